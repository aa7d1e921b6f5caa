//! HTTP MJPEG / JPEG snapshot source.
//!
//! Handles the common IP-camera endpoints (phone "IP Webcam" apps, ESP32-CAM,
//! most NVR `/video` URLs):
//! - `multipart/x-mixed-replace` responses are split on the declared boundary.
//!   A part's `Content-Length` is trusted when present, otherwise the part runs
//!   to the next boundary line. JPEG markers are never scanned, so EXIF
//!   thumbnails with their own SOI/EOI stay inside their frame.
//! - `image/jpeg` responses are snapshots. The body fetched by `open()` is the
//!   first frame and each later read fetches a new one.

use anyhow::{anyhow, Context, Result};
use std::io::Read;
use std::time::Duration;

use image::GenericImageView;

use super::{CaptureBackend, PixelFormat, RawCapture};

const MAX_JPEG_BYTES: usize = 5 * 1024 * 1024;
const MAX_HEADER_BYTES: usize = 8 * 1024;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const READ_CHUNK: usize = 8192;

pub(crate) struct MjpegBackend {
    url: String,
    agent: ureq::Agent,
    stream: Option<HttpStream>,
}

enum HttpStream {
    Multipart(MjpegStream),
    Snapshot { pending: Option<Vec<u8>> },
}

impl MjpegBackend {
    pub(crate) fn new(url: &str) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(CONNECT_TIMEOUT)
            .build();
        Self {
            url: url.to_string(),
            agent,
            stream: None,
        }
    }
}

impl CaptureBackend for MjpegBackend {
    fn name(&self) -> &'static str {
        "mjpeg"
    }

    fn open(&mut self) -> Result<()> {
        let response = self
            .agent
            .get(&self.url)
            .call()
            .with_context(|| format!("connect to http stream {}", self.url))?;
        let mime = response.content_type().to_ascii_lowercase();
        let stream = if mime.starts_with("multipart/") {
            let header = response.header("Content-Type").unwrap_or_default();
            let boundary = multipart_boundary(header).ok_or_else(|| {
                anyhow!(
                    "http stream {} is multipart without a boundary ('{}')",
                    self.url,
                    header
                )
            })?;
            log::debug!("MjpegBackend: multipart boundary '{}'", boundary);
            HttpStream::Multipart(MjpegStream::new(response.into_reader(), &boundary))
        } else if mime.contains("jpeg") {
            let first = read_snapshot(response).context("read first jpeg snapshot")?;
            HttpStream::Snapshot {
                pending: Some(first),
            }
        } else {
            return Err(anyhow!(
                "http stream {} has unsupported content type '{}'",
                self.url,
                mime
            ));
        };
        self.stream = Some(stream);
        log::info!("MjpegBackend: connected to {} ({})", self.url, mime);
        Ok(())
    }

    fn read(&mut self) -> Result<Option<RawCapture>> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| anyhow!("http source not connected; call open() first"))?;
        let jpeg = match stream {
            HttpStream::Multipart(stream) => stream.read_next_jpeg()?,
            HttpStream::Snapshot { pending } => match pending.take() {
                Some(first) => Some(first),
                None => Some(fetch_snapshot(&self.agent, &self.url)?),
            },
        };
        let Some(jpeg) = jpeg else {
            return Ok(None);
        };
        let (pixels, width, height) = decode_jpeg(&jpeg)?;
        Ok(Some(RawCapture {
            pixels,
            width,
            height,
            format: PixelFormat::Rgb24,
        }))
    }

    fn close(&mut self) {
        // Dropping the reader closes the HTTP connection.
        self.stream = None;
    }
}

/// `boundary` parameter of a multipart `Content-Type`, without quotes or a
/// leading `--` (some cameras declare it with the dashes included).
fn multipart_boundary(content_type: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|param| {
        let (key, value) = param.split_once('=')?;
        if !key.trim().eq_ignore_ascii_case("boundary") {
            return None;
        }
        let value = value.trim().trim_matches('"');
        let value = value.strip_prefix("--").unwrap_or(value);
        (!value.is_empty()).then(|| value.to_string())
    })
}

struct MjpegStream {
    reader: Box<dyn Read + Send>,
    /// `--` + boundary, as it appears at the start of each part.
    delimiter: Vec<u8>,
    buffer: Vec<u8>,
}

impl MjpegStream {
    fn new(reader: Box<dyn Read + Send>, boundary: &str) -> Self {
        Self {
            reader,
            delimiter: format!("--{}", boundary).into_bytes(),
            buffer: Vec::with_capacity(64 * 1024),
        }
    }

    /// Next part body, or `None` once the server closes the stream or sends
    /// the closing delimiter.
    fn read_next_jpeg(&mut self) -> Result<Option<Vec<u8>>> {
        // Skip preamble and the tail of the previous part.
        let at = loop {
            if let Some(at) = find(&self.buffer, &self.delimiter) {
                break at;
            }
            if !self.fill()? {
                return Ok(None);
            }
        };
        self.buffer.drain(..at);

        let token_end = self.delimiter.len();
        let body_start = loop {
            if let Some(end) = header_block_end(&self.buffer[token_end..]) {
                break token_end + end;
            }
            if self.buffer.len() - token_end > MAX_HEADER_BYTES {
                return Err(anyhow!("mjpeg part headers exceed {} bytes", MAX_HEADER_BYTES));
            }
            if !self.fill()? {
                return Ok(None);
            }
        };
        let headers = String::from_utf8_lossy(&self.buffer[token_end..body_start]).into_owned();
        if headers.starts_with("--") {
            log::debug!("MjpegStream: closing delimiter received");
            return Ok(None);
        }

        let body = match content_length(&headers)? {
            Some(len) => {
                if len > MAX_JPEG_BYTES {
                    return Err(anyhow!(
                        "mjpeg part of {} bytes exceeds {} bytes",
                        len,
                        MAX_JPEG_BYTES
                    ));
                }
                while self.buffer.len() < body_start + len {
                    if !self.fill()? {
                        return Err(anyhow!("mjpeg stream ended inside a {}-byte part", len));
                    }
                }
                let body = self.buffer[body_start..body_start + len].to_vec();
                self.buffer.drain(..body_start + len);
                body
            }
            None => {
                let end = loop {
                    if let Some(next) = find(&self.buffer[body_start..], &self.delimiter) {
                        break body_start + next;
                    }
                    if self.buffer.len() - body_start > MAX_JPEG_BYTES {
                        return Err(anyhow!(
                            "no mjpeg boundary within {} bytes",
                            MAX_JPEG_BYTES
                        ));
                    }
                    if !self.fill()? {
                        break self.buffer.len();
                    }
                };
                let body = trim_line_end(&self.buffer[body_start..end]).to_vec();
                self.buffer.drain(..end);
                if body.is_empty() {
                    return Ok(None);
                }
                body
            }
        };
        Ok(Some(body))
    }

    /// Append one chunk from the connection. `false` at end of stream.
    fn fill(&mut self) -> Result<bool> {
        let mut chunk = [0u8; READ_CHUNK];
        let read = self.reader.read(&mut chunk).context("read mjpeg chunk")?;
        if read == 0 {
            return Ok(false);
        }
        self.buffer.extend_from_slice(&chunk[..read]);
        if self.buffer.len() > MAX_JPEG_BYTES * 2 {
            return Err(anyhow!(
                "no complete mjpeg part within {} bytes",
                self.buffer.len()
            ));
        }
        Ok(true)
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Offset just past the blank line that ends a part's header block. The block
/// starts with the rest of the delimiter line.
fn header_block_end(buffer: &[u8]) -> Option<usize> {
    let crlf = find(buffer, b"\r\n\r\n").map(|at| at + 4);
    let lf = find(buffer, b"\n\n").map(|at| at + 2);
    match (crlf, lf) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn content_length(headers: &str) -> Result<Option<usize>> {
    for line in headers.lines() {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if name.trim().eq_ignore_ascii_case("content-length") {
            let len = value
                .trim()
                .parse()
                .with_context(|| format!("bad mjpeg Content-Length '{}'", value.trim()))?;
            return Ok(Some(len));
        }
    }
    Ok(None)
}

fn trim_line_end(body: &[u8]) -> &[u8] {
    body.strip_suffix(b"\r\n")
        .or_else(|| body.strip_suffix(b"\n"))
        .unwrap_or(body)
}

fn fetch_snapshot(agent: &ureq::Agent, url: &str) -> Result<Vec<u8>> {
    let response = agent
        .get(url)
        .call()
        .with_context(|| format!("fetch jpeg snapshot from {}", url))?;
    read_snapshot(response)
}

fn read_snapshot(response: ureq::Response) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    response
        .into_reader()
        .take(MAX_JPEG_BYTES as u64 + 1)
        .read_to_end(&mut bytes)
        .context("read jpeg snapshot")?;
    if bytes.is_empty() {
        return Err(anyhow!("empty jpeg snapshot"));
    }
    if bytes.len() > MAX_JPEG_BYTES {
        return Err(anyhow!("jpeg snapshot exceeds {} bytes", MAX_JPEG_BYTES));
    }
    Ok(bytes)
}

fn decode_jpeg(bytes: &[u8]) -> Result<(Vec<u8>, u32, u32)> {
    let image = image::load_from_memory(bytes).context("decode jpeg")?;
    let (width, height) = image.dimensions();
    Ok((image.into_rgb8().into_raw(), width, height))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn jpeg(width: u32, height: u32) -> Result<Vec<u8>> {
        let img = image::RgbImage::from_pixel(width, height, image::Rgb([200, 10, 20]));
        let mut out = Cursor::new(Vec::new());
        image::DynamicImage::ImageRgb8(img).write_to(&mut out, image::ImageFormat::Jpeg)?;
        Ok(out.into_inner())
    }

    /// A JPEG carrying a complete thumbnail JPEG inside an APP1 (EXIF) segment,
    /// the way phone camera apps emit them.
    fn jpeg_with_thumbnail() -> Result<Vec<u8>> {
        let main = jpeg(16, 8)?;
        let thumb = jpeg(2, 2)?;
        let mut payload = b"Exif\0\0".to_vec();
        payload.extend_from_slice(&thumb);
        let segment_len = u16::try_from(payload.len() + 2)?;

        let mut out = main[..2].to_vec();
        out.extend_from_slice(&[0xFF, 0xE1]);
        out.extend_from_slice(&segment_len.to_be_bytes());
        out.extend_from_slice(&payload);
        out.extend_from_slice(&main[2..]);
        Ok(out)
    }

    fn multipart_body(parts: &[Vec<u8>], with_length: bool) -> Vec<u8> {
        let mut body = b"preamble\r\n".to_vec();
        for part in parts {
            body.extend_from_slice(b"--frame\r\nContent-Type: image/jpeg\r\n");
            if with_length {
                body.extend_from_slice(format!("Content-Length: {}\r\n", part.len()).as_bytes());
            }
            body.extend_from_slice(b"\r\n");
            body.extend_from_slice(part);
            body.extend_from_slice(b"\r\n");
        }
        body
    }

    fn stream(body: Vec<u8>) -> MjpegStream {
        MjpegStream::new(Box::new(Cursor::new(body)), "frame")
    }

    #[test]
    fn boundary_is_taken_from_content_type() {
        assert_eq!(
            multipart_boundary("multipart/x-mixed-replace; boundary=frame").as_deref(),
            Some("frame")
        );
        assert_eq!(
            multipart_boundary("multipart/x-mixed-replace;Boundary=\"--Ba4oTvQMY8ew04N8dcnM\"")
                .as_deref(),
            Some("Ba4oTvQMY8ew04N8dcnM")
        );
        assert_eq!(multipart_boundary("multipart/x-mixed-replace"), None);
        assert_eq!(multipart_boundary("multipart/x-mixed-replace; boundary="), None);
    }

    #[test]
    fn splits_multipart_body_and_reports_end() -> Result<()> {
        let jpeg = jpeg(4, 2)?;
        let mut stream = stream(multipart_body(&[jpeg.clone(), jpeg.clone()], true));

        assert_eq!(stream.read_next_jpeg()?, Some(jpeg.clone()));
        assert_eq!(stream.read_next_jpeg()?, Some(jpeg));
        assert_eq!(stream.read_next_jpeg()?, None);
        Ok(())
    }

    #[test]
    fn thumbnail_end_marker_does_not_cut_the_frame() -> Result<()> {
        let frame = jpeg_with_thumbnail()?;
        assert!(decode_jpeg(&frame).is_ok());

        for with_length in [true, false] {
            let mut stream = stream(multipart_body(&[frame.clone(), frame.clone()], with_length));
            let first = stream.read_next_jpeg()?.expect("first part");
            assert_eq!(first.len(), frame.len());
            assert_eq!(decode_jpeg(&first)?.1, 16);
            assert_eq!(stream.read_next_jpeg()?, Some(frame.clone()));
            assert_eq!(stream.read_next_jpeg()?, None);
        }
        Ok(())
    }

    #[test]
    fn closing_delimiter_ends_the_stream() -> Result<()> {
        let jpeg = jpeg(4, 2)?;
        let mut body = multipart_body(&[jpeg.clone()], false);
        body.extend_from_slice(b"--frame--\r\n\r\nepilogue");
        let mut stream = stream(body);

        assert_eq!(stream.read_next_jpeg()?, Some(jpeg));
        assert_eq!(stream.read_next_jpeg()?, None);
        Ok(())
    }

    #[test]
    fn truncated_part_is_a_read_error() -> Result<()> {
        let jpeg = jpeg(4, 2)?;
        let mut body = multipart_body(&[jpeg], true);
        body.truncate(body.len() - 20);
        assert!(stream(body).read_next_jpeg().is_err());
        Ok(())
    }

    #[test]
    fn bad_content_length_is_rejected() {
        let body = b"--frame\r\nContent-Length: lots\r\n\r\nxyz".to_vec();
        assert!(stream(body).read_next_jpeg().is_err());
    }

    /// Serves `jpeg` as `image/jpeg` to `connections` clients, counting requests.
    fn serve_snapshots(
        jpeg: Vec<u8>,
        connections: usize,
    ) -> Result<(String, Arc<AtomicUsize>, std::thread::JoinHandle<()>)> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let url = format!("http://{}/shot.jpg", listener.local_addr()?);
        let requests = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&requests);
        let handle = std::thread::spawn(move || {
            for stream in listener.incoming().take(connections) {
                let Ok(mut stream) = stream else { return };
                let mut request = Vec::new();
                let mut byte = [0u8; 1];
                while !request.ends_with(b"\r\n\r\n") {
                    match stream.read(&mut byte) {
                        Ok(1) => request.push(byte[0]),
                        _ => return,
                    }
                }
                counter.fetch_add(1, Ordering::SeqCst);
                let head = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    jpeg.len()
                );
                let _ = stream.write_all(head.as_bytes());
                let _ = stream.write_all(&jpeg);
            }
        });
        Ok((url, requests, handle))
    }

    #[test]
    fn snapshot_fetched_by_open_is_the_first_frame() -> Result<()> {
        let (url, requests, server) = serve_snapshots(jpeg(4, 2)?, 2)?;
        let mut backend = MjpegBackend::new(&url);

        backend.open()?;
        assert_eq!(requests.load(Ordering::SeqCst), 1);
        let first = backend.read()?.expect("first snapshot");
        assert_eq!((first.width, first.height), (4, 2));
        assert_eq!(requests.load(Ordering::SeqCst), 1);

        assert!(backend.read()?.is_some());
        assert_eq!(requests.load(Ordering::SeqCst), 2);
        backend.close();
        server.join().expect("snapshot server");
        Ok(())
    }

    #[test]
    fn decodes_jpeg_to_rgb() -> Result<()> {
        let (pixels, width, height) = decode_jpeg(&jpeg(4, 2)?)?;
        assert_eq!((width, height), (4, 2));
        assert_eq!(pixels.len(), 4 * 2 * 3);
        Ok(())
    }
}
