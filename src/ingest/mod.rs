//! Frame ingestion.
//!
//! `StreamSource` owns the connection to one stream URL and turns backend captures
//! into `Frame`s. Backends are chosen by URL:
//! - `stub://...` synthetic frames (always available, used by tests)
//! - `http(s)://...` MJPEG or JPEG snapshots (feature: ingest-mjpeg)
//! - `rtsp://...` GStreamer decode (feature: rtsp-gstreamer)
//! - `/dev/videoN` or `v4l2:///dev/videoN` local devices (feature: ingest-v4l2)
//!
//! Every frame leaving this module is `bgr8` with a non-decreasing capture stamp.

#[cfg(feature = "ingest-mjpeg")]
mod mjpeg;
mod normalize;
#[cfg(feature = "rtsp-gstreamer")]
mod rtsp;
mod stub;
#[cfg(feature = "ingest-v4l2")]
mod v4l2;

use anyhow::{anyhow, Context, Result};
use std::time::{Duration, Instant};

use crate::frame::{Frame, Stamp, PUBLISHED_LAYOUT};

pub use normalize::PixelFormat;
pub use stub::{StubBackend, StubConfig};

/// One undecorated capture as produced by a backend.
#[derive(Debug)]
pub struct RawCapture {
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

/// Seam between `StreamSource` and a concrete capture library.
pub trait CaptureBackend: Send {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Establish the stream. Errors here are connection errors.
    fn open(&mut self) -> Result<()>;

    /// Block until the next capture. `Ok(None)` means the stream ended.
    fn read(&mut self) -> Result<Option<RawCapture>>;

    /// Release backend resources. Called at most once by `StreamSource`.
    fn close(&mut self);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandleState {
    Open,
    Closed,
}

/// Statistics for a stream source.
#[derive(Clone, Debug)]
pub struct SourceStats {
    pub frames_read: u64,
    pub url: String,
    pub backend: &'static str,
    pub uptime: Duration,
}

/// An open connection to a stream URL.
///
/// Closed exactly once: explicitly through `close()` or on drop.
pub struct StreamSource {
    url: String,
    backend: Box<dyn CaptureBackend>,
    state: HandleState,
    frames_read: u64,
    last_stamp: Option<Stamp>,
    opened_at: Instant,
}

impl std::fmt::Debug for StreamSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSource")
            .field("url", &self.url)
            .field("backend", &self.backend.name())
            .field("state", &self.state)
            .field("frames_read", &self.frames_read)
            .finish()
    }
}

impl StreamSource {
    /// Open `url` with the backend its scheme selects.
    pub fn open(url: &str) -> Result<Self> {
        let backend = backend_for_url(url)?;
        Self::open_with(url, backend)
    }

    /// Open `url` with an explicit backend.
    pub fn open_with(url: &str, mut backend: Box<dyn CaptureBackend>) -> Result<Self> {
        backend
            .open()
            .with_context(|| format!("unable to open stream {}", url))?;
        log::debug!("StreamSource: {} backend open for {}", backend.name(), url);
        Ok(Self {
            url: url.to_string(),
            backend,
            state: HandleState::Open,
            frames_read: 0,
            last_stamp: None,
            opened_at: Instant::now(),
        })
    }

    /// Read the next frame. `Ok(None)` signals end of stream.
    pub fn read_frame(&mut self) -> Result<Option<Frame>> {
        if self.state != HandleState::Open {
            return Err(anyhow!("read on closed stream {}", self.url));
        }
        let Some(capture) = self.backend.read()? else {
            return Ok(None);
        };
        let stamp = self.next_stamp()?;
        let pixels = normalize::normalize_to_bgr(
            capture.pixels,
            capture.width,
            capture.height,
            capture.format,
        )?;
        self.frames_read += 1;
        let frame = Frame::new(
            pixels,
            capture.width,
            capture.height,
            PUBLISHED_LAYOUT,
            stamp,
            self.frames_read,
        )?;
        Ok(Some(frame))
    }

    /// Release the stream. Calling this again is a no-op.
    pub fn close(&mut self) {
        if self.state == HandleState::Closed {
            return;
        }
        self.state = HandleState::Closed;
        self.backend.close();
        log::info!(
            "StreamSource: closed {} after {} frames",
            self.url,
            self.frames_read
        );
    }

    pub fn state(&self) -> HandleState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == HandleState::Open
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn stats(&self) -> SourceStats {
        SourceStats {
            frames_read: self.frames_read,
            url: self.url.clone(),
            backend: self.backend.name(),
            uptime: self.opened_at.elapsed(),
        }
    }

    fn next_stamp(&mut self) -> Result<Stamp> {
        Ok(self.clamp_stamp(Stamp::now()?))
    }

    /// Stamps never go backwards within a session, even if the wall clock does.
    fn clamp_stamp(&mut self, now: Stamp) -> Stamp {
        let stamp = match self.last_stamp {
            Some(last) if now < last => {
                log::debug!("StreamSource: clock stepped back ({} < {})", now, last);
                last
            }
            _ => now,
        };
        self.last_stamp = Some(stamp);
        stamp
    }
}

impl Drop for StreamSource {
    fn drop(&mut self) {
        self.close();
    }
}

/// Pick a capture backend for `url`.
pub fn backend_for_url(url: &str) -> Result<Box<dyn CaptureBackend>> {
    let url = url.trim();
    if url.is_empty() {
        return Err(anyhow!("stream url is empty"));
    }
    if url.starts_with("stub://") {
        return Ok(Box::new(StubBackend::new(StubConfig::from_url(url)?)));
    }
    if url.starts_with("/dev/video") {
        return v4l2_backend(url);
    }

    let parsed = url::Url::parse(url).with_context(|| format!("invalid stream url {}", url))?;
    match parsed.scheme() {
        "http" | "https" => mjpeg_backend(url),
        "rtsp" | "rtsps" => rtsp_backend(url),
        "v4l2" => v4l2_backend(parsed.path()),
        other => Err(anyhow!(
            "unsupported stream scheme '{}'; expected http(s), rtsp, v4l2 or stub",
            other
        )),
    }
}

#[cfg(feature = "ingest-mjpeg")]
fn mjpeg_backend(url: &str) -> Result<Box<dyn CaptureBackend>> {
    Ok(Box::new(mjpeg::MjpegBackend::new(url)))
}

#[cfg(not(feature = "ingest-mjpeg"))]
fn mjpeg_backend(_url: &str) -> Result<Box<dyn CaptureBackend>> {
    Err(anyhow!("http(s) streams require the ingest-mjpeg feature"))
}

#[cfg(feature = "rtsp-gstreamer")]
fn rtsp_backend(url: &str) -> Result<Box<dyn CaptureBackend>> {
    Ok(Box::new(rtsp::GstreamerBackend::new(url)?))
}

#[cfg(not(feature = "rtsp-gstreamer"))]
fn rtsp_backend(_url: &str) -> Result<Box<dyn CaptureBackend>> {
    Err(anyhow!("RTSP streams require the rtsp-gstreamer feature"))
}

#[cfg(feature = "ingest-v4l2")]
fn v4l2_backend(device: &str) -> Result<Box<dyn CaptureBackend>> {
    Ok(Box::new(v4l2::V4l2Backend::new(device)))
}

#[cfg(not(feature = "ingest-v4l2"))]
fn v4l2_backend(_device: &str) -> Result<Box<dyn CaptureBackend>> {
    Err(anyhow!("V4L2 devices require the ingest-v4l2 feature"))
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
