//! Published image message and its binary envelope.
//!
//! Envelope layout (little-endian, length-prefixed fields):
//!
//! ```text
//! "IMG1" | seq u32 | stamp.secs u64 | stamp.nanos u32 | frame_id
//! | height u32 | width u32 | encoding | is_bigendian u8 | step u32 | data
//! ```
//!
//! Variable-length fields are a `u32` length followed by the bytes.

use anyhow::{anyhow, Result};

use crate::frame::{Frame, PixelLayout, Stamp};

const IMAGE_MAGIC: &[u8; 4] = b"IMG1";

/// Maximum encoding tag length.
const MAX_ENCODING_LEN: usize = 32;

/// Maximum frame_id length.
const MAX_FRAME_ID_LEN: usize = 256;

/// Maximum pixel payload (256 MiB).
const MAX_DATA_LEN: usize = 256 * 1024 * 1024;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Header {
    pub seq: u32,
    pub stamp: Stamp,
    pub frame_id: String,
}

/// One published camera image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageMessage {
    pub header: Header,
    pub height: u32,
    pub width: u32,
    pub encoding: String,
    pub is_bigendian: u8,
    pub step: u32,
    pub data: Vec<u8>,
}

impl ImageMessage {
    /// Build a message from a frame. The layout tag and capture stamp are carried
    /// over unchanged.
    pub fn from_frame(frame: &Frame, seq: u32, frame_id: &str) -> Self {
        Self {
            header: Header {
                seq,
                stamp: frame.stamp(),
                frame_id: frame_id.to_string(),
            },
            height: frame.height(),
            width: frame.width(),
            encoding: frame.layout().tag().to_string(),
            is_bigendian: 0,
            step: frame.step(),
            data: frame.pixels().to_vec(),
        }
    }

    pub fn layout(&self) -> Option<PixelLayout> {
        PixelLayout::from_tag(&self.encoding)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.encoding.len() > MAX_ENCODING_LEN {
            return Err(anyhow!("encoding tag '{}' is too long", self.encoding));
        }
        if self.header.frame_id.len() > MAX_FRAME_ID_LEN {
            return Err(anyhow!(
                "frame_id length {} exceeds maximum {}",
                self.header.frame_id.len(),
                MAX_FRAME_ID_LEN
            ));
        }
        if self.data.len() > MAX_DATA_LEN {
            return Err(anyhow!(
                "image payload {} bytes exceeds maximum {}",
                self.data.len(),
                MAX_DATA_LEN
            ));
        }

        let mut out = Vec::with_capacity(self.data.len() + 64 + self.header.frame_id.len());
        out.extend_from_slice(IMAGE_MAGIC);
        out.extend_from_slice(&self.header.seq.to_le_bytes());
        out.extend_from_slice(&self.header.stamp.secs.to_le_bytes());
        out.extend_from_slice(&self.header.stamp.nanos.to_le_bytes());
        write_bytes(&mut out, self.header.frame_id.as_bytes());
        out.extend_from_slice(&self.height.to_le_bytes());
        out.extend_from_slice(&self.width.to_le_bytes());
        write_bytes(&mut out, self.encoding.as_bytes());
        out.push(self.is_bigendian);
        out.extend_from_slice(&self.step.to_le_bytes());
        write_bytes(&mut out, &self.data);
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut cursor = 0usize;
        let magic = read_slice(bytes, &mut cursor, 4)?;
        if magic != IMAGE_MAGIC {
            return Err(anyhow!("not an image message (bad magic)"));
        }
        let seq = read_u32(bytes, &mut cursor)?;
        let secs = read_u64(bytes, &mut cursor)?;
        let nanos = read_u32(bytes, &mut cursor)?;
        if nanos >= 1_000_000_000 {
            return Err(anyhow!("stamp nanoseconds out of range: {}", nanos));
        }
        let frame_id = read_string_bounded(bytes, &mut cursor, MAX_FRAME_ID_LEN)?;
        let height = read_u32(bytes, &mut cursor)?;
        let width = read_u32(bytes, &mut cursor)?;
        let encoding = read_string_bounded(bytes, &mut cursor, MAX_ENCODING_LEN)?;
        let is_bigendian = read_slice(bytes, &mut cursor, 1)?[0];
        let step = read_u32(bytes, &mut cursor)?;
        let data = read_vec_bounded(bytes, &mut cursor, MAX_DATA_LEN)?;
        if cursor != bytes.len() {
            return Err(anyhow!(
                "trailing {} bytes after image message",
                bytes.len() - cursor
            ));
        }

        let layout = PixelLayout::from_tag(&encoding)
            .ok_or_else(|| anyhow!("unsupported image encoding '{}'", encoding))?;
        let expected_step = width
            .checked_mul(layout.channels())
            .ok_or_else(|| anyhow!("image step overflows"))?;
        if step != expected_step {
            return Err(anyhow!(
                "image step mismatch: expected {}, got {}",
                expected_step,
                step
            ));
        }
        let expected_len = layout.buffer_len(width, height)?;
        if data.len() != expected_len {
            return Err(anyhow!(
                "image data length mismatch: expected {}, got {}",
                expected_len,
                data.len()
            ));
        }

        Ok(Self {
            header: Header {
                seq,
                stamp: Stamp { secs, nanos },
                frame_id,
            },
            height,
            width,
            encoding,
            is_bigendian,
            step,
            data,
        })
    }
}

fn read_u32(bytes: &[u8], cursor: &mut usize) -> Result<u32> {
    let slice = read_slice(bytes, cursor, 4)?;
    Ok(u32::from_le_bytes([slice[0], slice[1], slice[2], slice[3]]))
}

fn read_u64(bytes: &[u8], cursor: &mut usize) -> Result<u64> {
    let slice = read_slice(bytes, cursor, 8)?;
    let mut buf = [0u8; 8];
    buf.copy_from_slice(slice);
    Ok(u64::from_le_bytes(buf))
}

fn read_slice<'a>(bytes: &'a [u8], cursor: &mut usize, len: usize) -> Result<&'a [u8]> {
    let end = cursor
        .checked_add(len)
        .ok_or_else(|| anyhow!("truncated image message"))?;
    if end > bytes.len() {
        return Err(anyhow!("truncated image message"));
    }
    let out = &bytes[*cursor..end];
    *cursor = end;
    Ok(out)
}

fn read_vec_bounded(bytes: &[u8], cursor: &mut usize, max_len: usize) -> Result<Vec<u8>> {
    let len = read_u32(bytes, cursor)? as usize;
    if len > max_len {
        return Err(anyhow!(
            "field length {} exceeds maximum allowed {}",
            len,
            max_len
        ));
    }
    Ok(read_slice(bytes, cursor, len)?.to_vec())
}

fn read_string_bounded(bytes: &[u8], cursor: &mut usize, max_len: usize) -> Result<String> {
    let raw = read_vec_bounded(bytes, cursor, max_len)?;
    String::from_utf8(raw).map_err(|_| anyhow!("image message field is not valid UTF-8"))
}

fn write_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(bytes);
}
