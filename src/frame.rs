//! Frame model.
//!
//! - `Frame`: immutable snapshot produced by a `StreamSource`. Pixels are private and
//!   only exposed as a borrowed slice.
//! - `PixelLayout`: the color-layout tag carried into published messages.
//! - `Stamp`: wall-clock capture time with nanosecond resolution.

use anyhow::{anyhow, Result};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Layout every frame handed to the loop is normalized to.
pub const PUBLISHED_LAYOUT: PixelLayout = PixelLayout::Bgr8;

// ----------------------------------------------------------------------------
// PixelLayout
// ----------------------------------------------------------------------------

/// Channel order and bit depth of an interleaved pixel buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelLayout {
    Bgr8,
    Rgb8,
    Mono8,
}

impl PixelLayout {
    /// Encoding tag as it appears on the wire (`"bgr8"`, `"rgb8"`, `"mono8"`).
    pub fn tag(&self) -> &'static str {
        match self {
            PixelLayout::Bgr8 => "bgr8",
            PixelLayout::Rgb8 => "rgb8",
            PixelLayout::Mono8 => "mono8",
        }
    }

    pub fn channels(&self) -> u32 {
        match self {
            PixelLayout::Bgr8 | PixelLayout::Rgb8 => 3,
            PixelLayout::Mono8 => 1,
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "bgr8" => Some(PixelLayout::Bgr8),
            "rgb8" => Some(PixelLayout::Rgb8),
            "mono8" => Some(PixelLayout::Mono8),
            _ => None,
        }
    }

    /// Byte length of a tightly packed buffer with this layout.
    pub fn buffer_len(&self, width: u32, height: u32) -> Result<usize> {
        width
            .checked_mul(height)
            .and_then(|v| v.checked_mul(self.channels()))
            .map(|v| v as usize)
            .ok_or_else(|| anyhow!("{} frame dimensions overflow", self.tag()))
    }
}

impl std::fmt::Display for PixelLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

// ----------------------------------------------------------------------------
// Stamp
// ----------------------------------------------------------------------------

/// Capture timestamp (seconds + nanoseconds since the Unix epoch).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Stamp {
    pub secs: u64,
    pub nanos: u32,
}

impl Stamp {
    pub fn new(secs: u64, nanos: u32) -> Self {
        let secs = secs + (nanos / 1_000_000_000) as u64;
        Self {
            secs,
            nanos: nanos % 1_000_000_000,
        }
    }

    pub fn now() -> Result<Self> {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|_| anyhow!("system clock is before the Unix epoch"))?;
        Ok(Self::from(since_epoch))
    }

    pub fn as_duration(&self) -> Duration {
        Duration::new(self.secs, self.nanos)
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.as_duration().as_secs_f64()
    }
}

impl From<Duration> for Stamp {
    fn from(d: Duration) -> Self {
        Self {
            secs: d.as_secs(),
            nanos: d.subsec_nanos(),
        }
    }
}

impl std::fmt::Display for Stamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{:09}", self.secs, self.nanos)
    }
}

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// One decoded image snapshot.
///
/// No `Clone` and no mutating accessors: a frame is read by the publisher and
/// the display sink, then dropped.
#[derive(Debug)]
pub struct Frame {
    data: Vec<u8>,
    width: u32,
    height: u32,
    layout: PixelLayout,
    stamp: Stamp,
    seq: u64,
}

impl Frame {
    /// Build a frame, rejecting buffers whose length does not match the dimensions.
    pub fn new(
        data: Vec<u8>,
        width: u32,
        height: u32,
        layout: PixelLayout,
        stamp: Stamp,
        seq: u64,
    ) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(anyhow!("frame has zero dimension ({}x{})", width, height));
        }
        let expected = layout.buffer_len(width, height)?;
        if data.len() != expected {
            return Err(anyhow!(
                "{} frame length mismatch: expected {}, got {}",
                layout,
                expected,
                data.len()
            ));
        }
        Ok(Self {
            data,
            width,
            height,
            layout,
            stamp,
            seq,
        })
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn layout(&self) -> PixelLayout {
        self.layout
    }

    pub fn stamp(&self) -> Stamp {
        self.stamp
    }

    /// 1-based position of this frame within its session.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Bytes per row.
    pub fn step(&self) -> u32 {
        self.width * self.layout.channels()
    }
}
