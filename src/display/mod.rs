//! Local preview of the published stream.
//!
//! A display is strictly a side channel: it sees each frame after the frame
//! has been published, and its key poll can only ask the loop to stop.

#[cfg(feature = "display")]
mod window;

use anyhow::Result;

use crate::frame::Frame;

#[cfg(feature = "display")]
pub use window::MinifbDisplay;

pub const WINDOW_TITLE: &str = "IP Camera";

/// A key event reported by a display.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Key {
    Escape,
    /// The window was closed by the window manager.
    WindowClosed,
    Other,
}

impl Key {
    /// Keys that end the session.
    pub fn is_abort(self) -> bool {
        matches!(self, Key::Escape | Key::WindowClosed)
    }
}

pub trait DisplaySink {
    /// Render one frame.
    fn show(&mut self, frame: &Frame) -> Result<()>;

    /// Non-blocking check for a pending key.
    fn poll_key(&mut self) -> Option<Key>;

    /// Tear down the window. Calling this again is a no-op.
    fn close(&mut self);
}

/// The windowed display for this build.
#[cfg(feature = "display")]
pub fn open_window() -> Result<Box<dyn DisplaySink>> {
    Ok(Box::new(MinifbDisplay::new(WINDOW_TITLE)))
}

#[cfg(not(feature = "display"))]
pub fn open_window() -> Result<Box<dyn DisplaySink>> {
    anyhow::bail!("the preview window requires the display feature")
}

/// Pack `bgr8` pixels into the `0RGB` words most window toolkits take.
pub fn bgr_to_0rgb(pixels: &[u8]) -> Vec<u32> {
    pixels
        .chunks_exact(3)
        .map(|px| (u32::from(px[2]) << 16) | (u32::from(px[1]) << 8) | u32::from(px[0]))
        .collect()
}
