//! `minifb` preview window.

use anyhow::{anyhow, Result};
use minifb::{KeyRepeat, Window, WindowOptions};

use super::{bgr_to_0rgb, DisplaySink, Key};
use crate::frame::Frame;

/// Opens lazily at the first frame's size, so the window matches the stream.
pub struct MinifbDisplay {
    title: String,
    window: Option<Window>,
    size: (usize, usize),
    closed: bool,
}

impl MinifbDisplay {
    pub fn new(title: &str) -> Self {
        Self {
            title: title.to_string(),
            window: None,
            size: (0, 0),
            closed: false,
        }
    }

    fn window_for(&mut self, width: usize, height: usize) -> Result<&mut Window> {
        if self.window.is_some() && self.size != (width, height) {
            log::info!(
                "MinifbDisplay: stream size changed to {}x{}, reopening",
                width,
                height
            );
            self.window = None;
        }
        if self.window.is_none() {
            let mut window = Window::new(&self.title, width, height, WindowOptions::default())
                .map_err(|e| anyhow!("open preview window: {}", e))?;
            window.set_target_fps(0);
            self.window = Some(window);
            self.size = (width, height);
        }
        self.window
            .as_mut()
            .ok_or_else(|| anyhow!("preview window missing"))
    }
}

impl DisplaySink for MinifbDisplay {
    fn show(&mut self, frame: &Frame) -> Result<()> {
        if self.closed {
            return Err(anyhow!("preview window already closed"));
        }
        let (width, height) = (frame.width() as usize, frame.height() as usize);
        let buffer = bgr_to_0rgb(frame.pixels());
        self.window_for(width, height)?
            .update_with_buffer(&buffer, width, height)
            .map_err(|e| anyhow!("draw frame {}: {}", frame.seq(), e))
    }

    fn poll_key(&mut self) -> Option<Key> {
        let window = self.window.as_ref()?;
        if !window.is_open() {
            return Some(Key::WindowClosed);
        }
        window
            .get_keys_pressed(KeyRepeat::No)
            .into_iter()
            .map(|key| match key {
                minifb::Key::Escape => Key::Escape,
                _ => Key::Other,
            })
            .max_by_key(|key| key.is_abort())
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if self.window.take().is_some() {
            log::debug!("MinifbDisplay: window closed");
        }
    }
}

impl Drop for MinifbDisplay {
    fn drop(&mut self) {
        self.close();
    }
}
