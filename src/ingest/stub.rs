//! Synthetic frame source (`stub://`).
//!
//! URL parameters:
//! - `frames=N`     end the stream after N frames (default: endless)
//! - `width=W`, `height=H` frame size (default 640x480)
//! - `fail_open=1`  refuse to open, like an unreachable camera
//! - `fail_after=K` return a read error after K frames

use anyhow::{anyhow, Context, Result};

use super::{CaptureBackend, PixelFormat, RawCapture};
use crate::frame::PUBLISHED_LAYOUT;

const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StubConfig {
    pub name: String,
    pub frames: Option<u64>,
    pub width: u32,
    pub height: u32,
    pub fail_open: bool,
    pub fail_after: Option<u64>,
}

impl Default for StubConfig {
    fn default() -> Self {
        Self {
            name: "camera".to_string(),
            frames: None,
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            fail_open: false,
            fail_after: None,
        }
    }
}

impl StubConfig {
    pub fn from_url(raw: &str) -> Result<Self> {
        let url = url::Url::parse(raw).with_context(|| format!("invalid stub url {}", raw))?;
        let mut config = Self {
            name: url.host_str().unwrap_or("camera").to_string(),
            ..Self::default()
        };
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "frames" => config.frames = Some(parse_param(&key, &value)?),
                "width" => config.width = parse_param(&key, &value)?,
                "height" => config.height = parse_param(&key, &value)?,
                "fail_open" => config.fail_open = value == "1" || value == "true",
                "fail_after" => config.fail_after = Some(parse_param(&key, &value)?),
                other => return Err(anyhow!("unknown stub parameter '{}'", other)),
            }
        }
        if config.width == 0 || config.height == 0 {
            return Err(anyhow!("stub frame size must be non-zero"));
        }
        PUBLISHED_LAYOUT
            .buffer_len(config.width, config.height)
            .with_context(|| format!("stub frame size {}x{}", config.width, config.height))?;
        Ok(config)
    }
}

fn parse_param<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| anyhow!("stub parameter {}={} is not a number", key, value))
}

/// Generates a moving gradient in RGB, so the BGR normalization path is exercised.
pub struct StubBackend {
    config: StubConfig,
    frame_count: u64,
    opened: bool,
}

impl StubBackend {
    pub fn new(config: StubConfig) -> Self {
        Self {
            config,
            frame_count: 0,
            opened: false,
        }
    }

    fn generate_pixels(&self) -> Result<Vec<u8>> {
        let len = PUBLISHED_LAYOUT.buffer_len(self.config.width, self.config.height)?;
        let mut pixels = vec![0u8; len];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            *pixel = ((i as u64 + self.frame_count) % 256) as u8;
        }
        Ok(pixels)
    }
}

impl CaptureBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn open(&mut self) -> Result<()> {
        if self.config.fail_open {
            return Err(anyhow!("stub camera {} is unreachable", self.config.name));
        }
        self.opened = true;
        log::info!("StubBackend: connected to {} (synthetic)", self.config.name);
        Ok(())
    }

    fn read(&mut self) -> Result<Option<RawCapture>> {
        if !self.opened {
            return Err(anyhow!("stub source not opened"));
        }
        if let Some(limit) = self.config.fail_after {
            if self.frame_count >= limit {
                return Err(anyhow!("stub camera {} dropped the stream", self.config.name));
            }
        }
        if let Some(limit) = self.config.frames {
            if self.frame_count >= limit {
                return Ok(None);
            }
        }
        self.frame_count += 1;
        Ok(Some(RawCapture {
            pixels: self.generate_pixels()?,
            width: self.config.width,
            height: self.config.height,
            format: PixelFormat::Rgb24,
        }))
    }

    fn close(&mut self) {
        self.opened = false;
    }
}
