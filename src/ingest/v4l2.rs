//! Local V4L2 device source (e.g. `/dev/video0`).

use anyhow::{anyhow, Context, Result};
use ouroboros::self_referencing;

use super::{CaptureBackend, PixelFormat, RawCapture};

const PREFERRED_WIDTH: u32 = 640;
const PREFERRED_HEIGHT: u32 = 480;
const BUFFER_COUNT: u32 = 4;

pub(crate) struct V4l2Backend {
    device: String,
    state: Option<DeviceState>,
    width: u32,
    height: u32,
    format: PixelFormat,
}

#[self_referencing]
struct DeviceState {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

impl V4l2Backend {
    pub(crate) fn new(device: &str) -> Self {
        Self {
            device: device.to_string(),
            state: None,
            width: PREFERRED_WIDTH,
            height: PREFERRED_HEIGHT,
            format: PixelFormat::Bgr24,
        }
    }
}

impl CaptureBackend for V4l2Backend {
    fn name(&self) -> &'static str {
        "v4l2"
    }

    fn open(&mut self) -> Result<()> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        let mut device = v4l::Device::with_path(&self.device)
            .with_context(|| format!("open v4l2 device {}", self.device))?;
        let mut format = device.format().context("read v4l2 format")?;
        format.width = PREFERRED_WIDTH;
        format.height = PREFERRED_HEIGHT;
        format.fourcc = v4l::FourCC::new(b"BGR3");

        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!(
                    "V4l2Backend: failed to set BGR3 on {}: {}",
                    self.device,
                    err
                );
                device
                    .format()
                    .context("read v4l2 format after set failure")?
            }
        };

        self.format = match &format.fourcc.repr {
            b"BGR3" => PixelFormat::Bgr24,
            b"RGB3" => PixelFormat::Rgb24,
            b"NV12" => PixelFormat::Nv12,
            other => {
                return Err(anyhow!(
                    "v4l2 device {} negotiated unsupported fourcc {}",
                    self.device,
                    String::from_utf8_lossy(other)
                ))
            }
        };
        self.width = format.width;
        self.height = format.height;

        let state = DeviceStateBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, BUFFER_COUNT)
                    .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
            },
        }
        .try_build()?;
        self.state = Some(state);

        log::info!(
            "V4l2Backend: connected to {} ({}x{} {:?})",
            self.device,
            self.width,
            self.height,
            self.format
        );
        Ok(())
    }

    fn read(&mut self) -> Result<Option<RawCapture>> {
        use v4l::io::traits::CaptureStream;

        let state = self.state.as_mut().context("v4l2 device not open")?;
        let pixels = state.with_mut(|fields| -> Result<Vec<u8>> {
            let (buf, meta) = fields.stream.next().context("capture v4l2 frame")?;
            // Some drivers leave bytesused at zero for fixed-size formats.
            let used = match meta.bytesused as usize {
                0 => buf.len(),
                n => n.min(buf.len()),
            };
            Ok(buf[..used].to_vec())
        })?;

        Ok(Some(RawCapture {
            pixels,
            width: self.width,
            height: self.height,
            format: self.format,
        }))
    }

    fn close(&mut self) {
        self.state = None;
    }
}
