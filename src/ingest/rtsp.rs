//! RTSP source using GStreamer.
//!
//! Pipeline: `rtspsrc ! decodebin ! videoconvert ! video/x-raw,format=BGR ! appsink`.
//! GStreamer delivers BGR directly, so no channel swap happens on this path.

use anyhow::{anyhow, Context, Result};

use gstreamer::prelude::*;

use super::{CaptureBackend, PixelFormat, RawCapture};

/// How long `open` waits for the pipeline to reach Playing.
const OPEN_TIMEOUT_SECS: u64 = 10;

/// Pull granularity; between pulls the bus is drained for errors.
const PULL_SLICE_MS: u64 = 500;

pub(crate) struct GstreamerBackend {
    url: String,
    pipeline: gstreamer::Pipeline,
    appsink: gstreamer_app::AppSink,
}

impl GstreamerBackend {
    pub(crate) fn new(url: &str) -> Result<Self> {
        gstreamer::init().context("initialize gstreamer")?;

        let description = format!(
            "rtspsrc location={} latency=0 ! decodebin ! videoconvert ! \
             video/x-raw,format=BGR ! appsink name=sink sync=false",
            url
        );
        let pipeline = gstreamer::parse::launch(&description)
            .context("build RTSP pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow!("RTSP pipeline is not a Pipeline"))?;

        let appsink = pipeline
            .by_name("sink")
            .context("appsink element missing from pipeline")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow!("appsink element has unexpected type"))?;

        Ok(Self {
            url: url.to_string(),
            pipeline,
            appsink,
        })
    }

    /// First error posted on the pipeline bus, if any. EOS is not an error here.
    fn drain_bus_errors(&self) -> Option<String> {
        let bus = self.pipeline.bus()?;
        while let Some(message) = bus.pop() {
            use gstreamer::MessageView;
            if let MessageView::Error(err) = message.view() {
                return Some(format!(
                    "gstreamer error from {:?}: {}",
                    err.src().map(|s| s.path_string()),
                    err.error()
                ));
            }
        }
        None
    }
}

impl CaptureBackend for GstreamerBackend {
    fn name(&self) -> &'static str {
        "gstreamer"
    }

    fn open(&mut self) -> Result<()> {
        self.pipeline
            .set_state(gstreamer::State::Playing)
            .context("set RTSP pipeline to Playing")?;
        let (result, _current, _pending) = self
            .pipeline
            .state(gstreamer::ClockTime::from_seconds(OPEN_TIMEOUT_SECS));
        if result.is_err() {
            let _ = self.pipeline.set_state(gstreamer::State::Null);
            let reason = self
                .drain_bus_errors()
                .unwrap_or_else(|| "pipeline did not reach Playing".to_string());
            return Err(anyhow!("RTSP connect to {} failed: {}", self.url, reason));
        }
        log::info!("GstreamerBackend: connected to {}", self.url);
        Ok(())
    }

    fn read(&mut self) -> Result<Option<RawCapture>> {
        loop {
            if let Some(sample) = self
                .appsink
                .try_pull_sample(gstreamer::ClockTime::from_mseconds(PULL_SLICE_MS))
            {
                let (pixels, width, height) = sample_to_pixels(&sample)?;
                return Ok(Some(RawCapture {
                    pixels,
                    width,
                    height,
                    format: PixelFormat::Bgr24,
                }));
            }
            if self.appsink.is_eos() {
                return Ok(None);
            }
            if let Some(error) = self.drain_bus_errors() {
                return Err(anyhow!(error));
            }
        }
    }

    fn close(&mut self) {
        if let Err(err) = self.pipeline.set_state(gstreamer::State::Null) {
            log::warn!("GstreamerBackend: failed to stop pipeline: {}", err);
        }
    }
}

fn sample_to_pixels(sample: &gstreamer::Sample) -> Result<(Vec<u8>, u32, u32)> {
    let buffer = sample.buffer().context("RTSP sample missing buffer")?;
    let caps = sample.caps().context("RTSP sample missing caps")?;
    let info =
        gstreamer_video::VideoInfo::from_caps(caps).context("parse RTSP caps as video info")?;

    let width = info.width();
    let height = info.height();
    let row_bytes = (width as usize) * 3;
    let stride = info.stride()[0] as usize;

    let map = buffer.map_readable().context("map RTSP buffer")?;
    let data = map.as_slice();

    if stride == row_bytes {
        let packed = data
            .get(..row_bytes * height as usize)
            .context("RTSP buffer is shorter than its caps")?;
        return Ok((packed.to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        pixels.extend_from_slice(
            data.get(start..start + row_bytes)
                .context("RTSP buffer row is out of bounds")?,
        );
    }
    Ok((pixels, width, height))
}
