//! Frame → bus message.

use anyhow::{Context, Result};

use crate::bus::Bus;
use crate::frame::Frame;
use crate::message::ImageMessage;

/// Publishes each frame as one `ImageMessage` on a fixed topic.
///
/// No buffering and no retry: a failed publish is returned to the caller as is.
pub struct FramePublisher<B: Bus> {
    bus: B,
    topic: String,
    frame_id: String,
    next_seq: u32,
    published: u64,
    closed: bool,
}

impl<B: Bus> FramePublisher<B> {
    pub fn new(bus: B, topic: impl Into<String>, frame_id: impl Into<String>) -> Self {
        Self {
            bus,
            topic: topic.into(),
            frame_id: frame_id.into(),
            next_seq: 0,
            published: 0,
            closed: false,
        }
    }

    pub fn publish(&mut self, frame: &Frame) -> Result<()> {
        let message = ImageMessage::from_frame(frame, self.next_seq, &self.frame_id);
        let payload = message
            .encode()
            .with_context(|| format!("encode frame {}", frame.seq()))?;
        let len = payload.len();
        self.bus
            .publish(&self.topic, payload)
            .with_context(|| format!("publish frame {} to {}", frame.seq(), self.topic))?;
        log::debug!(
            "FramePublisher: frame {} as seq {} ({} bytes, stamp {})",
            frame.seq(),
            self.next_seq,
            len,
            frame.stamp()
        );
        self.next_seq = self.next_seq.wrapping_add(1);
        self.published += 1;
        Ok(())
    }

    /// Tell the bus this publisher is live.
    pub fn announce(&mut self) -> Result<()> {
        self.bus
            .announce()
            .with_context(|| format!("announce publisher for {}", self.topic))
    }

    pub fn published(&self) -> u64 {
        self.published
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Close the underlying bus. Calling this again is a no-op.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.bus.close()
    }
}
