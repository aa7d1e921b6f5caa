//! The acquisition loop: open the stream, then read → publish → (show) until
//! something asks it to stop.
//!
//! ```text
//! Starting ──open ok──▶ Running ──stop reason / fatal──▶ Stopping ──▶ Stopped
//!     └────────────open failed (Connection)──────────────────────────▲
//! ```
//!
//! Reads are never abandoned mid-flight. A stop request is observed between
//! frames, so the frame being handled when it arrives is still published.

use anyhow::anyhow;
use std::time::{Duration, Instant};

use crate::bus::Bus;
use crate::display::DisplaySink;
use crate::ingest::StreamSource;
use crate::publisher::FramePublisher;
use crate::reader::{FrameReader, ReadReply};
use crate::shutdown::{CancellationState, ShutdownSignal, StopReason};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopState {
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// Errors that end the process with a non-zero status.
#[derive(Debug)]
pub enum FatalError {
    /// The stream could not be opened. Never retried.
    Connection(anyhow::Error),
    /// Configuration or bus setup failed before any frame was read.
    Setup(anyhow::Error),
    /// The bus refused a frame.
    Publish(anyhow::Error),
    /// The preview window failed.
    Display(anyhow::Error),
}

impl FatalError {
    pub fn code(&self) -> &'static str {
        match self {
            FatalError::Connection(_) => "connection",
            FatalError::Setup(_) => "setup",
            FatalError::Publish(_) => "publish",
            FatalError::Display(_) => "display",
        }
    }

    /// 1 for startup failures, 2 for failures after frames started flowing.
    pub fn exit_code(&self) -> u8 {
        match self {
            FatalError::Connection(_) | FatalError::Setup(_) => 1,
            FatalError::Publish(_) | FatalError::Display(_) => 2,
        }
    }

    pub fn inner(&self) -> &anyhow::Error {
        match self {
            FatalError::Connection(err)
            | FatalError::Setup(err)
            | FatalError::Publish(err)
            | FatalError::Display(err) => err,
        }
    }
}

impl std::fmt::Display for FatalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} error: {:#}", self.code(), self.inner())
    }
}

impl std::error::Error for FatalError {}

#[derive(Clone, Debug)]
pub struct LoopSettings {
    /// How often to warn while a read is outstanding.
    pub stall_warn: Duration,
    /// How often to log throughput.
    pub stats_interval: Duration,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            stall_warn: Duration::from_secs(5),
            stats_interval: Duration::from_secs(5),
        }
    }
}

/// Outcome of a run that ended without a fatal error.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunSummary {
    pub frames_published: u64,
    pub stop_reason: StopReason,
    pub elapsed: Duration,
}

pub struct AcquisitionLoop<B: Bus> {
    url: String,
    publisher: FramePublisher<B>,
    display: Option<Box<dyn DisplaySink>>,
    settings: LoopSettings,
    state: LoopState,
    ran: bool,
}

impl<B: Bus> AcquisitionLoop<B> {
    pub fn new(
        url: impl Into<String>,
        publisher: FramePublisher<B>,
        display: Option<Box<dyn DisplaySink>>,
        settings: LoopSettings,
    ) -> Self {
        Self {
            url: url.into(),
            publisher,
            display,
            settings,
            state: LoopState::Starting,
            ran: false,
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Run once to completion.
    ///
    /// `connect` opens the stream (normally `StreamSource::open`). Every exit
    /// path closes the source, the display and the bus before returning.
    pub fn run<F>(&mut self, shutdown: ShutdownSignal, connect: F) -> Result<RunSummary, FatalError>
    where
        F: FnOnce(&str) -> anyhow::Result<StreamSource>,
    {
        if self.ran {
            return Err(FatalError::Setup(anyhow!(
                "acquisition loop for {} already ran",
                self.url
            )));
        }
        self.ran = true;
        let started = Instant::now();

        log::info!("opening stream {}", self.url);
        let mut source = match connect(&self.url) {
            Ok(source) => source,
            Err(err) => {
                self.release(None);
                return self.fail(FatalError::Connection(err));
            }
        };
        log::info!("opened stream {}", self.url);

        // Availability goes out only for a stream that actually opened.
        if let Err(err) = self.publisher.announce() {
            source.close();
            self.release(None);
            return self.fail(FatalError::Setup(err));
        }

        let mut reader = match FrameReader::spawn(source) {
            Ok(reader) => reader,
            Err(err) => {
                self.release(None);
                return self.fail(FatalError::Setup(err));
            }
        };

        self.transition(LoopState::Running);
        let mut cancel = CancellationState::new(shutdown);
        let fatal = self.pump(&mut reader, &mut cancel);

        self.transition(LoopState::Stopping);
        self.release(Some(reader));

        if let Some(err) = fatal {
            return self.fail(err);
        }
        self.transition(LoopState::Stopped);
        let summary = RunSummary {
            frames_published: self.publisher.published(),
            stop_reason: cancel
                .stop_reason()
                .unwrap_or(StopReason::SourceExhausted),
            elapsed: started.elapsed(),
        };
        log::info!(
            "stopped ({}): published {} frames in {:.1}s",
            summary.stop_reason,
            summary.frames_published,
            summary.elapsed.as_secs_f64()
        );
        Ok(summary)
    }

    /// The Running state. Returns the fatal error that ended it, if any.
    fn pump(
        &mut self,
        reader: &mut FrameReader,
        cancel: &mut CancellationState,
    ) -> Option<FatalError> {
        let mut last_stats = Instant::now();
        let mut published_at_last_stats = self.publisher.published();

        while cancel.should_continue() {
            match reader.read(self.settings.stall_warn) {
                ReadReply::Frame(frame) => {
                    if let Err(err) = self.publisher.publish(&frame) {
                        return Some(FatalError::Publish(err));
                    }
                    if let Some(display) = self.display.as_mut() {
                        if let Err(err) = display.show(&frame) {
                            return Some(FatalError::Display(err));
                        }
                        if let Some(key) = display.poll_key() {
                            if key.is_abort() {
                                log::info!("{:?} pressed, stopping", key);
                                cancel.mark_user_abort();
                            }
                        }
                    }
                }
                ReadReply::EndOfStream => {
                    log::info!("stream {} ended", self.url);
                    cancel.mark_source_exhausted();
                }
                ReadReply::Failed(err) => {
                    log::warn!("read from {} failed: {:#}", self.url, err);
                    cancel.mark_source_exhausted();
                }
            }

            let since = last_stats.elapsed();
            if since >= self.settings.stats_interval {
                let published = self.publisher.published();
                let rate = (published - published_at_last_stats) as f64 / since.as_secs_f64();
                log::info!(
                    "published={} rate={:.1}fps topic={} url={}",
                    published,
                    rate,
                    self.publisher.topic(),
                    self.url
                );
                last_stats = Instant::now();
                published_at_last_stats = published;
            }
        }
        None
    }

    /// Stopping: close the reader (and with it the source), the display, the bus.
    fn release(&mut self, reader: Option<FrameReader>) {
        if let Some(mut reader) = reader {
            reader.close();
        }
        if let Some(display) = self.display.as_mut() {
            display.close();
        }
        if let Err(err) = self.publisher.close() {
            log::warn!("closing bus failed: {:#}", err);
        }
    }

    fn fail(&mut self, err: FatalError) -> Result<RunSummary, FatalError> {
        log::error!("{}", err);
        self.transition(LoopState::Stopped);
        Err(err)
    }

    fn transition(&mut self, next: LoopState) {
        log::debug!("acquisition loop: {:?} -> {:?}", self.state, next);
        self.state = next;
    }
}
