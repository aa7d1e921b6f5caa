use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};

use ip_camera_bridge::ingest::{CaptureBackend, PixelFormat, RawCapture};
use ip_camera_bridge::{
    AcquisitionLoop, DisplaySink, FatalError, Frame, FramePublisher, ImageMessage, Key,
    LoopSettings, LoopState, MemoryBus, RunSummary, ShutdownSignal, StopReason, StreamSource,
};

const TOPIC: &str = "camera/image_raw";
const URL: &str = "scripted://camera";

#[derive(Clone, Default)]
struct Counters {
    reads: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
}

impl Counters {
    fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

/// Serves `frames` 4x2 BGR frames whose bytes all equal the frame index.
struct ScriptedBackend {
    frames: usize,
    fail_open: bool,
    fail_read_at: Option<usize>,
    signal_at: Option<(usize, ShutdownSignal)>,
    counters: Counters,
}

impl ScriptedBackend {
    fn new(frames: usize, counters: &Counters) -> Self {
        Self {
            frames,
            fail_open: false,
            fail_read_at: None,
            signal_at: None,
            counters: counters.clone(),
        }
    }
}

impl CaptureBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn open(&mut self) -> Result<()> {
        if self.fail_open {
            return Err(anyhow!("connection refused"));
        }
        Ok(())
    }

    fn read(&mut self) -> Result<Option<RawCapture>> {
        let n = self.counters.reads.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((at, signal)) = &self.signal_at {
            if n == *at {
                signal.trigger();
            }
        }
        if self.fail_read_at == Some(n) {
            return Err(anyhow!("socket reset"));
        }
        if n > self.frames {
            return Ok(None);
        }
        Ok(Some(RawCapture {
            pixels: vec![n as u8; 4 * 2 * 3],
            width: 4,
            height: 2,
            format: PixelFormat::Bgr24,
        }))
    }

    fn close(&mut self) {
        self.counters.closes.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Clone, Default)]
struct DisplayLog {
    shown: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
}

/// Reports `key` once `abort_after` frames have been shown.
struct ScriptedDisplay {
    abort_after: Option<usize>,
    key: Key,
    fail_show: bool,
    log: DisplayLog,
}

impl ScriptedDisplay {
    fn passive(log: &DisplayLog) -> Self {
        Self {
            abort_after: None,
            key: Key::Escape,
            fail_show: false,
            log: log.clone(),
        }
    }
}

impl DisplaySink for ScriptedDisplay {
    fn show(&mut self, _frame: &Frame) -> Result<()> {
        if self.fail_show {
            return Err(anyhow!("no display server"));
        }
        self.log.shown.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn poll_key(&mut self) -> Option<Key> {
        let shown = self.log.shown.load(Ordering::SeqCst);
        match self.abort_after {
            Some(k) if shown >= k => Some(self.key),
            _ => Some(Key::Other).filter(|_| shown % 2 == 0),
        }
    }

    fn close(&mut self) {
        self.log.closes.fetch_add(1, Ordering::SeqCst);
    }
}

struct Outcome {
    result: std::result::Result<RunSummary, FatalError>,
    state: LoopState,
}

fn run(
    backend: ScriptedBackend,
    bus: &MemoryBus,
    display: Option<Box<dyn DisplaySink>>,
    signal: ShutdownSignal,
) -> Outcome {
    let publisher = FramePublisher::new(bus.clone(), TOPIC, "camera");
    let mut bridge = AcquisitionLoop::new(URL, publisher, display, LoopSettings::default());
    let result = bridge.run(signal, move |url| {
        StreamSource::open_with(url, Box::new(backend))
    });
    Outcome {
        result,
        state: bridge.state(),
    }
}

fn decoded(bus: &MemoryBus) -> Result<Vec<ImageMessage>> {
    bus.messages()
        .iter()
        .map(|m| {
            assert_eq!(m.topic, TOPIC);
            ImageMessage::decode(&m.payload)
        })
        .collect()
}

fn summary(outcome: Outcome) -> Result<RunSummary> {
    assert_eq!(outcome.state, LoopState::Stopped);
    outcome.result.map_err(|e| anyhow!("{}", e))
}

#[test]
fn finite_stream_publishes_every_frame_in_order() -> Result<()> {
    let counters = Counters::default();
    let bus = MemoryBus::new();
    let outcome = run(
        ScriptedBackend::new(5, &counters),
        &bus,
        None,
        ShutdownSignal::new(),
    );

    let summary = summary(outcome)?;
    assert_eq!(summary.frames_published, 5);
    assert_eq!(summary.stop_reason, StopReason::SourceExhausted);

    let messages = decoded(&bus)?;
    assert_eq!(messages.len(), 5);
    for (i, msg) in messages.iter().enumerate() {
        assert_eq!(msg.header.seq, i as u32);
        assert_eq!(msg.encoding, "bgr8");
        assert!(msg.data.iter().all(|&b| b as usize == i + 1));
    }
    assert!(messages
        .windows(2)
        .all(|pair| pair[0].header.stamp <= pair[1].header.stamp));

    assert_eq!(counters.closes(), 1);
    assert_eq!(bus.announce_calls(), 1);
    assert_eq!(bus.close_calls(), 1);
    Ok(())
}

#[test]
fn failed_open_publishes_nothing_and_exits_1() {
    let counters = Counters::default();
    let mut backend = ScriptedBackend::new(5, &counters);
    backend.fail_open = true;
    let bus = MemoryBus::new();

    let outcome = run(backend, &bus, None, ShutdownSignal::new());
    assert_eq!(outcome.state, LoopState::Stopped);
    let err = outcome.result.unwrap_err();
    assert!(matches!(err, FatalError::Connection(_)));
    assert_eq!(err.exit_code(), 1);
    assert!(err.to_string().contains("connection refused"));

    assert!(bus.messages().is_empty());
    assert_eq!(bus.announce_calls(), 0);
    assert_eq!(counters.reads(), 0);
    assert_eq!(bus.close_calls(), 1);
}

#[test]
fn display_does_not_change_what_is_published() -> Result<()> {
    let headless_bus = MemoryBus::new();
    summary(run(
        ScriptedBackend::new(4, &Counters::default()),
        &headless_bus,
        None,
        ShutdownSignal::new(),
    ))?;

    let display_log = DisplayLog::default();
    let windowed_bus = MemoryBus::new();
    summary(run(
        ScriptedBackend::new(4, &Counters::default()),
        &windowed_bus,
        Some(Box::new(ScriptedDisplay::passive(&display_log))),
        ShutdownSignal::new(),
    ))?;

    let strip = |msgs: Vec<ImageMessage>| -> Vec<(u32, Vec<u8>)> {
        msgs.into_iter().map(|m| (m.header.seq, m.data)).collect()
    };
    assert_eq!(
        strip(decoded(&headless_bus)?),
        strip(decoded(&windowed_bus)?)
    );
    assert_eq!(display_log.shown.load(Ordering::SeqCst), 4);
    assert_eq!(display_log.closes.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
fn escape_after_frame_k_stops_before_the_next_read() -> Result<()> {
    let counters = Counters::default();
    let display_log = DisplayLog::default();
    let display = ScriptedDisplay {
        abort_after: Some(3),
        ..ScriptedDisplay::passive(&display_log)
    };
    let bus = MemoryBus::new();

    let summary = summary(run(
        ScriptedBackend::new(10, &counters),
        &bus,
        Some(Box::new(display)),
        ShutdownSignal::new(),
    ))?;

    assert_eq!(summary.stop_reason, StopReason::UserAbort);
    assert_eq!(summary.frames_published, 3);
    assert_eq!(counters.reads(), 3);
    assert_eq!(counters.closes(), 1);
    assert_eq!(display_log.closes.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
fn closing_the_window_counts_as_abort() -> Result<()> {
    let counters = Counters::default();
    let display = ScriptedDisplay {
        abort_after: Some(1),
        key: Key::WindowClosed,
        ..ScriptedDisplay::passive(&DisplayLog::default())
    };
    let summary = summary(run(
        ScriptedBackend::new(10, &counters),
        &MemoryBus::new(),
        Some(Box::new(display)),
        ShutdownSignal::new(),
    ))?;
    assert_eq!(summary.stop_reason, StopReason::UserAbort);
    assert_eq!(counters.reads(), 1);
    Ok(())
}

#[test]
fn signal_during_a_read_stops_after_that_frame() -> Result<()> {
    let counters = Counters::default();
    let signal = ShutdownSignal::new();
    let mut backend = ScriptedBackend::new(10, &counters);
    backend.signal_at = Some((2, signal.clone()));
    let bus = MemoryBus::new();

    let summary = summary(run(backend, &bus, None, signal))?;
    assert_eq!(summary.stop_reason, StopReason::ExternalShutdown);
    assert_eq!(summary.frames_published, 2);
    assert_eq!(counters.reads(), 2);
    assert_eq!(counters.closes(), 1);
    Ok(())
}

#[test]
fn signal_before_start_reads_nothing() -> Result<()> {
    let counters = Counters::default();
    let signal = ShutdownSignal::new();
    signal.trigger();
    let bus = MemoryBus::new();

    let summary = summary(run(
        ScriptedBackend::new(10, &counters),
        &bus,
        None,
        signal,
    ))?;
    assert_eq!(summary.stop_reason, StopReason::ExternalShutdown);
    assert_eq!(summary.frames_published, 0);
    assert_eq!(counters.reads(), 0);
    assert_eq!(counters.closes(), 1);
    Ok(())
}

#[test]
fn read_error_ends_the_run_gracefully() -> Result<()> {
    let counters = Counters::default();
    let mut backend = ScriptedBackend::new(10, &counters);
    backend.fail_read_at = Some(3);
    let bus = MemoryBus::new();

    let summary = summary(run(backend, &bus, None, ShutdownSignal::new()))?;
    assert_eq!(summary.stop_reason, StopReason::SourceExhausted);
    assert_eq!(summary.frames_published, 2);
    assert_eq!(counters.closes(), 1);
    Ok(())
}

#[test]
fn publish_failure_is_fatal_and_releases_the_source() {
    let counters = Counters::default();
    let bus = MemoryBus::failing_after(2);

    let outcome = run(
        ScriptedBackend::new(10, &counters),
        &bus,
        None,
        ShutdownSignal::new(),
    );
    assert_eq!(outcome.state, LoopState::Stopped);
    let err = outcome.result.unwrap_err();
    assert!(matches!(err, FatalError::Publish(_)));
    assert_eq!(err.exit_code(), 2);

    assert_eq!(bus.messages().len(), 2);
    assert_eq!(counters.reads(), 3);
    assert_eq!(counters.closes(), 1);
    assert_eq!(bus.close_calls(), 1);
}

#[test]
fn display_failure_is_fatal_after_publishing() {
    let counters = Counters::default();
    let display_log = DisplayLog::default();
    let display = ScriptedDisplay {
        fail_show: true,
        ..ScriptedDisplay::passive(&display_log)
    };
    let bus = MemoryBus::new();

    let outcome = run(
        ScriptedBackend::new(10, &counters),
        &bus,
        Some(Box::new(display)),
        ShutdownSignal::new(),
    );
    let err = outcome.result.unwrap_err();
    assert!(matches!(err, FatalError::Display(_)));
    assert_eq!(err.exit_code(), 2);
    assert_eq!(bus.messages().len(), 1);
    assert_eq!(counters.closes(), 1);
    assert_eq!(display_log.closes.load(Ordering::SeqCst), 1);
}

#[test]
fn vga_stub_frame_publishes_full_bgr8_payload() -> Result<()> {
    let bus = MemoryBus::new();
    let publisher = FramePublisher::new(bus.clone(), TOPIC, "camera");
    let mut bridge = AcquisitionLoop::new(
        "stub://vga?frames=1",
        publisher,
        None,
        LoopSettings::default(),
    );
    bridge
        .run(ShutdownSignal::new(), StreamSource::open)
        .map_err(|e| anyhow!("{}", e))?;

    let messages = decoded(&bus)?;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].encoding, "bgr8");
    assert_eq!((messages[0].width, messages[0].height), (640, 480));
    assert_eq!(messages[0].step, 640 * 3);
    assert_eq!(messages[0].data.len(), 640 * 480 * 3);
    Ok(())
}

#[test]
fn closing_a_source_twice_is_not_an_error() -> Result<()> {
    let counters = Counters::default();
    let mut source = StreamSource::open_with(URL, Box::new(ScriptedBackend::new(1, &counters)))?;
    source.close();
    source.close();
    drop(source);
    assert_eq!(counters.closes(), 1);
    Ok(())
}
