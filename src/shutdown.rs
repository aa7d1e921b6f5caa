//! Cooperative cancellation for the acquisition loop.

use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Exit status used when a second signal arrives while shutdown is in progress.
pub const FORCED_EXIT_CODE: i32 = 130;

/// Process-wide "please stop" flag. Clones share the flag.
#[derive(Clone, Debug, Default)]
pub struct ShutdownSignal {
    flag: Arc<AtomicBool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Route SIGINT/SIGTERM into `signal`.
///
/// The first signal only sets the flag; the loop sees it before its next read.
/// A read blocked on a silent camera never returns, so a second signal exits
/// the process immediately.
pub fn install_signal_handler(signal: &ShutdownSignal) -> Result<()> {
    let signal = signal.clone();
    let received = AtomicUsize::new(0);
    ctrlc::set_handler(move || {
        if received.fetch_add(1, Ordering::SeqCst) == 0 {
            log::warn!("shutdown signal received, stopping after the current frame");
            signal.trigger();
        } else {
            log::error!("second shutdown signal, exiting without cleanup");
            std::process::exit(FORCED_EXIT_CODE);
        }
    })
    .context("install SIGINT/SIGTERM handler")
}

/// Why the loop stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    ExternalShutdown,
    UserAbort,
    SourceExhausted,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::ExternalShutdown => write!(f, "shutdown signal"),
            StopReason::UserAbort => write!(f, "user abort"),
            StopReason::SourceExhausted => write!(f, "stream ended"),
        }
    }
}

/// The three reasons to stop, checked once per iteration.
#[derive(Debug)]
pub struct CancellationState {
    external_shutdown: ShutdownSignal,
    user_abort: bool,
    source_exhausted: bool,
}

impl CancellationState {
    pub fn new(external_shutdown: ShutdownSignal) -> Self {
        Self {
            external_shutdown,
            user_abort: false,
            source_exhausted: false,
        }
    }

    pub fn should_continue(&self) -> bool {
        self.stop_reason().is_none()
    }

    /// External shutdown wins over user abort, which wins over exhaustion.
    pub fn stop_reason(&self) -> Option<StopReason> {
        if self.external_shutdown.is_triggered() {
            Some(StopReason::ExternalShutdown)
        } else if self.user_abort {
            Some(StopReason::UserAbort)
        } else if self.source_exhausted {
            Some(StopReason::SourceExhausted)
        } else {
            None
        }
    }

    pub fn mark_user_abort(&mut self) {
        self.user_abort = true;
    }

    pub fn mark_source_exhausted(&mut self) {
        self.source_exhausted = true;
    }
}
