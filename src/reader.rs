//! Dedicated reader thread for the blocking `StreamSource::read_frame` call.
//!
//! The loop and the thread talk strictly request/reply: one request yields one
//! reply, so there is never more than one read in flight and no read-ahead.
//! The thread owns the source and closes it on its way out, whichever way that is.

use anyhow::{anyhow, Context, Result};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::frame::Frame;
use crate::ingest::StreamSource;

const MIN_STALL_WARN: Duration = Duration::from_millis(100);

/// Outcome of one read request.
#[derive(Debug)]
pub enum ReadReply {
    Frame(Frame),
    EndOfStream,
    Failed(anyhow::Error),
}

pub struct FrameReader {
    url: String,
    requests: Option<Sender<()>>,
    replies: Receiver<ReadReply>,
    join: Option<JoinHandle<()>>,
}

impl FrameReader {
    /// Move `source` onto its own thread.
    pub fn spawn(source: StreamSource) -> Result<Self> {
        let url = source.url().to_string();
        let (request_tx, request_rx) = mpsc::channel();
        let (reply_tx, reply_rx) = mpsc::channel();
        let join = std::thread::Builder::new()
            .name("frame-reader".to_string())
            .spawn(move || run_reader(source, request_rx, reply_tx))
            .context("spawn frame reader thread")?;
        Ok(Self {
            url,
            requests: Some(request_tx),
            replies: reply_rx,
            join: Some(join),
        })
    }

    /// Request one frame and wait for it.
    ///
    /// There is no timeout: a silent source blocks here. A warning is logged every
    /// `stall_warn` while waiting.
    pub fn read(&self, stall_warn: Duration) -> ReadReply {
        let Some(requests) = self.requests.as_ref() else {
            return ReadReply::Failed(anyhow!("frame reader for {} is closed", self.url));
        };
        if requests.send(()).is_err() {
            return ReadReply::Failed(anyhow!("frame reader for {} has exited", self.url));
        }

        let started = Instant::now();
        let interval = stall_warn.max(MIN_STALL_WARN);
        loop {
            match self.replies.recv_timeout(interval) {
                Ok(reply) => return reply,
                Err(RecvTimeoutError::Timeout) => {
                    log::warn!(
                        "no frame from {} for {:.1}s, still waiting",
                        self.url,
                        started.elapsed().as_secs_f64()
                    );
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return ReadReply::Failed(anyhow!(
                        "frame reader for {} stopped without replying",
                        self.url
                    ));
                }
            }
        }
    }

    /// Stop the thread and wait for it to close the source. Idempotent.
    pub fn close(&mut self) {
        self.requests.take();
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                log::error!("frame reader thread for {} panicked", self.url);
            }
        }
    }
}

impl Drop for FrameReader {
    fn drop(&mut self) {
        self.close();
    }
}

fn run_reader(mut source: StreamSource, requests: Receiver<()>, replies: Sender<ReadReply>) {
    while requests.recv().is_ok() {
        let reply = match source.read_frame() {
            Ok(Some(frame)) => ReadReply::Frame(frame),
            Ok(None) => ReadReply::EndOfStream,
            Err(err) => ReadReply::Failed(err),
        };
        let finished = !matches!(reply, ReadReply::Frame(_));
        if replies.send(reply).is_err() || finished {
            break;
        }
    }
    source.close();
}
