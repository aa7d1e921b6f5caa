//! Publish/subscribe bus seam.
//!
//! `MqttBus` is the production bus. `MemoryBus` records publishes and
//! announces in-process and can be told to start failing, which is how loop behavior is exercised
//! without a broker.

mod mqtt;
mod tls;

use anyhow::{anyhow, Result};
use std::sync::{Arc, Mutex, MutexGuard};

pub use mqtt::{connect_subscriber, MqttBus, MqttSettings, PAYLOAD_OFFLINE, PAYLOAD_ONLINE};
pub use tls::{build_transport, BrokerEndpoint, TlsMaterials};

/// A named-channel message sink.
pub trait Bus {
    /// Hand `payload` to the bus for `topic`. Returns once it is queued, not delivered.
    fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<()>;

    /// Mark this publisher available. Called once the stream is open.
    fn announce(&mut self) -> Result<()>;

    /// Withdraw availability if it was announced, then disconnect. Calling this
    /// again is a no-op.
    fn close(&mut self) -> Result<()>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Default)]
struct MemoryBusState {
    messages: Vec<PublishedMessage>,
    fail_after: Option<usize>,
    announce_calls: usize,
    close_calls: usize,
}

/// In-process bus. Clones share one message log.
#[derive(Clone, Debug, Default)]
pub struct MemoryBus {
    state: Arc<Mutex<MemoryBusState>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// A bus that accepts `n` publishes and rejects the rest.
    pub fn failing_after(n: usize) -> Self {
        let bus = Self::default();
        bus.lock().fail_after = Some(n);
        bus
    }

    pub fn messages(&self) -> Vec<PublishedMessage> {
        self.lock().messages.clone()
    }

    pub fn announce_calls(&self) -> usize {
        self.lock().announce_calls
    }

    pub fn close_calls(&self) -> usize {
        self.lock().close_calls
    }

    fn lock(&self) -> MutexGuard<'_, MemoryBusState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Bus for MemoryBus {
    fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<()> {
        let mut state = self.lock();
        if state.close_calls > 0 {
            return Err(anyhow!("memory bus is closed"));
        }
        if let Some(limit) = state.fail_after {
            if state.messages.len() >= limit {
                return Err(anyhow!("memory bus rejected publish to {}", topic));
            }
        }
        state.messages.push(PublishedMessage {
            topic: topic.to_string(),
            payload,
        });
        Ok(())
    }

    fn announce(&mut self) -> Result<()> {
        let mut state = self.lock();
        if state.close_calls > 0 {
            return Err(anyhow!("memory bus is closed"));
        }
        state.announce_calls += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.lock().close_calls += 1;
        Ok(())
    }
}
