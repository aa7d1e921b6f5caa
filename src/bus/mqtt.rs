//! MQTT v5 bus on `rumqttc`.
//!
//! The connection event loop runs on its own thread. Publishing only enqueues
//! into the client's bounded request channel; a full channel blocks the caller.
//! Availability follows the usual pattern: `online` retained once announced,
//! `offline` retained on clean close after that and as the last will.

use anyhow::{anyhow, Context, Result};
use rumqttc::v5::mqttbytes::v5::LastWill;
use rumqttc::v5::{mqttbytes::QoS, Client, Connection, Event, Incoming, MqttOptions};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use super::tls::{build_transport, BrokerEndpoint, TlsMaterials};
use super::Bus;

pub const PAYLOAD_ONLINE: &str = "online";
pub const PAYLOAD_OFFLINE: &str = "offline";

const KEEP_ALIVE: Duration = Duration::from_secs(60);
const CONNACK_TIMEOUT: Duration = Duration::from_secs(10);
/// Pending-request capacity between `Client` and the event loop.
const REQUEST_CAPACITY: usize = 10;

/// Everything needed to open a broker session.
#[derive(Clone, Debug)]
pub struct MqttSettings {
    pub endpoint: BrokerEndpoint,
    pub tls: TlsMaterials,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub status_topic: String,
    pub max_packet_bytes: u32,
}

impl MqttSettings {
    fn options(&self, with_will: bool) -> Result<MqttOptions> {
        let mut options =
            MqttOptions::new(&self.client_id, &self.endpoint.host, self.endpoint.port);
        options.set_keep_alive(KEEP_ALIVE);
        options.set_clean_start(true);
        options.set_max_packet_size(Some(self.max_packet_bytes));
        if let Some(user) = self.username.as_deref() {
            options.set_credentials(user, self.password.as_deref().unwrap_or_default());
        }
        if with_will {
            let will = LastWill::new(
                self.status_topic.clone(),
                PAYLOAD_OFFLINE.as_bytes().to_vec(),
                QoS::AtLeastOnce,
                true,
                None,
            );
            options.set_last_will(will);
        }
        options.set_transport(build_transport(&self.endpoint, &self.tls)?);
        Ok(options)
    }
}

pub struct MqttBus {
    client: Client,
    endpoint: BrokerEndpoint,
    status_topic: String,
    closing: Arc<AtomicBool>,
    announced: bool,
    connection_handle: Option<JoinHandle<()>>,
}

impl MqttBus {
    /// Connect and wait for the broker's CONNACK. Nothing is published yet.
    pub fn connect(settings: &MqttSettings) -> Result<Self> {
        let (client, connection) = Client::new(settings.options(true)?, REQUEST_CAPACITY);
        let closing = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = mpsc::channel();

        let thread_closing = Arc::clone(&closing);
        let handle = std::thread::Builder::new()
            .name("mqtt-connection".to_string())
            .spawn(move || drive_connection(connection, ready_tx, thread_closing))
            .context("spawn MQTT connection thread")?;

        match ready_rx.recv_timeout(CONNACK_TIMEOUT) {
            Ok(Ok(())) => {}
            Ok(Err(reason)) => {
                let _ = handle.join();
                return Err(anyhow!(
                    "MQTT connect to {} failed: {}",
                    settings.endpoint,
                    reason
                ));
            }
            Err(_) => {
                // The event loop may still be stuck in a TCP connect; leave it detached.
                closing.store(true, Ordering::SeqCst);
                return Err(anyhow!(
                    "no CONNACK from {} within {}s",
                    settings.endpoint,
                    CONNACK_TIMEOUT.as_secs()
                ));
            }
        }

        let bus = Self {
            client,
            endpoint: settings.endpoint.clone(),
            status_topic: settings.status_topic.clone(),
            closing,
            announced: false,
            connection_handle: Some(handle),
        };
        log::info!(
            "MqttBus: connected to {} as {} (TLS: {}, auth: {})",
            bus.endpoint,
            settings.client_id,
            settings.endpoint.use_tls,
            settings.username.is_some()
        );
        Ok(bus)
    }

    fn publish_status(&mut self, status: &str) -> Result<()> {
        self.client
            .publish(
                self.status_topic.as_str(),
                QoS::AtLeastOnce,
                true,
                status.as_bytes().to_vec(),
            )
            .with_context(|| format!("publish {} to {}", status, self.status_topic))?;
        log::debug!("MqttBus: {} -> {}", self.status_topic, status);
        Ok(())
    }
}

impl Bus for MqttBus {
    fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.client
            .publish(topic, QoS::AtMostOnce, false, payload)
            .with_context(|| format!("publish to {} on {}", topic, self.endpoint))?;
        Ok(())
    }

    fn announce(&mut self) -> Result<()> {
        if self.announced {
            return Ok(());
        }
        if self.connection_handle.is_none() {
            return Err(anyhow!("announce on closed bus {}", self.endpoint));
        }
        self.publish_status(PAYLOAD_ONLINE)?;
        self.announced = true;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        let Some(handle) = self.connection_handle.take() else {
            return Ok(());
        };
        self.closing.store(true, Ordering::SeqCst);
        let status = if self.announced {
            self.publish_status(PAYLOAD_OFFLINE)
        } else {
            Ok(())
        };
        let disconnect = self.client.disconnect().context("disconnect from broker");
        if handle.join().is_err() {
            log::error!("MQTT connection thread panicked");
        }
        status?;
        disconnect?;
        log::info!("MqttBus: disconnected from {}", self.endpoint);
        Ok(())
    }
}

impl Drop for MqttBus {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            log::warn!("MqttBus: close on drop failed: {:#}", err);
        }
    }
}

fn drive_connection(
    mut connection: Connection,
    ready: mpsc::Sender<std::result::Result<(), String>>,
    closing: Arc<AtomicBool>,
) {
    let mut ready = Some(ready);
    for event in connection.iter() {
        match event {
            Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                if let Some(ready) = ready.take() {
                    let _ = ready.send(Ok(()));
                }
            }
            Ok(_) => {}
            Err(err) => {
                if let Some(ready) = ready.take() {
                    let _ = ready.send(Err(err.to_string()));
                } else if closing.load(Ordering::SeqCst) {
                    log::debug!("MQTT connection ended: {}", err);
                } else {
                    log::warn!("MQTT connection error: {}", err);
                }
                break;
            }
        }
    }
}

/// Open a plain subscriber session (no last will) for tools that read the bus.
pub fn connect_subscriber(settings: &MqttSettings) -> Result<(Client, Connection)> {
    let options = settings.options(false)?;
    Ok(Client::new(options, REQUEST_CAPACITY))
}
