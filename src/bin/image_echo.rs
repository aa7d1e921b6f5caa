//! image_echo - Subscribe to the bridge's topics and log what arrives.
//!
//! One line per decoded image (seq, stamp, size, encoding) plus availability
//! changes. Useful to confirm a camera is flowing without a viewer.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use rumqttc::v5::{mqttbytes::QoS, Event, Incoming};
use std::path::PathBuf;
use std::time::Duration;

use ip_camera_bridge::bus::connect_subscriber;
use ip_camera_bridge::config::BrokerArgs;
use ip_camera_bridge::{install_signal_handler, BridgeConfig, ImageMessage, ShutdownSignal};

#[derive(Parser, Debug)]
#[command(author, version, about = "Log image messages published by ip_camera")]
struct Args {
    /// Configuration file (.toml or .json), shared with ip_camera.
    #[arg(long, env = "IP_CAMERA_CONFIG")]
    config: Option<PathBuf>,

    #[command(flatten)]
    broker: BrokerArgs,

    /// Exit after this many images.
    #[arg(long)]
    count: Option<u64>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = BridgeConfig::load_with(args.config.as_deref(), &args.broker.overrides())?;
    let mut settings = config.mqtt_settings()?;
    if args.broker.mqtt_client_id.is_none() {
        settings.client_id = format!("image_echo_{}", std::process::id());
    }
    let image_topic = config.mqtt.topic.clone();
    let status_topic = config.mqtt.status_topic.clone();

    let (client, mut connection) = connect_subscriber(&settings)?;
    client.subscribe(image_topic.as_str(), QoS::AtMostOnce)?;
    client.subscribe(status_topic.as_str(), QoS::AtMostOnce)?;
    log::info!(
        "subscribed to {} and {} on {}",
        image_topic,
        status_topic,
        settings.endpoint
    );

    let shutdown = ShutdownSignal::new();
    install_signal_handler(&shutdown)?;
    let watcher_client = client.clone();
    let watcher_signal = shutdown.clone();
    std::thread::Builder::new()
        .name("shutdown-watcher".to_string())
        .spawn(move || {
            while !watcher_signal.is_triggered() {
                std::thread::sleep(Duration::from_millis(100));
            }
            let _ = watcher_client.disconnect();
        })
        .context("spawn shutdown watcher")?;

    let mut received = 0u64;
    for event in connection.iter() {
        match event {
            Ok(Event::Incoming(Incoming::Publish(publish))) => {
                let topic = match std::str::from_utf8(&publish.topic) {
                    Ok(topic) => topic.to_string(),
                    Err(e) => {
                        log::warn!("Skipping publish with invalid topic: {}", e);
                        continue;
                    }
                };
                if topic == status_topic {
                    log::info!(
                        "{} is {}",
                        topic,
                        String::from_utf8_lossy(&publish.payload)
                    );
                    continue;
                }
                match ImageMessage::decode(&publish.payload) {
                    Ok(msg) => {
                        received += 1;
                        log::info!(
                            "seq={} stamp={} frame_id={} {}x{} {} ({} bytes)",
                            msg.header.seq,
                            msg.header.stamp,
                            msg.header.frame_id,
                            msg.width,
                            msg.height,
                            msg.encoding,
                            msg.data.len()
                        );
                    }
                    Err(e) => log::warn!("undecodable message on {}: {:#}", topic, e),
                }
                if args.count.is_some_and(|n| received >= n) {
                    break;
                }
            }
            Ok(_) => {}
            Err(e) if shutdown.is_triggered() => {
                log::debug!("connection closed after shutdown: {}", e);
                break;
            }
            Err(e) => return Err(anyhow!("MQTT connection error: {}", e)),
        }
    }

    let _ = client.disconnect();
    log::info!("received {} images", received);
    Ok(())
}
