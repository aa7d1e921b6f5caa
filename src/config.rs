use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::bridge::LoopSettings;
use crate::bus::{BrokerEndpoint, MqttSettings, TlsMaterials};

pub const CONFIG_ENV: &str = "IP_CAMERA_CONFIG";

const DEFAULT_URL: &str = "http://192.168.43.1:8080/video";
const DEFAULT_FRAME_ID: &str = "camera";
const DEFAULT_BROKER_ADDR: &str = "127.0.0.1:1883";
const DEFAULT_TOPIC: &str = "camera/image_raw";
const DEFAULT_STATUS_TOPIC: &str = "camera/status";
const DEFAULT_MAX_PACKET_BYTES: u32 = 16 * 1024 * 1024;
const DEFAULT_STALL_WARN_SECS: u64 = 5;
const DEFAULT_STATS_INTERVAL_SECS: u64 = 5;
const MAX_FRAME_ID_LEN: usize = 256;

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct BridgeConfigFile {
    stream: Option<StreamConfigFile>,
    mqtt: Option<MqttConfigFile>,
    #[serde(rename = "loop")]
    timing: Option<LoopConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct StreamConfigFile {
    url: Option<String>,
    display: Option<bool>,
    frame_id: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct MqttConfigFile {
    broker_addr: Option<String>,
    allow_remote: Option<bool>,
    client_id: Option<String>,
    username: Option<String>,
    password: Option<String>,
    use_tls: Option<bool>,
    tls_ca_path: Option<PathBuf>,
    tls_client_cert_path: Option<PathBuf>,
    tls_client_key_path: Option<PathBuf>,
    topic: Option<String>,
    status_topic: Option<String>,
    max_packet_bytes: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct LoopConfigFile {
    stall_warn_secs: Option<u64>,
    stats_interval_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub stream: StreamSettings,
    pub mqtt: BrokerSettings,
    pub timing: TimingSettings,
}

#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub url: String,
    pub display: bool,
    pub frame_id: String,
}

#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub broker_addr: String,
    pub allow_remote: bool,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub use_tls: bool,
    pub tls_ca_path: Option<PathBuf>,
    pub tls_client_cert_path: Option<PathBuf>,
    pub tls_client_key_path: Option<PathBuf>,
    pub topic: String,
    pub status_topic: String,
    pub max_packet_bytes: u32,
}

#[derive(Debug, Clone)]
pub struct TimingSettings {
    pub stall_warn_secs: u64,
    pub stats_interval_secs: u64,
}

/// Command-line values, applied after the file and the environment.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub url: Option<String>,
    /// `-g` can only switch the display on.
    pub display: bool,
    pub frame_id: Option<String>,
    pub broker_addr: Option<String>,
    pub allow_remote: bool,
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub use_tls: bool,
    pub tls_ca_path: Option<PathBuf>,
    pub tls_client_cert_path: Option<PathBuf>,
    pub tls_client_key_path: Option<PathBuf>,
    pub topic: Option<String>,
    pub status_topic: Option<String>,
}

/// Broker flags shared by the binaries. Environment variables are read by
/// `BridgeConfig`, not here, so a flag always beats the environment.
#[derive(clap::Args, Debug, Clone, Default)]
pub struct BrokerArgs {
    /// MQTT broker address (host:port, mqtt://, mqtts://).
    #[arg(long)]
    pub mqtt_broker_addr: Option<String>,

    /// Allow a non-loopback broker.
    #[arg(long)]
    pub allow_remote_mqtt: bool,

    /// MQTT client identifier.
    #[arg(long)]
    pub mqtt_client_id: Option<String>,

    /// MQTT username.
    #[arg(long)]
    pub mqtt_username: Option<String>,

    /// MQTT password.
    #[arg(long)]
    pub mqtt_password: Option<String>,

    /// Use TLS even for a bare host:port address.
    #[arg(long)]
    pub mqtt_use_tls: bool,

    /// PEM CA certificate for MQTT TLS.
    #[arg(long)]
    pub mqtt_tls_ca_path: Option<PathBuf>,

    /// PEM client certificate for MQTT TLS.
    #[arg(long)]
    pub mqtt_tls_client_cert_path: Option<PathBuf>,

    /// PEM client private key for MQTT TLS.
    #[arg(long)]
    pub mqtt_tls_client_key_path: Option<PathBuf>,

    /// Image topic.
    #[arg(long)]
    pub topic: Option<String>,

    /// Availability topic.
    #[arg(long)]
    pub status_topic: Option<String>,
}

impl BrokerArgs {
    pub fn overrides(&self) -> CliOverrides {
        CliOverrides {
            broker_addr: self.mqtt_broker_addr.clone(),
            allow_remote: self.allow_remote_mqtt,
            client_id: self.mqtt_client_id.clone(),
            username: self.mqtt_username.clone(),
            password: self.mqtt_password.clone(),
            use_tls: self.mqtt_use_tls,
            tls_ca_path: self.mqtt_tls_ca_path.clone(),
            tls_client_cert_path: self.mqtt_tls_client_cert_path.clone(),
            tls_client_key_path: self.mqtt_tls_client_key_path.clone(),
            topic: self.topic.clone(),
            status_topic: self.status_topic.clone(),
            ..CliOverrides::default()
        }
    }
}

impl BridgeConfig {
    /// Defaults, then the file named by `IP_CAMERA_CONFIG`, then the environment.
    pub fn load() -> Result<Self> {
        Self::load_with(None, &CliOverrides::default())
    }

    /// Defaults < config file < environment < `cli`.
    ///
    /// `path` wins over `IP_CAMERA_CONFIG` when both are given.
    pub fn load_with(path: Option<&Path>, cli: &CliOverrides) -> Result<Self> {
        let env_path = std::env::var(CONFIG_ENV)
            .ok()
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from);
        let file_cfg = match path.map(Path::to_path_buf).or(env_path) {
            Some(path) => read_config_file(&path)?,
            None => BridgeConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg);
        cfg.apply_env()?;
        cfg.apply_cli(cli);
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: BridgeConfigFile) -> Self {
        let stream = file.stream.unwrap_or_default();
        let mqtt = file.mqtt.unwrap_or_default();
        let timing = file.timing.unwrap_or_default();
        Self {
            stream: StreamSettings {
                url: stream.url.unwrap_or_else(|| DEFAULT_URL.to_string()),
                display: stream.display.unwrap_or(false),
                frame_id: stream
                    .frame_id
                    .unwrap_or_else(|| DEFAULT_FRAME_ID.to_string()),
            },
            mqtt: BrokerSettings {
                broker_addr: mqtt
                    .broker_addr
                    .unwrap_or_else(|| DEFAULT_BROKER_ADDR.to_string()),
                allow_remote: mqtt.allow_remote.unwrap_or(false),
                client_id: mqtt.client_id.unwrap_or_else(default_client_id),
                username: mqtt.username,
                password: mqtt.password,
                use_tls: mqtt.use_tls.unwrap_or(false),
                tls_ca_path: mqtt.tls_ca_path,
                tls_client_cert_path: mqtt.tls_client_cert_path,
                tls_client_key_path: mqtt.tls_client_key_path,
                topic: mqtt.topic.unwrap_or_else(|| DEFAULT_TOPIC.to_string()),
                status_topic: mqtt
                    .status_topic
                    .unwrap_or_else(|| DEFAULT_STATUS_TOPIC.to_string()),
                max_packet_bytes: mqtt.max_packet_bytes.unwrap_or(DEFAULT_MAX_PACKET_BYTES),
            },
            timing: TimingSettings {
                stall_warn_secs: timing.stall_warn_secs.unwrap_or(DEFAULT_STALL_WARN_SECS),
                stats_interval_secs: timing
                    .stats_interval_secs
                    .unwrap_or(DEFAULT_STATS_INTERVAL_SECS),
            },
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(url) = non_empty_env("IP_CAMERA_URL") {
            self.stream.url = url;
        }
        if let Some(display) = non_empty_env("IP_CAMERA_DISPLAY") {
            self.stream.display = parse_bool("IP_CAMERA_DISPLAY", &display)?;
        }
        if let Some(frame_id) = non_empty_env("IP_CAMERA_FRAME_ID") {
            self.stream.frame_id = frame_id;
        }
        if let Some(topic) = non_empty_env("IP_CAMERA_TOPIC") {
            self.mqtt.topic = topic;
        }
        if let Some(addr) = non_empty_env("MQTT_BROKER_ADDR") {
            self.mqtt.broker_addr = addr;
        }
        if let Some(client_id) = non_empty_env("MQTT_CLIENT_ID") {
            self.mqtt.client_id = client_id;
        }
        if let Some(username) = non_empty_env("MQTT_USERNAME") {
            self.mqtt.username = Some(username);
        }
        if let Some(password) = non_empty_env("MQTT_PASSWORD") {
            self.mqtt.password = Some(password);
        }
        Ok(())
    }

    fn apply_cli(&mut self, cli: &CliOverrides) {
        fn set<T: Clone>(slot: &mut T, value: &Option<T>) {
            if let Some(value) = value {
                *slot = value.clone();
            }
        }
        fn set_opt<T: Clone>(slot: &mut Option<T>, value: &Option<T>) {
            if value.is_some() {
                *slot = value.clone();
            }
        }

        set(&mut self.stream.url, &cli.url);
        self.stream.display |= cli.display;
        set(&mut self.stream.frame_id, &cli.frame_id);
        set(&mut self.mqtt.broker_addr, &cli.broker_addr);
        self.mqtt.allow_remote |= cli.allow_remote;
        set(&mut self.mqtt.client_id, &cli.client_id);
        set_opt(&mut self.mqtt.username, &cli.username);
        set_opt(&mut self.mqtt.password, &cli.password);
        self.mqtt.use_tls |= cli.use_tls;
        set_opt(&mut self.mqtt.tls_ca_path, &cli.tls_ca_path);
        set_opt(&mut self.mqtt.tls_client_cert_path, &cli.tls_client_cert_path);
        set_opt(&mut self.mqtt.tls_client_key_path, &cli.tls_client_key_path);
        set(&mut self.mqtt.topic, &cli.topic);
        set(&mut self.mqtt.status_topic, &cli.status_topic);
    }

    fn validate(&mut self) -> Result<()> {
        self.stream.url = self.stream.url.trim().to_string();
        if self.stream.url.is_empty() {
            return Err(anyhow!("stream url must not be empty"));
        }
        if self.stream.frame_id.is_empty() || self.stream.frame_id.len() > MAX_FRAME_ID_LEN {
            return Err(anyhow!(
                "frame_id must be 1..={} bytes",
                MAX_FRAME_ID_LEN
            ));
        }

        validate_topic("topic", &self.mqtt.topic)?;
        validate_topic("status_topic", &self.mqtt.status_topic)?;
        if self.mqtt.topic == self.mqtt.status_topic {
            return Err(anyhow!("topic and status_topic must differ"));
        }
        if self.mqtt.client_id.trim().is_empty() {
            return Err(anyhow!("client_id must not be empty"));
        }
        if self.mqtt.max_packet_bytes == 0 {
            return Err(anyhow!("max_packet_bytes must be greater than zero"));
        }

        let endpoint = self.broker_endpoint()?;
        if !self.mqtt.allow_remote {
            endpoint.require_loopback()?;
        }

        if self.timing.stall_warn_secs == 0 || self.timing.stats_interval_secs == 0 {
            return Err(anyhow!(
                "stall_warn_secs and stats_interval_secs must be greater than zero"
            ));
        }
        Ok(())
    }

    pub fn broker_endpoint(&self) -> Result<BrokerEndpoint> {
        BrokerEndpoint::parse(&self.mqtt.broker_addr, self.mqtt.use_tls)
            .with_context(|| format!("invalid broker_addr {}", self.mqtt.broker_addr))
    }

    /// Resolve the broker section into connection settings, reading TLS files.
    pub fn mqtt_settings(&self) -> Result<MqttSettings> {
        let endpoint = self.broker_endpoint()?;
        if self.mqtt.allow_remote && !endpoint.is_loopback() {
            log::warn!(
                "publishing camera frames to remote broker {}; make sure the network is trusted",
                endpoint
            );
        }
        let tls = TlsMaterials::load(
            self.mqtt.tls_ca_path.as_deref(),
            self.mqtt.tls_client_cert_path.as_deref(),
            self.mqtt.tls_client_key_path.as_deref(),
        )?;
        Ok(MqttSettings {
            endpoint,
            tls,
            client_id: self.mqtt.client_id.clone(),
            username: self.mqtt.username.clone(),
            password: self.mqtt.password.clone(),
            status_topic: self.mqtt.status_topic.clone(),
            max_packet_bytes: self.mqtt.max_packet_bytes,
        })
    }

    pub fn loop_settings(&self) -> LoopSettings {
        LoopSettings {
            stall_warn: Duration::from_secs(self.timing.stall_warn_secs),
            stats_interval: Duration::from_secs(self.timing.stats_interval_secs),
        }
    }
}

fn read_config_file(path: &Path) -> Result<BridgeConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let parsed = match path.extension().and_then(|ext| ext.to_str()) {
        Some("toml") => toml::from_str(&raw).map_err(|e| e.to_string()),
        Some("json") => serde_json::from_str(&raw).map_err(|e| e.to_string()),
        _ => {
            return Err(anyhow!(
                "config file {} must end in .toml or .json",
                path.display()
            ))
        }
    };
    parsed.map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))
}

fn default_client_id() -> String {
    format!("ip_camera_{}", std::process::id())
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(anyhow!("{} must be a boolean, got '{}'", key, other)),
    }
}

fn validate_topic(name: &str, topic: &str) -> Result<()> {
    if topic.is_empty() {
        return Err(anyhow!("{} must not be empty", name));
    }
    if topic.contains(['+', '#', '\0']) {
        return Err(anyhow!(
            "{} '{}' must not contain wildcards or NUL",
            name,
            topic
        ));
    }
    Ok(())
}
