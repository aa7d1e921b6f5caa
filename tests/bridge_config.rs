use std::io::Write;
use std::sync::Mutex;

use tempfile::Builder;

use ip_camera_bridge::config::{BridgeConfig, CliOverrides};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "IP_CAMERA_CONFIG",
        "IP_CAMERA_URL",
        "IP_CAMERA_DISPLAY",
        "IP_CAMERA_FRAME_ID",
        "IP_CAMERA_TOPIC",
        "MQTT_BROKER_ADDR",
        "MQTT_CLIENT_ID",
        "MQTT_USERNAME",
        "MQTT_PASSWORD",
    ] {
        std::env::remove_var(key);
    }
}

fn write_config(suffix: &str, body: &str) -> tempfile::NamedTempFile {
    let mut file = Builder::new()
        .suffix(suffix)
        .tempfile()
        .expect("temp config");
    file.write_all(body.as_bytes()).expect("write config");
    file
}

#[test]
fn defaults_apply_without_file_or_env() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = BridgeConfig::load().expect("load config");
    assert_eq!(cfg.stream.url, "http://192.168.43.1:8080/video");
    assert!(!cfg.stream.display);
    assert_eq!(cfg.stream.frame_id, "camera");
    assert_eq!(cfg.mqtt.broker_addr, "127.0.0.1:1883");
    assert_eq!(cfg.mqtt.topic, "camera/image_raw");
    assert_eq!(cfg.mqtt.status_topic, "camera/status");
    assert_eq!(cfg.mqtt.max_packet_bytes, 16 * 1024 * 1024);
    assert_eq!(cfg.timing.stats_interval_secs, 5);
}

#[test]
fn toml_file_then_env_then_cli() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        ".toml",
        r#"
            [stream]
            url = "rtsp://cam-file/stream"
            display = true
            frame_id = "porch"

            [mqtt]
            broker_addr = "localhost:1884"
            topic = "porch/image_raw"
            status_topic = "porch/status"
            username = "file-user"
            max_packet_bytes = 4194304

            [loop]
            stall_warn_secs = 2
            stats_interval_secs = 30
        "#,
    );
    std::env::set_var("IP_CAMERA_CONFIG", file.path());
    std::env::set_var("IP_CAMERA_URL", "http://cam-env:8080/video");
    std::env::set_var("MQTT_USERNAME", "env-user");
    std::env::set_var("IP_CAMERA_DISPLAY", "false");

    let cli = CliOverrides {
        url: Some("stub://cli?frames=1".to_string()),
        ..CliOverrides::default()
    };
    let cfg = BridgeConfig::load_with(None, &cli).expect("load config");

    assert_eq!(cfg.stream.url, "stub://cli?frames=1");
    assert!(!cfg.stream.display);
    assert_eq!(cfg.stream.frame_id, "porch");
    assert_eq!(cfg.mqtt.broker_addr, "localhost:1884");
    assert_eq!(cfg.mqtt.topic, "porch/image_raw");
    assert_eq!(cfg.mqtt.status_topic, "porch/status");
    assert_eq!(cfg.mqtt.username.as_deref(), Some("env-user"));
    assert_eq!(cfg.mqtt.max_packet_bytes, 4 * 1024 * 1024);
    assert_eq!(cfg.timing.stall_warn_secs, 2);
    assert_eq!(cfg.loop_settings().stats_interval.as_secs(), 30);

    clear_env();
}

#[test]
fn json_file_and_explicit_path_wins_over_env_path() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let env_file = write_config(".json", r#"{ "stream": { "url": "stub://from-env" } }"#);
    let explicit = write_config(
        ".json",
        r#"{ "stream": { "url": "stub://explicit" }, "mqtt": { "client_id": "cam-1" } }"#,
    );
    std::env::set_var("IP_CAMERA_CONFIG", env_file.path());

    let cfg = BridgeConfig::load_with(Some(explicit.path()), &CliOverrides::default())
        .expect("load config");
    assert_eq!(cfg.stream.url, "stub://explicit");
    assert_eq!(cfg.mqtt.client_id, "cam-1");

    clear_env();
}

#[test]
fn gui_flag_enables_display() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cli = CliOverrides {
        display: true,
        ..CliOverrides::default()
    };
    let cfg = BridgeConfig::load_with(None, &cli).expect("load config");
    assert!(cfg.stream.display);
}

#[test]
fn remote_broker_from_env_is_rejected_unless_allowed() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();
    std::env::set_var("MQTT_BROKER_ADDR", "192.168.1.20:1883");

    let err = BridgeConfig::load().unwrap_err();
    assert!(err.to_string().contains("not loopback"));

    let cli = CliOverrides {
        allow_remote: true,
        ..CliOverrides::default()
    };
    let cfg = BridgeConfig::load_with(None, &cli).expect("load config");
    assert!(!cfg.broker_endpoint().expect("endpoint").is_loopback());

    clear_env();
}

#[test]
fn invalid_inputs_are_reported() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("IP_CAMERA_DISPLAY", "sometimes");
    assert!(BridgeConfig::load().is_err());
    clear_env();

    std::env::set_var("IP_CAMERA_TOPIC", "camera/#");
    assert!(BridgeConfig::load().is_err());
    clear_env();

    let unknown = write_config(".toml", "[stream]\nfps = 30\n");
    assert!(BridgeConfig::load_with(Some(unknown.path()), &CliOverrides::default()).is_err());

    let yaml = write_config(".yaml", "stream: {}\n");
    let err = BridgeConfig::load_with(Some(yaml.path()), &CliOverrides::default()).unwrap_err();
    assert!(err.to_string().contains(".toml or .json"));

    clear_env();
}
