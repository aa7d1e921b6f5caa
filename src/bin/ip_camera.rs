//! ip_camera - Publish an IP camera stream as MQTT image messages.
//!
//! 1. Loads configuration (defaults < file < environment < flags)
//! 2. Connects to the broker
//! 3. Opens the stream, announces `online` on the status topic, then publishes
//!    every frame as a `bgr8` image message
//! 4. Optionally mirrors the stream to a preview window (ESC quits)
//!
//! Exit status: 0 on a clean stop, 1 if startup failed, 2 if publishing or the
//! preview failed mid-stream. A second Ctrl-C exits with 130.

use clap::Parser;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;

use ip_camera_bridge::config::BrokerArgs;
use ip_camera_bridge::display;
use ip_camera_bridge::ui::{Ui, UiMode};
use ip_camera_bridge::{
    install_signal_handler, AcquisitionLoop, BridgeConfig, FatalError, FramePublisher, MqttBus,
    RunSummary, ShutdownSignal, StreamSource,
};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Publish an IP camera stream as MQTT image messages"
)]
struct Args {
    /// Stream URL: http(s) MJPEG, rtsp://, /dev/videoN or stub://.
    #[arg(short = 'u', long)]
    url: Option<String>,

    /// Show the stream in a preview window. ESC or closing the window stops.
    #[arg(short = 'g', long)]
    gui: bool,

    /// Configuration file (.toml or .json).
    #[arg(long, env = "IP_CAMERA_CONFIG")]
    config: Option<PathBuf>,

    /// frame_id stamped into every message header.
    #[arg(long)]
    frame_id: Option<String>,

    #[command(flatten)]
    broker: BrokerArgs,

    /// UI mode for stderr progress.
    #[arg(long, value_enum, default_value_t = UiMode::Auto, value_name = "MODE")]
    ui: UiMode,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let ui = Ui::new(
        args.ui,
        std::io::stderr().is_terminal(),
        !std::io::stdout().is_terminal(),
    );

    match run(&args, &ui) {
        Ok(_) => ExitCode::SUCCESS,
        Err(err) => ExitCode::from(err.exit_code()),
    }
}

fn run(args: &Args, ui: &Ui) -> Result<RunSummary, FatalError> {
    let config = {
        let stage = ui.stage("Load configuration");
        let mut overrides = args.broker.overrides();
        overrides.url = args.url.clone();
        overrides.display = args.gui;
        overrides.frame_id = args.frame_id.clone();
        let config = setup(BridgeConfig::load_with(args.config.as_deref(), &overrides))?;
        stage.done();
        config
    };

    let shutdown = ShutdownSignal::new();
    setup(install_signal_handler(&shutdown))?;

    let bus = {
        let stage = ui.stage("Connect to MQTT broker");
        let bus = setup(config.mqtt_settings().and_then(|s| MqttBus::connect(&s)))?;
        stage.done();
        bus
    };

    let display = if config.stream.display {
        let stage = ui.stage("Prepare preview window");
        let window = setup(display::open_window())?;
        stage.done();
        Some(window)
    } else {
        None
    };

    let publisher = FramePublisher::new(bus, &config.mqtt.topic, &config.stream.frame_id);
    log::info!(
        "publishing {} to {} as frame_id={} (display: {})",
        config.stream.url,
        config.mqtt.topic,
        config.stream.frame_id,
        config.stream.display
    );

    let mut bridge = AcquisitionLoop::new(
        &config.stream.url,
        publisher,
        display,
        config.loop_settings(),
    );
    bridge.run(shutdown, StreamSource::open)
}

fn setup<T>(result: anyhow::Result<T>) -> Result<T, FatalError> {
    result.map_err(|err| {
        let err = FatalError::Setup(err);
        log::error!("{}", err);
        err
    })
}
