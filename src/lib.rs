//! IP camera bridge
//!
//! Pulls frames from a network video stream and republishes each one as a
//! timestamped `bgr8` image message on an MQTT topic, optionally mirroring the
//! stream to a local preview window.
//!
//! # Module Structure
//!
//! - `ingest`: stream sources (HTTP MJPEG, RTSP, V4L2, synthetic `stub://`)
//! - `reader`: the thread that owns the source and performs blocking reads
//! - `bridge`: the acquisition loop, its states and fatal errors
//! - `publisher`, `message`, `bus`: frame → envelope → MQTT
//! - `display`: the optional preview window
//! - `shutdown`: signal handling and the per-iteration stop predicate
//! - `config`, `ui`: process configuration and startup progress

pub mod bridge;
pub mod bus;
pub mod config;
pub mod display;
pub mod frame;
pub mod ingest;
pub mod message;
pub mod publisher;
pub mod reader;
pub mod shutdown;
pub mod ui;

pub use bridge::{AcquisitionLoop, FatalError, LoopSettings, LoopState, RunSummary};
pub use bus::{Bus, MemoryBus, MqttBus};
pub use config::{BridgeConfig, CliOverrides};
pub use display::{DisplaySink, Key};
pub use frame::{Frame, PixelLayout, Stamp};
pub use ingest::{CaptureBackend, RawCapture, StreamSource};
pub use message::ImageMessage;
pub use publisher::FramePublisher;
pub use shutdown::{install_signal_handler, CancellationState, ShutdownSignal, StopReason};
