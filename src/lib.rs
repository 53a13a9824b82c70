//! Climate telemetry agent
//!
//! Device-side agent for a small Linux board with an MH-Z19 CO2 sensor on a
//! UART and a DHT-family temperature/humidity sensor. Every interval it
//! acquires one reading, composes a JSON telemetry message with alert
//! properties, and hands it to an MQTT cloud channel. Delivery
//! confirmations, cloud-to-device messages, twin updates, and remote
//! `start`/`stop` method calls come back asynchronously and are handled by
//! an event pump.
//!
//! # Overview
//!
//! - [`sensor`] - CO2 serial codec and the environment driver boundary
//! - [`telemetry`] - reading to message composition and alert rules
//! - [`agent`] - control flag, delivery tracker, cycle, and lifecycle
//! - [`transport`] - the [`CloudChannel`](transport::CloudChannel) trait and its MQTT implementation
//! - [`observability`] - structured logging setup
//!
//! # Quick Start
//!
//! ```rust
//! use climate_agent::sensor::Reading;
//! use climate_agent::telemetry::TelemetryComposer;
//!
//! let composer = TelemetryComposer::new("pi-01");
//! let reading = Reading {
//!     temperature: 30.0,
//!     humidity: 45.0,
//!     co2_ppm: 900,
//!     timestamp: "2024-01-01T00:00:00.000000Z".to_string(),
//! };
//!
//! let message = composer.compose(&reading, 1);
//! assert_eq!(message.properties.get("temperatureAlert"), Some("true"));
//! assert_eq!(message.properties.get("co2Alert"), Some("true"));
//! ```

pub mod agent;
pub mod config;
pub mod error;
pub mod observability;
pub mod protocol;
pub mod sensor;
pub mod telemetry;
pub mod testing;
pub mod transport;

pub use agent::{AgentLifecycle, CycleOutcome};
pub use config::*;
pub use error::{AgentError, AgentResult};
pub use protocol::*;
pub use sensor::{Reading, ReadingSource, SensorError};
pub use telemetry::TelemetryComposer;
pub use transport::{ChannelError, CloudChannel};
pub use transport::mqtt::MqttClient;
