//! MQTT implementation of the cloud channel
//!
//! Pure functions are kept apart from I/O:
//!
//! - [`connection`] - connection state, backoff, and option building
//! - [`correlation`] - pairing broker acknowledgements with sends
//! - [`message_handler`] - event and inbound-topic routing
//! - [`health_monitor`] - reconnection decisions
//! - [`client`] - the client handle and its event-loop supervisor
//!
//! # Usage
//!
//! ```rust,no_run
//! use climate_agent::config::{MqttSection, ReconnectSection};
//! use climate_agent::transport::mqtt::MqttClient;
//!
//! # tokio_test::block_on(async {
//! let config = MqttSection {
//!     broker_url: "mqtts://my-hub.azure-devices.net".to_string(),
//!     username_env: None,
//!     password_env: Some("IOTHUB_SAS_TOKEN".to_string()),
//!     keep_alive_secs: 60,
//!     reconnect: ReconnectSection::default(),
//! };
//!
//! let mut client = MqttClient::new("pi-01", config)?;
//! client.connect().await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod correlation;
pub mod health_monitor;
pub mod message_handler;

pub use client::MqttClient;
pub use connection::{ConnectionState, MqttError, ReconnectConfig};
pub use correlation::{PublishCorrelation, TwinRequestKind};
pub use health_monitor::{ConnectionEvent, HealthMonitor, ReconnectionDecision};
pub use message_handler::{EventRoute, InboundRoute, MessageHandler, OutcomeForwarder};
