//! Pure connection state management for the MQTT channel
//!
//! Connection states, reconnection backoff, transport errors, and the
//! translation of [`MqttSection`] into rumqttc options.

use crate::config::{MqttSection, ReconnectSection};
use crate::transport::ChannelError;
use rumqttc::{MqttOptions, Transport as RumqttcTransport};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// API version carried in the MQTT username
pub const API_VERSION: &str = "2021-04-12";

/// Connection state for the MQTT client
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// Initial state - attempting to connect
    Connecting,
    /// Successfully connected and ready for operations
    Connected,
    /// Disconnected with reason
    Disconnected(String),
    /// Attempting to reconnect (attempt count)
    Reconnecting(u32),
    /// Permanently disconnected - max reconnection attempts exceeded
    PermanentlyDisconnected(String),
}

/// Reconnection configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Maximum number of reconnection attempts (None = unlimited)
    pub max_attempts: Option<u32>,
    /// Backoff pattern in milliseconds
    pub backoff_pattern: Vec<u64>,
    /// Delay to use after the pattern is exhausted
    pub sustained_delay: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self::from(&ReconnectSection::default())
    }
}

impl From<&ReconnectSection> for ReconnectConfig {
    fn from(section: &ReconnectSection) -> Self {
        Self {
            max_attempts: section.max_attempts,
            backoff_pattern: section.backoff_ms.clone(),
            sustained_delay: section.sustained_delay_ms,
        }
    }
}

impl ReconnectConfig {
    /// Maximum total time for all reconnection attempts (None when unlimited)
    pub fn calculate_max_total_time(&self) -> Option<u64> {
        self.max_attempts.map(|max_attempts| {
            (1..=max_attempts)
                .map(|attempt| self.calculate_backoff_delay(attempt))
                .sum()
        })
    }

    /// Backoff delay for a 1-based attempt number
    pub fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        let index = attempt.saturating_sub(1) as usize;
        self.backoff_pattern
            .get(index)
            .copied()
            .unwrap_or(self.sustained_delay)
    }
}

/// MQTT transport errors
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Publishing failed: {0}")]
    PublishFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Credential environment variable not set: {0}")]
    CredentialUnavailable(String),
    #[error("Not connected - current state: {state:?}")]
    NotConnected { state: ConnectionState },
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
}

impl From<MqttError> for ChannelError {
    fn from(error: MqttError) -> Self {
        match error {
            MqttError::PublishFailed(_) => ChannelError::send_failed(error.to_string()),
            _ => ChannelError::transport_unavailable(error.to_string()),
        }
    }
}

/// Broker host, port, and TLS flag parsed from a broker URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

/// Parse `mqtt://host[:port]` or `mqtts://host[:port]` (pure function)
pub fn parse_broker_url(broker_url: &str) -> Result<BrokerAddress, MqttError> {
    let url = Url::parse(broker_url).map_err(|_| MqttError::InvalidBrokerUrl(broker_url.to_string()))?;
    let tls = match url.scheme() {
        "mqtts" => true,
        "mqtt" => false,
        _ => return Err(MqttError::InvalidBrokerUrl(broker_url.to_string())),
    };
    let host = url
        .host_str()
        .ok_or_else(|| MqttError::InvalidBrokerUrl(broker_url.to_string()))?
        .to_string();
    let port = url.port().unwrap_or(if tls { 8883 } else { 1883 });

    Ok(BrokerAddress { host, port, tls })
}

/// Username the hub expects from a device: `{host}/{device_id}/?api-version=...`
pub fn device_username(host: &str, device_id: &str) -> String {
    format!("{host}/{device_id}/?api-version={API_VERSION}")
}

/// Build rumqttc options for `device_id` from config
///
/// Credentials are read from the environment here, on every (re)connection,
/// so a rotated SAS token is picked up without a restart.
pub fn configure_mqtt_options(
    device_id: &str,
    config: &MqttSection,
) -> Result<MqttOptions, MqttError> {
    let broker = parse_broker_url(&config.broker_url)?;

    // The hub identifies the device by client id, so it must be stable
    let mut mqtt_options = MqttOptions::new(device_id, broker.host.clone(), broker.port);

    if broker.tls {
        mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    let username = config
        .username_env
        .as_ref()
        .and_then(|name| std::env::var(name).ok())
        .unwrap_or_else(|| device_username(&broker.host, device_id));
    let password = match &config.password_env {
        Some(name) => {
            std::env::var(name).map_err(|_| MqttError::CredentialUnavailable(name.clone()))?
        }
        None => String::new(),
    };
    mqtt_options.set_credentials(username, password);

    mqtt_options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
    mqtt_options.set_clean_session(true);
    mqtt_options.set_max_packet_size(256 * 1024, 256 * 1024);

    Ok(mqtt_options)
}
