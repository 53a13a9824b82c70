//! Crate-level error type
//!
//! Each subsystem keeps its own error enum; [`AgentError`] is what the binary
//! and other callers that span subsystems deal with.

use crate::agent::lifecycle::LifecycleError;
use crate::config::ConfigError;
use crate::sensor::SensorError;
use crate::transport::mqtt::MqttError;
use crate::transport::ChannelError;
use thiserror::Error;

/// Main error type for agent operations
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Sensor error: {0}")]
    Sensor(#[from] SensorError),

    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),

    #[error("MQTT error: {0}")]
    Mqtt(#[from] MqttError),

    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl AgentError {
    /// Create internal error
    pub fn internal_error<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

/// Result type for agent operations
pub type AgentResult<T> = Result<T, AgentError>;
