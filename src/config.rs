//! Agent configuration
//!
//! Loaded once at startup from a TOML file. Credentials are never stored in
//! the file itself: the file names environment variables that are resolved
//! when the MQTT connection is built.

use crate::protocol::topics::validate_device_id;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default locations searched when no `--config` path is given
pub const DEFAULT_CONFIG_PATHS: [&str; 2] = ["agent.toml", "config/agent.toml"];

/// Main agent configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentConfig {
    pub device: DeviceSection,
    pub mqtt: MqttSection,
    #[serde(default)]
    pub sensors: SensorSection,
    #[serde(default)]
    pub telemetry: TelemetrySection,
}

/// Device identity
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceSection {
    /// Device identifier registered with the cloud
    pub id: String,
}

/// MQTT connection settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    /// Broker URL, `mqtt://` or `mqtts://`
    pub broker_url: String,
    /// Environment variable overriding the derived username
    #[serde(default)]
    pub username_env: Option<String>,
    /// Environment variable containing the SAS token
    #[serde(default)]
    pub password_env: Option<String>,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    #[serde(default)]
    pub reconnect: ReconnectSection,
}

fn default_keep_alive() -> u64 {
    60
}

/// Reconnection backoff settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectSection {
    /// Give up after this many attempts (unset = retry forever)
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: Vec<u64>,
    /// Delay once the backoff pattern is exhausted
    #[serde(default = "default_sustained_delay_ms")]
    pub sustained_delay_ms: u64,
}

fn default_backoff_ms() -> Vec<u64> {
    vec![1000, 2000, 5000, 10000]
}

fn default_sustained_delay_ms() -> u64 {
    30000
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            max_attempts: None,
            backoff_ms: default_backoff_ms(),
            sustained_delay_ms: default_sustained_delay_ms(),
        }
    }
}

/// Sensor hardware settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SensorSection {
    /// Serial device the CO2 sensor is attached to
    #[serde(default = "default_serial_port")]
    pub serial_port: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// IIO sysfs directory of the temperature/humidity sensor
    #[serde(default = "default_iio_device")]
    pub iio_device: PathBuf,
    /// Environment read attempts before giving up on a cycle
    #[serde(default = "default_read_attempts")]
    pub read_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

fn default_serial_port() -> String {
    "/dev/ttyAMA0".to_string()
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_read_timeout_ms() -> u64 {
    1000
}

fn default_iio_device() -> PathBuf {
    PathBuf::from("/sys/bus/iio/devices/iio:device0")
}

fn default_read_attempts() -> u32 {
    15
}

fn default_retry_delay_ms() -> u64 {
    2000
}

impl Default for SensorSection {
    fn default() -> Self {
        Self {
            serial_port: default_serial_port(),
            baud_rate: default_baud_rate(),
            read_timeout_ms: default_read_timeout_ms(),
            iio_device: default_iio_device(),
            read_attempts: default_read_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

/// Measurement schedule and dispatch settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TelemetrySection {
    /// Seconds between the start of consecutive cycles
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Upper bound on waiting for a reported-state acknowledgement
    #[serde(default = "default_reported_state_timeout_ms")]
    pub reported_state_timeout_ms: u64,
    /// Withhold telemetry while a `stop` method is in effect
    #[serde(default)]
    pub gate_on_stop: bool,
    /// How long a single-cycle run waits for its telemetry to be confirmed
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
}

fn default_interval_secs() -> u64 {
    10
}

fn default_reported_state_timeout_ms() -> u64 {
    10000
}

fn default_drain_timeout_ms() -> u64 {
    5000
}

impl Default for TelemetrySection {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            reported_state_timeout_ms: default_reported_state_timeout_ms(),
            gate_on_stop: false,
            drain_timeout_ms: default_drain_timeout_ms(),
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid device ID: {0}")]
    InvalidDeviceId(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl AgentConfig {
    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: AgentConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Find the first existing file among [`DEFAULT_CONFIG_PATHS`]
    pub fn find_default_path() -> Option<PathBuf> {
        DEFAULT_CONFIG_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|path| path.is_file())
    }

    /// Check field values that TOML typing cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_device_id(&self.device.id)
            .map_err(|e| ConfigError::InvalidDeviceId(format!("'{}': {e}", self.device.id)))?;

        let scheme = url::Url::parse(&self.mqtt.broker_url)
            .map(|url| url.scheme().to_string())
            .map_err(|e| {
                ConfigError::InvalidConfig(format!(
                    "mqtt.broker_url '{}' is not a URL: {e}",
                    self.mqtt.broker_url
                ))
            })?;
        if scheme != "mqtt" && scheme != "mqtts" {
            return Err(ConfigError::InvalidConfig(format!(
                "mqtt.broker_url must use mqtt:// or mqtts://, got {scheme}://"
            )));
        }

        if self.mqtt.keep_alive_secs < 5 {
            return Err(ConfigError::InvalidConfig(
                "mqtt.keep_alive_secs must be at least 5".to_string(),
            ));
        }

        let reconnect = &self.mqtt.reconnect;
        if reconnect.max_attempts == Some(0) {
            return Err(ConfigError::InvalidConfig(
                "mqtt.reconnect.max_attempts must be greater than 0 or omitted".to_string(),
            ));
        }
        if reconnect.sustained_delay_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "mqtt.reconnect.sustained_delay_ms must be greater than 0".to_string(),
            ));
        }

        if self.sensors.read_timeout_ms == 0 || self.sensors.read_timeout_ms > 1000 {
            return Err(ConfigError::InvalidConfig(format!(
                "sensors.read_timeout_ms must be between 1 and 1000, got {}",
                self.sensors.read_timeout_ms
            )));
        }
        if self.sensors.read_attempts == 0 {
            return Err(ConfigError::InvalidConfig(
                "sensors.read_attempts must be at least 1".to_string(),
            ));
        }
        if self.telemetry.interval_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "telemetry.interval_secs must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    fn get_env_var_optional(env_var_name: Option<&String>) -> Option<String> {
        env_var_name.and_then(|name| std::env::var(name).ok())
    }

    fn get_env_var_required(env_var_name: &str) -> Result<String, ConfigError> {
        std::env::var(env_var_name)
            .map_err(|_| ConfigError::EnvVarNotFound(env_var_name.to_string()))
    }

    /// Username override from the environment, if configured and set
    pub fn get_mqtt_username(&self) -> Option<String> {
        Self::get_env_var_optional(self.mqtt.username_env.as_ref())
    }

    /// SAS token from the environment
    ///
    /// `Ok(None)` when no `password_env` is configured; an error when it is
    /// configured but unset.
    pub fn get_mqtt_password(&self) -> Result<Option<String>, ConfigError> {
        self.mqtt
            .password_env
            .as_deref()
            .map(Self::get_env_var_required)
            .transpose()
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[device]
id = "test-device"

[mqtt]
broker_url = "mqtt://localhost:1883"

[telemetry]
interval_secs = 1
reported_state_timeout_ms = 50
drain_timeout_ms = 100
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}
