//! Ambient temperature / humidity driver boundary
//!
//! The agent only needs one capability from the temperature/humidity sensor:
//! a blocking read that performs its own bounded retries and yields either
//! both values or nothing. [`IioEnvironmentSensor`] provides that on Linux
//! through the kernel `dht11` IIO driver, which also handles AM2302/DHT22
//! parts wired to a GPIO pin.

use crate::config::SensorSection;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

/// One successful temperature/humidity sample
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnvironmentSample {
    /// Degrees Celsius
    pub temperature: f64,
    /// Relative humidity in percent
    pub humidity: f64,
}

/// Blocking temperature/humidity driver with internal retries
pub trait EnvironmentSensor: Send {
    /// Read both values, retrying internally; `None` when every attempt failed
    fn read_retry(&mut self) -> Option<EnvironmentSample>;
}

const TEMPERATURE_FILE: &str = "in_temp_input";
const HUMIDITY_FILE: &str = "in_humidityrelative_input";

/// Temperature/humidity sensor exposed by the Linux IIO subsystem
///
/// The driver publishes milli-degrees and milli-percent as decimal text. A
/// single read frequently fails with a checksum or timing error, hence the
/// retry loop.
#[derive(Debug, Clone)]
pub struct IioEnvironmentSensor {
    device_dir: PathBuf,
    attempts: u32,
    retry_delay: Duration,
}

impl IioEnvironmentSensor {
    pub fn new(device_dir: impl Into<PathBuf>, attempts: u32, retry_delay: Duration) -> Self {
        Self {
            device_dir: device_dir.into(),
            attempts: attempts.max(1),
            retry_delay,
        }
    }

    pub fn from_config(config: &SensorSection) -> Self {
        Self::new(
            &config.iio_device,
            config.read_attempts,
            Duration::from_millis(config.retry_delay_ms),
        )
    }

    /// Single attempt without retries
    pub fn read_once(&self) -> Option<EnvironmentSample> {
        let temperature = read_milli_value(&self.device_dir.join(TEMPERATURE_FILE))?;
        let humidity = read_milli_value(&self.device_dir.join(HUMIDITY_FILE))?;
        Some(EnvironmentSample {
            temperature,
            humidity,
        })
    }
}

impl EnvironmentSensor for IioEnvironmentSensor {
    fn read_retry(&mut self) -> Option<EnvironmentSample> {
        for attempt in 1..=self.attempts {
            if let Some(sample) = self.read_once() {
                return Some(sample);
            }
            debug!(
                attempt = attempt,
                max_attempts = self.attempts,
                "Environment sensor read failed"
            );
            if attempt < self.attempts {
                thread::sleep(self.retry_delay);
            }
        }

        warn!(
            device = %self.device_dir.display(),
            attempts = self.attempts,
            "Environment sensor unavailable after all attempts"
        );
        None
    }
}

/// Parse an IIO milli-unit value file (pure apart from the read)
fn read_milli_value(path: &Path) -> Option<f64> {
    let raw = fs::read_to_string(path).ok()?;
    parse_milli_value(&raw)
}

fn parse_milli_value(raw: &str) -> Option<f64> {
    raw.trim().parse::<i64>().ok().map(|v| v as f64 / 1000.0)
}
