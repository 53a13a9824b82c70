//! Sensor acquisition
//!
//! Combines the ambient temperature/humidity driver with the CO2 serial
//! codec into one [`Reading`] per measurement cycle.

pub mod co2;
pub mod environment;

pub use co2::{decode_response, read_co2, Co2Sensor, ProtocolError, READ_CO2_COMMAND};
pub use environment::{EnvironmentSample, EnvironmentSensor, IioEnvironmentSensor};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use thiserror::Error;
use tracing::debug;

/// One complete measurement, immutable once produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub temperature: f64,
    pub humidity: f64,
    pub co2_ppm: u16,
    /// ISO-8601 UTC acquisition time
    pub timestamp: String,
}

/// Sensor acquisition errors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SensorError {
    #[error("Temperature/humidity sensor unavailable")]
    EnvironmentUnavailable,
    #[error("CO2 sensor unavailable: {0}")]
    Co2Unavailable(#[from] ProtocolError),
    #[error("Sensor acquisition interrupted: {message}")]
    Interrupted { message: String },
}

/// Anything that can produce one [`Reading`] per call, blocking
pub trait ReadingSource: Send {
    fn acquire(&mut self) -> Result<Reading, SensorError>;
}

/// Current UTC time in ISO-8601 form
pub fn utc_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Real sensor pair: environment driver plus CO2 sensor on a serial transport
pub struct SensorSource<E, T> {
    environment: E,
    co2: Co2Sensor<T>,
}

impl<E, T> SensorSource<E, T>
where
    E: EnvironmentSensor,
    T: Read + Write + Send,
{
    pub fn new(environment: E, co2: Co2Sensor<T>) -> Self {
        Self { environment, co2 }
    }

    /// Access the CO2 sensor (used by tests to inspect serial traffic)
    pub fn co2_sensor(&self) -> &Co2Sensor<T> {
        &self.co2
    }
}

impl<E, T> ReadingSource for SensorSource<E, T>
where
    E: EnvironmentSensor,
    T: Read + Write + Send,
{
    fn acquire(&mut self) -> Result<Reading, SensorError> {
        // No serial round trip when the cycle is already lost
        let sample = self
            .environment
            .read_retry()
            .ok_or(SensorError::EnvironmentUnavailable)?;

        let co2_ppm = self.co2.read()?;

        let reading = Reading {
            temperature: sample.temperature,
            humidity: sample.humidity,
            co2_ppm,
            timestamp: utc_timestamp(),
        };
        debug!(?reading, "Sensor reading acquired");
        Ok(reading)
    }
}
