//! Telemetry composition
//!
//! Turns a [`Reading`] into a dispatchable [`Message`]: JSON payload with a
//! fixed key order, alert properties, and sequence-derived identity. No I/O
//! and no shared state, so the same input always yields the same message.

use crate::protocol::messages::{
    Message, MessageProperties, CO2_ALERT_PROPERTY, TEMPERATURE_ALERT_PROPERTY,
};
use crate::sensor::Reading;
use serde_json::json;

/// Temperature above which `temperatureAlert` is raised (°C, exclusive)
pub const TEMPERATURE_ALERT_THRESHOLD: f64 = 28.0;

/// CO2 concentration above which `co2Alert` is raised (ppm, exclusive)
pub const CO2_ALERT_THRESHOLD: u16 = 800;

/// Builds telemetry messages for one device
#[derive(Debug, Clone)]
pub struct TelemetryComposer {
    device_id: String,
}

impl TelemetryComposer {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Compose the message for `reading` with sequence number `seq`
    pub fn compose(&self, reading: &Reading, seq: u64) -> Message {
        // Key order: deviceId, temperature, humidity, co2, timestamp
        let payload = json!({
            "deviceId": self.device_id,
            "temperature": reading.temperature,
            "humidity": reading.humidity,
            "co2": reading.co2_ppm,
            "timestamp": reading.timestamp,
        });

        let mut properties = MessageProperties::new();
        properties.insert(
            TEMPERATURE_ALERT_PROPERTY,
            flag(temperature_alert(reading.temperature)),
        );
        properties.insert(CO2_ALERT_PROPERTY, flag(co2_alert(reading.co2_ppm)));

        Message {
            seq,
            id: format!("message_{seq}"),
            correlation_id: format!("correlation_{seq}"),
            payload: payload.to_string().into_bytes(),
            properties,
        }
    }
}

pub fn temperature_alert(temperature: f64) -> bool {
    temperature > TEMPERATURE_ALERT_THRESHOLD
}

pub fn co2_alert(co2_ppm: u16) -> bool {
    co2_ppm > CO2_ALERT_THRESHOLD
}

fn flag(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}
