//! Test helpers and utilities for integration tests

use climate_agent::config::{
    AgentConfig, DeviceSection, MqttSection, ReconnectSection, SensorSection, TelemetrySection,
};
use climate_agent::sensor::co2::{frame_checksum, READ_CO2_OPCODE, START_BYTE};
use climate_agent::sensor::Reading;
use std::time::Duration;

/// Create a test configuration for integration tests
#[allow(dead_code)]
pub fn test_config() -> AgentConfig {
    AgentConfig {
        device: DeviceSection {
            id: "test-device".to_string(),
        },
        mqtt: MqttSection {
            broker_url: "mqtt://localhost:1883".to_string(),
            username_env: None,
            password_env: None,
            keep_alive_secs: 60,
            reconnect: ReconnectSection::default(),
        },
        sensors: SensorSection::default(),
        telemetry: TelemetrySection {
            interval_secs: 1,
            reported_state_timeout_ms: 200,
            gate_on_stop: false,
            drain_timeout_ms: 500,
        },
    }
}

/// Reading with a fixed timestamp
#[allow(dead_code)]
pub fn reading(temperature: f64, humidity: f64, co2_ppm: u16) -> Reading {
    Reading {
        temperature,
        humidity,
        co2_ppm,
        timestamp: "2024-01-01T12:00:00.000000Z".to_string(),
    }
}

/// Well-formed read-CO2 response frame for `ppm`
#[allow(dead_code)]
pub fn response_frame(ppm: u16) -> Vec<u8> {
    let [high, low] = ppm.to_be_bytes();
    let mut frame = vec![START_BYTE, READ_CO2_OPCODE, high, low, 0, 0, 0, 0, 0];
    frame[8] = frame_checksum(&frame);
    frame
}

/// Poll `condition` until it holds or two seconds pass
#[allow(dead_code)]
pub async fn eventually<F>(mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
