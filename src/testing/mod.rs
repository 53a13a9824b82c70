//! Testing utilities and mock implementations
//!
//! Mocks for the cloud channel, the sensor pair, and the CO2 serial line, so
//! the agent can be tested without an MQTT broker or attached hardware.

pub mod mocks;

pub use mocks::*;
