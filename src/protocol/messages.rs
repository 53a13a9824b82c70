//! Device-to-cloud and cloud-to-device message types
//!
//! Every payload the agent puts on the wire, plus the inbound method request
//! shape, lives here so transports and the agent agree on one definition.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Property key carrying the temperature alert flag
pub const TEMPERATURE_ALERT_PROPERTY: &str = "temperatureAlert";
/// Property key carrying the CO2 alert flag
pub const CO2_ALERT_PROPERTY: &str = "co2Alert";

/// Insertion-ordered application properties attached to a message
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageProperties(Vec<(String, String)>);

impl MessageProperties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a property, keeping the original position on replace
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.0.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, String)> for MessageProperties {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        let mut properties = MessageProperties::new();
        for (k, v) in iter {
            properties.insert(k, v);
        }
        properties
    }
}

/// Telemetry message ready for dispatch
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Per-process sequence number this message was built from
    pub seq: u64,
    pub id: String,
    pub correlation_id: String,
    /// UTF-8 JSON body
    pub payload: Vec<u8>,
    pub properties: MessageProperties,
}

impl Message {
    /// Payload as text for logging
    pub fn payload_text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// Reported-state twin patch announced by the device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportedState {
    #[serde(rename = "newState")]
    pub new_state: String,
}

impl ReportedState {
    /// `{"newState":"standBy"}`
    pub fn standby() -> Self {
        Self {
            new_state: "standBy".to_string(),
        }
    }

    pub fn to_payload(&self) -> Vec<u8> {
        json!({ "newState": self.new_state }).to_string().into_bytes()
    }
}

/// Remote method invocation received from the cloud
#[derive(Debug, Clone, PartialEq)]
pub struct MethodRequest {
    pub name: String,
    pub payload: Value,
    /// Transport request id used to route the response back
    pub request_id: String,
}

/// Acknowledgement returned for every method invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodAck {
    pub status: u16,
    pub response: Value,
}

impl MethodAck {
    pub const OK: u16 = 200;

    /// 200 acknowledgement with a `{"Response": text}` body
    pub fn ok(text: &str) -> Self {
        Self {
            status: Self::OK,
            response: json!({ "Response": text }),
        }
    }

    pub fn response_payload(&self) -> Vec<u8> {
        self.response.to_string().into_bytes()
    }
}
