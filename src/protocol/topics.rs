//! Device topic construction, classification, and device ID validation
//!
//! Topic layout follows the IoT Hub MQTT device surface: telemetry under
//! `devices/{id}/messages/events/`, cloud-to-device messages under
//! `devices/{id}/messages/devicebound/`, and the `$iothub/twin` and
//! `$iothub/methods` request/response families.

use super::messages::{Message, MessageProperties};
use thiserror::Error;
use url::form_urlencoded;

const TWIN_RESPONSE_PREFIX: &str = "$iothub/twin/res/";
const DESIRED_PATCH_PREFIX: &str = "$iothub/twin/PATCH/properties/desired/";
const METHOD_REQUEST_PREFIX: &str = "$iothub/methods/POST/";

/// Topic filter for twin request responses
pub const TWIN_RESPONSE_FILTER: &str = "$iothub/twin/res/#";
/// Topic filter for desired-property patches
pub const DESIRED_PATCH_FILTER: &str = "$iothub/twin/PATCH/properties/desired/#";
/// Topic filter for direct method invocations
pub const METHOD_REQUEST_FILTER: &str = "$iothub/methods/POST/#";

/// Pure topic construction functions
pub struct TopicBuilder;

impl TopicBuilder {
    /// `devices/{id}/messages/events/{property_bag}`
    pub fn telemetry_topic(device_id: &str, message: &Message) -> String {
        format!(
            "devices/{device_id}/messages/events/{}",
            encode_property_bag(message)
        )
    }

    /// `devices/{id}/messages/devicebound/#`
    pub fn cloud_to_device_filter(device_id: &str) -> String {
        format!("devices/{device_id}/messages/devicebound/#")
    }

    /// `$iothub/twin/GET/?$rid={rid}`
    pub fn twin_get_topic(request_id: &str) -> String {
        format!("$iothub/twin/GET/?$rid={request_id}")
    }

    /// `$iothub/twin/PATCH/properties/reported/?$rid={rid}`
    pub fn reported_patch_topic(request_id: &str) -> String {
        format!("$iothub/twin/PATCH/properties/reported/?$rid={request_id}")
    }

    /// `$iothub/methods/res/{status}/?$rid={rid}`
    pub fn method_response_topic(status: u16, request_id: &str) -> String {
        format!("$iothub/methods/res/{status}/?$rid={request_id}")
    }

    /// Every filter a connected device subscribes to
    pub fn subscription_filters(device_id: &str) -> Vec<String> {
        vec![
            Self::cloud_to_device_filter(device_id),
            TWIN_RESPONSE_FILTER.to_string(),
            DESIRED_PATCH_FILTER.to_string(),
            METHOD_REQUEST_FILTER.to_string(),
        ]
    }
}

/// Encode message identity, content metadata, and application properties
/// as a form-urlencoded property bag
pub fn encode_property_bag(message: &Message) -> String {
    let mut bag = form_urlencoded::Serializer::new(String::new());
    bag.append_pair("$.mid", &message.id);
    bag.append_pair("$.cid", &message.correlation_id);
    bag.append_pair("$.ct", "application/json");
    bag.append_pair("$.ce", "utf-8");
    for (key, value) in message.properties.iter() {
        bag.append_pair(key, value);
    }
    bag.finish()
}

/// Decode a form-urlencoded property bag (leading `?` tolerated)
pub fn decode_property_bag(bag: &str) -> MessageProperties {
    let bag = bag.strip_prefix('?').unwrap_or(bag);
    form_urlencoded::parse(bag.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

/// Classification of an inbound topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundTopic {
    CloudToDevice { properties: MessageProperties },
    TwinResponse { status: u16, request_id: String },
    DesiredPropertiesPatch,
    MethodInvocation { name: String, request_id: String },
    Unrecognized,
}

impl InboundTopic {
    /// Classify a topic received by `device_id` (pure function)
    pub fn parse(topic: &str, device_id: &str) -> Self {
        let c2d_prefix = format!("devices/{device_id}/messages/devicebound/");
        if let Some(bag) = topic.strip_prefix(&c2d_prefix) {
            return InboundTopic::CloudToDevice {
                properties: decode_property_bag(bag),
            };
        }

        if let Some(rest) = topic.strip_prefix(TWIN_RESPONSE_PREFIX) {
            let Some((status, query)) = rest.split_once('/') else {
                return InboundTopic::Unrecognized;
            };
            return match (status.parse::<u16>(), query_value(query, "$rid")) {
                (Ok(status), Some(request_id)) => InboundTopic::TwinResponse { status, request_id },
                _ => InboundTopic::Unrecognized,
            };
        }

        if topic.starts_with(DESIRED_PATCH_PREFIX) {
            return InboundTopic::DesiredPropertiesPatch;
        }

        if let Some(rest) = topic.strip_prefix(METHOD_REQUEST_PREFIX) {
            let Some((name, query)) = rest.split_once('/') else {
                return InboundTopic::Unrecognized;
            };
            return match query_value(query, "$rid") {
                Some(request_id) if !name.is_empty() => InboundTopic::MethodInvocation {
                    name: name.to_string(),
                    request_id,
                },
                _ => InboundTopic::Unrecognized,
            };
        }

        InboundTopic::Unrecognized
    }
}

fn query_value(query: &str, key: &str) -> Option<String> {
    let query = query.strip_prefix('?').unwrap_or(query);
    form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
}

/// Validate a device identifier
///
/// Allowed: ASCII alphanumerics and `-.%_*?!(),:=@$'`, at most 128 characters.
/// MQTT wildcard and level separators never pass.
pub fn validate_device_id(device_id: &str) -> Result<(), ValidationError> {
    if device_id.is_empty() {
        return Err(ValidationError::EmptyDeviceId);
    }
    if device_id.len() > 128 {
        return Err(ValidationError::DeviceIdTooLong(device_id.len()));
    }

    for ch in device_id.chars() {
        if !ch.is_ascii_alphanumeric() && !"-.%_*?!(),:=@$'".contains(ch) {
            return Err(ValidationError::InvalidDeviceIdChar(ch));
        }
    }

    Ok(())
}

/// Validation errors for device identity
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("Device ID cannot be empty")]
    EmptyDeviceId,
    #[error("Device ID is {0} characters long, maximum is 128")]
    DeviceIdTooLong(usize),
    #[error("Device ID contains invalid character: '{0}'")]
    InvalidDeviceIdChar(char),
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn message(seq: u64) -> Message {
        let mut properties = MessageProperties::new();
        properties.insert("temperatureAlert", "true");
        properties.insert("co2Alert", "false");
        Message {
            seq,
            id: format!("message_{seq}"),
            correlation_id: format!("correlation_{seq}"),
            payload: b"{}".to_vec(),
            properties,
        }
    }

    proptest! {
        #[test]
        fn valid_device_ids_never_contain_topic_separators(id in ".{0,140}") {
            if validate_device_id(&id).is_ok() {
                prop_assert!(!id.contains('/'));
                prop_assert!(!id.contains('#'));
                prop_assert!(!id.contains('+'));
            }
        }

        #[test]
        fn method_topics_round_trip(name in "[a-zA-Z][a-zA-Z0-9_]{0,20}", rid in 1u64..100_000) {
            let topic = format!("$iothub/methods/POST/{name}/?$rid={rid}");
            prop_assert_eq!(
                InboundTopic::parse(&topic, "dev"),
                InboundTopic::MethodInvocation { name, request_id: rid.to_string() }
            );
        }
    }

    #[test]
    fn test_telemetry_topic_carries_identity_and_alerts() {
        let topic = TopicBuilder::telemetry_topic("pi-01", &message(7));

        assert!(topic.starts_with("devices/pi-01/messages/events/"));
        let bag = topic.trim_start_matches("devices/pi-01/messages/events/");
        let decoded = decode_property_bag(bag);
        assert_eq!(decoded.get("$.mid"), Some("message_7"));
        assert_eq!(decoded.get("$.cid"), Some("correlation_7"));
        assert_eq!(decoded.get("$.ct"), Some("application/json"));
        assert_eq!(decoded.get("temperatureAlert"), Some("true"));
        assert_eq!(decoded.get("co2Alert"), Some("false"));
    }

    #[test]
    fn test_response_topics() {
        assert_eq!(TopicBuilder::twin_get_topic("3"), "$iothub/twin/GET/?$rid=3");
        assert_eq!(
            TopicBuilder::reported_patch_topic("4"),
            "$iothub/twin/PATCH/properties/reported/?$rid=4"
        );
        assert_eq!(
            TopicBuilder::method_response_topic(200, "abc"),
            "$iothub/methods/res/200/?$rid=abc"
        );
    }

    #[test]
    fn test_subscription_filters() {
        let filters = TopicBuilder::subscription_filters("pi-01");
        assert_eq!(filters.len(), 4);
        assert!(filters.contains(&"devices/pi-01/messages/devicebound/#".to_string()));
        assert!(filters.contains(&METHOD_REQUEST_FILTER.to_string()));
    }

    #[test]
    fn test_parse_twin_response() {
        assert_eq!(
            InboundTopic::parse("$iothub/twin/res/204/?$rid=12&$version=5", "dev"),
            InboundTopic::TwinResponse {
                status: 204,
                request_id: "12".to_string()
            }
        );
    }

    #[test]
    fn test_parse_desired_patch() {
        assert_eq!(
            InboundTopic::parse("$iothub/twin/PATCH/properties/desired/?$version=9", "dev"),
            InboundTopic::DesiredPropertiesPatch
        );
    }

    #[test]
    fn test_parse_cloud_to_device_with_properties() {
        let topic = "devices/dev/messages/devicebound/%24.mid=m1&color=red";
        match InboundTopic::parse(topic, "dev") {
            InboundTopic::CloudToDevice { properties } => {
                assert_eq!(properties.get("$.mid"), Some("m1"));
                assert_eq!(properties.get("color"), Some("red"));
            }
            other => panic!("unexpected classification: {other:?}"),
        }
    }

    #[test]
    fn test_parse_cloud_to_device_for_other_device_is_unrecognized() {
        assert_eq!(
            InboundTopic::parse("devices/other/messages/devicebound/", "dev"),
            InboundTopic::Unrecognized
        );
    }

    #[test]
    fn test_parse_malformed_topics() {
        assert_eq!(
            InboundTopic::parse("$iothub/twin/res/abc/?$rid=1", "dev"),
            InboundTopic::Unrecognized
        );
        assert_eq!(
            InboundTopic::parse("$iothub/methods/POST/start", "dev"),
            InboundTopic::Unrecognized
        );
        assert_eq!(
            InboundTopic::parse("$iothub/methods/POST/start/?foo=1", "dev"),
            InboundTopic::Unrecognized
        );
        assert_eq!(InboundTopic::parse("random/topic", "dev"), InboundTopic::Unrecognized);
    }

    #[test]
    fn test_validate_device_id() {
        assert!(validate_device_id("RaspberryPi_oleg").is_ok());
        assert!(validate_device_id("dev-01.lab:a").is_ok());
        assert_eq!(validate_device_id(""), Err(ValidationError::EmptyDeviceId));
        assert_eq!(
            validate_device_id("a/b"),
            Err(ValidationError::InvalidDeviceIdChar('/'))
        );
        assert_eq!(
            validate_device_id(&"x".repeat(129)),
            Err(ValidationError::DeviceIdTooLong(129))
        );
    }
}
