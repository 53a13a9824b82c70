//! Pure event routing for the MQTT channel
//!
//! Raw rumqttc events become [`EventRoute`] decisions; inbound publishes
//! become [`DeliveryOutcome`] values. The only impure piece is the
//! [`OutcomeForwarder`] at the end.

use super::correlation::TwinRequestKind;
use crate::protocol::{
    DeliveryOutcome, InboundMessage, InboundTopic, MethodRequest, TwinUpdateState,
};
use crate::transport::OutcomeSender;
use rumqttc::{Event, Outgoing, Packet, SubscribeReasonCode};
use serde_json::Value;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, warn};

/// Pure message routing decisions based on MQTT events
pub struct MessageHandler;

impl MessageHandler {
    /// Route an event-loop event (pure function)
    pub fn route_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(Packet::ConnAck(_)) => EventRoute::ConnectionAcknowledged,
            Event::Incoming(Packet::Publish(publish)) => EventRoute::MessageReceived {
                topic: publish.topic.clone(),
                payload: publish.payload.to_vec(),
            },
            Event::Incoming(Packet::PubAck(ack)) => EventRoute::PublishAcknowledged(ack.pkid),
            Event::Incoming(Packet::SubAck(suback)) => EventRoute::SubscriptionConfirmed {
                packet_id: suback.pkid,
                failures: Self::subscription_failures(&suback.return_codes),
            },
            Event::Incoming(Packet::Disconnect) => EventRoute::Disconnected,
            Event::Incoming(other) => EventRoute::InfrastructureEvent(format!("{other:?}")),
            Event::Outgoing(Outgoing::Publish(pkid)) => EventRoute::PublishWritten(*pkid),
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }

    /// Count rejected filters in a SubAck (pure function)
    pub fn subscription_failures(return_codes: &[SubscribeReasonCode]) -> usize {
        return_codes
            .iter()
            .filter(|code| matches!(code, SubscribeReasonCode::Failure))
            .count()
    }

    /// Turn an inbound publish into an outcome, or defer it for correlation (pure function)
    pub fn route_inbound(device_id: &str, topic: &str, payload: &[u8]) -> InboundRoute {
        match InboundTopic::parse(topic, device_id) {
            InboundTopic::CloudToDevice { properties } => {
                InboundRoute::Outcome(DeliveryOutcome::InboundReceived(InboundMessage {
                    payload: payload.to_vec(),
                    properties,
                }))
            }
            InboundTopic::DesiredPropertiesPatch => InboundRoute::Outcome(DeliveryOutcome::TwinUpdated {
                state: TwinUpdateState::Partial,
                payload: payload.to_vec(),
            }),
            InboundTopic::MethodInvocation { name, request_id } => InboundRoute::Outcome(
                DeliveryOutcome::MethodInvoked(Self::method_request(name, request_id, payload)),
            ),
            InboundTopic::TwinResponse { status, request_id } => InboundRoute::TwinResponse {
                status,
                request_id,
                payload: payload.to_vec(),
            },
            InboundTopic::Unrecognized => InboundRoute::Ignored(topic.to_string()),
        }
    }

    /// Method payloads are JSON; anything else is kept as text
    pub fn method_request(name: String, request_id: String, payload: &[u8]) -> MethodRequest {
        let payload = if payload.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(payload)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(payload).into_owned()))
        };
        MethodRequest {
            name,
            payload,
            request_id,
        }
    }

    /// Outcome for a twin response whose request kind is known (pure function)
    pub fn twin_response_outcome(
        kind: TwinRequestKind,
        status: u16,
        request_id: String,
        payload: Vec<u8>,
    ) -> DeliveryOutcome {
        match kind {
            TwinRequestKind::Get => DeliveryOutcome::TwinUpdated {
                state: TwinUpdateState::Complete,
                payload,
            },
            TwinRequestKind::ReportedPatch => DeliveryOutcome::ReportedStateAcked {
                request_id,
                status_code: status,
            },
        }
    }
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    /// Connection acknowledged - ready to publish/subscribe
    ConnectionAcknowledged,
    /// Message received on a subscribed topic
    MessageReceived { topic: String, payload: Vec<u8> },
    /// Event loop wrote a publish with this packet id (0 for QoS 0)
    PublishWritten(u16),
    /// Broker acknowledged a QoS 1 publish
    PublishAcknowledged(u16),
    /// MQTT broker disconnected
    Disconnected,
    /// Subscription confirmed; `failures` filters were rejected
    SubscriptionConfirmed { packet_id: u16, failures: usize },
    /// Infrastructure event (PingResp, etc.)
    InfrastructureEvent(String),
    /// Other outgoing event (handled automatically)
    OutgoingEvent,
}

/// Classification of an inbound publish
#[derive(Debug, Clone, PartialEq)]
pub enum InboundRoute {
    /// Ready to forward
    Outcome(DeliveryOutcome),
    /// Needs the pending twin request to decide its meaning
    TwinResponse {
        status: u16,
        request_id: String,
        payload: Vec<u8>,
    },
    /// Topic outside the device surface
    Ignored(String),
}

/// Forwards outcomes to the queue installed by the agent (impure I/O)
#[derive(Debug, Clone, Default)]
pub struct OutcomeForwarder {
    sender: Arc<Mutex<Option<OutcomeSender>>>,
}

impl OutcomeForwarder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_sender(&self, sender: OutcomeSender) {
        *self.sender.lock().unwrap_or_else(PoisonError::into_inner) = Some(sender);
    }

    /// Forward one outcome; returns false when it was dropped
    pub fn forward(&self, outcome: DeliveryOutcome) -> bool {
        let guard = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(sender) => {
                let category = outcome.category();
                if sender.send(outcome).is_err() {
                    warn!(category = category, "Outcome queue closed - outcome dropped");
                    return false;
                }
                debug!(category = category, "Outcome forwarded");
                true
            }
            None => {
                warn!(
                    category = outcome.category(),
                    "No outcome queue installed - outcome dropped"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::{ConnAck, ConnectReturnCode, PubAck, Publish, QoS, SubAck};
    use tokio::sync::mpsc;

    #[test]
    fn test_route_connack() {
        let event = Event::Incoming(Packet::ConnAck(ConnAck::new(
            ConnectReturnCode::Success,
            false,
        )));
        assert_eq!(
            MessageHandler::route_event(&event),
            EventRoute::ConnectionAcknowledged
        );
    }

    #[test]
    fn test_route_publish_and_acks() {
        let publish = Publish::new("devices/pi-01/messages/devicebound/", QoS::AtLeastOnce, "hi");
        assert_eq!(
            MessageHandler::route_event(&Event::Incoming(Packet::Publish(publish))),
            EventRoute::MessageReceived {
                topic: "devices/pi-01/messages/devicebound/".to_string(),
                payload: b"hi".to_vec(),
            }
        );
        assert_eq!(
            MessageHandler::route_event(&Event::Incoming(Packet::PubAck(PubAck::new(9)))),
            EventRoute::PublishAcknowledged(9)
        );
        assert_eq!(
            MessageHandler::route_event(&Event::Outgoing(Outgoing::Publish(9))),
            EventRoute::PublishWritten(9)
        );
        assert_eq!(
            MessageHandler::route_event(&Event::Outgoing(Outgoing::PingReq)),
            EventRoute::OutgoingEvent
        );
    }

    #[test]
    fn test_route_suback_counts_failures() {
        let suback = SubAck::new(
            4,
            vec![
                SubscribeReasonCode::Success(QoS::AtLeastOnce),
                SubscribeReasonCode::Failure,
            ],
        );
        assert_eq!(
            MessageHandler::route_event(&Event::Incoming(Packet::SubAck(suback))),
            EventRoute::SubscriptionConfirmed {
                packet_id: 4,
                failures: 1
            }
        );
    }

    #[test]
    fn test_route_inbound_cloud_to_device() {
        let route = MessageHandler::route_inbound(
            "pi-01",
            "devices/pi-01/messages/devicebound/%24.mid=abc&color=red",
            b"payload",
        );
        match route {
            InboundRoute::Outcome(DeliveryOutcome::InboundReceived(msg)) => {
                assert_eq!(msg.payload, b"payload");
                assert_eq!(msg.properties.get("color"), Some("red"));
            }
            other => panic!("unexpected route: {other:?}"),
        }
    }

    #[test]
    fn test_route_inbound_method_invocation() {
        let route = MessageHandler::route_inbound(
            "pi-01",
            "$iothub/methods/POST/stop/?$rid=17",
            br#"{"delay":5}"#,
        );
        assert_eq!(
            route,
            InboundRoute::Outcome(DeliveryOutcome::MethodInvoked(MethodRequest {
                name: "stop".to_string(),
                payload: serde_json::json!({"delay": 5}),
                request_id: "17".to_string(),
            }))
        );
    }

    #[test]
    fn test_route_inbound_twin_response_and_patch() {
        assert_eq!(
            MessageHandler::route_inbound("pi-01", "$iothub/twin/res/204/?$rid=2&$version=7", b""),
            InboundRoute::TwinResponse {
                status: 204,
                request_id: "2".to_string(),
                payload: Vec::new(),
            }
        );
        assert!(matches!(
            MessageHandler::route_inbound(
                "pi-01",
                "$iothub/twin/PATCH/properties/desired/?$version=8",
                b"{}"
            ),
            InboundRoute::Outcome(DeliveryOutcome::TwinUpdated {
                state: TwinUpdateState::Partial,
                ..
            })
        ));
        assert!(matches!(
            MessageHandler::route_inbound("pi-01", "some/other/topic", b""),
            InboundRoute::Ignored(_)
        ));
    }

    #[test]
    fn test_method_payload_fallbacks() {
        let empty = MessageHandler::method_request("start".into(), "1".into(), b"");
        assert_eq!(empty.payload, Value::Null);

        let text = MessageHandler::method_request("start".into(), "1".into(), b"not json");
        assert_eq!(text.payload, Value::String("not json".to_string()));
    }

    #[test]
    fn test_twin_response_outcome() {
        assert_eq!(
            MessageHandler::twin_response_outcome(
                TwinRequestKind::ReportedPatch,
                204,
                "7".to_string(),
                Vec::new()
            ),
            DeliveryOutcome::ReportedStateAcked {
                request_id: "7".to_string(),
                status_code: 204
            }
        );
        assert_eq!(
            MessageHandler::twin_response_outcome(
                TwinRequestKind::Get,
                200,
                "8".to_string(),
                b"{}".to_vec()
            ),
            DeliveryOutcome::TwinUpdated {
                state: TwinUpdateState::Complete,
                payload: b"{}".to_vec(),
            }
        );
    }

    fn acked() -> DeliveryOutcome {
        DeliveryOutcome::ReportedStateAcked {
            request_id: "1".to_string(),
            status_code: 204,
        }
    }

    #[test]
    fn test_forwarder_without_sender_drops() {
        let forwarder = OutcomeForwarder::new();
        assert!(!forwarder.forward(acked()));
    }

    #[test]
    fn test_forwarder_delivers_to_queue() {
        let forwarder = OutcomeForwarder::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        forwarder.set_sender(tx);

        assert!(forwarder.forward(acked()));
        assert_eq!(
            rx.try_recv().unwrap(),
            acked()
        );
    }
}
