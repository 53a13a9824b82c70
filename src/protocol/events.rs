//! Asynchronous delivery outcomes produced by a cloud channel
//!
//! Every callback the channel would otherwise invoke is represented as one
//! typed [`DeliveryOutcome`] value on a completion queue.

use super::messages::{MessageProperties, MethodRequest};
use crate::transport::ChannelError;

/// Result of an asynchronous send
#[derive(Debug, Clone, PartialEq)]
pub enum SendResult {
    Ok,
    Failed(ChannelError),
}

impl SendResult {
    pub fn is_ok(&self) -> bool {
        matches!(self, SendResult::Ok)
    }
}

/// Whether a twin callback carries the whole document or a desired-properties patch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TwinUpdateState {
    Complete,
    Partial,
}

/// Cloud-to-device message
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub payload: Vec<u8>,
    pub properties: MessageProperties,
}

/// One asynchronous completion or inbound event from the cloud channel
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    /// Telemetry message `seq` was confirmed (or failed)
    MessageSent { seq: u64, status: SendResult },
    /// Reported-state patch `request_id` acknowledged with a transport status code
    ReportedStateAcked {
        request_id: String,
        status_code: u16,
    },
    /// Cloud-to-device message arrived
    InboundReceived(InboundMessage),
    /// Device twin document or desired-properties patch arrived
    TwinUpdated {
        state: TwinUpdateState,
        payload: Vec<u8>,
    },
    /// Remote method invoked against the device
    MethodInvoked(MethodRequest),
    /// File upload confirmation
    BlobUploaded { status: SendResult },
}

impl DeliveryOutcome {
    /// Short category label for structured logs
    pub fn category(&self) -> &'static str {
        match self {
            DeliveryOutcome::MessageSent { .. } => "sent",
            DeliveryOutcome::ReportedStateAcked { .. } => "reported_state",
            DeliveryOutcome::InboundReceived(_) => "received",
            DeliveryOutcome::TwinUpdated { .. } => "twin",
            DeliveryOutcome::MethodInvoked(_) => "method",
            DeliveryOutcome::BlobUploaded { .. } => "blob",
        }
    }
}
