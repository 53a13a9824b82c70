//! Cloud channel abstraction
//!
//! The agent talks to the cloud only through [`CloudChannel`]: fire-and-forget
//! sends whose confirmations, together with every inbound event, come back
//! later as [`DeliveryOutcome`] values on the queue installed with
//! [`CloudChannel::set_outcome_sender`].

use crate::protocol::{DeliveryOutcome, Message, MethodAck, MethodRequest, ReportedState};
use thiserror::Error;
use tokio::sync::mpsc;

pub mod mqtt;

/// Errors surfaced by a cloud channel
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("Send failed: {reason}")]
    SendFailed { reason: String },
    #[error("Transport unavailable: {reason}")]
    TransportUnavailable { reason: String },
}

impl ChannelError {
    pub fn send_failed<S: Into<String>>(reason: S) -> Self {
        Self::SendFailed {
            reason: reason.into(),
        }
    }

    pub fn transport_unavailable<S: Into<String>>(reason: S) -> Self {
        Self::TransportUnavailable {
            reason: reason.into(),
        }
    }
}

/// Token returned for an accepted send; confirmations carry the same value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeliveryToken(pub u64);

/// Outcome queue handed to a channel
pub type OutcomeSender = mpsc::UnboundedSender<DeliveryOutcome>;

/// Device-side cloud channel
///
/// Implementations must be shareable: once connected, the agent loop and the
/// inbound event pump hold the channel concurrently.
#[async_trait::async_trait]
pub trait CloudChannel: Send + Sync {
    /// Establish the connection and subscriptions
    async fn connect(&mut self) -> Result<(), ChannelError>;

    /// Close the connection; safe to call when never connected
    async fn disconnect(&self) -> Result<(), ChannelError>;

    /// Hand a telemetry message to the channel without waiting for delivery
    ///
    /// Confirmation arrives later as `DeliveryOutcome::MessageSent` with
    /// `seq == message.seq`.
    async fn send_event(&self, message: &Message) -> Result<DeliveryToken, ChannelError>;

    /// Send a reported-state patch
    ///
    /// Returns the request id that the later `ReportedStateAcked` carries.
    async fn send_reported_state(&self, state: &ReportedState) -> Result<String, ChannelError>;

    /// Answer a device method invocation
    async fn send_method_response(
        &self,
        request: &MethodRequest,
        ack: &MethodAck,
    ) -> Result<(), ChannelError>;

    /// Install the queue that receives asynchronous outcomes
    async fn set_outcome_sender(&self, sender: OutcomeSender);

    /// Whether this transport can carry reported-state patches
    fn supports_reported_state(&self) -> bool;

    fn is_connected(&self) -> bool;

    /// True once the channel gave up reconnecting
    fn is_permanently_disconnected(&self) -> bool;
}
