//! Matching broker acknowledgements back to the sends that caused them
//!
//! rumqttc assigns packet ids inside its event loop, so a telemetry publish
//! only learns its pkid when the loop reports `Outgoing::Publish(pkid)`.
//! Telemetry is the only QoS 1 traffic, and the event loop emits outgoing
//! publishes in request order, so a FIFO of sequence numbers pairs each
//! non-zero outgoing pkid with the telemetry message that produced it.
//!
//! Twin requests are correlated by their `$rid` instead.

use std::collections::{HashMap, VecDeque};

/// What a pending twin request was for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TwinRequestKind {
    /// Full twin document request
    Get,
    /// Reported-properties patch
    ReportedPatch,
}

#[derive(Debug, Default)]
pub struct PublishCorrelation {
    /// Telemetry handed to the client, pkid not yet assigned
    queued: VecDeque<u64>,
    /// pkid → telemetry sequence number, waiting for PubAck
    in_flight: HashMap<u16, u64>,
    twin_requests: HashMap<String, TwinRequestKind>,
}

impl PublishCorrelation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that telemetry `seq` was just handed to the client
    pub fn enqueue(&mut self, seq: u64) {
        self.queued.push_back(seq);
    }

    /// Undo the most recent `enqueue` after the client refused the request
    pub fn cancel_last(&mut self) -> Option<u64> {
        self.queued.pop_back()
    }

    /// The event loop wrote a publish with `pkid`; QoS 0 publishes carry pkid 0
    pub fn on_outgoing(&mut self, pkid: u16) -> Option<u64> {
        if pkid == 0 {
            return None;
        }
        let seq = self.queued.pop_front()?;
        self.in_flight.insert(pkid, seq);
        Some(seq)
    }

    /// The broker acknowledged `pkid`; returns the confirmed telemetry sequence
    pub fn on_puback(&mut self, pkid: u16) -> Option<u64> {
        self.in_flight.remove(&pkid)
    }

    pub fn register_twin_request(&mut self, request_id: impl Into<String>, kind: TwinRequestKind) {
        self.twin_requests.insert(request_id.into(), kind);
    }

    pub fn take_twin_request(&mut self, request_id: &str) -> Option<TwinRequestKind> {
        self.twin_requests.remove(request_id)
    }

    /// Drop all correlation state after the session was lost
    ///
    /// Returns every telemetry sequence number that will never be
    /// acknowledged, ascending.
    pub fn fail_all(&mut self) -> Vec<u64> {
        let mut lost: Vec<u64> = self
            .queued
            .drain(..)
            .chain(self.in_flight.drain().map(|(_, seq)| seq))
            .collect();
        lost.sort_unstable();
        self.twin_requests.clear();
        lost
    }

    /// Number of telemetry messages not yet acknowledged
    pub fn outstanding(&self) -> usize {
        self.queued.len() + self.in_flight.len()
    }
}
