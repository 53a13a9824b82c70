//! Delivery-confirmation bookkeeping
//!
//! Counts every asynchronous outcome per category and keeps the set of
//! telemetry sends still waiting for confirmation. Counters only ever grow.
//! Nothing here expires a pending send: a confirmation that never arrives
//! leaves its sequence number pending for the life of the process.

use crate::protocol::events::{DeliveryOutcome, SendResult};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;

/// Acknowledged patch ids kept for late waiters
const ACKED_PATCH_HISTORY: usize = 16;

/// Snapshot of the per-category outcome counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryCounters {
    pub sent: u64,
    pub received: u64,
    pub blob: u64,
    pub twin: u64,
    pub reported_state: u64,
    pub method: u64,
}

/// Snapshot of locally recorded failures
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FailureCounts {
    /// Cycles aborted before dispatch (sensor or protocol failure)
    pub cycles: u64,
    /// Sends rejected by the channel or confirmed as failed
    pub sends: u64,
}

/// Outbound queue status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// No telemetry awaiting confirmation
    Idle,
    /// At least one telemetry message awaiting confirmation
    Busy,
}

/// Thread-safe outcome counters and pending-send registry
#[derive(Debug, Default)]
pub struct DeliveryTracker {
    sent: AtomicU64,
    received: AtomicU64,
    blob: AtomicU64,
    twin: AtomicU64,
    reported_state: AtomicU64,
    method: AtomicU64,

    cycle_failures: AtomicU64,
    send_failures: AtomicU64,

    pending: Mutex<BTreeSet<u64>>,
    acked_patches: Mutex<VecDeque<String>>,
    last_received: Mutex<Option<DateTime<Utc>>>,
    recorded: Notify,
}

impl DeliveryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one asynchronous outcome
    pub fn record(&self, outcome: &DeliveryOutcome) {
        match outcome {
            DeliveryOutcome::MessageSent { seq, status } => {
                self.resolve(*seq);
                if !status.is_ok() {
                    self.send_failures.fetch_add(1, Ordering::Relaxed);
                }
                self.sent.fetch_add(1, Ordering::Relaxed);
            }
            DeliveryOutcome::ReportedStateAcked { request_id, .. } => {
                if let Ok(mut acked) = self.acked_patches.lock() {
                    if acked.len() == ACKED_PATCH_HISTORY {
                        acked.pop_front();
                    }
                    acked.push_back(request_id.clone());
                }
                self.reported_state.fetch_add(1, Ordering::Relaxed);
            }
            DeliveryOutcome::InboundReceived(_) => {
                if let Ok(mut last) = self.last_received.lock() {
                    *last = Some(Utc::now());
                }
                self.received.fetch_add(1, Ordering::Relaxed);
            }
            DeliveryOutcome::TwinUpdated { .. } => {
                self.twin.fetch_add(1, Ordering::Relaxed);
            }
            DeliveryOutcome::MethodInvoked(_) => {
                self.method.fetch_add(1, Ordering::Relaxed);
            }
            DeliveryOutcome::BlobUploaded { status } => {
                if let SendResult::Failed(_) = status {
                    self.send_failures.fetch_add(1, Ordering::Relaxed);
                }
                self.blob.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.recorded.notify_waiters();
    }

    pub fn counters(&self) -> DeliveryCounters {
        DeliveryCounters {
            sent: self.sent.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            blob: self.blob.load(Ordering::Relaxed),
            twin: self.twin.load(Ordering::Relaxed),
            reported_state: self.reported_state.load(Ordering::Relaxed),
            method: self.method.load(Ordering::Relaxed),
        }
    }

    // Dispatch bookkeeping

    /// Mark `seq` as awaiting confirmation; call before handing it to the channel
    pub fn register_dispatch(&self, seq: u64) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(seq);
        }
    }

    /// Forget `seq` after the channel refused it
    pub fn abandon_dispatch(&self, seq: u64) {
        self.resolve(seq);
    }

    fn resolve(&self, seq: u64) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&seq);
        }
    }

    /// Sequence numbers still waiting for confirmation, ascending
    pub fn pending(&self) -> Vec<u64> {
        self.pending
            .lock()
            .map(|pending| pending.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn send_status(&self) -> SendStatus {
        if self.pending().is_empty() {
            SendStatus::Idle
        } else {
            SendStatus::Busy
        }
    }

    // Local failures

    pub fn record_cycle_failure(&self) {
        self.cycle_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dispatch_failure(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn failures(&self) -> FailureCounts {
        FailureCounts {
            cycles: self.cycle_failures.load(Ordering::Relaxed),
            sends: self.send_failures.load(Ordering::Relaxed),
        }
    }

    /// Time the most recent cloud-to-device message was recorded
    pub fn last_message_received_at(&self) -> Option<DateTime<Utc>> {
        self.last_received.lock().ok().and_then(|last| *last)
    }

    /// Take the acknowledgement for patch `request_id` if it has been recorded
    fn take_patch_ack(&self, request_id: &str) -> bool {
        let Ok(mut acked) = self.acked_patches.lock() else {
            return false;
        };
        match acked.iter().position(|id| id == request_id) {
            Some(index) => {
                acked.remove(index);
                true
            }
            None => false,
        }
    }

    /// Wait until patch `request_id` is acknowledged or `timeout` elapses
    ///
    /// Acknowledgements for other patches, including late ones from earlier
    /// cycles, do not end the wait. Returns `true` when this patch's
    /// acknowledgement arrived in time.
    pub async fn wait_for_reported_state(&self, request_id: &str, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.recorded.notified();
                tokio::pin!(notified);
                // Register before checking so a record() in between is not missed
                notified.as_mut().enable();
                if self.take_patch_ack(request_id) {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }

    /// Wait until no telemetry is awaiting confirmation or `timeout` elapses
    ///
    /// Returns the final [`SendStatus`].
    pub async fn wait_until_idle(&self, timeout: Duration) -> SendStatus {
        let wait = async {
            loop {
                let notified = self.recorded.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.send_status() == SendStatus::Idle {
                    return;
                }
                notified.await;
            }
        };
        let _ = tokio::time::timeout(timeout, wait).await;
        self.send_status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::events::{InboundMessage, TwinUpdateState};
    use crate::protocol::messages::MessageProperties;
    use crate::transport::ChannelError;
    use std::sync::Arc;

    fn sent(seq: u64) -> DeliveryOutcome {
        DeliveryOutcome::MessageSent {
            seq,
            status: SendResult::Ok,
        }
    }

    #[test]
    fn test_counters_are_independent() {
        let tracker = DeliveryTracker::new();
        for seq in 1..=3 {
            tracker.record(&sent(seq));
        }
        tracker.record(&DeliveryOutcome::TwinUpdated {
            state: TwinUpdateState::Complete,
            payload: b"{}".to_vec(),
        });

        assert_eq!(
            tracker.counters(),
            DeliveryCounters {
                sent: 3,
                twin: 1,
                ..Default::default()
            }
        );
    }

    #[test]
    fn test_failed_confirmation_counts_as_sent_and_failure() {
        let tracker = DeliveryTracker::new();
        tracker.register_dispatch(5);

        tracker.record(&DeliveryOutcome::MessageSent {
            seq: 5,
            status: SendResult::Failed(ChannelError::transport_unavailable("lost")),
        });

        assert_eq!(tracker.counters().sent, 1);
        assert_eq!(tracker.failures().sends, 1);
        assert!(tracker.pending().is_empty());
    }

    #[test]
    fn test_pending_dispatch_lifecycle() {
        let tracker = DeliveryTracker::new();
        assert_eq!(tracker.send_status(), SendStatus::Idle);

        tracker.register_dispatch(1);
        tracker.register_dispatch(2);
        assert_eq!(tracker.pending(), vec![1, 2]);
        assert_eq!(tracker.send_status(), SendStatus::Busy);

        tracker.record(&sent(1));
        tracker.abandon_dispatch(2);
        assert_eq!(tracker.send_status(), SendStatus::Idle);
    }

    #[test]
    fn test_unknown_confirmation_still_counts() {
        let tracker = DeliveryTracker::new();
        tracker.record(&sent(99));
        assert_eq!(tracker.counters().sent, 1);
        assert!(tracker.pending().is_empty());
    }

    #[test]
    fn test_inbound_message_sets_last_received() {
        let tracker = DeliveryTracker::new();
        assert!(tracker.last_message_received_at().is_none());

        tracker.record(&DeliveryOutcome::InboundReceived(InboundMessage {
            payload: b"hello".to_vec(),
            properties: MessageProperties::new(),
        }));

        assert_eq!(tracker.counters().received, 1);
        assert!(tracker.last_message_received_at().is_some());
    }

    #[test]
    fn test_local_failures() {
        let tracker = DeliveryTracker::new();
        tracker.record_cycle_failure();
        tracker.record_cycle_failure();
        tracker.record_dispatch_failure();
        assert_eq!(tracker.failures(), FailureCounts { cycles: 2, sends: 1 });
        assert_eq!(tracker.counters(), DeliveryCounters::default());
    }

    fn acked(request_id: &str) -> DeliveryOutcome {
        DeliveryOutcome::ReportedStateAcked {
            request_id: request_id.to_string(),
            status_code: 204,
        }
    }

    #[tokio::test]
    async fn test_wait_for_reported_state_acknowledged() {
        let tracker = Arc::new(DeliveryTracker::new());
        let recorder = tracker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            recorder.record(&acked("1"));
        });

        assert!(
            tracker
                .wait_for_reported_state("1", Duration::from_secs(2))
                .await
        );
    }

    #[tokio::test]
    async fn test_wait_for_reported_state_times_out() {
        let tracker = DeliveryTracker::new();
        tracker.record(&sent(1));

        assert!(
            !tracker
                .wait_for_reported_state("1", Duration::from_millis(20))
                .await
        );
    }

    #[tokio::test]
    async fn test_wait_returns_immediately_when_already_acknowledged() {
        let tracker = DeliveryTracker::new();
        tracker.record(&acked("4"));

        assert!(
            tracker
                .wait_for_reported_state("4", Duration::from_millis(1))
                .await
        );
        // Consumed by the first wait
        assert!(
            !tracker
                .wait_for_reported_state("4", Duration::from_millis(1))
                .await
        );
    }

    #[test]
    fn test_acked_patch_history_is_bounded() {
        let tracker = DeliveryTracker::new();
        for id in 0..(ACKED_PATCH_HISTORY + 4) {
            tracker.record(&acked(&id.to_string()));
        }

        assert!(!tracker.take_patch_ack("0"));
        assert!(tracker.take_patch_ack(&(ACKED_PATCH_HISTORY + 3).to_string()));
        assert_eq!(tracker.counters().reported_state, ACKED_PATCH_HISTORY as u64 + 4);
    }

    #[tokio::test]
    async fn test_wait_until_idle() {
        let tracker = Arc::new(DeliveryTracker::new());
        assert_eq!(
            tracker.wait_until_idle(Duration::from_millis(1)).await,
            SendStatus::Idle
        );

        tracker.register_dispatch(1);
        assert_eq!(
            tracker.wait_until_idle(Duration::from_millis(20)).await,
            SendStatus::Busy
        );

        let recorder = tracker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            recorder.record(&sent(1));
        });
        assert_eq!(
            tracker.wait_until_idle(Duration::from_secs(2)).await,
            SendStatus::Idle
        );
    }
}
