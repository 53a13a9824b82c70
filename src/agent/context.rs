//! Shared agent state
//!
//! Everything the measurement loop and the inbound event handlers share is
//! held in one [`AgentContext`] and passed around behind an `Arc`.

use super::control::ControlState;
use super::tracker::DeliveryTracker;
use std::sync::atomic::{AtomicU64, Ordering};

/// Per-process message sequence, starting at 1 and never reused
#[derive(Debug)]
pub struct SequenceCounter {
    next: AtomicU64,
}

impl SequenceCounter {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }

    /// Allocate the next sequence number
    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// Value the next call to [`next`](Self::next) will return
    pub fn peek(&self) -> u64 {
        self.next.load(Ordering::Relaxed)
    }
}

impl Default for SequenceCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// State shared between the agent loop and channel event handlers
#[derive(Debug, Default)]
pub struct AgentContext {
    pub control: ControlState,
    pub tracker: DeliveryTracker,
    pub sequence: SequenceCounter,
}

impl AgentContext {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_sequence_starts_at_one_and_increases() {
        let seq = SequenceCounter::new();
        assert_eq!(seq.next(), 1);
        assert_eq!(seq.next(), 2);
        assert_eq!(seq.peek(), 3);
    }

    #[test]
    fn test_sequence_unique_across_threads() {
        let seq = Arc::new(SequenceCounter::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let seq = seq.clone();
                std::thread::spawn(move || (0..250).map(|_| seq.next()).collect::<Vec<_>>())
            })
            .collect();

        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 1000);
        assert_eq!(all.first(), Some(&1));
        assert_eq!(all.last(), Some(&1000));
    }

    #[test]
    fn test_context_defaults() {
        let ctx = AgentContext::new();
        assert!(ctx.control.get());
        assert_eq!(ctx.sequence.peek(), 1);
        assert!(ctx.tracker.pending().is_empty());
    }
}
