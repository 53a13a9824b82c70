//! One measurement cycle
//!
//! `Idle → Acquiring → Composing → Dispatching → AwaitingConfirmation → Idle`.
//! A cycle never waits for delivery confirmation; that arrives out of band
//! through the event pump and the [`DeliveryTracker`](super::tracker::DeliveryTracker).
//! Failures record themselves and return the agent to `Idle`.

use super::context::AgentContext;
use crate::config::TelemetrySection;
use crate::protocol::{Message, ReportedState};
use crate::sensor::{Reading, ReadingSource, SensorError};
use crate::telemetry::TelemetryComposer;
use crate::transport::{ChannelError, CloudChannel};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn, Instrument};

/// Dispatch tuning taken from configuration
#[derive(Debug, Clone)]
pub struct CycleSettings {
    /// Upper bound on waiting for the reported-state acknowledgement
    pub reported_state_timeout: Duration,
    /// Skip the telemetry send while remote control has stopped the agent
    pub gate_on_stop: bool,
}

impl CycleSettings {
    pub fn from_config(config: &TelemetrySection) -> Self {
        Self {
            reported_state_timeout: Duration::from_millis(config.reported_state_timeout_ms),
            gate_on_stop: config.gate_on_stop,
        }
    }
}

impl Default for CycleSettings {
    fn default() -> Self {
        Self {
            reported_state_timeout: Duration::from_secs(10),
            gate_on_stop: false,
        }
    }
}

/// Position in the measurement cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    Idle,
    Acquiring,
    Composing,
    Dispatching,
    AwaitingConfirmation,
}

/// How a cycle ended
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// Telemetry handed to the channel; confirmation pending
    Dispatched { seq: u64, standby_announced: bool },
    /// Telemetry composed but withheld because sending is stopped
    Suppressed { seq: u64 },
    /// Sensor acquisition failed; nothing was composed
    Skipped(SensorError),
    /// The channel refused the telemetry send
    DispatchFailed { seq: u64, error: ChannelError },
}

/// Single-flight measurement agent
///
/// `run_cycle` takes `&mut self`, so two cycles of one agent can never overlap.
pub struct Agent<C>
where
    C: CloudChannel + 'static,
{
    context: Arc<AgentContext>,
    channel: Arc<C>,
    composer: TelemetryComposer,
    source: Arc<Mutex<Box<dyn ReadingSource>>>,
    settings: CycleSettings,
    state: CycleState,
}

impl<C> Agent<C>
where
    C: CloudChannel + 'static,
{
    pub fn new(
        context: Arc<AgentContext>,
        channel: Arc<C>,
        composer: TelemetryComposer,
        source: Box<dyn ReadingSource>,
        settings: CycleSettings,
    ) -> Self {
        Self {
            context,
            channel,
            composer,
            source: Arc::new(Mutex::new(source)),
            settings,
            state: CycleState::Idle,
        }
    }

    pub fn state(&self) -> CycleState {
        self.state
    }

    pub fn context(&self) -> &Arc<AgentContext> {
        &self.context
    }

    /// Run one complete cycle
    pub async fn run_cycle(&mut self) -> CycleOutcome {
        let span = crate::cycle_span!(next_seq = self.context.sequence.peek());
        self.cycle().instrument(span).await
    }

    async fn cycle(&mut self) -> CycleOutcome {
        self.transition(CycleState::Acquiring);
        let reading = match self.acquire().await {
            Ok(reading) => reading,
            Err(e) => {
                warn!(error = %e, "Sensor acquisition failed, skipping cycle");
                self.context.tracker.record_cycle_failure();
                self.transition(CycleState::Idle);
                return CycleOutcome::Skipped(e);
            }
        };

        self.transition(CycleState::Composing);
        let seq = self.context.sequence.next();
        let message = self.composer.compose(&reading, seq);
        info!(
            seq = seq,
            message_id = %message.id,
            payload = %message.payload_text(),
            "Telemetry composed"
        );

        self.transition(CycleState::Dispatching);
        let outcome = self.dispatch(&message).await;
        self.transition(CycleState::Idle);
        outcome
    }

    /// Run the blocking sensor read off the async executor
    async fn acquire(&self) -> Result<Reading, SensorError> {
        let source = Arc::clone(&self.source);
        tokio::task::spawn_blocking(move || {
            let mut source = source.lock().unwrap_or_else(PoisonError::into_inner);
            source.acquire()
        })
        .await
        .map_err(|e| SensorError::Interrupted {
            message: e.to_string(),
        })?
    }

    async fn dispatch(&mut self, message: &Message) -> CycleOutcome {
        let seq = message.seq;
        // One read of the control flag per dispatch decision
        let enabled = self.context.control.get();

        let standby_announced = if self.channel.supports_reported_state() {
            self.announce_standby().await
        } else {
            false
        };

        if self.settings.gate_on_stop && !enabled {
            info!(seq = seq, "Sending stopped by remote control, telemetry withheld");
            return CycleOutcome::Suppressed { seq };
        }

        // Registered first so an early confirmation always finds its entry
        self.context.tracker.register_dispatch(seq);
        match self.channel.send_event(message).await {
            Ok(token) => {
                self.transition(CycleState::AwaitingConfirmation);
                info!(
                    seq = seq,
                    token = token.0,
                    enabled = enabled,
                    send_status = ?self.context.tracker.send_status(),
                    "Telemetry accepted for transmission"
                );
                CycleOutcome::Dispatched {
                    seq,
                    standby_announced,
                }
            }
            Err(error) => {
                self.context.tracker.abandon_dispatch(seq);
                self.context.tracker.record_dispatch_failure();
                warn!(seq = seq, error = %error, "Telemetry send rejected");
                CycleOutcome::DispatchFailed { seq, error }
            }
        }
    }

    /// Send the standby reported state and wait, bounded, for its acknowledgement
    async fn announce_standby(&self) -> bool {
        let tracker = &self.context.tracker;

        let request_id = match self
            .channel
            .send_reported_state(&ReportedState::standby())
            .await
        {
            Ok(request_id) => request_id,
            Err(e) => {
                tracker.record_dispatch_failure();
                warn!(error = %e, "Reported state send failed");
                return false;
            }
        };

        let timeout = self.settings.reported_state_timeout;
        if !timeout.is_zero() && !tracker.wait_for_reported_state(&request_id, timeout).await {
            warn!(
                request_id = %request_id,
                timeout_ms = timeout.as_millis() as u64,
                "Reported state not acknowledged in time, continuing with telemetry"
            );
        }
        true
    }

    fn transition(&mut self, next: CycleState) {
        debug!(from = ?self.state, to = ?next, "Cycle state transition");
        self.state = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor::ProtocolError;
    use crate::testing::mocks::{MockChannel, MockReadingSource};

    fn reading() -> Reading {
        Reading {
            temperature: 22.0,
            humidity: 40.0,
            co2_ppm: 500,
            timestamp: "2024-01-01T00:00:00.000000Z".to_string(),
        }
    }

    fn agent(channel: MockChannel, source: MockReadingSource) -> Agent<MockChannel> {
        Agent::new(
            Arc::new(AgentContext::new()),
            Arc::new(channel),
            TelemetryComposer::new("test-device"),
            Box::new(source),
            CycleSettings {
                reported_state_timeout: Duration::ZERO,
                gate_on_stop: false,
            },
        )
    }

    #[tokio::test]
    async fn test_cycle_returns_to_idle_after_dispatch() {
        let mut agent = agent(
            MockChannel::new(),
            MockReadingSource::scripted(vec![Ok(reading())]),
        );

        let outcome = agent.run_cycle().await;

        assert!(matches!(outcome, CycleOutcome::Dispatched { seq: 1, .. }));
        assert_eq!(agent.state(), CycleState::Idle);
        assert_eq!(agent.context().tracker.pending(), vec![1]);
    }

    #[tokio::test]
    async fn test_sensor_failure_skips_without_consuming_sequence() {
        let mut agent = agent(
            MockChannel::new(),
            MockReadingSource::scripted(vec![
                Err(SensorError::Co2Unavailable(ProtocolError::Truncated {
                    received: 0,
                })),
                Ok(reading()),
            ]),
        );

        let first = agent.run_cycle().await;
        let second = agent.run_cycle().await;

        assert!(matches!(first, CycleOutcome::Skipped(_)));
        assert!(matches!(second, CycleOutcome::Dispatched { seq: 1, .. }));
        assert_eq!(agent.context().tracker.failures().cycles, 1);
    }

    #[tokio::test]
    async fn test_send_rejection_is_recorded() {
        let mut agent = agent(
            MockChannel::with_failure(),
            MockReadingSource::scripted(vec![Ok(reading())]),
        );

        let outcome = agent.run_cycle().await;

        assert!(matches!(outcome, CycleOutcome::DispatchFailed { seq: 1, .. }));
        assert!(agent.context().tracker.pending().is_empty());
        assert!(agent.context().tracker.failures().sends >= 1);
        assert_eq!(agent.state(), CycleState::Idle);
    }
}
