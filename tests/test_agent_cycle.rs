//! Measurement cycle tests
//!
//! Drive single cycles against a mock channel and scripted sensor source:
//! what gets sent, in which order, and what a failed step leaves behind.

mod test_helpers;

use climate_agent::agent::{Agent, AgentContext, CycleOutcome, CycleSettings, CycleState};
use climate_agent::protocol::ReportedState;
use climate_agent::sensor::{ProtocolError, SensorError};
use climate_agent::telemetry::TelemetryComposer;
use climate_agent::testing::mocks::{ChannelCall, MockChannel, MockReadingSource};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use test_helpers::reading;

fn build_agent(
    channel: MockChannel,
    source: MockReadingSource,
    gate_on_stop: bool,
) -> (Agent<MockChannel>, Arc<MockChannel>) {
    let channel = Arc::new(channel);
    let agent = Agent::new(
        Arc::new(AgentContext::new()),
        Arc::clone(&channel),
        TelemetryComposer::new("pi-01"),
        Box::new(source),
        CycleSettings {
            reported_state_timeout: Duration::ZERO,
            gate_on_stop,
        },
    );
    (agent, channel)
}

#[tokio::test]
async fn test_cycle_sends_alerting_telemetry() {
    let (mut agent, channel) = build_agent(
        MockChannel::new(),
        MockReadingSource::scripted(vec![Ok(reading(30.0, 45.0, 900))]),
        false,
    );

    let outcome = agent.run_cycle().await;

    assert_eq!(
        outcome,
        CycleOutcome::Dispatched {
            seq: 1,
            standby_announced: true
        }
    );
    let events = channel.sent_events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].properties.get("temperatureAlert"), Some("true"));
    assert_eq!(events[0].properties.get("co2Alert"), Some("true"));
    assert_eq!(agent.context().tracker.pending(), vec![1]);
}

#[tokio::test]
async fn test_stopped_agent_still_sends_by_default() {
    let (mut agent, channel) = build_agent(
        MockChannel::new(),
        MockReadingSource::scripted(vec![Ok(reading(22.0, 40.0, 500))]),
        false,
    );
    agent.context().control.set(false);

    let outcome = agent.run_cycle().await;

    assert!(matches!(outcome, CycleOutcome::Dispatched { seq: 1, .. }));
    assert_eq!(channel.sent_events().len(), 1);
}

#[tokio::test]
async fn test_gate_on_stop_withholds_telemetry() {
    let (mut agent, channel) = build_agent(
        MockChannel::new(),
        MockReadingSource::scripted(vec![Ok(reading(22.0, 40.0, 500)); 2]),
        true,
    );
    agent.context().control.set(false);

    assert_eq!(agent.run_cycle().await, CycleOutcome::Suppressed { seq: 1 });
    assert!(channel.sent_events().is_empty());
    assert!(agent.context().tracker.pending().is_empty());

    agent.context().control.set(true);
    assert!(matches!(
        agent.run_cycle().await,
        CycleOutcome::Dispatched { seq: 2, .. }
    ));
}

#[tokio::test]
async fn test_reported_state_precedes_telemetry() {
    let (mut agent, channel) = build_agent(
        MockChannel::new(),
        MockReadingSource::scripted(vec![Ok(reading(22.0, 40.0, 500))]),
        false,
    );

    agent.run_cycle().await;

    assert_eq!(
        channel.call_log(),
        vec![ChannelCall::SendReportedState, ChannelCall::SendEvent]
    );
    assert_eq!(channel.sent_reported_states(), vec![ReportedState::standby()]);
}

#[tokio::test]
async fn test_no_reported_state_without_twin_support() {
    let (mut agent, channel) = build_agent(
        MockChannel::without_reported_state(),
        MockReadingSource::scripted(vec![Ok(reading(22.0, 40.0, 500))]),
        false,
    );

    let outcome = agent.run_cycle().await;

    assert_eq!(
        outcome,
        CycleOutcome::Dispatched {
            seq: 1,
            standby_announced: false
        }
    );
    assert_eq!(channel.call_log(), vec![ChannelCall::SendEvent]);
}

#[tokio::test]
async fn test_sensor_failure_skips_cycle_and_sends_nothing() {
    let source = MockReadingSource::scripted(vec![Err(SensorError::Co2Unavailable(
        ProtocolError::Truncated { received: 0 },
    ))]);
    let acquisitions = source.acquisitions();
    let (mut agent, channel) = build_agent(MockChannel::new(), source, false);

    let outcome = agent.run_cycle().await;

    assert!(matches!(outcome, CycleOutcome::Skipped(_)));
    assert_eq!(acquisitions.load(Ordering::SeqCst), 1);
    assert!(channel.call_log().is_empty());
    assert_eq!(agent.context().tracker.failures().cycles, 1);
    assert_eq!(agent.context().sequence.peek(), 1);
    assert_eq!(agent.state(), CycleState::Idle);
}

#[tokio::test]
async fn test_sequence_numbers_increase_across_cycles() {
    let (mut agent, channel) = build_agent(
        MockChannel::new(),
        MockReadingSource::scripted(vec![Ok(reading(22.0, 40.0, 500)); 3]),
        false,
    );

    for _ in 0..3 {
        agent.run_cycle().await;
    }

    let seqs: Vec<u64> = channel.sent_events().iter().map(|m| m.seq).collect();
    assert_eq!(seqs, vec![1, 2, 3]);
}
