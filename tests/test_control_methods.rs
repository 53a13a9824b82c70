//! Remote control round trips through the full lifecycle
//!
//! Method invocations and confirmations are pushed through the mock
//! channel's outcome queue and handled by the running event pump.

mod test_helpers;

use climate_agent::agent::AgentLifecycle;
use climate_agent::protocol::{DeliveryOutcome, MethodRequest, SendResult};
use climate_agent::testing::mocks::{MockChannel, MockReadingSource};
use serde_json::json;
use test_helpers::{eventually, reading, test_config};
use tokio::sync::watch;

fn method(name: &str, request_id: &str) -> DeliveryOutcome {
    DeliveryOutcome::MethodInvoked(MethodRequest {
        name: name.to_string(),
        payload: json!({}),
        request_id: request_id.to_string(),
    })
}

async fn started(channel: MockChannel, readings: usize) -> AgentLifecycle<MockChannel> {
    let source = MockReadingSource::scripted(vec![Ok(reading(22.0, 40.0, 500)); readings]);
    let mut lifecycle = AgentLifecycle::new(test_config(), channel, Box::new(source));
    lifecycle.start().await.unwrap();
    lifecycle
}

#[tokio::test]
async fn test_stop_then_start_round_trip() {
    let lifecycle = started(MockChannel::new(), 0).await;
    let channel = lifecycle.channel().unwrap().clone();
    let context = lifecycle.context().clone();

    assert!(channel.emit(method("stop", "1")));
    assert!(eventually(|| channel.method_responses().len() == 1).await);
    assert!(!context.control.get());

    assert!(channel.emit(method("start", "2")));
    assert!(eventually(|| channel.method_responses().len() == 2).await);
    assert!(context.control.get());

    let responses = channel.method_responses();
    assert_eq!(responses[0].0.request_id, "1");
    assert_eq!(responses[0].1.response, json!({"Response": "Successfully stopped"}));
    assert_eq!(responses[1].1.response, json!({"Response": "Successfully started"}));
    assert_eq!(context.tracker.counters().method, 2);
}

#[tokio::test]
async fn test_unknown_method_acknowledged_without_state_change() {
    let lifecycle = started(MockChannel::new(), 0).await;
    let channel = lifecycle.channel().unwrap().clone();

    assert!(channel.emit(method("reboot", "7")));
    assert!(eventually(|| !channel.method_responses().is_empty()).await);

    let (_, ack) = &channel.method_responses()[0];
    assert_eq!(ack.status, 200);
    assert_eq!(
        ack.response,
        json!({"Response": "This is the response from the device"})
    );
    assert!(lifecycle.context().control.get());
}

#[tokio::test]
async fn test_confirmations_clear_pending_sends() {
    let mut lifecycle = started(MockChannel::new().confirming_telemetry(), 2).await;
    let (_tx, rx) = watch::channel(false);

    let cycles = lifecycle.run(rx, Some(2)).await.unwrap();
    assert_eq!(cycles, 2);

    let context = lifecycle.context().clone();
    assert!(eventually(|| context.tracker.counters().sent == 2).await);
    assert!(context.tracker.pending().is_empty());
    assert_eq!(context.tracker.counters().reported_state, 2);
}

#[tokio::test]
async fn test_failed_confirmation_counts_as_send_failure() {
    let lifecycle = started(MockChannel::new(), 0).await;
    let channel = lifecycle.channel().unwrap().clone();
    let context = lifecycle.context().clone();

    assert!(channel.emit(DeliveryOutcome::MessageSent {
        seq: 9,
        status: SendResult::Failed(climate_agent::ChannelError::transport_unavailable("lost")),
    }));

    assert!(eventually(|| context.tracker.failures().sends == 1).await);
    assert_eq!(context.tracker.counters().sent, 1);
}

#[tokio::test]
async fn test_permanent_disconnect_ends_run() {
    let mut lifecycle = started(MockChannel::new(), 3).await;
    lifecycle.channel().unwrap().give_up();
    let (_tx, rx) = watch::channel(false);

    let result = lifecycle.run(rx, None).await;

    assert!(result.is_err());
    lifecycle.shutdown().await.unwrap();
}
