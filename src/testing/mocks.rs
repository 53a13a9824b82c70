//! Mock implementations for testing
//!
//! Provides a mock cloud channel, scripted sensor sources, and an in-memory
//! serial line so the whole agent can be exercised without a broker or
//! hardware.

use crate::protocol::{
    DeliveryOutcome, Message, MethodAck, MethodRequest, ReportedState, SendResult,
};
use crate::sensor::{EnvironmentSample, EnvironmentSensor, Reading, ReadingSource, SensorError};
use crate::transport::{ChannelError, CloudChannel, DeliveryToken, OutcomeSender};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Channel operations in the order they were invoked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelCall {
    Connect,
    Disconnect,
    SendEvent,
    SendReportedState,
    SendMethodResponse,
}

/// Mock cloud channel for testing
///
/// Reported-state patches are acknowledged through the installed outcome
/// queue unless built with [`MockChannel::without_acknowledgements`].
#[derive(Debug)]
pub struct MockChannel {
    pub events: Arc<Mutex<Vec<Message>>>,
    pub reported_states: Arc<Mutex<Vec<ReportedState>>>,
    pub method_responses: Arc<Mutex<Vec<(MethodRequest, MethodAck)>>>,
    pub calls: Arc<Mutex<Vec<ChannelCall>>>,
    pub should_fail: bool,
    pub refuse_connection: bool,
    pub reported_state_supported: bool,
    pub acknowledge_reported_state: bool,
    pub confirm_telemetry: bool,
    pub confirmation_delay: Duration,
    patch_ids: AtomicU64,
    connected: AtomicBool,
    permanently_disconnected: AtomicBool,
    outcome_sender: Mutex<Option<OutcomeSender>>,
}

impl Default for MockChannel {
    fn default() -> Self {
        Self {
            events: Arc::default(),
            reported_states: Arc::default(),
            method_responses: Arc::default(),
            calls: Arc::default(),
            should_fail: false,
            refuse_connection: false,
            reported_state_supported: true,
            acknowledge_reported_state: true,
            confirm_telemetry: false,
            confirmation_delay: Duration::ZERO,
            patch_ids: AtomicU64::new(1),
            connected: AtomicBool::new(false),
            permanently_disconnected: AtomicBool::new(false),
            outcome_sender: Mutex::new(None),
        }
    }
}

impl MockChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every send is rejected
    pub fn with_failure() -> Self {
        Self {
            should_fail: true,
            ..Default::default()
        }
    }

    pub fn refusing_connection() -> Self {
        Self {
            refuse_connection: true,
            ..Default::default()
        }
    }

    /// Transport without a device twin
    pub fn without_reported_state() -> Self {
        Self {
            reported_state_supported: false,
            ..Default::default()
        }
    }

    pub fn without_acknowledgements() -> Self {
        Self {
            acknowledge_reported_state: false,
            ..Default::default()
        }
    }

    /// Confirm every accepted telemetry message immediately
    pub fn confirming_telemetry(mut self) -> Self {
        self.confirm_telemetry = true;
        self
    }

    /// Confirm every accepted telemetry message after `delay`
    pub fn confirming_telemetry_after(mut self, delay: Duration) -> Self {
        self.confirm_telemetry = true;
        self.confirmation_delay = delay;
        self
    }

    pub fn sent_events(&self) -> Vec<Message> {
        lock(&self.events).clone()
    }

    pub fn sent_reported_states(&self) -> Vec<ReportedState> {
        lock(&self.reported_states).clone()
    }

    pub fn method_responses(&self) -> Vec<(MethodRequest, MethodAck)> {
        lock(&self.method_responses).clone()
    }

    pub fn call_log(&self) -> Vec<ChannelCall> {
        lock(&self.calls).clone()
    }

    /// Push an outcome as if it came from the transport
    ///
    /// Returns false when no queue is installed or the receiver is gone.
    pub fn emit(&self, outcome: DeliveryOutcome) -> bool {
        lock(&self.outcome_sender)
            .as_ref()
            .is_some_and(|sender| sender.send(outcome).is_ok())
    }

    /// Simulate the transport giving up on reconnection
    pub fn give_up(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.permanently_disconnected.store(true, Ordering::SeqCst);
    }

    fn record_call(&self, call: ChannelCall) {
        lock(&self.calls).push(call);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl CloudChannel for MockChannel {
    async fn connect(&mut self) -> Result<(), ChannelError> {
        self.record_call(ChannelCall::Connect);
        if self.refuse_connection {
            return Err(ChannelError::transport_unavailable("Mock connection failure"));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), ChannelError> {
        self.record_call(ChannelCall::Disconnect);
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn send_event(&self, message: &Message) -> Result<DeliveryToken, ChannelError> {
        self.record_call(ChannelCall::SendEvent);
        if self.should_fail {
            return Err(ChannelError::send_failed("Mock send failure"));
        }

        lock(&self.events).push(message.clone());
        if self.confirm_telemetry {
            let confirmation = DeliveryOutcome::MessageSent {
                seq: message.seq,
                status: SendResult::Ok,
            };
            if self.confirmation_delay.is_zero() {
                self.emit(confirmation);
            } else if let Some(sender) = lock(&self.outcome_sender).clone() {
                let delay = self.confirmation_delay;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = sender.send(confirmation);
                });
            }
        }
        Ok(DeliveryToken(message.seq))
    }

    async fn send_reported_state(&self, state: &ReportedState) -> Result<String, ChannelError> {
        self.record_call(ChannelCall::SendReportedState);
        if self.should_fail {
            return Err(ChannelError::send_failed("Mock reported state failure"));
        }

        lock(&self.reported_states).push(state.clone());
        let request_id = self.patch_ids.fetch_add(1, Ordering::Relaxed).to_string();
        if self.acknowledge_reported_state {
            self.emit(DeliveryOutcome::ReportedStateAcked {
                request_id: request_id.clone(),
                status_code: 204,
            });
        }
        Ok(request_id)
    }

    async fn send_method_response(
        &self,
        request: &MethodRequest,
        ack: &MethodAck,
    ) -> Result<(), ChannelError> {
        self.record_call(ChannelCall::SendMethodResponse);
        if self.should_fail {
            return Err(ChannelError::send_failed("Mock method response failure"));
        }

        lock(&self.method_responses).push((request.clone(), ack.clone()));
        Ok(())
    }

    async fn set_outcome_sender(&self, sender: OutcomeSender) {
        *lock(&self.outcome_sender) = Some(sender);
    }

    fn supports_reported_state(&self) -> bool {
        self.reported_state_supported
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn is_permanently_disconnected(&self) -> bool {
        self.permanently_disconnected.load(Ordering::SeqCst)
    }
}

/// Reading source that replays a fixed script, then reports the sensor missing
#[derive(Debug, Default)]
pub struct MockReadingSource {
    script: VecDeque<Result<Reading, SensorError>>,
    acquisitions: Arc<AtomicUsize>,
}

impl MockReadingSource {
    pub fn scripted(script: Vec<Result<Reading, SensorError>>) -> Self {
        Self {
            script: script.into(),
            acquisitions: Arc::default(),
        }
    }

    /// Shared count of `acquire` calls, readable after the source is boxed
    pub fn acquisitions(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.acquisitions)
    }
}

impl ReadingSource for MockReadingSource {
    fn acquire(&mut self) -> Result<Reading, SensorError> {
        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        self.script
            .pop_front()
            .unwrap_or(Err(SensorError::EnvironmentUnavailable))
    }
}

/// Temperature/humidity sensor with a fixed answer
#[derive(Debug, Clone, Default)]
pub struct MockEnvironment {
    sample: Option<EnvironmentSample>,
    pub reads: usize,
}

impl MockEnvironment {
    pub fn returning(temperature: f64, humidity: f64) -> Self {
        Self {
            sample: Some(EnvironmentSample {
                temperature,
                humidity,
            }),
            reads: 0,
        }
    }

    pub fn unavailable() -> Self {
        Self::default()
    }
}

impl EnvironmentSensor for MockEnvironment {
    fn read_retry(&mut self) -> Option<EnvironmentSample> {
        self.reads += 1;
        self.sample
    }
}

/// In-memory serial line: records writes and replays a canned response
#[derive(Debug, Clone, Default)]
pub struct LoopbackSerial {
    response: VecDeque<u8>,
    written: Vec<u8>,
    chunk_size: Option<usize>,
    timing_out: bool,
}

impl LoopbackSerial {
    pub fn responding(response: Vec<u8>) -> Self {
        Self {
            response: response.into(),
            ..Default::default()
        }
    }

    /// Deliver at most `n` bytes per read call
    pub fn with_chunk_size(mut self, n: usize) -> Self {
        self.chunk_size = Some(n.max(1));
        self
    }

    /// Report a read timeout once the response is exhausted, like a real port
    pub fn timing_out(mut self) -> Self {
        self.timing_out = true;
        self
    }

    pub fn written(&self) -> Vec<u8> {
        self.written.clone()
    }
}

impl Read for LoopbackSerial {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.response.is_empty() {
            if self.timing_out {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "Operation timed out"));
            }
            return Ok(0);
        }

        let limit = self.chunk_size.unwrap_or(buf.len()).min(buf.len());
        let mut n = 0;
        while n < limit {
            match self.response.pop_front() {
                Some(byte) => {
                    buf[n] = byte;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }
}

impl Write for LoopbackSerial {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.written.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
