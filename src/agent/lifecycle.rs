//! Agent lifecycle management
//!
//! Wires the cloud channel, the outcome queue, the event pump, and the
//! measurement [`Agent`] together, runs the periodic schedule, and tears
//! everything down in order.

use super::context::AgentContext;
use super::control::dispatch_method;
use super::cycle::{Agent, CycleOutcome, CycleSettings};
use super::tracker::SendStatus;
use crate::config::{AgentConfig, ConfigError};
use crate::protocol::{DeliveryOutcome, MethodRequest, SendResult};
use crate::sensor::ReadingSource;
use crate::telemetry::TelemetryComposer;
use crate::transport::{ChannelError, CloudChannel};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn, Instrument};

/// Agent lifecycle with injected channel and sensor source
pub struct AgentLifecycle<C>
where
    C: CloudChannel + 'static,
{
    config: AgentConfig,
    context: Arc<AgentContext>,
    channel: Option<C>,
    source: Option<Box<dyn ReadingSource>>,
    shared_channel: Option<Arc<C>>,
    agent: Option<Agent<C>>,
    pump_handle: Option<JoinHandle<()>>,
}

impl<C> AgentLifecycle<C>
where
    C: CloudChannel + 'static,
{
    pub fn new(config: AgentConfig, channel: C, source: Box<dyn ReadingSource>) -> Self {
        Self {
            config,
            context: Arc::new(AgentContext::new()),
            channel: Some(channel),
            source: Some(source),
            shared_channel: None,
            agent: None,
            pump_handle: None,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.config.device.id
    }

    /// Shared control flag, counters, and sequence
    pub fn context(&self) -> &Arc<AgentContext> {
        &self.context
    }

    /// Channel handle once started
    pub fn channel(&self) -> Option<&Arc<C>> {
        self.shared_channel.as_ref()
    }

    pub fn is_started(&self) -> bool {
        self.agent.is_some()
    }

    fn create_outcome_channel() -> (
        mpsc::UnboundedSender<DeliveryOutcome>,
        mpsc::UnboundedReceiver<DeliveryOutcome>,
    ) {
        mpsc::unbounded_channel()
    }

    /// Connect the channel and start consuming outcomes
    pub async fn start(&mut self) -> Result<(), LifecycleError> {
        let span = crate::lifecycle_span!(phase = "start", device_id = %self.config.device.id);
        async {
            let (Some(mut channel), Some(source)) = (self.channel.take(), self.source.take())
            else {
                return Err(LifecycleError::InitializationError(
                    "Agent already started".to_string(),
                ));
            };

            channel.connect().await?;
            info!("Cloud channel connected");

            let channel = Arc::new(channel);
            let (outcome_tx, outcome_rx) = Self::create_outcome_channel();
            channel.set_outcome_sender(outcome_tx).await;
            self.pump_handle = Some(Self::spawn_event_pump(
                outcome_rx,
                channel.clone(),
                self.context.clone(),
            ));

            self.agent = Some(Agent::new(
                self.context.clone(),
                channel.clone(),
                TelemetryComposer::new(self.config.device.id.clone()),
                source,
                CycleSettings::from_config(&self.config.telemetry),
            ));
            self.shared_channel = Some(channel);

            info!(
                interval_secs = self.config.telemetry.interval_secs,
                gate_on_stop = self.config.telemetry.gate_on_stop,
                "Agent started"
            );
            Ok(())
        }
        .instrument(span)
        .await
    }

    /// Consume outcomes until the queue closes
    fn spawn_event_pump(
        mut outcome_rx: mpsc::UnboundedReceiver<DeliveryOutcome>,
        channel: Arc<C>,
        context: Arc<AgentContext>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(outcome) = outcome_rx.recv().await {
                Self::handle_outcome(outcome, channel.as_ref(), &context).await;
            }
            debug!("Outcome queue closed, event pump stopping");
        })
    }

    /// Record one outcome and react to it
    pub async fn handle_outcome(outcome: DeliveryOutcome, channel: &C, context: &AgentContext) {
        context.tracker.record(&outcome);

        match outcome {
            DeliveryOutcome::MessageSent { seq, status } => match status {
                SendResult::Ok => info!(seq = seq, "Telemetry confirmed"),
                SendResult::Failed(e) => warn!(seq = seq, error = %e, "Telemetry delivery failed"),
            },
            DeliveryOutcome::ReportedStateAcked {
                request_id,
                status_code,
            } => {
                info!(request_id = %request_id, status_code = status_code, "Reported state acknowledged");
            }
            DeliveryOutcome::InboundReceived(message) => {
                let properties: Vec<String> = message
                    .properties
                    .iter()
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect();
                info!(
                    payload = %String::from_utf8_lossy(&message.payload),
                    properties = ?properties,
                    received_at = ?context.tracker.last_message_received_at(),
                    "Cloud-to-device message received"
                );
            }
            DeliveryOutcome::TwinUpdated { state, payload } => {
                info!(
                    state = ?state,
                    payload = %String::from_utf8_lossy(&payload),
                    "Device twin updated"
                );
            }
            DeliveryOutcome::MethodInvoked(request) => {
                let span = crate::method_span!(method = %request.name, request_id = %request.request_id);
                Self::answer_method(&request, channel, context)
                    .instrument(span)
                    .await;
            }
            DeliveryOutcome::BlobUploaded { status } => {
                info!(ok = status.is_ok(), "Blob upload completed");
            }
        }
    }

    async fn answer_method(request: &MethodRequest, channel: &C, context: &AgentContext) {
        info!(payload = %request.payload, "Device method invoked");
        let ack = dispatch_method(&context.control, &request.name);
        if let Err(e) = channel.send_method_response(request, &ack).await {
            warn!(error = %e, "Failed to send method response");
        }
    }

    /// Run exactly one cycle
    pub async fn run_once(&mut self) -> Result<CycleOutcome, LifecycleError> {
        let agent = self.agent.as_mut().ok_or_else(|| {
            LifecycleError::InitializationError("Agent not started".to_string())
        })?;
        Ok(agent.run_cycle().await)
    }

    /// Wait for outstanding telemetry to be confirmed
    ///
    /// Bounded by `telemetry.drain_timeout_ms`. Returns `Busy` when something
    /// is still unconfirmed at the deadline.
    pub async fn drain(&self) -> SendStatus {
        let timeout = Duration::from_millis(self.config.telemetry.drain_timeout_ms);
        let tracker = &self.context.tracker;
        let status = tracker.wait_until_idle(timeout).await;
        match status {
            SendStatus::Idle => debug!("All telemetry confirmed"),
            SendStatus::Busy => warn!(
                pending = ?tracker.pending(),
                timeout_ms = self.config.telemetry.drain_timeout_ms,
                "Telemetry still unconfirmed after drain timeout"
            ),
        }
        status
    }

    /// Run cycles on the configured interval
    ///
    /// Stops when `shutdown` turns true (or its sender is dropped), after
    /// `max_cycles` cycles, or when the channel gives up reconnecting.
    /// Returns the number of cycles run.
    pub async fn run(
        &mut self,
        mut shutdown: watch::Receiver<bool>,
        max_cycles: Option<u64>,
    ) -> Result<u64, LifecycleError> {
        let channel = self.shared_channel.clone().ok_or_else(|| {
            LifecycleError::InitializationError("Agent not started".to_string())
        })?;
        let agent = self.agent.as_mut().ok_or_else(|| {
            LifecycleError::InitializationError("Agent not started".to_string())
        })?;

        let period = Duration::from_secs(self.config.telemetry.interval_secs);
        let mut interval = tokio::time::interval(period);
        // A slow cycle pushes the schedule back instead of bunching cycles up
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut cycles = 0u64;
        loop {
            if *shutdown.borrow() {
                break;
            }
            if max_cycles.is_some_and(|max| cycles >= max) {
                info!(cycles = cycles, "Cycle limit reached");
                break;
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Shutdown requested, leaving measurement loop");
                        break;
                    }
                }
                _ = interval.tick() => {
                    let outcome = agent.run_cycle().await;
                    cycles += 1;
                    debug!(cycle = cycles, outcome = ?outcome, "Cycle finished");

                    if channel.is_permanently_disconnected() {
                        error!("Cloud channel permanently disconnected");
                        return Err(LifecycleError::TransportError(
                            ChannelError::transport_unavailable("permanently disconnected"),
                        ));
                    }
                }
            }
        }
        Ok(cycles)
    }

    /// Disconnect the channel and stop the event pump
    pub async fn shutdown(&mut self) -> Result<(), LifecycleError> {
        let span = crate::lifecycle_span!(phase = "shutdown", device_id = %self.config.device.id);
        async {
            let result = match self.shared_channel.take() {
                Some(channel) => channel.disconnect().await.map_err(LifecycleError::from),
                None => Ok(()),
            };
            self.agent = None;

            if let Some(handle) = self.pump_handle.take() {
                handle.abort();
                if let Err(e) = handle.await {
                    if !e.is_cancelled() {
                        error!(error = %e, "Event pump shutdown error");
                    }
                }
            }

            let tracker = &self.context.tracker;
            info!(
                counters = ?tracker.counters(),
                failures = ?tracker.failures(),
                pending = ?tracker.pending(),
                "Agent shutdown complete"
            );
            result
        }
        .instrument(span)
        .await
    }
}

/// Agent lifecycle errors
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("Configuration error: {0}")]
    ConfigurationError(#[from] ConfigError),
    #[error("Transport error: {0}")]
    TransportError(#[from] ChannelError),
    #[error("Initialization error: {0}")]
    InitializationError(String),
}
