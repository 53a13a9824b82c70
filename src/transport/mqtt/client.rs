//! Impure I/O for the MQTT channel
//!
//! [`MqttClient`] owns the rumqttc client handle; a background supervisor
//! task owns the event loop, drives reconnection, and turns broker traffic
//! into [`DeliveryOutcome`] values.
//!
//! Nothing on the publish path awaits the event loop: every request uses the
//! non-blocking `try_*` API, so a stalled connection surfaces as a send error
//! instead of a hung cycle.

use super::connection::{configure_mqtt_options, ConnectionState, MqttError, ReconnectConfig};
use super::correlation::{PublishCorrelation, TwinRequestKind};
use super::health_monitor::{ConnectionEvent, HealthMonitor, ReconnectionDecision};
use super::message_handler::{EventRoute, InboundRoute, MessageHandler, OutcomeForwarder};
use crate::config::MqttSection;
use crate::protocol::{
    DeliveryOutcome, Message, MethodAck, MethodRequest, ReportedState, SendResult, TopicBuilder,
};
use crate::transport::{ChannelError, CloudChannel, DeliveryToken, OutcomeSender};
use async_trait::async_trait;
use rumqttc::{AsyncClient, EventLoop, QoS};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

/// Capacity of the rumqttc request channel
const REQUEST_CHANNEL_CAPACITY: usize = 10;

type SharedCorrelation = Arc<StdMutex<PublishCorrelation>>;

fn lock_correlation(correlation: &SharedCorrelation) -> MutexGuard<'_, PublishCorrelation> {
    correlation.lock().unwrap_or_else(PoisonError::into_inner)
}

fn next_request_id(counter: &AtomicU64) -> String {
    counter.fetch_add(1, Ordering::Relaxed).to_string()
}

/// MQTT cloud channel for one device
pub struct MqttClient {
    device_id: String,
    config: MqttSection,
    client: Arc<Mutex<AsyncClient>>,
    event_loop: StdMutex<Option<EventLoop>>,
    reconnect_config: ReconnectConfig,
    state_rx: Option<watch::Receiver<ConnectionState>>,
    state_tx: Option<watch::Sender<ConnectionState>>,
    shutdown_tx: Option<watch::Sender<bool>>,
    supervisor_handle: StdMutex<Option<JoinHandle<()>>>,
    correlation: SharedCorrelation,
    forwarder: OutcomeForwarder,
    request_ids: Arc<AtomicU64>,
}

impl MqttClient {
    pub fn new(device_id: &str, config: MqttSection) -> Result<Self, MqttError> {
        let (client, event_loop) = Self::create_connection(device_id, &config)?;
        let reconnect_config = ReconnectConfig::from(&config.reconnect);

        Ok(MqttClient {
            device_id: device_id.to_string(),
            config,
            client: Arc::new(Mutex::new(client)),
            event_loop: StdMutex::new(Some(event_loop)),
            reconnect_config,
            state_rx: None,
            state_tx: None,
            shutdown_tx: None,
            supervisor_handle: StdMutex::new(None),
            correlation: Arc::new(StdMutex::new(PublishCorrelation::new())),
            forwarder: OutcomeForwarder::new(),
            request_ids: Arc::new(AtomicU64::new(1)),
        })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Create a client and event loop for the current credentials
    fn create_connection(
        device_id: &str,
        config: &MqttSection,
    ) -> Result<(AsyncClient, EventLoop), MqttError> {
        let mqtt_options = configure_mqtt_options(device_id, config)?;
        Ok(AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY))
    }

    #[allow(clippy::type_complexity)]
    fn setup_connection_channels() -> (
        (
            watch::Sender<ConnectionState>,
            watch::Receiver<ConnectionState>,
        ),
        (watch::Sender<bool>, watch::Receiver<bool>),
    ) {
        (
            watch::channel(ConnectionState::Connecting),
            watch::channel(false),
        )
    }

    /// Wait for the first ConnAck, failing on disconnection or timeout
    async fn wait_for_connection_confirmation(
        mut state_rx: watch::Receiver<ConnectionState>,
        timeout: Duration,
    ) -> Result<(), MqttError> {
        let timeout_result = tokio::time::timeout(timeout, async {
            loop {
                match *state_rx.borrow_and_update() {
                    ConnectionState::Connected => return Ok(()),
                    ConnectionState::Disconnected(ref reason) => {
                        return Err(MqttError::ConnectionFailed(reason.clone()));
                    }
                    ConnectionState::PermanentlyDisconnected(ref reason) => {
                        return Err(MqttError::ConnectionFailed(format!(
                            "Permanently disconnected: {reason}"
                        )));
                    }
                    ConnectionState::Connecting | ConnectionState::Reconnecting(_) => {}
                }
                if state_rx.changed().await.is_err() {
                    return Err(MqttError::ConnectionFailed(
                        "State channel closed".to_string(),
                    ));
                }
            }
        })
        .await;

        timeout_result.unwrap_or_else(|_| {
            Err(MqttError::ConnectionFailed(
                "ConnAck timeout - no connection confirmation received".to_string(),
            ))
        })
    }

    /// Sleep unless shutdown is requested first; returns false on shutdown
    async fn interruptible_sleep(mut shutdown_rx: watch::Receiver<bool>, delay_ms: u64) -> bool {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    info!("Shutdown signal received during reconnection delay");
                    return false;
                }
                true
            }
            _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => true,
        }
    }

    /// Start the supervisor and wait for the broker's ConnAck
    pub async fn connect(&mut self) -> Result<(), MqttError> {
        let event_loop = self
            .event_loop
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| {
                MqttError::ConnectionFailed("Event loop already started".to_string())
            })?;

        let ((state_tx, state_rx), (shutdown_tx, shutdown_rx)) =
            Self::setup_connection_channels();
        self.state_rx = Some(state_rx.clone());
        self.state_tx = Some(state_tx.clone());
        self.shutdown_tx = Some(shutdown_tx);

        let supervisor = Supervisor {
            device_id: self.device_id.clone(),
            config: self.config.clone(),
            reconnect_config: self.reconnect_config.clone(),
            client: self.client.clone(),
            event_loop,
            state_tx,
            shutdown_rx,
            correlation: self.correlation.clone(),
            forwarder: self.forwarder.clone(),
            request_ids: self.request_ids.clone(),
            reconnect_attempts: 0,
        };
        let span = crate::mqtt_span!(device_id = %self.device_id);
        let handle = tokio::spawn(supervisor.run().instrument(span));
        *self
            .supervisor_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);

        let connection_timeout =
            HealthMonitor::calculate_connection_timeout(&self.reconnect_config);
        if let Err(e) = Self::wait_for_connection_confirmation(state_rx, connection_timeout).await
        {
            if let Some(shutdown_tx) = &self.shutdown_tx {
                let _ = shutdown_tx.send(true);
            }
            return Err(e);
        }

        info!(device_id = %self.device_id, broker = %self.config.broker_url, "MQTT channel connected");
        Ok(())
    }

    /// Stop the supervisor and close the session
    pub async fn disconnect(&self) -> Result<(), MqttError> {
        if let Some(shutdown_tx) = &self.shutdown_tx {
            let _ = shutdown_tx.send(true);
            debug!("Sent shutdown signal to reconnection supervisor");
        }

        {
            let client = self.client.lock().await;
            if let Err(e) = client.try_disconnect() {
                debug!(error = %e, "Disconnect request not delivered");
            }
        }

        if let Some(state_tx) = &self.state_tx {
            let _ = state_tx.send(ConnectionState::Disconnected(
                "Client disconnected".to_string(),
            ));
        }

        let handle = self
            .supervisor_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            match tokio::time::timeout(Duration::from_secs(2), handle).await {
                Ok(Ok(())) => debug!("Supervisor task shut down gracefully"),
                Ok(Err(e)) if !e.is_cancelled() => warn!(error = %e, "Supervisor task ended with error"),
                Err(_) => warn!("Supervisor task didn't shut down in time"),
                _ => {}
            }
        }

        info!(device_id = %self.device_id, "MQTT channel disconnected");
        Ok(())
    }

    /// Current connection state; None before `connect`
    pub fn connection_state(&self) -> Option<ConnectionState> {
        self.state_rx.as_ref().map(|rx| rx.borrow().clone())
    }

    fn check_connection_state(&self) -> Result<(), MqttError> {
        let state_rx = self.state_rx.as_ref().ok_or_else(|| {
            MqttError::ConnectionFailed("Client not connected".to_string())
        })?;

        let current_state = state_rx.borrow().clone();
        if !HealthMonitor::can_publish(&current_state) {
            return Err(MqttError::NotConnected {
                state: current_state,
            });
        }
        Ok(())
    }

    /// Queue a QoS 1 telemetry publish and register it for PubAck correlation
    fn publish_tracked(&self, client: &AsyncClient, message: &Message) -> Result<(), MqttError> {
        let topic = TopicBuilder::telemetry_topic(&self.device_id, message);
        let mut correlation = lock_correlation(&self.correlation);
        correlation.enqueue(message.seq);
        if let Err(e) = client.try_publish(topic, QoS::AtLeastOnce, false, message.payload.clone()) {
            correlation.cancel_last();
            return Err(MqttError::PublishFailed(Box::new(e)));
        }
        Ok(())
    }

    /// Queue a QoS 0 twin request and remember what it was for
    fn publish_twin_request(
        &self,
        client: &AsyncClient,
        kind: TwinRequestKind,
        payload: Vec<u8>,
    ) -> Result<String, MqttError> {
        let request_id = next_request_id(&self.request_ids);
        let topic = match kind {
            TwinRequestKind::Get => TopicBuilder::twin_get_topic(&request_id),
            TwinRequestKind::ReportedPatch => TopicBuilder::reported_patch_topic(&request_id),
        };
        let mut correlation = lock_correlation(&self.correlation);
        correlation.register_twin_request(request_id.clone(), kind);
        if let Err(e) = client.try_publish(topic, QoS::AtMostOnce, false, payload) {
            correlation.take_twin_request(&request_id);
            return Err(MqttError::PublishFailed(Box::new(e)));
        }
        Ok(request_id)
    }
}

#[async_trait]
impl CloudChannel for MqttClient {
    async fn connect(&mut self) -> Result<(), ChannelError> {
        MqttClient::connect(self).await.map_err(ChannelError::from)
    }

    async fn disconnect(&self) -> Result<(), ChannelError> {
        MqttClient::disconnect(self).await.map_err(ChannelError::from)
    }

    async fn send_event(&self, message: &Message) -> Result<DeliveryToken, ChannelError> {
        let client = self.client.lock().await;
        self.check_connection_state()?;
        self.publish_tracked(&client, message)?;

        debug!(
            seq = message.seq,
            message_id = %message.id,
            bytes = message.payload.len(),
            "Telemetry queued for publish"
        );
        Ok(DeliveryToken(message.seq))
    }

    async fn send_reported_state(&self, state: &ReportedState) -> Result<String, ChannelError> {
        let client = self.client.lock().await;
        self.check_connection_state()?;
        let request_id =
            self.publish_twin_request(&client, TwinRequestKind::ReportedPatch, state.to_payload())?;

        debug!(request_id = %request_id, new_state = %state.new_state, "Reported state queued");
        Ok(request_id)
    }

    async fn send_method_response(
        &self,
        request: &MethodRequest,
        ack: &MethodAck,
    ) -> Result<(), ChannelError> {
        let client = self.client.lock().await;
        self.check_connection_state()?;

        let topic = TopicBuilder::method_response_topic(ack.status, &request.request_id);
        client
            .try_publish(topic, QoS::AtMostOnce, false, ack.response_payload())
            .map_err(|e| MqttError::PublishFailed(Box::new(e)))?;

        debug!(
            method = %request.name,
            request_id = %request.request_id,
            status = ack.status,
            "Method response queued"
        );
        Ok(())
    }

    async fn set_outcome_sender(&self, sender: OutcomeSender) {
        self.forwarder.set_sender(sender);
    }

    fn supports_reported_state(&self) -> bool {
        true
    }

    fn is_connected(&self) -> bool {
        matches!(self.connection_state(), Some(ConnectionState::Connected))
    }

    fn is_permanently_disconnected(&self) -> bool {
        matches!(
            self.connection_state(),
            Some(ConnectionState::PermanentlyDisconnected(_))
        )
    }
}

impl Drop for MqttClient {
    fn drop(&mut self) {
        if let Some(shutdown_tx) = &self.shutdown_tx {
            let _ = shutdown_tx.send(true);
        }
        if let Some(handle) = self
            .supervisor_handle
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

/// Background task owning the event loop
struct Supervisor {
    device_id: String,
    config: MqttSection,
    reconnect_config: ReconnectConfig,
    client: Arc<Mutex<AsyncClient>>,
    event_loop: EventLoop,
    state_tx: watch::Sender<ConnectionState>,
    shutdown_rx: watch::Receiver<bool>,
    correlation: SharedCorrelation,
    forwarder: OutcomeForwarder,
    request_ids: Arc<AtomicU64>,
    reconnect_attempts: u32,
}

impl Supervisor {
    async fn run(mut self) {
        info!("Starting MQTT event loop with reconnection supervisor");

        loop {
            let polled = tokio::select! {
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping reconnection supervisor");
                        break;
                    }
                    continue;
                }
                polled = self.event_loop.poll() => polled,
            };

            let keep_running = match polled {
                Ok(event) => {
                    let route = MessageHandler::route_event(&event);
                    self.process_event_route(route).await
                }
                Err(e) => self.handle_event_loop_error(e).await,
            };
            if !keep_running {
                break;
            }
        }

        self.fail_in_flight("MQTT channel stopped");
        info!("MQTT event loop stopped");
    }

    /// Returns false when the supervisor should stop
    async fn process_event_route(&mut self, route: EventRoute) -> bool {
        match route {
            EventRoute::ConnectionAcknowledged => {
                let _ = self
                    .state_tx
                    .send(HealthMonitor::determine_next_state(ConnectionEvent::ConnAckReceived));
                self.reconnect_attempts = 0;
                self.subscribe_and_request_twin().await;
                true
            }
            EventRoute::MessageReceived { topic, payload } => {
                self.handle_message_received(&topic, payload);
                true
            }
            EventRoute::PublishWritten(pkid) => {
                if let Some(seq) = lock_correlation(&self.correlation).on_outgoing(pkid) {
                    debug!(seq = seq, pkid = pkid, "Telemetry written to broker");
                }
                true
            }
            EventRoute::PublishAcknowledged(pkid) => {
                let confirmed = lock_correlation(&self.correlation).on_puback(pkid);
                match confirmed {
                    Some(seq) => {
                        self.forwarder.forward(DeliveryOutcome::MessageSent {
                            seq,
                            status: SendResult::Ok,
                        });
                    }
                    None => debug!(pkid = pkid, "PubAck for untracked packet"),
                }
                true
            }
            EventRoute::Disconnected => {
                let _ = self.state_tx.send(HealthMonitor::determine_next_state(
                    ConnectionEvent::DisconnectedByBroker,
                ));
                self.should_attempt_reconnection().await
            }
            EventRoute::SubscriptionConfirmed {
                packet_id,
                failures,
            } => {
                if failures > 0 {
                    warn!(packet_id = packet_id, failures = failures, "Broker rejected subscription");
                } else {
                    debug!(packet_id = packet_id, "Subscription confirmed");
                }
                true
            }
            EventRoute::InfrastructureEvent(event) => {
                debug!(event = %event, "MQTT event");
                true
            }
            EventRoute::OutgoingEvent => true,
        }
    }

    fn handle_message_received(&self, topic: &str, payload: Vec<u8>) {
        debug!(topic = %topic, bytes = payload.len(), "Received MQTT message");

        match MessageHandler::route_inbound(&self.device_id, topic, &payload) {
            InboundRoute::Outcome(outcome) => {
                self.forwarder.forward(outcome);
            }
            InboundRoute::TwinResponse {
                status,
                request_id,
                payload,
            } => {
                let kind = lock_correlation(&self.correlation).take_twin_request(&request_id);
                match kind {
                    Some(kind) => {
                        self.forwarder.forward(MessageHandler::twin_response_outcome(
                            kind, status, request_id, payload,
                        ));
                    }
                    None => debug!(request_id = %request_id, status = status, "Twin response for unknown request"),
                }
            }
            InboundRoute::Ignored(topic) => {
                debug!(topic = %topic, "Ignoring message outside the device surface");
            }
        }
    }

    /// Subscribe to every device filter and request the full twin
    async fn subscribe_and_request_twin(&mut self) {
        let client = self.client.lock().await;
        for filter in TopicBuilder::subscription_filters(&self.device_id) {
            match client.try_subscribe(filter.clone(), QoS::AtLeastOnce) {
                Ok(()) => debug!(filter = %filter, "Subscription requested"),
                Err(e) => error!(filter = %filter, error = %e, "Failed to subscribe"),
            }
        }

        let request_id = next_request_id(&self.request_ids);
        lock_correlation(&self.correlation).register_twin_request(request_id.clone(), TwinRequestKind::Get);
        if let Err(e) = client.try_publish(
            TopicBuilder::twin_get_topic(&request_id),
            QoS::AtMostOnce,
            false,
            Vec::new(),
        ) {
            lock_correlation(&self.correlation).take_twin_request(&request_id);
            warn!(error = %e, "Failed to request device twin");
        }
    }

    async fn handle_event_loop_error(&mut self, error: rumqttc::ConnectionError) -> bool {
        let _ = self.state_tx.send(HealthMonitor::determine_next_state(
            ConnectionEvent::NetworkError(error.to_string()),
        ));
        self.should_attempt_reconnection().await
    }

    async fn should_attempt_reconnection(&mut self) -> bool {
        let decision = HealthMonitor::should_attempt_reconnection(
            self.reconnect_attempts,
            &self.reconnect_config,
            *self.shutdown_rx.borrow(),
        );

        match decision {
            ReconnectionDecision::Proceed { attempt, delay_ms } => {
                self.reconnect_attempts = attempt;
                let _ = self.state_tx.send(HealthMonitor::determine_next_state(
                    ConnectionEvent::ReconnectionStarted(attempt),
                ));

                let max_display = self
                    .reconnect_config
                    .max_attempts
                    .map_or("∞".to_string(), |max| max.to_string());
                info!(
                    attempt = attempt,
                    max_attempts = %max_display,
                    delay_ms = delay_ms,
                    "Attempting MQTT reconnection"
                );

                if !MqttClient::interruptible_sleep(self.shutdown_rx.clone(), delay_ms).await {
                    return false;
                }
                if *self.shutdown_rx.borrow() {
                    info!("Shutdown signal received, aborting reconnection");
                    return false;
                }

                self.apply_new_connection().await;
                true
            }
            ReconnectionDecision::AbortShutdownRequested => {
                info!("Shutdown signal received, stopping reconnection");
                false
            }
            ReconnectionDecision::AbortMaxAttemptsExceeded => {
                let reason = format!(
                    "Max reconnection attempts ({}) exceeded",
                    self.reconnect_attempts
                );
                let _ = self.state_tx.send(HealthMonitor::determine_next_state(
                    ConnectionEvent::PermanentFailure(reason),
                ));
                false
            }
        }
    }

    /// Replace client and event loop; the old session's sends can no longer be acknowledged
    async fn apply_new_connection(&mut self) {
        match MqttClient::create_connection(&self.device_id, &self.config) {
            Ok((new_client, new_event_loop)) => {
                let mut client = self.client.lock().await;
                *client = new_client;
                self.event_loop = new_event_loop;
                self.fail_in_flight("connection lost before acknowledgement");
                debug!("Created new MQTT connection for reconnection attempt");
            }
            Err(e) => {
                error!(error = %e, "Failed to create new MQTT connection");
            }
        }
    }

    fn fail_in_flight(&self, reason: &str) {
        let lost = lock_correlation(&self.correlation).fail_all();
        if lost.is_empty() {
            return;
        }
        warn!(count = lost.len(), reason = reason, "Failing unacknowledged telemetry");
        for seq in lost {
            self.forwarder.forward(DeliveryOutcome::MessageSent {
                seq,
                status: SendResult::Failed(ChannelError::transport_unavailable(reason)),
            });
        }
    }
}
