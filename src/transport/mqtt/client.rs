//! Impure I/O for the MQTT transport
//!
//! [`MqttTransport`] is a cloneable handle. A supervisor task owns the
//! rumqttc client, the pending queue and the subscription set. Each
//! connection's event loop is polled on its own task and its events are
//! forwarded to the supervisor, so a poll is never cancelled halfway
//! through a handshake or a write. Handles only validate and submit
//! operations, so submission never blocks on the network.

use super::connection::{
    configure_mqtt_options, ConnectionState, LastWillSpec, MqttError, ReconnectConfig,
};
use super::health_monitor::{ConnectionEvent, HealthMonitor, ReconnectionDecision};
use super::message_handler::{EventRoute, MessageHandler, DEFAULT_QOS};
use super::pending::{PendingOp, PendingQueue, SubscriptionSet};
use crate::config::MqttSection;
use crate::protocol::{validate_filter, validate_topic_name, InboundMessage};
use crate::transport::Transport;
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::v5::{AsyncClient, ConnectionError, Event, EventLoop};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn, Instrument};

/// Capacity of the rumqttc request channel between client and event loop
const REQUEST_CHANNEL_CAPACITY: usize = 64;
/// How long a graceful shutdown may spend writing DISCONNECT
const DISCONNECT_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);
/// How long `disconnect` waits for the supervisor task
const SUPERVISOR_STOP_TIMEOUT: Duration = Duration::from_secs(2);

type PollResult = Result<Event, ConnectionError>;

/// MQTT transport handle; clones share one connection
#[derive(Clone)]
pub struct MqttTransport {
    inner: Arc<Inner>,
}

struct Inner {
    client_id: String,
    ops_tx: mpsc::UnboundedSender<PendingOp>,
    state_rx: watch::Receiver<ConnectionState>,
    shutdown_tx: watch::Sender<bool>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
        let handle = self
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for MqttTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttTransport")
            .field("client_id", &self.inner.client_id)
            .field("state", &*self.inner.state_rx.borrow())
            .finish()
    }
}

impl MqttTransport {
    /// Spawn the connection supervisor and return immediately
    ///
    /// Operations submitted before the broker acknowledges the connection are
    /// queued and flushed in order once it does. Inbound publishes arrive on
    /// the returned receiver in broker delivery order.
    pub fn start(
        client_id: &str,
        config: &MqttSection,
        last_will: Option<LastWillSpec>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<InboundMessage>), MqttError> {
        let reconnect_config = ReconnectConfig::from(&config.reconnect);
        HealthMonitor::validate_connection_config(&reconnect_config)
            .map_err(MqttError::ConnectionFailed)?;

        let (client, event_loop) = create_connection(client_id, config, last_will.as_ref())?;
        let span = crate::mqtt_span!(operation = "supervisor", client_id = %client_id);
        let (events_rx, poller) = span.in_scope(|| spawn_poller(event_loop));

        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let supervisor = Supervisor {
            client_id: client_id.to_string(),
            config: config.clone(),
            last_will,
            reconnect_config,
            client,
            events_rx,
            poller,
            state: ConnectionState::Connecting,
            state_tx,
            inbound_tx,
            pending: PendingQueue::new(),
            subscriptions: SubscriptionSet::new(),
            reconnect_attempts: 0,
        };

        let handle = tokio::spawn(supervisor.run(ops_rx, shutdown_rx).instrument(span));

        info!(client_id = %client_id, broker_url = %config.broker_url, "MQTT transport started");

        let transport = MqttTransport {
            inner: Arc::new(Inner {
                client_id: client_id.to_string(),
                ops_tx,
                state_rx,
                shutdown_tx,
                supervisor: Mutex::new(Some(handle)),
            }),
        };
        Ok((transport, inbound_rx))
    }

    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    /// Receiver that observes every connection state change
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_rx.clone()
    }

    /// Wait for a broker ConnAck
    ///
    /// Fails early if the supervisor gives up permanently.
    pub async fn wait_until_connected(&self, timeout: Duration) -> Result<(), MqttError> {
        let mut state_rx = self.state_receiver();
        let wait = state_rx.wait_for(|state| {
            state.is_connected() || !HealthMonitor::accepts_operations(state)
        });

        // Clone out of the watch guard so it is not held past this statement
        let reached = match tokio::time::timeout(timeout, wait).await {
            Ok(Ok(state)) => state.clone(),
            Ok(Err(_)) => return Err(MqttError::Closed),
            Err(_) => {
                return Err(MqttError::Timeout {
                    state: self.current_state(),
                })
            }
        };

        if reached.is_connected() {
            Ok(())
        } else {
            Err(MqttError::ConnectionFailed(format!("{reached:?}")))
        }
    }

    fn current_state(&self) -> ConnectionState {
        self.inner.state_rx.borrow().clone()
    }

    fn submit(&self, op: PendingOp) -> Result<(), MqttError> {
        if !HealthMonitor::accepts_operations(&self.current_state()) {
            return Err(MqttError::Closed);
        }
        self.inner.ops_tx.send(op).map_err(|_| MqttError::Closed)
    }
}

#[async_trait]
impl Transport for MqttTransport {
    type Error = MqttError;

    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), MqttError> {
        validate_topic_name(topic)?;
        self.submit(PendingOp::Publish {
            topic: topic.to_string(),
            payload: Bytes::from(payload),
            retain,
        })
    }

    async fn subscribe(&self, filter: &str) -> Result<(), MqttError> {
        validate_filter(filter)?;
        self.submit(PendingOp::Subscribe {
            filter: filter.to_string(),
        })
    }

    fn connection_state(&self) -> ConnectionState {
        self.current_state()
    }

    /// Stop the supervisor after flushing submitted operations and sending
    /// DISCONNECT. A clean disconnect suppresses the last will.
    async fn disconnect(&self) -> Result<(), MqttError> {
        self.inner.shutdown_tx.send_replace(true);

        let handle = self
            .inner
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(handle) = handle {
            let abort_handle = handle.abort_handle();
            match tokio::time::timeout(SUPERVISOR_STOP_TIMEOUT, handle).await {
                Ok(Ok(())) => debug!("MQTT supervisor stopped"),
                Ok(Err(e)) if !e.is_cancelled() => warn!(error = %e, "MQTT supervisor ended with error"),
                Ok(Err(_)) => {}
                Err(_) => {
                    warn!("MQTT supervisor did not stop in time, aborting");
                    abort_handle.abort();
                }
            }
        }

        info!(client_id = %self.inner.client_id, "MQTT transport disconnected");
        Ok(())
    }
}

fn create_connection(
    client_id: &str,
    config: &MqttSection,
    last_will: Option<&LastWillSpec>,
) -> Result<(AsyncClient, EventLoop), MqttError> {
    let mqtt_options = configure_mqtt_options(client_id, config, last_will)?;
    Ok(AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY))
}

/// Poll one connection's event loop until it fails or the supervisor stops
/// listening. The loop is never dropped mid-poll by the supervisor; a
/// replaced connection's poller is aborted.
fn spawn_poller(mut event_loop: EventLoop) -> (mpsc::UnboundedReceiver<PollResult>, JoinHandle<()>) {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let handle = tokio::spawn(
        async move {
            loop {
                let event = event_loop.poll().await;
                let failed = event.is_err();
                if events_tx.send(event).is_err() || failed {
                    break;
                }
            }
            trace!("MQTT event loop poller stopped");
        }
        .in_current_span(),
    );
    (events_rx, handle)
}

/// Perform interruptible sleep with shutdown monitoring
/// Returns true if sleep completed, false if shutdown requested
async fn interruptible_sleep(mut shutdown_rx: watch::Receiver<bool>, delay_ms: u64) -> bool {
    if *shutdown_rx.borrow() {
        return false;
    }
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

struct Supervisor {
    client_id: String,
    config: MqttSection,
    last_will: Option<LastWillSpec>,
    reconnect_config: ReconnectConfig,
    client: AsyncClient,
    events_rx: mpsc::UnboundedReceiver<PollResult>,
    poller: JoinHandle<()>,
    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    inbound_tx: mpsc::UnboundedSender<InboundMessage>,
    pending: PendingQueue,
    subscriptions: SubscriptionSet,
    reconnect_attempts: u32,
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.poller.abort();
    }
}

impl Supervisor {
    async fn run(
        mut self,
        mut ops_rx: mpsc::UnboundedReceiver<PendingOp>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                biased;

                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        self.shutdown(&mut ops_rx).await;
                        break;
                    }
                }

                op = ops_rx.recv() => match op {
                    Some(op) => self.submit(op),
                    None => {
                        self.shutdown(&mut ops_rx).await;
                        break;
                    }
                },

                event = self.events_rx.recv() => {
                    let keep_running = match event {
                        Some(Ok(event)) => self.handle_event(&event, &shutdown_rx).await,
                        Some(Err(e)) => self.handle_connection_error(e.to_string(), &shutdown_rx).await,
                        None => {
                            self.handle_connection_error("event loop stopped".to_string(), &shutdown_rx)
                                .await
                        }
                    };
                    if !keep_running {
                        break;
                    }
                }
            }
        }
        info!(client_id = %self.client_id, "MQTT supervisor stopped");
    }

    fn transition(&mut self, event: ConnectionEvent) {
        let next = HealthMonitor::determine_next_state(event);
        HealthMonitor::log_state_transition(&self.state, &next);
        self.state = next.clone();
        self.state_tx.send_replace(next);
    }

    /// Issue directly when connected with nothing queued ahead, else queue
    fn submit(&mut self, op: PendingOp) {
        if HealthMonitor::can_publish(&self.state) && self.pending.is_empty() {
            if !Self::issue(&self.client, &mut self.subscriptions, &op) {
                self.pending.push(op);
            }
        } else {
            debug!(topic = %op.topic(), queued = self.pending.len() + 1, "Queued operation until connected");
            self.pending.push(op);
        }
    }

    /// Hand one operation to the rumqttc client. Returns false when the
    /// client request channel is full.
    fn issue(client: &AsyncClient, subscriptions: &mut SubscriptionSet, op: &PendingOp) -> bool {
        match op {
            PendingOp::Publish {
                topic,
                payload,
                retain,
            } => match client.try_publish(topic.clone(), DEFAULT_QOS, *retain, payload.clone()) {
                Ok(()) => {
                    debug!(topic = %topic, retain, bytes = payload.len(), "Published");
                    true
                }
                Err(e) => {
                    debug!(topic = %topic, error = %e, "Publish deferred");
                    false
                }
            },
            PendingOp::Subscribe { filter } => match client.try_subscribe(filter.clone(), DEFAULT_QOS) {
                Ok(()) => {
                    if subscriptions.insert(filter) {
                        info!(filter = %filter, "Subscribed");
                    } else {
                        debug!(filter = %filter, "Subscription re-issued");
                    }
                    true
                }
                Err(e) => {
                    debug!(filter = %filter, error = %e, "Subscribe deferred");
                    false
                }
            },
        }
    }

    fn flush_pending(&mut self) {
        if self.pending.is_empty() || !HealthMonitor::can_publish(&self.state) {
            return;
        }
        let client = &self.client;
        let subscriptions = &mut self.subscriptions;
        let issued = self.pending.flush(|op| Self::issue(client, subscriptions, op));
        if issued > 0 {
            debug!(issued, remaining = self.pending.len(), "Flushed pending operations");
        }
    }

    /// Put every established subscription ahead of the queued operations
    fn queue_resubscriptions(&mut self) {
        let filters: Vec<String> = self.subscriptions.iter().map(str::to_string).collect();
        if !filters.is_empty() {
            info!(count = filters.len(), "Re-subscribing after connect");
        }
        for filter in filters.into_iter().rev() {
            self.pending.requeue_front(PendingOp::Subscribe { filter });
        }
    }

    /// Returns false when the supervisor should stop
    async fn handle_event(&mut self, event: &Event, shutdown_rx: &watch::Receiver<bool>) -> bool {
        match MessageHandler::route_mqtt_event(event) {
            EventRoute::ConnectionAcknowledged { session_present } => {
                debug!(session_present, "ConnAck received");
                self.transition(ConnectionEvent::ConnAckReceived);
                self.reconnect_attempts = 0;
                self.queue_resubscriptions();
            }
            EventRoute::ConnectionRefused(reason) | EventRoute::Disconnected(reason) => {
                self.transition(ConnectionEvent::DisconnectedByBroker(reason));
                return self.reconnect(shutdown_rx).await;
            }
            EventRoute::MessageReceived {
                topic,
                payload,
                retain,
            } => {
                trace!(topic = %topic, retain, "Received publish");
                let message = MessageHandler::inbound_message(topic, payload, retain, Instant::now());
                if self.inbound_tx.send(message).is_err() {
                    debug!("Inbound receiver dropped, message discarded");
                }
            }
            EventRoute::SubscriptionConfirmed {
                packet_id,
                return_codes,
            } => match MessageHandler::validate_subscription_success(&return_codes) {
                Ok(()) => debug!(packet_id, "Subscription confirmed"),
                Err(reason) => warn!(packet_id, reason = %reason, "Broker rejected subscription"),
            },
            EventRoute::InfrastructureEvent(event) => {
                trace!(event = %event, "MQTT event");
            }
            EventRoute::DisconnectSent | EventRoute::OutgoingEvent => {}
        }

        self.flush_pending();
        true
    }

    async fn handle_connection_error(
        &mut self,
        error: String,
        shutdown_rx: &watch::Receiver<bool>,
    ) -> bool {
        if self.state.is_connected() {
            error!(error = %error, "MQTT event loop error");
        } else {
            debug!(error = %error, "MQTT connection attempt failed");
        }
        self.transition(ConnectionEvent::NetworkError(error));
        self.reconnect(shutdown_rx).await
    }

    /// Sleep per the backoff schedule, then swap in a fresh client
    /// Returns false when the supervisor should stop
    async fn reconnect(&mut self, shutdown_rx: &watch::Receiver<bool>) -> bool {
        // The old event loop would otherwise reconnect on its own
        self.poller.abort();

        let decision = HealthMonitor::should_attempt_reconnection(
            self.reconnect_attempts,
            &self.reconnect_config,
            *shutdown_rx.borrow(),
        );

        match decision {
            ReconnectionDecision::Proceed { attempt, delay_ms } => {
                self.reconnect_attempts = attempt;
                self.transition(ConnectionEvent::ReconnectionStarted(attempt));

                let max_display = self
                    .reconnect_config
                    .max_attempts
                    .map_or("unlimited".to_string(), |max| max.to_string());
                info!(
                    attempt,
                    max_attempts = %max_display,
                    delay_ms,
                    pending = self.pending.len(),
                    "Reconnecting to MQTT broker"
                );

                if !interruptible_sleep(shutdown_rx.clone(), delay_ms).await {
                    self.transition(ConnectionEvent::PermanentFailure(
                        "shutdown requested".to_string(),
                    ));
                    return false;
                }

                match create_connection(&self.client_id, &self.config, self.last_will.as_ref()) {
                    Ok((client, event_loop)) => {
                        let (events_rx, poller) = spawn_poller(event_loop);
                        self.client = client;
                        self.events_rx = events_rx;
                        self.poller = poller;
                    }
                    Err(e) => error!(error = %e, "Failed to create new connection"),
                }
                true
            }
            ReconnectionDecision::AbortShutdownRequested => {
                self.transition(ConnectionEvent::PermanentFailure(
                    "shutdown requested".to_string(),
                ));
                false
            }
            ReconnectionDecision::AbortMaxAttemptsExceeded => {
                let reason = format!(
                    "Max reconnection attempts ({}) exceeded",
                    self.reconnect_attempts
                );
                if !self.pending.is_empty() {
                    warn!(dropped = self.pending.len(), "Discarding queued operations");
                }
                self.transition(ConnectionEvent::PermanentFailure(reason));
                false
            }
        }
    }

    /// Flush everything already submitted, send DISCONNECT and stop
    async fn shutdown(&mut self, ops_rx: &mut mpsc::UnboundedReceiver<PendingOp>) {
        while let Ok(op) = ops_rx.try_recv() {
            self.submit(op);
        }

        if self.state.is_connected() {
            self.flush_pending();
            if let Err(e) = self.client.try_disconnect() {
                debug!(error = %e, "Could not request DISCONNECT");
            }

            let events_rx = &mut self.events_rx;
            let drain = async {
                while let Some(Ok(event)) = events_rx.recv().await {
                    if matches!(
                        MessageHandler::route_mqtt_event(&event),
                        EventRoute::DisconnectSent
                    ) {
                        break;
                    }
                }
            };
            if tokio::time::timeout(DISCONNECT_FLUSH_TIMEOUT, drain).await.is_err() {
                warn!("Timed out sending DISCONNECT");
            }
        }
        self.poller.abort();

        if !self.pending.is_empty() {
            warn!(dropped = self.pending.len(), "Discarding operations queued while disconnected");
        }
        self.transition(ConnectionEvent::PermanentFailure(
            "client shut down".to_string(),
        ));
    }
}
