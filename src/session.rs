//! Presence session: one task that owns all presence and channel state
//!
//! Inbound transport messages are fanned out through a [`MessageRouter`]
//! to the presence monitor, the channel cache and any external
//! subscribers. Messages, ticks and consumer requests are handled on a
//! single `select!` loop, so a signal and a tick never interleave and no
//! lock guards the state.

use crate::channels::{
    HistoryEntry, Readiness, RelayChannels, StatusUpdate, DEFAULT_HISTORY_CAPACITY,
};
use crate::config::RelayConfig;
use crate::error::{CommandError, PingError, RelayError};
use crate::presence::{
    PresenceEvaluator, PresenceMonitor, PresenceSource, PresenceState, PresenceStatus,
    PresenceTransition,
};
use crate::protocol::{
    InboundMessage, PayloadCase, PingRequest, RelayCommand, RelayState, TopicError, TopicLayout,
};
use crate::router::{MessageRouter, Subscription};
use crate::transport::Transport;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn, Instrument};

const EVENT_CHANNEL_CAPACITY: usize = 64;
const DEFAULT_PING_SENDER: &str = "relay-presence";

/// Settings of one session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub layout: TopicLayout,
    pub evaluator: PresenceEvaluator,
    pub tick_interval: Duration,
    pub payload_case: PayloadCase,
    pub history_capacity: usize,
    /// Display names by channel id
    pub channel_names: BTreeMap<String, String>,
    /// Channels whose status changes go into the history; empty tracks all
    pub history_channels: Vec<String>,
    /// `from` field of outgoing pings
    pub ping_sender: String,
}

impl SessionConfig {
    pub fn new(layout: TopicLayout, evaluator: PresenceEvaluator) -> Self {
        Self {
            layout,
            evaluator,
            tick_interval: Duration::from_secs(2),
            payload_case: PayloadCase::default(),
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            channel_names: BTreeMap::new(),
            history_channels: Vec::new(),
            ping_sender: DEFAULT_PING_SENDER.to_string(),
        }
    }

    pub fn with_tick_interval(mut self, tick_interval: Duration) -> Self {
        self.tick_interval = tick_interval;
        self
    }

    pub fn with_ping_sender(mut self, ping_sender: impl Into<String>) -> Self {
        self.ping_sender = ping_sender.into();
        self
    }

    pub fn from_relay_config(config: &RelayConfig) -> Self {
        let channel_names = config
            .channels
            .iter()
            .filter_map(|channel| {
                channel
                    .name
                    .as_ref()
                    .map(|name| (channel.id.clone(), name.clone()))
            })
            .collect();

        Self {
            layout: config.layout(),
            evaluator: config.presence.evaluator(),
            tick_interval: config.presence.tick_interval(),
            payload_case: config.topics.payload_case,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            channel_names,
            history_channels: config.channel_ids(),
            ping_sender: config.mqtt.client_id_prefix.clone(),
        }
    }
}

/// Notifications broadcast to session consumers
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Presence(PresenceTransition),
    ChannelStatus {
        channel_id: String,
        previous: RelayState,
        current: RelayState,
    },
    CommandIssued {
        channel_id: String,
        command: RelayCommand,
    },
}

/// Point-in-time export of the session state
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub taken_at: DateTime<Utc>,
    pub connection: String,
    pub readiness: Readiness,
    pub presence: PresenceSnapshot,
    pub channels: Vec<ChannelSnapshot>,
    pub history: Vec<HistoryEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PresenceSnapshot {
    pub status: PresenceStatus,
    pub source: PresenceSource,
    pub reason: Option<String>,
    pub last_payload: Option<String>,
    pub last_retained: bool,
    pub last_seen_secs_ago: Option<f64>,
    pub signals_received: u64,
    pub timeout_secs: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChannelSnapshot {
    pub channel_id: String,
    pub name: Option<String>,
    pub state: RelayState,
    pub updated_secs_ago: f64,
}

/// Round trip of one answered ping
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PingReport {
    pub id: String,
    pub sent_at: DateTime<Utc>,
    pub latency_ms: f64,
}

struct PendingPing {
    sent_at: Instant,
    sent_wall: DateTime<Utc>,
    reply: oneshot::Sender<Result<PingReport, PingError>>,
}

enum SessionRequest {
    Command {
        channel_id: String,
        command: RelayCommand,
        reply: oneshot::Sender<Result<(), CommandError>>,
    },
    Snapshot {
        reply: oneshot::Sender<SessionSnapshot>,
    },
    Ping {
        reply: oneshot::Sender<Result<PingReport, PingError>>,
    },
    Shutdown,
}

/// State owned by the session task
pub struct PresenceSession<T: Transport> {
    router: MessageRouter,
    presence_subscription: Subscription,
    status_subscription: Subscription,
    echo_subscription: Subscription,
    monitor: PresenceMonitor,
    channels: RelayChannels<T>,
    tick_interval: Duration,
    channel_names: BTreeMap<String, String>,
    ping_topic: String,
    ping_sender: String,
    pending_pings: HashMap<String, PendingPing>,
    presence_tx: watch::Sender<PresenceState>,
    events_tx: broadcast::Sender<SessionEvent>,
}

impl<T: Transport + 'static> PresenceSession<T> {
    /// Subscribe to the presence, status and ping echo topics and start the
    /// session task
    pub async fn spawn(
        transport: T,
        inbound: mpsc::UnboundedReceiver<InboundMessage>,
        config: SessionConfig,
    ) -> Result<SessionHandle, RelayError> {
        let router = MessageRouter::new();
        let presence_topic = config.layout.presence_topic().to_string();
        let status_filter = config.layout.status_filter();
        let echo_topic = config.layout.ping_echo_topic();
        let ping_topic = config.layout.ping_topic().to_string();

        let presence_subscription = router.subscribe(&presence_topic)?;
        let status_subscription = router.subscribe(&status_filter)?;
        let echo_subscription = router.subscribe(&echo_topic)?;

        for filter in [&presence_topic, &status_filter, &echo_topic] {
            transport
                .subscribe(filter)
                .await
                .map_err(|e| RelayError::Transport(e.to_string()))?;
        }

        let (presence_tx, presence_rx) = watch::channel(PresenceState::new());
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();

        let session = PresenceSession {
            router: router.clone(),
            presence_subscription,
            status_subscription,
            echo_subscription,
            monitor: PresenceMonitor::new(presence_topic.clone(), config.evaluator),
            channels: RelayChannels::new(transport, config.layout, config.payload_case)
                .with_history_capacity(config.history_capacity)
                .with_history_channels(config.history_channels),
            tick_interval: config.tick_interval.max(Duration::from_millis(1)),
            channel_names: config.channel_names,
            ping_topic,
            ping_sender: config.ping_sender,
            pending_pings: HashMap::new(),
            presence_tx,
            events_tx: events_tx.clone(),
        };

        let span = crate::presence_span!(topic = %presence_topic);
        let task = tokio::spawn(session.run(inbound, requests_rx).instrument(span));

        info!(presence_topic = %presence_topic, status_filter = %status_filter, "Presence session started");

        Ok(SessionHandle {
            requests_tx,
            presence_rx,
            events_tx,
            router,
            task: Some(task),
        })
    }

    async fn run(
        mut self,
        mut inbound: mpsc::UnboundedReceiver<InboundMessage>,
        mut requests: mpsc::UnboundedReceiver<SessionRequest>,
    ) {
        let mut ticker =
            tokio::time::interval_at(Instant::now() + self.tick_interval, self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut inbound_open = true;

        loop {
            tokio::select! {
                biased;

                message = inbound.recv(), if inbound_open => match message {
                    Some(message) => self.handle_inbound(message),
                    None => {
                        warn!("Transport inbound stream closed; presence now only times out");
                        inbound_open = false;
                    }
                },

                request = requests.recv() => match request {
                    Some(SessionRequest::Shutdown) | None => break,
                    Some(request) => self.handle_request(request).await,
                },

                now = ticker.tick() => self.handle_tick(now),
            }
        }

        info!("Presence session stopped");
    }

    fn handle_inbound(&mut self, message: InboundMessage) {
        let delivered = self.router.dispatch(&message);
        if delivered == 0 {
            debug!(topic = %message.topic, "No subscriber for inbound message");
        }

        while let Some(message) = self.presence_subscription.try_recv() {
            if let Some(transition) = self.monitor.handle_message(message) {
                self.emit(SessionEvent::Presence(transition));
            }
            self.presence_tx.send_replace(self.monitor.state().clone());
        }

        while let Some(message) = self.status_subscription.try_recv() {
            if let Some((channel_id, StatusUpdate::Changed { previous, current })) =
                self.channels.handle_message(&message)
            {
                self.emit(SessionEvent::ChannelStatus {
                    channel_id,
                    previous,
                    current,
                });
            }
        }

        while let Some(message) = self.echo_subscription.try_recv() {
            self.handle_echo(&message);
        }
    }

    fn handle_echo(&mut self, message: &InboundMessage) {
        let Some(id) = PingRequest::echo_id(&message.payload) else {
            debug!(payload = %message.payload_str(), "Ignoring malformed ping echo");
            return;
        };
        let Some(pending) = self.pending_pings.remove(&id) else {
            debug!(id = %id, "Ignoring echo for unknown or expired ping");
            return;
        };

        let latency = message.received_at.saturating_duration_since(pending.sent_at);
        info!(id = %id, latency_ms = latency.as_secs_f64() * 1000.0, "Ping echo received");
        let _ = pending.reply.send(Ok(PingReport {
            id,
            sent_at: pending.sent_wall,
            latency_ms: latency.as_secs_f64() * 1000.0,
        }));
    }

    fn handle_tick(&mut self, now: Instant) {
        if let Some(transition) = self.monitor.tick(now) {
            self.presence_tx.send_replace(self.monitor.state().clone());
            self.emit(SessionEvent::Presence(transition));
        }
        // Callers that gave up waiting dropped their receiver
        self.pending_pings.retain(|_, pending| !pending.reply.is_closed());
    }

    async fn send_ping(&mut self, reply: oneshot::Sender<Result<PingReport, PingError>>) {
        let transport = self.channels.transport();
        if !transport.is_connected() {
            let _ = reply.send(Err(PingError::NotConnected));
            return;
        }

        let ping = PingRequest::new(self.ping_sender.clone());
        let payload = match ping.to_payload() {
            Ok(payload) => payload,
            Err(e) => {
                let _ = reply.send(Err(PingError::Encode(e.to_string())));
                return;
            }
        };

        let sent_at = Instant::now();
        if let Err(e) = transport.publish(&self.ping_topic, payload, false).await {
            let _ = reply.send(Err(PingError::Transport(e.to_string())));
            return;
        }

        debug!(id = %ping.id, topic = %self.ping_topic, "Ping sent");
        self.pending_pings.insert(
            ping.id,
            PendingPing {
                sent_at,
                sent_wall: Utc::now(),
                reply,
            },
        );
    }

    async fn handle_request(&mut self, request: SessionRequest) {
        match request {
            SessionRequest::Command {
                channel_id,
                command,
                reply,
            } => {
                let presence = self.monitor.state().clone();
                let result = self
                    .channels
                    .issue_command(&channel_id, command, &presence)
                    .await;
                if result.is_ok() {
                    self.emit(SessionEvent::CommandIssued {
                        channel_id,
                        command,
                    });
                }
                let _ = reply.send(result);
            }
            SessionRequest::Snapshot { reply } => {
                let _ = reply.send(self.snapshot(Instant::now()));
            }
            SessionRequest::Ping { reply } => self.send_ping(reply).await,
            SessionRequest::Shutdown => {}
        }
    }

    fn emit(&self, event: SessionEvent) {
        // No receivers is fine
        let _ = self.events_tx.send(event);
    }

    fn snapshot(&self, now: Instant) -> SessionSnapshot {
        let state = self.monitor.state();
        let transport = self.channels.transport();

        SessionSnapshot {
            taken_at: Utc::now(),
            connection: transport.connection_state().label().to_string(),
            readiness: self.channels.readiness(transport.is_connected()),
            presence: PresenceSnapshot {
                status: state.status,
                source: state.source,
                reason: state.reason.clone(),
                last_payload: state.last_payload.clone(),
                last_retained: state.last_retained,
                last_seen_secs_ago: state.age(now).map(|age| age.as_secs_f64()),
                signals_received: state.signals_received,
                timeout_secs: self.monitor.evaluator().timeout_threshold().as_secs_f64(),
            },
            channels: self
                .channels
                .statuses()
                .into_iter()
                .map(|status| ChannelSnapshot {
                    name: self.channel_names.get(&status.channel_id).cloned(),
                    updated_secs_ago: now
                        .saturating_duration_since(status.last_updated)
                        .as_secs_f64(),
                    state: status.last_known_state,
                    channel_id: status.channel_id,
                })
                .collect(),
            history: self.channels.history().to_vec(),
        }
    }
}

/// Consumer side of a running session
pub struct SessionHandle {
    requests_tx: mpsc::UnboundedSender<SessionRequest>,
    presence_rx: watch::Receiver<PresenceState>,
    events_tx: broadcast::Sender<SessionEvent>,
    router: MessageRouter,
    task: Option<JoinHandle<()>>,
}

impl SessionHandle {
    /// Latest presence state
    pub fn presence(&self) -> PresenceState {
        self.presence_rx.borrow().clone()
    }

    pub fn presence_receiver(&self) -> watch::Receiver<PresenceState> {
        self.presence_rx.clone()
    }

    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events_tx.subscribe()
    }

    /// Tap into the inbound stream with an additional topic filter
    pub fn subscribe(&self, filter: &str) -> Result<Subscription, TopicError> {
        self.router.subscribe(filter)
    }

    /// Issue a gated relay command; never waits for presence or sync
    pub async fn issue_command(
        &self,
        channel_id: &str,
        command: RelayCommand,
    ) -> Result<(), CommandError> {
        let (reply, response) = oneshot::channel();
        self.requests_tx
            .send(SessionRequest::Command {
                channel_id: channel_id.to_string(),
                command,
                reply,
            })
            .map_err(|_| CommandError::SessionClosed)?;
        response.await.map_err(|_| CommandError::SessionClosed)?
    }

    /// Snapshot of the session, or `None` once it has stopped
    pub async fn snapshot(&self) -> Option<SessionSnapshot> {
        let (reply, response) = oneshot::channel();
        self.requests_tx
            .send(SessionRequest::Snapshot { reply })
            .ok()?;
        response.await.ok()
    }

    /// Publish a ping and wait for the device to echo it back
    pub async fn ping(&self, timeout: Duration) -> Result<PingReport, PingError> {
        let (reply, response) = oneshot::channel();
        self.requests_tx
            .send(SessionRequest::Ping { reply })
            .map_err(|_| PingError::SessionClosed)?;

        match tokio::time::timeout(timeout, response).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(PingError::SessionClosed),
            Err(_) => Err(PingError::Timeout { timeout }),
        }
    }

    /// Wait until a command for `channel_id` would pass the presence and
    /// sync gates. On timeout the error names the gate that is still closed.
    pub async fn wait_until_command_ready(
        &self,
        channel_id: &str,
        timeout: Duration,
    ) -> Result<(), CommandError> {
        let deadline = Instant::now() + timeout;
        let mut events = self.events();

        loop {
            let snapshot = self.snapshot().await.ok_or(CommandError::SessionClosed)?;
            let known = snapshot
                .channels
                .iter()
                .any(|channel| channel.channel_id == channel_id);
            let status = snapshot.presence.status;

            if known && status == PresenceStatus::Online {
                return Ok(());
            }

            match tokio::time::timeout_at(deadline, events.recv()).await {
                Err(_) if !known => {
                    return Err(CommandError::ChannelUnknown {
                        channel_id: channel_id.to_string(),
                    })
                }
                Err(_) => return Err(CommandError::PresenceNotReady { status }),
                Ok(Err(broadcast::error::RecvError::Closed)) => {
                    return Err(CommandError::SessionClosed)
                }
                Ok(_) => {}
            }
        }
    }

    /// Stop the session task and wait for it to finish
    pub async fn shutdown(mut self) {
        let _ = self.requests_tx.send(SessionRequest::Shutdown);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "Presence session task failed");
            }
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::StickinessPolicy;
    use crate::testing::MockTransport;

    const PRESENCE: &str = "smarthome/device/esp32s2mini/presence";

    fn config() -> SessionConfig {
        SessionConfig::new(
            TopicLayout::new("smarthome", PRESENCE, "status", "command"),
            PresenceEvaluator::new(Duration::from_secs(20), StickinessPolicy::Strict),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawn_subscribes_presence_status_and_echo() {
        let transport = MockTransport::new();
        let (_tx, rx) = mpsc::unbounded_channel();
        let handle = PresenceSession::spawn(transport.clone(), rx, config())
            .await
            .unwrap();

        assert_eq!(
            transport.subscriptions(),
            vec![
                PRESENCE.to_string(),
                "smarthome/+/status".to_string(),
                "smarthome/device/ping/echo".to_string(),
            ]
        );
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawn_fails_when_transport_rejects_subscribe() {
        let (_tx, rx) = mpsc::unbounded_channel();
        let result = PresenceSession::spawn(MockTransport::with_failure(), rx, config()).await;
        assert!(matches!(result, Err(RelayError::Transport(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_reflects_messages() {
        let transport = MockTransport::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let mut config = config();
        config
            .channel_names
            .insert("lampu1".to_string(), "Lampu Teras".to_string());
        let handle = PresenceSession::spawn(transport, rx, config).await.unwrap();

        tx.send(InboundMessage::new(PRESENCE, "online", true)).unwrap();
        tx.send(InboundMessage::new("smarthome/lampu1/status", "ON", true))
            .unwrap();

        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.presence.status, PresenceStatus::Online);
        assert_eq!(snapshot.readiness, Readiness::Ready);
        assert_eq!(snapshot.connection, "connected");
        assert_eq!(snapshot.channels.len(), 1);
        assert_eq!(snapshot.channels[0].name.as_deref(), Some("Lampu Teras"));
        assert_eq!(snapshot.channels[0].state, RelayState::On);
        assert_eq!(handle.presence().status, PresenceStatus::Online);

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["presence"]["status"], "online");
        assert_eq!(json["presence"]["source"], "explicit-online");
        assert_eq!(json["channels"][0]["state"], "on");

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_subscription_sees_inbound() {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = PresenceSession::spawn(MockTransport::new(), rx, config())
            .await
            .unwrap();
        let mut tap = handle.subscribe("smarthome/#").unwrap();

        tx.send(InboundMessage::new("smarthome/lampu2/status", "OFF", false))
            .unwrap();
        let received = tap.recv().await.unwrap();
        assert_eq!(received.topic, "smarthome/lampu2/status");

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_requests_fail_after_shutdown() {
        let (_tx, rx) = mpsc::unbounded_channel();
        let handle = PresenceSession::spawn(MockTransport::new(), rx, config())
            .await
            .unwrap();
        let requests_tx = handle.requests_tx.clone();
        handle.shutdown().await;

        let (reply, response) = oneshot::channel();
        assert!(requests_tx.send(SessionRequest::Snapshot { reply }).is_err());
        assert!(response.await.is_err());
    }
}
