//! Presence session behavior over a mock transport
//!
//! Time is paused and auto-advances from timer to timer, so tick-driven
//! timeouts fire in a deterministic order relative to the test's sleeps.

use relay_presence::error::{CommandError, PingError};
use relay_presence::presence::{PresenceEvaluator, PresenceSource, PresenceStatus, StickinessPolicy};
use relay_presence::protocol::{InboundMessage, RelayCommand, RelayState, TopicLayout};
use relay_presence::session::{PresenceSession, SessionConfig, SessionEvent, SessionHandle};
use relay_presence::testing::MockTransport;
use relay_presence::transport::mqtt::ConnectionState;
use relay_presence::Readiness;
use std::time::Duration;
use tokio::sync::mpsc;

const PRESENCE_TOPIC: &str = "smarthome/device/esp32s2mini/presence";
const PING_TOPIC: &str = "smarthome/device/ping";
const ECHO_TOPIC: &str = "smarthome/device/ping/echo";

fn session_config() -> SessionConfig {
    SessionConfig::new(
        TopicLayout::new("smarthome", PRESENCE_TOPIC, "status", "perintah"),
        PresenceEvaluator::new(Duration::from_secs(10), StickinessPolicy::Strict),
    )
    .with_tick_interval(Duration::from_secs(2))
}

async fn start() -> (
    MockTransport,
    mpsc::UnboundedSender<InboundMessage>,
    SessionHandle,
) {
    start_with(session_config()).await
}

async fn start_with(
    config: SessionConfig,
) -> (
    MockTransport,
    mpsc::UnboundedSender<InboundMessage>,
    SessionHandle,
) {
    let transport = MockTransport::new();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let handle = PresenceSession::spawn(transport.clone(), inbound_rx, config)
        .await
        .unwrap();
    (transport, inbound_tx, handle)
}

/// Let the session task drain everything already sent to it
async fn settle(handle: &SessionHandle) {
    handle.snapshot().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_session_times_out_silent_device() {
    let (_transport, inbound, handle) = start().await;
    let mut events = handle.events();

    inbound
        .send(InboundMessage::new(PRESENCE_TOPIC, "online", true))
        .unwrap();
    settle(&handle).await;
    assert_eq!(handle.presence().status, PresenceStatus::Online);

    let event = events.recv().await.unwrap();
    assert!(matches!(
        event,
        SessionEvent::Presence(ref transition) if transition.current == PresenceStatus::Online
    ));

    // Still within the 10s threshold
    tokio::time::sleep(Duration::from_secs(8)).await;
    settle(&handle).await;
    assert_eq!(handle.presence().status, PresenceStatus::Online);

    // The next tick after the threshold flips the verdict
    tokio::time::sleep(Duration::from_secs(5)).await;
    settle(&handle).await;
    let presence = handle.presence();
    assert_eq!(presence.status, PresenceStatus::Offline);
    assert_eq!(presence.source, PresenceSource::Timeout);

    let event = events.recv().await.unwrap();
    assert!(matches!(
        event,
        SessionEvent::Presence(ref transition)
            if transition.previous == PresenceStatus::Online
                && transition.source == PresenceSource::Timeout
    ));

    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_heartbeats_keep_device_online() {
    let (_transport, inbound, handle) = start().await;

    inbound
        .send(InboundMessage::new(PRESENCE_TOPIC, "online", true))
        .unwrap();
    for _ in 0..6 {
        tokio::time::sleep(Duration::from_secs(5)).await;
        inbound
            .send(InboundMessage::new(PRESENCE_TOPIC, "heartbeat", false))
            .unwrap();
        settle(&handle).await;
        assert_eq!(handle.presence().status, PresenceStatus::Online);
    }

    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(snapshot.presence.signals_received, 7);
    assert_eq!(snapshot.presence.source, PresenceSource::Heartbeat);

    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_last_will_is_sticky_across_ticks() {
    let (_transport, inbound, handle) = start().await;

    inbound
        .send(InboundMessage::new(PRESENCE_TOPIC, "online", true))
        .unwrap();
    inbound
        .send(InboundMessage::new(PRESENCE_TOPIC, "offline", false))
        .unwrap();
    settle(&handle).await;
    assert!(handle.presence().is_explicitly_offline());

    tokio::time::sleep(Duration::from_secs(120)).await;
    settle(&handle).await;
    assert!(handle.presence().is_explicitly_offline());

    inbound
        .send(InboundMessage::new(PRESENCE_TOPIC, "heartbeat", false))
        .unwrap();
    settle(&handle).await;
    assert!(handle.presence().is_explicitly_offline());

    inbound
        .send(InboundMessage::new(PRESENCE_TOPIC, "online", false))
        .unwrap();
    settle(&handle).await;
    assert_eq!(handle.presence().status, PresenceStatus::Online);

    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_commands_are_gated_through_the_session() {
    let (transport, inbound, handle) = start().await;

    let result = handle.issue_command("lampu1", RelayCommand::On).await;
    assert!(matches!(result, Err(CommandError::ChannelUnknown { .. })));

    inbound
        .send(InboundMessage::new("smarthome/lampu1/status", "OFF", true))
        .unwrap();
    settle(&handle).await;

    let result = handle.issue_command("lampu1", RelayCommand::On).await;
    assert_eq!(
        result,
        Err(CommandError::PresenceNotReady {
            status: PresenceStatus::Unknown
        })
    );
    assert!(transport.published().is_empty());

    inbound
        .send(InboundMessage::new(PRESENCE_TOPIC, "online", true))
        .unwrap();
    settle(&handle).await;

    handle
        .issue_command("lampu1", RelayCommand::On)
        .await
        .unwrap();
    let published = transport.published_to("smarthome/lampu1/perintah");
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].payload_str(), "ON");

    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_transport_failure_surfaces_as_command_error() {
    let (transport, inbound, handle) = start().await;

    inbound
        .send(InboundMessage::new(PRESENCE_TOPIC, "online", true))
        .unwrap();
    inbound
        .send(InboundMessage::new("smarthome/lampu1/status", "ON", true))
        .unwrap();
    settle(&handle).await;

    transport.set_failing(true);
    let result = handle.issue_command("lampu1", RelayCommand::Off).await;
    assert!(matches!(result, Err(CommandError::Transport(_))));

    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_channel_status_events_only_on_change() {
    let (_transport, inbound, handle) = start().await;
    let mut events = handle.events();

    for payload in ["ON", "on", "OFF", "garbage"] {
        inbound
            .send(InboundMessage::new("smarthome/stopkontak1/status", payload, false))
            .unwrap();
    }
    settle(&handle).await;

    let first = events.recv().await.unwrap();
    assert_eq!(
        first,
        SessionEvent::ChannelStatus {
            channel_id: "stopkontak1".to_string(),
            previous: RelayState::Unknown,
            current: RelayState::On,
        }
    );
    let second = events.recv().await.unwrap();
    assert_eq!(
        second,
        SessionEvent::ChannelStatus {
            channel_id: "stopkontak1".to_string(),
            previous: RelayState::On,
            current: RelayState::Off,
        }
    );
    assert!(events.try_recv().is_err());

    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_wait_until_command_ready_resolves_on_sync() {
    let (_transport, inbound, handle) = start().await;

    let feeder = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        inbound
            .send(InboundMessage::new(PRESENCE_TOPIC, "online", true))
            .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        inbound
            .send(InboundMessage::new("smarthome/lampu1/status", "OFF", true))
            .unwrap();
        inbound
    });

    handle
        .wait_until_command_ready("lampu1", Duration::from_secs(5))
        .await
        .unwrap();

    let _inbound = feeder.await.unwrap();
    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_wait_until_command_ready_names_closed_gate() {
    let (_transport, inbound, handle) = start().await;

    let result = handle
        .wait_until_command_ready("lampu1", Duration::from_secs(3))
        .await;
    assert!(matches!(result, Err(CommandError::ChannelUnknown { .. })));

    inbound
        .send(InboundMessage::new("smarthome/lampu1/status", "OFF", true))
        .unwrap();
    let result = handle
        .wait_until_command_ready("lampu1", Duration::from_secs(3))
        .await;
    assert!(matches!(
        result,
        Err(CommandError::PresenceNotReady {
            status: PresenceStatus::Unknown
        })
    ));

    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_snapshot_reports_readiness_and_history() {
    let (transport, inbound, handle) = start().await;

    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(snapshot.readiness, Readiness::Syncing);
    assert!(snapshot.presence.last_seen_secs_ago.is_none());

    inbound
        .send(InboundMessage::new(PRESENCE_TOPIC, "online", true))
        .unwrap();
    inbound
        .send(InboundMessage::new("smarthome/lampu1/status", "OFF", true))
        .unwrap();
    settle(&handle).await;
    handle
        .issue_command("lampu1", RelayCommand::On)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(3)).await;
    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(snapshot.readiness, Readiness::Ready);
    assert_eq!(snapshot.presence.timeout_secs, 10.0);
    assert!(snapshot.presence.last_seen_secs_ago.unwrap() >= 3.0);
    assert_eq!(snapshot.history.len(), 2);

    transport.set_connection_state(ConnectionState::Reconnecting(1));
    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(snapshot.readiness, Readiness::Disconnected);
    assert_eq!(snapshot.connection, "reconnecting");

    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_session_keeps_ticking_after_inbound_closes() {
    let (_transport, inbound, handle) = start().await;

    inbound
        .send(InboundMessage::new(PRESENCE_TOPIC, "online", true))
        .unwrap();
    drop(inbound);
    settle(&handle).await;

    tokio::time::sleep(Duration::from_secs(15)).await;
    settle(&handle).await;
    assert_eq!(handle.presence().source, PresenceSource::Timeout);

    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_presence_watch_closes_after_shutdown() {
    let (_transport, _inbound, handle) = start().await;
    let presence = handle.presence_receiver();
    handle.shutdown().await;

    assert!(presence.has_changed().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_last_will_after_timeout_is_announced() {
    let (_transport, inbound, handle) = start().await;
    let mut events = handle.events();

    inbound
        .send(InboundMessage::new(PRESENCE_TOPIC, "online", true))
        .unwrap();
    tokio::time::sleep(Duration::from_secs(13)).await;
    settle(&handle).await;
    assert_eq!(handle.presence().source, PresenceSource::Timeout);

    inbound
        .send(InboundMessage::new(PRESENCE_TOPIC, "offline", true))
        .unwrap();
    settle(&handle).await;

    let transitions: Vec<_> = std::iter::from_fn(|| events.try_recv().ok()).collect();
    let last = transitions.last().unwrap();
    assert!(matches!(
        last,
        SessionEvent::Presence(transition)
            if transition.previous == PresenceStatus::Offline
                && transition.current == PresenceStatus::Offline
                && transition.source == PresenceSource::ExplicitOffline
    ));

    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_history_keeps_configured_channels_only() {
    let mut config = session_config();
    config.history_channels = vec!["lampu1".to_string()];
    let (_transport, inbound, handle) = start_with(config).await;

    for topic in ["smarthome/lampu1/status", "smarthome/lampu9/status"] {
        inbound
            .send(InboundMessage::new(topic, "ON", true))
            .unwrap();
    }
    let snapshot = handle.snapshot().await.unwrap();

    assert_eq!(snapshot.channels.len(), 2);
    assert_eq!(snapshot.history.len(), 1);
    assert_eq!(snapshot.history[0].channel_id, "lampu1");

    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_ping_round_trip_reports_latency() {
    let (transport, inbound, handle) = start().await;

    let responder = async {
        let request = loop {
            if let Some(request) = transport.published_to(PING_TOPIC).pop() {
                break request;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        };
        tokio::time::sleep(Duration::from_millis(140)).await;
        inbound
            .send(InboundMessage::new(ECHO_TOPIC, request.payload.clone(), false))
            .unwrap();
        request
    };

    let (report, request) = tokio::join!(handle.ping(Duration::from_secs(2)), responder);
    let report = report.unwrap();

    let sent: serde_json::Value = serde_json::from_slice(&request.payload).unwrap();
    assert_eq!(sent["id"], report.id.as_str());
    assert_eq!(sent["from"], "relay-presence");
    assert!(!request.retain);
    assert!(
        (140.0..=160.0).contains(&report.latency_ms),
        "latency {}",
        report.latency_ms
    );

    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_ping_times_out_without_matching_echo() {
    let (transport, inbound, handle) = start().await;

    inbound
        .send(InboundMessage::new(ECHO_TOPIC, r#"{"id":"from-someone-else"}"#, false))
        .unwrap();
    let result = handle.ping(Duration::from_secs(1)).await;

    assert_eq!(
        result,
        Err(PingError::Timeout {
            timeout: Duration::from_secs(1)
        })
    );
    assert_eq!(transport.published_to(PING_TOPIC).len(), 1);

    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_ping_requires_connection() {
    let (transport, _inbound, handle) = start().await;
    transport.set_connection_state(ConnectionState::Reconnecting(2));

    let result = handle.ping(Duration::from_secs(1)).await;

    assert_eq!(result, Err(PingError::NotConnected));
    assert!(transport.published().is_empty());

    handle.shutdown().await;
}
