//! Relay channel status cache and gated command issuing
//!
//! Channel state comes only from status messages published (retained) by
//! the device. A command is sent only for a channel whose status has been
//! seen, and only while the device is online.

pub mod history;

pub use history::{CommandHistory, HistoryEntry, HistoryKind, DEFAULT_HISTORY_CAPACITY};

use crate::error::CommandError;
use crate::presence::{PresenceState, PresenceStatus};
use crate::protocol::{InboundMessage, PayloadCase, RelayCommand, RelayState, TopicLayout};
use crate::transport::Transport;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::time::Instant;
use tracing::{debug, info, warn, Instrument};

/// Last known state of one channel
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelStatus {
    pub channel_id: String,
    pub last_known_state: RelayState,
    pub last_updated: Instant,
}

/// Outcome of applying a status payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusUpdate {
    Changed {
        previous: RelayState,
        current: RelayState,
    },
    /// Same state as before; only the timestamp moved
    Unchanged,
    /// Payload was not `on`/`off`
    Ignored,
}

/// Whether the dashboard side can act on the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Readiness {
    /// No broker connection
    Disconnected,
    /// Connected, no channel status received yet
    Syncing,
    /// Connected and at least one channel status known
    Ready,
}

impl std::fmt::Display for Readiness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Readiness::Disconnected => write!(f, "disconnected"),
            Readiness::Syncing => write!(f, "syncing"),
            Readiness::Ready => write!(f, "ready"),
        }
    }
}

/// Status cache and command gate for every relay channel of one device
#[derive(Debug)]
pub struct RelayChannels<T: Transport> {
    transport: T,
    layout: TopicLayout,
    payload_case: PayloadCase,
    channels: BTreeMap<String, ChannelStatus>,
    history: CommandHistory,
}

impl<T: Transport> RelayChannels<T> {
    pub fn new(transport: T, layout: TopicLayout, payload_case: PayloadCase) -> Self {
        Self {
            transport,
            layout,
            payload_case,
            channels: BTreeMap::new(),
            history: CommandHistory::default(),
        }
    }

    /// Replaces the history, so call before [`Self::with_history_channels`]
    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history = CommandHistory::new(capacity);
        self
    }

    /// Record history only for these channels; an empty list records all
    pub fn with_history_channels(mut self, channel_ids: Vec<String>) -> Self {
        self.history = self.history.with_tracked_channels(channel_ids);
        self
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn layout(&self) -> &TopicLayout {
        &self.layout
    }

    /// Apply a message from the status filter. Returns `None` when the
    /// topic is not a status topic of this layout.
    pub fn handle_message(&mut self, message: &InboundMessage) -> Option<(String, StatusUpdate)> {
        let channel_id = self.layout.channel_from_status_topic(&message.topic)?.to_string();
        let update = self.record_status(&channel_id, &message.payload, message.received_at);
        Some((channel_id, update))
    }

    /// Record a status payload for a channel
    pub fn record_status(
        &mut self,
        channel_id: &str,
        payload: &[u8],
        received_at: Instant,
    ) -> StatusUpdate {
        let Some(state) = RelayState::parse_payload(payload) else {
            warn!(
                channel = %channel_id,
                payload = %String::from_utf8_lossy(payload),
                "Ignoring unrecognized status payload"
            );
            return StatusUpdate::Ignored;
        };

        let update = match self.channels.get_mut(channel_id) {
            Some(status) => {
                let previous = status.last_known_state;
                status.last_known_state = state;
                status.last_updated = received_at;
                if previous == state {
                    StatusUpdate::Unchanged
                } else {
                    StatusUpdate::Changed {
                        previous,
                        current: state,
                    }
                }
            }
            None => {
                self.channels.insert(
                    channel_id.to_string(),
                    ChannelStatus {
                        channel_id: channel_id.to_string(),
                        last_known_state: state,
                        last_updated: received_at,
                    },
                );
                StatusUpdate::Changed {
                    previous: RelayState::Unknown,
                    current: state,
                }
            }
        };

        match update {
            StatusUpdate::Changed { previous, current } => {
                info!(channel = %channel_id, from = %previous, to = %current, "Channel status changed");
                self.history
                    .record_status(channel_id, current, chrono::Utc::now());
            }
            _ => debug!(channel = %channel_id, state = %state, "Channel status refreshed"),
        }
        update
    }

    /// Send a relay command if the channel is known and the device is online
    pub async fn issue_command(
        &mut self,
        channel_id: &str,
        desired: RelayCommand,
        presence: &PresenceState,
    ) -> Result<(), CommandError> {
        if !self.channels.contains_key(channel_id) {
            warn!(channel = %channel_id, command = %desired, "Rejecting command for unknown channel");
            return Err(CommandError::ChannelUnknown {
                channel_id: channel_id.to_string(),
            });
        }

        if presence.status != PresenceStatus::Online {
            warn!(
                channel = %channel_id,
                command = %desired,
                presence = %presence.status,
                "Rejecting command while device is not online"
            );
            return Err(CommandError::PresenceNotReady {
                status: presence.status,
            });
        }

        let topic = self.layout.command_topic(channel_id);
        let payload = desired.payload(self.payload_case);
        let span = crate::command_span!(channel = %channel_id, command = %desired, topic = %topic);

        self.transport
            .publish(&topic, payload.as_bytes().to_vec(), false)
            .instrument(span)
            .await
            .map_err(CommandError::transport)?;

        info!(channel = %channel_id, command = %desired, topic = %topic, "Command issued");
        self.history
            .record_command(channel_id, desired.target_state(), chrono::Utc::now());
        Ok(())
    }

    pub fn status(&self, channel_id: &str) -> Option<&ChannelStatus> {
        self.channels.get(channel_id)
    }

    /// All known channels ordered by channel id
    pub fn statuses(&self) -> Vec<ChannelStatus> {
        self.channels.values().cloned().collect()
    }

    pub fn history(&self) -> &CommandHistory {
        &self.history
    }

    pub fn readiness(&self, connected: bool) -> Readiness {
        if !connected {
            Readiness::Disconnected
        } else if self.channels.is_empty() {
            Readiness::Syncing
        } else {
            Readiness::Ready
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::{PresenceEvaluator, PresenceSignal, StickinessPolicy};
    use crate::testing::MockTransport;
    use std::time::Duration;

    fn layout() -> TopicLayout {
        TopicLayout::new(
            "smarthome",
            "smarthome/device/esp32s2mini/presence",
            "status",
            "perintah",
        )
    }

    fn channels(transport: MockTransport) -> RelayChannels<MockTransport> {
        RelayChannels::new(transport, layout(), PayloadCase::Upper)
    }

    fn online_presence() -> PresenceState {
        let evaluator = PresenceEvaluator::new(Duration::from_secs(20), StickinessPolicy::Strict);
        let signal = PresenceSignal::new(
            "smarthome/device/esp32s2mini/presence",
            "online",
            true,
            Instant::now(),
        );
        evaluator.on_signal(&PresenceState::new(), &signal)
    }

    #[test]
    fn test_record_status_lifecycle() {
        let mut channels = channels(MockTransport::new());
        let t0 = Instant::now();

        assert_eq!(
            channels.record_status("lampu1", b"ON", t0),
            StatusUpdate::Changed {
                previous: RelayState::Unknown,
                current: RelayState::On
            }
        );

        let t1 = t0 + Duration::from_secs(1);
        assert_eq!(channels.record_status("lampu1", b" on\n", t1), StatusUpdate::Unchanged);
        assert_eq!(channels.status("lampu1").unwrap().last_updated, t1);

        assert_eq!(
            channels.record_status("lampu1", b"off", t1),
            StatusUpdate::Changed {
                previous: RelayState::On,
                current: RelayState::Off
            }
        );
        assert_eq!(channels.history().len(), 2);
    }

    #[test]
    fn test_unrecognized_payload_does_not_create_channel() {
        let mut channels = channels(MockTransport::new());
        assert_eq!(
            channels.record_status("lampu1", b"maybe", Instant::now()),
            StatusUpdate::Ignored
        );
        assert!(channels.status("lampu1").is_none());

        channels.record_status("lampu1", b"ON", Instant::now());
        assert_eq!(
            channels.record_status("lampu1", b"", Instant::now()),
            StatusUpdate::Ignored
        );
        assert_eq!(
            channels.status("lampu1").unwrap().last_known_state,
            RelayState::On
        );
    }

    #[test]
    fn test_handle_message_uses_topic_layout() {
        let mut channels = channels(MockTransport::new());
        let message = InboundMessage::new("smarthome/stopkontak1/status", "OFF", true);
        assert_eq!(
            channels.handle_message(&message),
            Some((
                "stopkontak1".to_string(),
                StatusUpdate::Changed {
                    previous: RelayState::Unknown,
                    current: RelayState::Off
                }
            ))
        );

        let other = InboundMessage::new("smarthome/stopkontak1/perintah", "ON", false);
        assert_eq!(channels.handle_message(&other), None);
    }

    #[test]
    fn test_statuses_ordered_by_channel_id() {
        let mut channels = channels(MockTransport::new());
        let now = Instant::now();
        channels.record_status("stopkontak2", b"ON", now);
        channels.record_status("lampu2", b"OFF", now);
        channels.record_status("lampu1", b"ON", now);

        let ids: Vec<_> = channels
            .statuses()
            .into_iter()
            .map(|s| s.channel_id)
            .collect();
        assert_eq!(ids, vec!["lampu1", "lampu2", "stopkontak2"]);
    }

    #[tokio::test]
    async fn test_command_rejected_for_unknown_channel_regardless_of_presence() {
        let transport = MockTransport::new();
        let mut channels = channels(transport.clone());

        let result = channels
            .issue_command("lampu1", RelayCommand::On, &online_presence())
            .await;
        assert_eq!(
            result,
            Err(CommandError::ChannelUnknown {
                channel_id: "lampu1".to_string()
            })
        );

        let result = channels
            .issue_command("lampu1", RelayCommand::On, &PresenceState::new())
            .await;
        assert!(matches!(result, Err(CommandError::ChannelUnknown { .. })));
        assert!(transport.published().is_empty());
    }

    #[tokio::test]
    async fn test_command_rejected_while_not_online() {
        let transport = MockTransport::new();
        let mut channels = channels(transport.clone());
        channels.record_status("lampu1", b"OFF", Instant::now());

        let result = channels
            .issue_command("lampu1", RelayCommand::On, &PresenceState::new())
            .await;
        assert_eq!(
            result,
            Err(CommandError::PresenceNotReady {
                status: PresenceStatus::Unknown
            })
        );
        assert!(transport.published().is_empty());
        assert!(channels
            .history()
            .entries()
            .all(|e| e.kind == HistoryKind::Status));
    }

    #[tokio::test]
    async fn test_command_published_when_ready() {
        let transport = MockTransport::new();
        let mut channels = channels(transport.clone());
        channels.record_status("lampu1", b"OFF", Instant::now());

        channels
            .issue_command("lampu1", RelayCommand::On, &online_presence())
            .await
            .unwrap();

        let published = transport.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, "smarthome/lampu1/perintah");
        assert_eq!(published[0].payload, b"ON".to_vec());
        assert!(!published[0].retain);

        // The cached state only changes when the device reports it
        assert_eq!(
            channels.status("lampu1").unwrap().last_known_state,
            RelayState::Off
        );
        let last = channels.history().to_vec().pop().unwrap();
        assert_eq!(last.kind, HistoryKind::Command);
        assert_eq!(last.state, RelayState::On);
    }

    #[tokio::test]
    async fn test_lowercase_payloads() {
        let transport = MockTransport::new();
        let mut channels = RelayChannels::new(transport.clone(), layout(), PayloadCase::Lower);
        channels.record_status("lampu2", b"ON", Instant::now());

        channels
            .issue_command("lampu2", RelayCommand::Off, &online_presence())
            .await
            .unwrap();
        assert_eq!(transport.published()[0].payload, b"off".to_vec());
    }

    #[tokio::test]
    async fn test_transport_rejection_surfaces() {
        let transport = MockTransport::with_failure();
        let mut channels = channels(transport);
        channels.record_status("lampu1", b"OFF", Instant::now());

        let result = channels
            .issue_command("lampu1", RelayCommand::On, &online_presence())
            .await;
        assert!(matches!(result, Err(CommandError::Transport(_))));
        assert_eq!(
            channels
                .history()
                .entries()
                .filter(|e| e.kind == HistoryKind::Command)
                .count(),
            0
        );
    }

    #[test]
    fn test_readiness() {
        let mut channels = channels(MockTransport::new());
        assert_eq!(channels.readiness(false), Readiness::Disconnected);
        assert_eq!(channels.readiness(true), Readiness::Syncing);

        channels.record_status("lampu1", b"ON", Instant::now());
        assert_eq!(channels.readiness(true), Readiness::Ready);
        assert_eq!(channels.readiness(false), Readiness::Disconnected);
        assert_eq!(Readiness::Ready.to_string(), "ready");
    }
}
