//! Pure presence evaluation
//!
//! The evaluator never mutates in place: both operations take the current
//! [`PresenceState`] and return the next one, so the owner decides when a
//! new state becomes visible. Signal handling and timeout evaluation are
//! expected to run on the same task, which removes the race between a
//! scheduled timeout check and an in-flight disconnect message.

use crate::protocol::{InboundMessage, OFFLINE_PAYLOAD, ONLINE_PAYLOAD};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::time::Duration;
use tokio::time::Instant;

/// Reason recorded when the device reports its own disconnect
pub const LAST_WILL_REASON: &str = "device disconnected (last will)";

/// Derived liveness verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    #[default]
    Unknown,
    Online,
    Offline,
}

impl std::fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PresenceStatus::Unknown => write!(f, "unknown"),
            PresenceStatus::Online => write!(f, "online"),
            PresenceStatus::Offline => write!(f, "offline"),
        }
    }
}

/// Provenance of the current status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum PresenceSource {
    #[default]
    None,
    ExplicitOnline,
    ExplicitOffline,
    Heartbeat,
    Timeout,
}

/// What may lift an explicit (last will) offline verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StickinessPolicy {
    /// Only a literal `online` payload brings the device back
    #[default]
    Strict,
    /// Any payload other than `offline` brings the device back
    Relaxed,
}

/// An inbound event observed on the presence topic
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceSignal {
    pub topic: String,
    pub payload: Bytes,
    pub retained: bool,
    pub received_at: Instant,
}

impl PresenceSignal {
    pub fn new(
        topic: impl Into<String>,
        payload: impl Into<Bytes>,
        retained: bool,
        received_at: Instant,
    ) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            retained,
            received_at,
        }
    }

    pub fn payload_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    pub fn kind(&self) -> SignalKind {
        SignalKind::classify(&self.payload)
    }
}

impl From<InboundMessage> for PresenceSignal {
    fn from(message: InboundMessage) -> Self {
        Self {
            topic: message.topic,
            payload: message.payload,
            retained: message.retained,
            received_at: message.received_at,
        }
    }
}

/// Classification of a presence payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Online,
    Offline,
    Heartbeat,
}

impl SignalKind {
    /// Exact literal match; every other payload counts as a heartbeat
    pub fn classify(payload: &[u8]) -> Self {
        if payload == ONLINE_PAYLOAD.as_bytes() {
            SignalKind::Online
        } else if payload == OFFLINE_PAYLOAD.as_bytes() {
            SignalKind::Offline
        } else {
            SignalKind::Heartbeat
        }
    }
}

/// Current belief about one device
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PresenceState {
    pub status: PresenceStatus,
    /// Last time liveness evidence was observed. Kept when going offline.
    pub last_seen: Option<Instant>,
    pub last_payload: Option<String>,
    pub source: PresenceSource,
    /// Only set while offline
    pub reason: Option<String>,
    /// Whether the most recent signal was a retained delivery
    pub last_retained: bool,
    pub signals_received: u64,
}

impl PresenceState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_online(&self) -> bool {
        self.status == PresenceStatus::Online
    }

    /// Offline because the device (or its last will) said so
    pub fn is_explicitly_offline(&self) -> bool {
        self.status == PresenceStatus::Offline && self.source == PresenceSource::ExplicitOffline
    }

    /// Time elapsed since the last liveness evidence
    pub fn age(&self, now: Instant) -> Option<Duration> {
        self.last_seen
            .map(|last_seen| now.saturating_duration_since(last_seen))
    }
}

/// Presence state machine combining explicit signals with a timeout fallback
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceEvaluator {
    timeout_threshold: Duration,
    stickiness: StickinessPolicy,
}

impl PresenceEvaluator {
    pub fn new(timeout_threshold: Duration, stickiness: StickinessPolicy) -> Self {
        Self {
            timeout_threshold,
            stickiness,
        }
    }

    /// Threshold of twice the expected heartbeat interval
    pub fn for_heartbeat_interval(heartbeat_interval: Duration, stickiness: StickinessPolicy) -> Self {
        Self::new(heartbeat_interval * 2, stickiness)
    }

    pub fn timeout_threshold(&self) -> Duration {
        self.timeout_threshold
    }

    pub fn stickiness(&self) -> StickinessPolicy {
        self.stickiness
    }

    /// Apply one presence signal
    ///
    /// Retained signals are applied exactly like live ones: a retained
    /// `offline` is stale but still the best knowledge available.
    pub fn on_signal(&self, state: &PresenceState, signal: &PresenceSignal) -> PresenceState {
        let mut next = state.clone();
        next.last_payload = Some(signal.payload_str().into_owned());
        next.last_retained = signal.retained;
        next.signals_received = state.signals_received.saturating_add(1);

        match signal.kind() {
            SignalKind::Offline => {
                next.status = PresenceStatus::Offline;
                next.source = PresenceSource::ExplicitOffline;
                next.reason = Some(LAST_WILL_REASON.to_string());
            }
            kind => {
                if state.is_explicitly_offline()
                    && kind == SignalKind::Heartbeat
                    && self.stickiness == StickinessPolicy::Strict
                {
                    return next;
                }

                next.status = PresenceStatus::Online;
                next.source = match kind {
                    SignalKind::Online => PresenceSource::ExplicitOnline,
                    _ => PresenceSource::Heartbeat,
                };
                next.last_seen = Some(signal.received_at);
                next.reason = None;
            }
        }

        next
    }

    /// Periodic timeout evaluation
    ///
    /// Idempotent: `last_seen` is never touched and the only transition is
    /// online to offline once the threshold has been exceeded.
    pub fn on_tick(&self, state: &PresenceState, now: Instant) -> PresenceState {
        let Some(last_seen) = state.last_seen else {
            return state.clone();
        };

        if state.is_explicitly_offline() || state.status != PresenceStatus::Online {
            return state.clone();
        }

        if now.saturating_duration_since(last_seen) > self.timeout_threshold {
            PresenceState {
                status: PresenceStatus::Offline,
                source: PresenceSource::Timeout,
                reason: Some(format!("no signal within {:?}", self.timeout_threshold)),
                ..state.clone()
            }
        } else {
            state.clone()
        }
    }
}
