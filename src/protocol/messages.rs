//! Payload conventions for the presence, status and command topics

use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use tokio::time::Instant;

/// Presence payload published (retained) by the device when it connects
pub const ONLINE_PAYLOAD: &str = "online";
/// Presence payload registered by the device as its last will
pub const OFFLINE_PAYLOAD: &str = "offline";

/// A message delivered by the transport, stamped locally on arrival
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
    /// True when the broker delivered its stored last-known value
    pub retained: bool,
    pub received_at: Instant,
}

impl InboundMessage {
    /// Create a message stamped with the current instant
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>, retained: bool) -> Self {
        Self::at(topic, payload, retained, Instant::now())
    }

    pub fn at(
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

    /// Payload as text; invalid UTF-8 is replaced rather than rejected
    pub fn payload_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// Last known state of a relay channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RelayState {
    On,
    Off,
    #[default]
    Unknown,
}

impl RelayState {
    /// Parse a status payload. Accepts `on`/`off` in any ASCII case with
    /// surrounding whitespace; anything else is unrecognized.
    pub fn parse_payload(payload: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(payload).ok()?.trim();
        if text.eq_ignore_ascii_case("on") {
            Some(RelayState::On)
        } else if text.eq_ignore_ascii_case("off") {
            Some(RelayState::Off)
        } else {
            None
        }
    }

    pub fn is_known(self) -> bool {
        !matches!(self, RelayState::Unknown)
    }
}

impl std::fmt::Display for RelayState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelayState::On => write!(f, "on"),
            RelayState::Off => write!(f, "off"),
            RelayState::Unknown => write!(f, "unknown"),
        }
    }
}

/// Desired relay state carried by a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RelayCommand {
    On,
    Off,
}

impl RelayCommand {
    /// Payload written to the command topic
    pub fn payload(self, case: PayloadCase) -> &'static str {
        match (self, case) {
            (RelayCommand::On, PayloadCase::Upper) => "ON",
            (RelayCommand::Off, PayloadCase::Upper) => "OFF",
            (RelayCommand::On, PayloadCase::Lower) => "on",
            (RelayCommand::Off, PayloadCase::Lower) => "off",
        }
    }

    /// State the channel is expected to report once the command is applied
    pub fn target_state(self) -> RelayState {
        match self {
            RelayCommand::On => RelayState::On,
            RelayCommand::Off => RelayState::Off,
        }
    }

    /// Parse a command payload the same way status payloads are parsed
    pub fn parse_payload(payload: &[u8]) -> Option<Self> {
        match RelayState::parse_payload(payload)? {
            RelayState::On => Some(RelayCommand::On),
            RelayState::Off => Some(RelayCommand::Off),
            RelayState::Unknown => None,
        }
    }
}

impl std::fmt::Display for RelayCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.target_state())
    }
}

/// Letter case used for outbound command and status payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PayloadCase {
    #[default]
    Upper,
    Lower,
}

/// Latency ping published on the ping topic
///
/// The device echoes the payload back on the echo topic; replies are matched
/// by `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingRequest {
    pub id: String,
    pub from: String,
    /// Send time in milliseconds since the Unix epoch
    pub t: i64,
}

impl PingRequest {
    pub fn new(from: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            from: from.into(),
            t: Utc::now().timestamp_millis(),
        }
    }

    pub fn to_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Id carried by an echo payload. Numeric ids are accepted as well.
    pub fn echo_id(payload: &[u8]) -> Option<String> {
        let value: serde_json::Value = serde_json::from_slice(payload).ok()?;
        match value.get("id")? {
            serde_json::Value::String(id) => Some(id.clone()),
            serde_json::Value::Number(id) => Some(id.to_string()),
            _ => None,
        }
    }
}
