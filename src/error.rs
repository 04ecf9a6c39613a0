//! Error types for the relay presence monitor
//!
//! Each layer has its own `thiserror` enum; [`RelayError`] gathers them for
//! the binary and for callers that do not care which layer failed.

use crate::config::ConfigError;
use crate::presence::PresenceStatus;
use crate::protocol::TopicError;
use crate::transport::mqtt::MqttError;
use std::time::Duration;
use thiserror::Error;

/// Rejection of a relay command. Always returned immediately.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("Device is not online (presence: {status})")]
    PresenceNotReady { status: PresenceStatus },

    #[error("No status has been received for channel '{channel_id}'")]
    ChannelUnknown { channel_id: String },

    #[error("Transport rejected command: {0}")]
    Transport(String),

    #[error("Presence session has stopped")]
    SessionClosed,
}

impl CommandError {
    /// Create transport rejection error
    pub fn transport<E: std::fmt::Display>(error: E) -> Self {
        Self::Transport(error.to_string())
    }
}

/// Failure of a latency ping
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PingError {
    #[error("Not connected to the broker")]
    NotConnected,

    #[error("No echo within {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("Transport rejected ping: {0}")]
    Transport(String),

    #[error("Failed to encode ping: {0}")]
    Encode(String),

    #[error("Presence session has stopped")]
    SessionClosed,
}

/// Crate-level error type
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("MQTT error: {0}")]
    Mqtt(#[from] MqttError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Topic error: {0}")]
    Topic(#[from] TopicError),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Command rejected: {0}")]
    Command(#[from] CommandError),

    #[error("Ping failed: {0}")]
    Ping(#[from] PingError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type RelayResult<T> = Result<T, RelayError>;
