//! Relay Presence - presence tracking and gated relay control over MQTT
//!
//! Derives whether a single relay controller is reachable from an
//! unordered, at-most-once stream of retained and live presence messages,
//! caches the state of its relay channels, and only lets relay commands
//! through while the device is online and the channel is known.
//!
//! # Overview
//!
//! - [`presence`]: pure evaluator plus a stateful monitor with sticky
//!   last-will handling
//! - [`channels`]: per-channel status cache, command gate and history
//! - [`router`]: topic-filter fan-out with MQTT wildcards
//! - [`transport`]: MQTT connection with FIFO buffering, bounded backoff
//!   reconnect and automatic resubscription
//! - [`session`]: one task composing all of the above
//!
//! # Quick Start
//!
//! ```rust
//! use relay_presence::presence::{
//!     PresenceEvaluator, PresenceSignal, PresenceState, PresenceStatus, StickinessPolicy,
//! };
//! use std::time::Duration;
//! use tokio::time::Instant;
//!
//! let evaluator = PresenceEvaluator::new(Duration::from_secs(10), StickinessPolicy::Strict);
//! let start = Instant::now();
//!
//! let topic = "smarthome/device/esp32s2mini/presence";
//! let state = evaluator.on_signal(
//!     &PresenceState::new(),
//!     &PresenceSignal::new(topic, "online", true, start),
//! );
//! assert_eq!(state.status, PresenceStatus::Online);
//!
//! let state = evaluator.on_tick(&state, start + Duration::from_secs(15));
//! assert_eq!(state.status, PresenceStatus::Offline);
//! ```

pub mod channels;
pub mod config;
pub mod error;
pub mod observability;
pub mod presence;
pub mod protocol;
pub mod router;
pub mod session;
pub mod testing;
pub mod transport;

pub use channels::{Readiness, RelayChannels, StatusUpdate};
pub use config::*;
pub use error::{CommandError, PingError, RelayError, RelayResult};
pub use presence::{PresenceEvaluator, PresenceMonitor, PresenceState, PresenceStatus};
pub use protocol::*;
pub use router::{MessageRouter, Subscription};
pub use session::{
    PingReport, PresenceSession, SessionConfig, SessionEvent, SessionHandle, SessionSnapshot,
};
pub use transport::mqtt::MqttTransport;
pub use transport::Transport;
