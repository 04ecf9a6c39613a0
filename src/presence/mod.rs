//! Device presence evaluation
//!
//! Derives a liveness verdict for one device from an unordered, at-most-once
//! stream of presence signals (retained `online`, last-will `offline`,
//! heartbeats) combined with a periodic timeout check.

pub mod evaluator;
pub mod monitor;

pub use evaluator::{
    PresenceEvaluator, PresenceSignal, PresenceSource, PresenceState, PresenceStatus,
    SignalKind, StickinessPolicy, LAST_WILL_REASON,
};
pub use monitor::{PresenceMonitor, PresenceTransition};
