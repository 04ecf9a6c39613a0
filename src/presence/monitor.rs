//! Stateful wrapper owning the presence state of one device

use super::evaluator::{
    PresenceEvaluator, PresenceSignal, PresenceSource, PresenceState, PresenceStatus,
};
use crate::protocol::InboundMessage;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// A change of the derived status, or of the reason an offline device is
/// considered offline
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceTransition {
    pub previous: PresenceStatus,
    pub current: PresenceStatus,
    pub source: PresenceSource,
    pub reason: Option<String>,
}

/// Owns the [`PresenceState`] of one device and applies the evaluator to it
#[derive(Debug)]
pub struct PresenceMonitor {
    topic: String,
    evaluator: PresenceEvaluator,
    state: PresenceState,
}

impl PresenceMonitor {
    pub fn new(topic: impl Into<String>, evaluator: PresenceEvaluator) -> Self {
        Self {
            topic: topic.into(),
            evaluator,
            state: PresenceState::new(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn state(&self) -> &PresenceState {
        &self.state
    }

    pub fn evaluator(&self) -> &PresenceEvaluator {
        &self.evaluator
    }

    /// Apply a message received on the presence topic
    pub fn handle_message(&mut self, message: InboundMessage) -> Option<PresenceTransition> {
        if message.topic != self.topic {
            warn!(
                topic = %message.topic,
                expected = %self.topic,
                "Ignoring message delivered to presence monitor for another topic"
            );
            return None;
        }
        self.apply_signal(&PresenceSignal::from(message))
    }

    pub fn apply_signal(&mut self, signal: &PresenceSignal) -> Option<PresenceTransition> {
        debug!(
            topic = %signal.topic,
            payload = %signal.payload_str(),
            retained = signal.retained,
            "Presence signal received"
        );
        let next = self.evaluator.on_signal(&self.state, signal);
        self.replace(next)
    }

    /// Periodic timeout evaluation
    pub fn tick(&mut self, now: Instant) -> Option<PresenceTransition> {
        let next = self.evaluator.on_tick(&self.state, now);
        self.replace(next)
    }

    fn replace(&mut self, next: PresenceState) -> Option<PresenceTransition> {
        let previous = self.state.status;
        let previous_source = self.state.source;
        self.state = next;

        let offline_cause_changed = previous == PresenceStatus::Offline
            && self.state.status == PresenceStatus::Offline
            && previous_source != self.state.source;
        if previous == self.state.status && !offline_cause_changed {
            return None;
        }

        info!(
            topic = %self.topic,
            from = %previous,
            to = %self.state.status,
            source = ?self.state.source,
            reason = self.state.reason.as_deref().unwrap_or(""),
            "Presence changed"
        );

        Some(PresenceTransition {
            previous,
            current: self.state.status,
            source: self.state.source,
            reason: self.state.reason.clone(),
        })
    }
}
