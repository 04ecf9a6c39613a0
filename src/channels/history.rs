//! Bounded log of issued commands and observed status changes

use crate::protocol::RelayState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};

/// Entries kept when no capacity is configured
pub const DEFAULT_HISTORY_CAPACITY: usize = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryKind {
    Command,
    Status,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub at: DateTime<Utc>,
    pub channel_id: String,
    pub kind: HistoryKind,
    pub state: RelayState,
}

/// Ring of the most recent entries, newest last
///
/// When a set of tracked channels is given, entries for other channels are
/// not recorded.
#[derive(Debug, Clone)]
pub struct CommandHistory {
    capacity: usize,
    entries: VecDeque<HistoryEntry>,
    tracked: BTreeSet<String>,
}

impl Default for CommandHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

impl CommandHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: VecDeque::with_capacity(capacity.max(1)),
            tracked: BTreeSet::new(),
        }
    }

    pub fn with_tracked_channels<I, S>(mut self, channel_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tracked = channel_ids.into_iter().map(Into::into).collect();
        self
    }

    /// Empty tracked set means every channel
    pub fn tracks(&self, channel_id: &str) -> bool {
        self.tracked.is_empty() || self.tracked.contains(channel_id)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn record_command(&mut self, channel_id: &str, state: RelayState, at: DateTime<Utc>) {
        if !self.tracks(channel_id) {
            return;
        }
        self.push(HistoryEntry {
            at,
            channel_id: channel_id.to_string(),
            kind: HistoryKind::Command,
            state,
        });
    }

    /// Record an observed status unless it repeats the channel's last one.
    /// Returns whether an entry was added.
    pub fn record_status(&mut self, channel_id: &str, state: RelayState, at: DateTime<Utc>) -> bool {
        if !self.tracks(channel_id) {
            return false;
        }
        let repeated = self
            .entries
            .iter()
            .rev()
            .find(|entry| entry.kind == HistoryKind::Status && entry.channel_id == channel_id)
            .is_some_and(|entry| entry.state == state);
        if repeated {
            return false;
        }

        self.push(HistoryEntry {
            at,
            channel_id: channel_id.to_string(),
            kind: HistoryKind::Status,
            state,
        });
        true
    }

    fn push(&mut self, entry: HistoryEntry) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    /// Oldest first
    pub fn entries(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.iter()
    }

    pub fn for_channel<'a>(&'a self, channel_id: &'a str) -> impl Iterator<Item = &'a HistoryEntry> {
        self.entries
            .iter()
            .filter(move |entry| entry.channel_id == channel_id)
    }

    pub fn to_vec(&self) -> Vec<HistoryEntry> {
        self.entries.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut history = CommandHistory::new(3);
        let now = Utc::now();
        for channel in ["a", "b", "c", "d"] {
            history.record_command(channel, RelayState::On, now);
        }

        assert_eq!(history.len(), 3);
        let channels: Vec<_> = history.entries().map(|e| e.channel_id.as_str()).collect();
        assert_eq!(channels, vec!["b", "c", "d"]);
    }

    #[test]
    fn test_default_capacity() {
        let history = CommandHistory::default();
        assert_eq!(history.capacity(), 80);
        assert!(history.is_empty());
    }

    #[test]
    fn test_zero_capacity_keeps_one_entry() {
        let mut history = CommandHistory::new(0);
        history.record_command("a", RelayState::On, Utc::now());
        history.record_command("b", RelayState::Off, Utc::now());
        assert_eq!(history.len(), 1);
        assert_eq!(history.to_vec()[0].channel_id, "b");
    }

    #[test]
    fn test_repeated_status_not_duplicated() {
        let mut history = CommandHistory::default();
        let now = Utc::now();

        assert!(history.record_status("lampu1", RelayState::On, now));
        assert!(!history.record_status("lampu1", RelayState::On, now));
        // Another channel's entry in between does not break the deduplication
        assert!(history.record_status("lampu2", RelayState::On, now));
        assert!(!history.record_status("lampu1", RelayState::On, now));
        assert!(history.record_status("lampu1", RelayState::Off, now));

        assert_eq!(history.for_channel("lampu1").count(), 2);
    }

    #[test]
    fn test_untracked_channels_not_recorded() {
        let mut history = CommandHistory::new(10).with_tracked_channels(["lampu1"]);
        let now = Utc::now();

        assert!(history.tracks("lampu1"));
        assert!(!history.tracks("lampu9"));
        assert!(!history.record_status("lampu9", RelayState::On, now));
        history.record_command("lampu9", RelayState::Off, now);
        assert!(history.record_status("lampu1", RelayState::On, now));

        let channels: Vec<_> = history.entries().map(|e| e.channel_id.as_str()).collect();
        assert_eq!(channels, vec!["lampu1"]);
    }

    #[test]
    fn test_commands_always_recorded() {
        let mut history = CommandHistory::default();
        let now = Utc::now();
        history.record_command("lampu1", RelayState::On, now);
        history.record_command("lampu1", RelayState::On, now);
        assert_eq!(history.len(), 2);
        assert!(history.entries().all(|e| e.kind == HistoryKind::Command));
    }

    #[test]
    fn test_entry_serialization() {
        let mut history = CommandHistory::default();
        history.record_status("lampu1", RelayState::Off, Utc::now());
        let json = serde_json::to_value(history.to_vec()).unwrap();
        assert_eq!(json[0]["kind"], "status");
        assert_eq!(json[0]["state"], "off");
        assert_eq!(json[0]["channel_id"], "lampu1");
    }
}
