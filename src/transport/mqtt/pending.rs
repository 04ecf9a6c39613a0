//! Operations buffered while the broker connection is not ready
//!
//! [`PendingQueue`] preserves submission order across disconnections.
//! [`SubscriptionSet`] remembers every filter the broker has accepted a
//! subscribe for, so a clean-start reconnect can re-issue them.

use bytes::Bytes;
use std::collections::VecDeque;

/// A publish or subscribe waiting for a connected client
#[derive(Debug, Clone, PartialEq)]
pub enum PendingOp {
    Publish {
        topic: String,
        payload: Bytes,
        retain: bool,
    },
    Subscribe {
        filter: String,
    },
}

impl PendingOp {
    pub fn topic(&self) -> &str {
        match self {
            PendingOp::Publish { topic, .. } => topic,
            PendingOp::Subscribe { filter } => filter,
        }
    }
}

/// FIFO buffer of operations submitted before the connection was ready
#[derive(Debug, Default)]
pub struct PendingQueue {
    ops: VecDeque<PendingOp>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: PendingOp) {
        self.ops.push_back(op);
    }

    /// Put back an operation the client could not accept, keeping it first
    pub fn requeue_front(&mut self, op: PendingOp) {
        self.ops.push_front(op);
    }

    pub fn pop(&mut self) -> Option<PendingOp> {
        self.ops.pop_front()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Issue queued operations in order until `issue` refuses one
    ///
    /// A refused operation stays at the head of the queue. Returns the
    /// number of operations issued.
    pub fn flush<F>(&mut self, mut issue: F) -> usize
    where
        F: FnMut(&PendingOp) -> bool,
    {
        let mut issued = 0;
        while let Some(op) = self.ops.pop_front() {
            if issue(&op) {
                issued += 1;
            } else {
                self.ops.push_front(op);
                break;
            }
        }
        issued
    }
}

/// Filters to re-issue after every reconnect, in first-subscribe order
#[derive(Debug, Default, Clone)]
pub struct SubscriptionSet {
    filters: Vec<String>,
}

impl SubscriptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when the filter was already tracked
    pub fn insert(&mut self, filter: &str) -> bool {
        if self.contains(filter) {
            return false;
        }
        self.filters.push(filter.to_string());
        true
    }

    pub fn contains(&self, filter: &str) -> bool {
        self.filters.iter().any(|existing| existing == filter)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.filters.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}
