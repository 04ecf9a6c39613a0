use super::{lock_registry, Registry};
use crate::protocol::InboundMessage;
use std::sync::{Mutex, Weak};
use tokio::sync::mpsc;
use tracing::debug;

/// Handle to one router registration; dropping it unregisters
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    filter: String,
    receiver: mpsc::UnboundedReceiver<InboundMessage>,
    registry: Weak<Mutex<Registry>>,
}

impl Subscription {
    pub(crate) fn new(
        id: u64,
        filter: String,
        receiver: mpsc::UnboundedReceiver<InboundMessage>,
        registry: Weak<Mutex<Registry>>,
    ) -> Self {
        Self {
            id,
            filter,
            receiver,
            registry,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn filter(&self) -> &str {
        &self.filter
    }

    /// Wait for the next matching message. Returns `None` once the router
    /// has been dropped and all buffered messages were consumed.
    pub async fn recv(&mut self) -> Option<InboundMessage> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<InboundMessage> {
        self.receiver.try_recv().ok()
    }

    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            if lock_registry(&registry).remove(self.id) {
                debug!(filter = %self.filter, subscription_id = self.id, "Router subscription removed");
            }
        }
    }
}
