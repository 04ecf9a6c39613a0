//! Topic-filter fan-out of inbound messages
//!
//! Every subscription owns an unbounded channel. [`MessageRouter::dispatch`]
//! takes a snapshot of the registry and sends one copy of the message to
//! every subscription whose filter matches, so subscriptions added or
//! dropped by a consumer while a dispatch is running never invalidate the
//! iteration. Nothing is queued for subscriptions registered later.

mod subscription;

pub use subscription::Subscription;

use crate::protocol::{topic_matches, validate_filter, InboundMessage, TopicError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, trace};

#[derive(Debug, Clone)]
struct Route {
    id: u64,
    filter: String,
    sender: mpsc::UnboundedSender<InboundMessage>,
}

#[derive(Debug, Default)]
pub(crate) struct Registry {
    next_id: u64,
    routes: Vec<Route>,
}

impl Registry {
    pub(crate) fn remove(&mut self, id: u64) -> bool {
        let before = self.routes.len();
        self.routes.retain(|route| route.id != id);
        before != self.routes.len()
    }
}

pub(crate) fn lock_registry(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Subscription registry; clones share the same registry
#[derive(Debug, Clone, Default)]
pub struct MessageRouter {
    registry: Arc<Mutex<Registry>>,
}

impl MessageRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in every topic matched by `filter`
    ///
    /// Dropping the returned [`Subscription`] unregisters it.
    pub fn subscribe(&self, filter: &str) -> Result<Subscription, TopicError> {
        validate_filter(filter)?;

        let (sender, receiver) = mpsc::unbounded_channel();
        let id = {
            let mut registry = lock_registry(&self.registry);
            let id = registry.next_id;
            registry.next_id += 1;
            registry.routes.push(Route {
                id,
                filter: filter.to_string(),
                sender,
            });
            id
        };

        debug!(filter = %filter, subscription_id = id, "Router subscription added");
        Ok(Subscription::new(
            id,
            filter.to_string(),
            receiver,
            Arc::downgrade(&self.registry),
        ))
    }

    /// Deliver `message` to every matching subscription, returning the
    /// number of deliveries
    pub fn dispatch(&self, message: &InboundMessage) -> usize {
        let snapshot: Vec<Route> = lock_registry(&self.registry).routes.clone();

        let mut delivered = 0;
        let mut closed = Vec::new();
        for route in snapshot
            .iter()
            .filter(|route| topic_matches(&route.filter, &message.topic))
        {
            if route.sender.send(message.clone()).is_ok() {
                delivered += 1;
            } else {
                closed.push(route.id);
            }
        }

        if !closed.is_empty() {
            let mut registry = lock_registry(&self.registry);
            for id in closed {
                registry.remove(id);
            }
        }

        trace!(
            topic = %message.topic,
            retained = message.retained,
            delivered,
            "Dispatched inbound message"
        );
        delivered
    }

    pub fn subscription_count(&self) -> usize {
        lock_registry(&self.registry).routes.len()
    }

    /// Filters of all live subscriptions, in registration order
    pub fn filters(&self) -> Vec<String> {
        lock_registry(&self.registry)
            .routes
            .iter()
            .map(|route| route.filter.clone())
            .collect()
    }
}
