//! Mock implementations for testing
//!
//! [`MockTransport`] records every publish and subscribe in memory so the
//! channel and session layers can be tested without a broker.

use crate::protocol::{validate_filter, validate_topic_name};
use crate::transport::mqtt::{ConnectionState, MqttError};
use crate::transport::Transport;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// One recorded publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

impl PublishedMessage {
    pub fn payload_str(&self) -> String {
        String::from_utf8_lossy(&self.payload).to_string()
    }
}

/// Mock transport for testing; clones share recorded state
#[derive(Debug, Clone)]
pub struct MockTransport {
    published: Arc<Mutex<Vec<PublishedMessage>>>,
    subscriptions: Arc<Mutex<Vec<String>>>,
    state: Arc<Mutex<ConnectionState>>,
    should_fail: Arc<AtomicBool>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self {
            published: Arc::default(),
            subscriptions: Arc::default(),
            state: Arc::new(Mutex::new(ConnectionState::Connected)),
            should_fail: Arc::default(),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockTransport {
    /// Connected transport that accepts everything
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport that rejects every publish and subscribe
    pub fn with_failure() -> Self {
        let transport = Self::default();
        transport.set_failing(true);
        transport
    }

    pub fn set_failing(&self, failing: bool) {
        self.should_fail.store(failing, Ordering::SeqCst);
    }

    pub fn set_connection_state(&self, state: ConnectionState) {
        *lock(&self.state) = state;
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        lock(&self.published).clone()
    }

    pub fn published_to(&self, topic: &str) -> Vec<PublishedMessage> {
        lock(&self.published)
            .iter()
            .filter(|message| message.topic == topic)
            .cloned()
            .collect()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        lock(&self.subscriptions).clone()
    }

    pub fn clear_history(&self) {
        lock(&self.published).clear();
        lock(&self.subscriptions).clear();
    }

    fn check_failure(&self, operation: &str) -> Result<(), MqttError> {
        if self.should_fail.load(Ordering::SeqCst) {
            Err(MqttError::ConnectionFailed(format!("Mock {operation} failure")))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Error = MqttError;

    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), MqttError> {
        validate_topic_name(topic)?;
        self.check_failure("publish")?;
        lock(&self.published).push(PublishedMessage {
            topic: topic.to_string(),
            payload,
            retain,
        });
        Ok(())
    }

    async fn subscribe(&self, filter: &str) -> Result<(), MqttError> {
        validate_filter(filter)?;
        self.check_failure("subscribe")?;
        lock(&self.subscriptions).push(filter.to_string());
        Ok(())
    }

    fn connection_state(&self) -> ConnectionState {
        lock(&self.state).clone()
    }

    async fn disconnect(&self) -> Result<(), MqttError> {
        self.set_connection_state(ConnectionState::PermanentlyDisconnected(
            "Client disconnected".to_string(),
        ));
        Ok(())
    }
}
