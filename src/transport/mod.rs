//! Transport layer for broker communication
//!
//! [`Transport`] is the seam the channel and session layers are written
//! against; [`mqtt`] provides the rumqttc implementation and
//! [`crate::testing::MockTransport`] an in-memory one.

use crate::transport::mqtt::ConnectionState;

pub mod mqtt;

/// Publish/subscribe transport
///
/// Operations are accepted even while the broker connection is down; they
/// are delivered once it is ready. An error means the operation was
/// rejected outright (invalid topic, transport closed).
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Publish a payload to a concrete topic
    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool)
        -> Result<(), Self::Error>;

    /// Subscribe to a topic filter; kept across reconnects
    async fn subscribe(&self, filter: &str) -> Result<(), Self::Error>;

    /// Get current connection state
    fn connection_state(&self) -> ConnectionState;

    /// Check if transport is currently connected
    fn is_connected(&self) -> bool {
        self.connection_state().is_connected()
    }

    /// Disconnect from the broker and stop reconnecting
    async fn disconnect(&self) -> Result<(), Self::Error>;
}

/// Type alias for MQTT transport
pub type MqttTransport = mqtt::MqttTransport;
