//! MQTT v5 transport with buffering and automatic reconnection
//!
//! The module separates pure decisions from I/O:
//!
//! - [`connection`] - Connection state, backoff schedule and broker options
//! - [`pending`] - FIFO queue of operations submitted before the connection is ready
//! - [`health_monitor`] - Reconnection decisions and state transitions
//! - [`message_handler`] - Routing of rumqttc events
//! - [`client`] - The supervisor task and the cloneable transport handle
//!
//! # Usage
//!
//! ```rust,no_run
//! use relay_presence::config::{MqttSection, ReconnectSection};
//! use relay_presence::transport::{MqttTransport, Transport};
//! use std::time::Duration;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = MqttSection {
//!     broker_url: "mqtt://localhost:1883".to_string(),
//!     client_id_prefix: "relay-presence".to_string(),
//!     username_env: None,
//!     password_env: None,
//!     keep_alive_secs: 30,
//!     reconnect: ReconnectSection::default(),
//! };
//!
//! let (transport, mut inbound) = MqttTransport::start("dashboard-1", &config, None)?;
//! transport.subscribe("smarthome/+/status").await?;
//! transport.wait_until_connected(Duration::from_secs(10)).await?;
//! while let Some(message) = inbound.recv().await {
//!     println!("{} = {}", message.topic, message.payload_str());
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod connection;
pub mod health_monitor;
pub mod message_handler;
pub mod pending;

pub use client::MqttTransport;
pub use connection::{
    configure_mqtt_options, generate_client_id, ConnectionState, LastWillSpec, MqttError,
    ReconnectConfig,
};
pub use health_monitor::{ConnectionEvent, HealthMonitor, ReconnectionDecision};
pub use message_handler::{EventRoute, MessageHandler};
pub use pending::{PendingOp, PendingQueue, SubscriptionSet};
