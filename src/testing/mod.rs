//! Testing utilities and mock implementations
//!
//! Lets the channel and session layers run without an MQTT broker, and the
//! MQTT transport run against a loopback one.

pub mod broker;
pub mod mocks;

pub use broker::{BrokerPacket, FakeBroker, FakeBrokerOptions};
pub use mocks::*;
