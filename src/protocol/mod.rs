//! Topic and payload conventions for relay presence and control

pub mod messages;
pub mod topics;

pub use messages::*;
pub use topics::*;
