//! The `broker` module routes publishes between client sessions.
//!
//! - `topic`: pattern validation and wildcard matching.
//! - `engine`: the session table, fan-out, acks and redelivery.
//! - `message`: what the broker hands to in-process consumers.

pub mod engine;
pub mod message;
pub mod topic;

pub use engine::{Broker, Credentials, DisconnectReason, Origin, SharedBroker, lock};
pub use message::Message;

#[cfg(test)]
mod tests;
