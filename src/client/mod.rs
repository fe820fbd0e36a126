//! The `client` module defines the representation of a connected client.
//!
//! It provides `ClientSession`, which encapsulates one connection's identity,
//! subscription set and bounded outbound queue, and `SessionHandle`, the
//! lightweight identifier the transport holds on to.

pub mod session;
pub use session::{ClientId, ClientSession, DeliveryStatus, InflightMessage, SessionHandle};

#[cfg(test)]
mod tests;
