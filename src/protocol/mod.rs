//! The `protocol` module decodes location-tracking payloads.
//!
//! - `payload`: the `_type`-tagged payload kinds.
//! - `handler`: topic to reporter, decryption and dispatch into `Event`s.
//! - `command`: payloads published back to the apps.

pub mod command;
pub mod handler;
pub mod payload;

pub use handler::{Decoded, Event, ProtocolHandler, Reporter};
