use bytes::Bytes;

use crate::client::ClientId;
use crate::transport::packet::QoS;

/// A publish as seen by in-process consumers of the broker.
///
/// Every message a client (or a client's will) publishes is handed to the
/// ingest channel in this form, in the order the broker accepted it.
///
/// # Fields
///
/// - `topic` - Concrete topic the message was published on.
/// - `payload` - Raw application payload.
/// - `qos` - Level the publisher asked for.
/// - `timestamp` - Unix milliseconds at which the broker accepted it.
/// - `client_id` - Publishing client, `None` for broker-internal publishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub timestamp: i64,
    pub client_id: Option<ClientId>,
}
