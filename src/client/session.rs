//! Client session
//!
//! `ClientSession` models one connected client: its identity, the patterns it
//! subscribed to, and the sending side of a bounded per-connection queue the
//! transport drains onto the socket. Sessions are owned by the `Broker`;
//! the connection task only keeps the `SessionHandle` and the shutdown token.

use std::collections::{BTreeSet, HashMap};
use std::num::NonZeroU16;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::broker::topic;
use crate::transport::packet::{LastWill, Packet, Publish, QoS};

pub type ClientId = String;

/// Identifies one connection of a client. A reconnect with the same
/// `client_id` gets a new `session_id`, so stale handles can be detected.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionHandle {
    pub client_id: ClientId,
    pub session_id: Uuid,
}

/// A QoS > 0 delivery waiting for PUBACK (or PUBREC).
#[derive(Debug, Clone)]
pub struct InflightMessage {
    pub publish: Publish,
    pub sent_at: i64,
    pub retries: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    Queued,
    /// Outbound queue full; the packet was dropped.
    Full,
    /// The connection task is gone.
    Closed,
}

#[derive(Debug)]
pub struct ClientSession {
    pub handle: SessionHandle,
    pub username: Option<String>,
    pub last_will: Option<LastWill>,
    pub subscriptions: HashMap<String, QoS>,
    pub inflight: HashMap<NonZeroU16, InflightMessage>,
    /// `<namespace>/<user>/<device>` topics this session has reported on.
    pub reported_topics: BTreeSet<String>,
    sender: mpsc::Sender<Packet>,
    shutdown: CancellationToken,
    next_packet_id: u16,
    full_strikes: u32,
}

impl ClientSession {
    /// Create a session for `client_id` around the sender of its outbound
    /// queue.
    pub fn new(client_id: impl Into<ClientId>, sender: mpsc::Sender<Packet>) -> Self {
        Self {
            handle: SessionHandle {
                client_id: client_id.into(),
                session_id: Uuid::new_v4(),
            },
            username: None,
            last_will: None,
            subscriptions: HashMap::new(),
            inflight: HashMap::new(),
            reported_topics: BTreeSet::new(),
            sender,
            shutdown: CancellationToken::new(),
            next_packet_id: 0,
            full_strikes: 0,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.handle.client_id
    }

    /// Record `pattern` at `qos`. Subscribing again to the same pattern only
    /// replaces its level, so delivery is never duplicated.
    pub fn subscribe(&mut self, pattern: &str, qos: QoS) {
        self.subscriptions.insert(pattern.to_string(), qos);
    }

    pub fn unsubscribe(&mut self, pattern: &str) -> bool {
        self.subscriptions.remove(pattern).is_some()
    }

    /// Highest granted level among the patterns matching `topic_name`, or
    /// `None` when nothing matches. One value per session, however many
    /// patterns overlap.
    pub fn matching_qos(&self, topic_name: &str) -> Option<QoS> {
        self.subscriptions
            .iter()
            .filter(|(pattern, _)| topic::matches(pattern, topic_name))
            .map(|(_, qos)| *qos)
            .max()
    }

    /// Queue a packet without waiting. Never blocks the publisher.
    pub fn send(&mut self, packet: Packet) -> DeliveryStatus {
        match self.sender.try_send(packet) {
            Ok(()) => {
                self.full_strikes = 0;
                DeliveryStatus::Queued
            }
            Err(TrySendError::Full(_)) => {
                self.full_strikes += 1;
                DeliveryStatus::Full
            }
            Err(TrySendError::Closed(_)) => DeliveryStatus::Closed,
        }
    }

    /// Consecutive deliveries dropped because the queue was full.
    pub fn full_strikes(&self) -> u32 {
        self.full_strikes
    }

    /// Next free packet identifier, skipping ids still in flight.
    /// `None` once all 65535 ids are awaiting acknowledgement.
    pub fn next_packet_id(&mut self) -> Option<NonZeroU16> {
        for _ in 0..=u16::MAX {
            self.next_packet_id = self.next_packet_id.wrapping_add(1);
            if let Some(id) = NonZeroU16::new(self.next_packet_id) {
                if !self.inflight.contains_key(&id) {
                    return Some(id);
                }
            }
        }
        None
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Ask the connection task to close the transport.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled() || self.sender.is_closed()
    }
}
