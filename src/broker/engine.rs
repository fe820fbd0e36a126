//! Broker engine
//!
//! This module contains the in-memory broker responsible for:
//! - the session table (at most one live session per client id)
//! - authenticating CONNECTs against the configured credentials
//! - fan-out of publishes to every session with a matching pattern
//! - acknowledging publishers and tracking QoS>0 deliveries until acked
//! - handing every client publish to the bounded ingest channel
//! - raising a liveness-loss lwt for reporters whose session ends without
//!   a will
//!
//! Concurrency and usage notes:
//! - The API is synchronous and meant to sit behind `Arc<Mutex<Broker>>`.
//!   Nothing here awaits, so the lock is never held across network I/O.
//! - Outbound packets go through each session's bounded queue with
//!   `try_send`, so a slow subscriber never blocks a publisher. A session
//!   whose queue stays full is disconnected.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::message::Message;
use crate::broker::topic;
use crate::client::{ClientId, ClientSession, DeliveryStatus, InflightMessage, SessionHandle};
use crate::config::BrokerSettings;
use crate::protocol::command;
use crate::transport::packet::{Connect, Packet, Publish, QoS, SubscribeReturnCode};
use crate::utils::error::AuthError;

/// Highest delivery level granted to subscribers.
pub const SUPPORTED_QOS: QoS = QoS::ExactlyOnce;

pub type SharedBroker = Arc<Mutex<Broker>>;

/// Lock the shared broker. A panic while holding the lock leaves the table
/// usable, so poisoning is ignored.
pub fn lock(broker: &SharedBroker) -> MutexGuard<'_, Broker> {
    broker.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Who a publish comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    /// A connected client; gets PUBACK/PUBREC and is ingested.
    Client(SessionHandle),
    /// The will of a client that went away; ingested, never acked.
    Will(ClientId),
    /// Published by the service itself; neither acked nor ingested.
    Internal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Client sent DISCONNECT.
    Client,
    /// Socket error, protocol violation or keep-alive timeout.
    Transport,
    /// Outbound queue stayed full.
    SlowConsumer,
    /// Another connection took over the client id.
    Superseded,
}

impl DisconnectReason {
    fn publishes_will(self) -> bool {
        !matches!(self, DisconnectReason::Superseded)
    }
}

#[derive(Debug)]
pub struct Broker {
    sessions: HashMap<ClientId, ClientSession>,
    credentials: Option<Credentials>,
    settings: BrokerSettings,
    ingest: Option<mpsc::Sender<Message>>,
    ingest_dropped: u64,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(BrokerSettings::default(), None)
    }
}

impl Broker {
    pub fn new(settings: BrokerSettings, credentials: Option<Credentials>) -> Self {
        Self {
            sessions: HashMap::new(),
            credentials,
            settings,
            ingest: None,
            ingest_dropped: 0,
        }
    }

    pub fn into_shared(self) -> SharedBroker {
        Arc::new(Mutex::new(self))
    }

    /// Every accepted client publish (and will) is also sent to `tx`.
    /// When `tx` is full the message is dropped for ingest only.
    pub fn set_ingest(&mut self, tx: mpsc::Sender<Message>) {
        self.ingest = Some(tx);
    }

    /// Messages not ingested because the ingest queue was full.
    pub fn ingest_dropped(&self) -> u64 {
        self.ingest_dropped
    }

    fn ingest(&mut self, msg: Message) {
        let Some(ingest) = &self.ingest else {
            return;
        };
        match ingest.try_send(msg) {
            Ok(()) => {}
            Err(TrySendError::Full(msg)) => {
                self.ingest_dropped += 1;
                warn!(
                    "Ingest queue full; dropped message on {} ({} dropped so far)",
                    msg.topic, self.ingest_dropped
                );
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Ingest channel closed; message not forwarded");
            }
        }
    }

    pub fn settings(&self) -> &BrokerSettings {
        &self.settings
    }

    pub fn session(&self, client_id: &str) -> Option<&ClientSession> {
        self.sessions.get(client_id)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Register a session for `request`, replacing any live session with the
    /// same client id. Returns the handle and the token the connection task
    /// watches for being closed from this side.
    pub fn connect(
        &mut self,
        request: &Connect,
        sender: mpsc::Sender<Packet>,
    ) -> Result<(SessionHandle, CancellationToken), AuthError> {
        self.authenticate(request.username.as_deref(), request.password.as_deref())?;

        let client_id = if request.client_id.is_empty() {
            if !request.clean_session {
                return Err(AuthError::InvalidClientId);
            }
            format!("auto-{}", Uuid::new_v4())
        } else {
            request.client_id.clone()
        };

        if !self.sessions.contains_key(&client_id)
            && self.sessions.len() >= self.settings.max_connections
        {
            return Err(AuthError::ServerFull(self.settings.max_connections));
        }

        if let Some(previous) = self.sessions.get(&client_id).map(|s| s.handle.clone()) {
            info!("Client {} reconnected, closing previous session", client_id);
            self.disconnect(&previous, DisconnectReason::Superseded);
        }

        let mut session = ClientSession::new(client_id.clone(), sender);
        session.username = request.username.clone();
        session.last_will = request.last_will.clone();
        let handle = session.handle.clone();
        let token = session.shutdown_token();
        self.sessions.insert(client_id, session);

        info!("Client {} connected", handle.client_id);
        Ok((handle, token))
    }

    fn authenticate(&self, username: Option<&str>, password: Option<&[u8]>) -> Result<(), AuthError> {
        match &self.credentials {
            None => Ok(()),
            Some(expected) => {
                if username == Some(expected.username.as_str())
                    && password == Some(expected.password.as_bytes())
                {
                    Ok(())
                } else {
                    Err(AuthError::BadCredentials)
                }
            }
        }
    }

    fn live_session_mut(&mut self, handle: &SessionHandle) -> Option<&mut ClientSession> {
        self.sessions
            .get_mut(&handle.client_id)
            .filter(|s| s.handle.session_id == handle.session_id)
    }

    /// Record `pattern` for the session and return what was granted.
    pub fn subscribe(&mut self, handle: &SessionHandle, pattern: &str, qos: QoS) -> SubscribeReturnCode {
        if !topic::is_valid_pattern(pattern) {
            warn!("Client {} sent invalid pattern '{}'", handle.client_id, pattern);
            return SubscribeReturnCode::Failure;
        }
        match self.live_session_mut(handle) {
            Some(session) => {
                let granted = qos.min(SUPPORTED_QOS);
                session.subscribe(pattern, granted);
                debug!("{} subscribed to {} at {:?}", handle.client_id, pattern, granted);
                SubscribeReturnCode::Success(granted)
            }
            None => SubscribeReturnCode::Failure,
        }
    }

    pub fn unsubscribe(&mut self, handle: &SessionHandle, pattern: &str) -> bool {
        self.live_session_mut(handle)
            .map(|session| session.unsubscribe(pattern))
            .unwrap_or(false)
    }

    /// Acknowledge the publisher, hand the message to the ingest channel and
    /// deliver it to every session with a matching pattern, the publisher
    /// included. Each session gets one copy at
    /// `min(publish qos, highest matching granted qos)`.
    pub fn publish(&mut self, publish: Publish, origin: Origin) {
        if !topic::is_valid_topic(&publish.topic) {
            warn!("Dropping publish to invalid topic '{}'", publish.topic);
            return;
        }

        if let Origin::Client(handle) = &origin {
            if let Some(packet_id) = publish.packet_id {
                let ack = match publish.qos {
                    QoS::AtMostOnce => None,
                    QoS::AtLeastOnce => Some(Packet::PublishAck { packet_id }),
                    QoS::ExactlyOnce => Some(Packet::PublishReceived { packet_id }),
                };
                if let (Some(ack), Some(session)) = (ack, self.live_session_mut(handle)) {
                    session.send(ack);
                }
            }
            if let Some(base) = self.reporter_topic(&publish.topic) {
                if let Some(session) = self.live_session_mut(handle) {
                    session.reported_topics.insert(base);
                }
            }
        }

        let timestamp = Utc::now().timestamp_millis();
        let publisher = match &origin {
            Origin::Client(handle) => Some(handle.client_id.clone()),
            Origin::Will(client_id) => Some(client_id.clone()),
            Origin::Internal => None,
        };
        if let Some(client_id) = publisher {
            self.ingest(Message {
                topic: publish.topic.clone(),
                payload: publish.payload.clone(),
                qos: publish.qos,
                timestamp,
                client_id: Some(client_id),
            });
        }

        let max_strikes = self.settings.max_queue_strikes;
        let mut to_drop = Vec::new();

        for session in self.sessions.values_mut() {
            let Some(granted) = session.matching_qos(&publish.topic) else {
                continue;
            };
            let mut qos = publish.qos.min(granted);
            let mut packet_id = None;
            if qos > QoS::AtMostOnce {
                packet_id = session.next_packet_id();
                if packet_id.is_none() {
                    warn!(
                        "No free packet id for {}; delivering at QoS 0",
                        session.client_id()
                    );
                    qos = QoS::AtMostOnce;
                }
            }
            let outgoing = Publish {
                dup: false,
                retain: false,
                qos,
                topic: publish.topic.clone(),
                packet_id,
                payload: publish.payload.clone(),
            };
            if let Some(id) = packet_id {
                session.inflight.insert(
                    id,
                    InflightMessage {
                        publish: outgoing.clone(),
                        sent_at: timestamp,
                        retries: 0,
                    },
                );
            }

            match session.send(Packet::Publish(outgoing)) {
                DeliveryStatus::Queued => {}
                DeliveryStatus::Full => {
                    warn!(
                        "Outbound queue of {} is full ({} strikes)",
                        session.client_id(),
                        session.full_strikes()
                    );
                    if session.full_strikes() >= max_strikes {
                        to_drop.push((session.handle.clone(), DisconnectReason::SlowConsumer));
                    }
                }
                DeliveryStatus::Closed => {
                    to_drop.push((session.handle.clone(), DisconnectReason::Transport));
                }
            }
        }

        for (handle, reason) in to_drop {
            self.disconnect(&handle, reason);
        }
    }

    /// Queue `packet` on the session's outbound queue, behind anything
    /// already queued for it.
    pub fn send_to(&mut self, handle: &SessionHandle, packet: Packet) -> DeliveryStatus {
        match self.live_session_mut(handle) {
            Some(session) => session.send(packet),
            None => DeliveryStatus::Closed,
        }
    }

    /// PUBACK or PUBCOMP for a delivery to this session.
    pub fn handle_ack(&mut self, handle: &SessionHandle, packet_id: std::num::NonZeroU16) -> bool {
        match self.live_session_mut(handle) {
            Some(session) => session.inflight.remove(&packet_id).is_some(),
            None => false,
        }
    }

    /// PUBREC for a QoS 2 delivery: stop redelivering and release it.
    pub fn handle_received(&mut self, handle: &SessionHandle, packet_id: std::num::NonZeroU16) {
        if let Some(session) = self.live_session_mut(handle) {
            session.inflight.remove(&packet_id);
            session.send(Packet::PublishRelease { packet_id });
        }
    }

    /// Remove the session if `handle` is still the live one for its client
    /// id. Publishes the will unless the session was superseded.
    pub fn disconnect(&mut self, handle: &SessionHandle, reason: DisconnectReason) -> bool {
        let is_live = self
            .sessions
            .get(&handle.client_id)
            .is_some_and(|s| s.handle.session_id == handle.session_id);
        if !is_live {
            return false;
        }
        let Some(session) = self.sessions.remove(&handle.client_id) else {
            return false;
        };
        session.close();
        info!("Client {} disconnected ({:?})", handle.client_id, reason);

        if !reason.publishes_will() {
            return true;
        }
        match session.last_will {
            Some(will) => {
                debug!("Publishing will of {} on {}", handle.client_id, will.topic);
                let publish = Publish {
                    dup: false,
                    retain: false,
                    qos: will.qos,
                    topic: will.topic,
                    packet_id: None,
                    payload: will.message,
                };
                self.publish(publish, Origin::Will(handle.client_id.clone()));
            }
            None => self.ingest_liveness_lost(&handle.client_id, session.reported_topics),
        }
        true
    }

    /// First three levels of `topic` when it sits under the namespace.
    fn reporter_topic(&self, topic: &str) -> Option<String> {
        let mut levels = topic.split('/');
        let namespace = levels.next()?;
        let user = levels.next()?;
        let device = levels.next()?;
        (namespace == self.settings.namespace && !user.is_empty() && !device.is_empty())
            .then(|| format!("{namespace}/{user}/{device}"))
    }

    /// Tell ingest that a will-less session is gone by feeding it an lwt on
    /// every topic the session reported on. Nothing is delivered to
    /// subscribers.
    fn ingest_liveness_lost(&mut self, client_id: &ClientId, topics: BTreeSet<String>) {
        if topics.is_empty() {
            return;
        }
        let tst = Utc::now().timestamp();
        let payload = match command::last_will(tst, None) {
            Ok(payload) => Bytes::from(payload),
            Err(e) => {
                warn!("Could not build lwt for {}: {}", client_id, e);
                return;
            }
        };
        for topic in topics {
            debug!("Session of {} ended without a will; ingesting lwt for {}", client_id, topic);
            self.ingest(Message {
                topic,
                payload: payload.clone(),
                qos: QoS::AtMostOnce,
                timestamp: tst * 1000,
                client_id: Some(client_id.clone()),
            });
        }
    }

    /// Re-send deliveries not acked within `ack_timeout_ms`, with DUP set.
    /// Gives up on a delivery after `max_retries` re-sends.
    pub fn retry_pending(&mut self, now_ms: i64) {
        let timeout = self.settings.ack_timeout_ms;
        let max_retries = self.settings.max_retries;
        let mut closed = Vec::new();

        for session in self.sessions.values_mut() {
            let due: Vec<_> = session
                .inflight
                .iter()
                .filter(|(_, m)| now_ms - m.sent_at >= timeout)
                .map(|(id, _)| *id)
                .collect();

            for id in due {
                let Some(pending) = session.inflight.get_mut(&id) else {
                    continue;
                };
                if pending.retries >= max_retries {
                    session.inflight.remove(&id);
                    warn!(
                        "Delivery {} to {} dropped after {} retries",
                        id,
                        session.client_id(),
                        max_retries
                    );
                    continue;
                }
                pending.retries += 1;
                pending.sent_at = now_ms;
                let retry = pending.retries;
                let mut resend = pending.publish.clone();
                resend.dup = true;
                debug!("Re-sending {} to {} (retry {})", id, session.client_id(), retry);
                if session.send(Packet::Publish(resend)) == DeliveryStatus::Closed {
                    closed.push(session.handle.clone());
                    break;
                }
            }
        }

        for handle in closed {
            self.disconnect(&handle, DisconnectReason::Transport);
        }
    }

    pub async fn start_retry_loop(broker: SharedBroker) {
        let period = {
            let b = lock(&broker);
            Duration::from_millis((b.settings.ack_timeout_ms / 5).max(100) as u64)
        };
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            lock(&broker).retry_pending(Utc::now().timestamp_millis());
        }
    }

    /// Publish `payload` from the service itself.
    pub fn publish_internal(&mut self, topic: &str, payload: impl Into<Bytes>, qos: QoS) {
        self.publish(
            Publish {
                dup: false,
                retain: false,
                qos,
                topic: topic.to_string(),
                packet_id: None,
                payload: payload.into(),
            },
            Origin::Internal,
        );
    }
}
