//! The presence worker.
//!
//! One task owns the protocol handler, the tracker and the region list, so
//! every state mutation is serialized. It receives client publishes from the
//! broker's ingest channel, timer expiries from the tracker, and queries from
//! `PresenceHandle`s. Commands for the apps go back out through the broker.

use std::collections::HashMap;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::broker::{self, Message, SharedBroker};
use crate::config::PresenceSettings;
use crate::persistence::Persistence;
use crate::presence::model::{Location, User, normalize_key};
use crate::presence::regions::RegionRegistry;
use crate::presence::tracker::{Notification, PresenceTracker, TrackerTimers};
use crate::protocol::command;
use crate::protocol::handler::{Decoded, Event, ProtocolHandler};
use crate::protocol::payload::{UserCard, Waypoint};
use crate::transport::packet::QoS;
use crate::utils::error::ProtocolError;

const NOTIFICATION_CAPACITY: usize = 256;
const QUERY_CAPACITY: usize = 32;

/// Copies of the current records; never live references.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub users: Vec<User>,
    pub locations: Vec<Location>,
    pub regions: Vec<Waypoint>,
}

impl Snapshot {
    pub fn user(&self, key: &str) -> Option<&User> {
        self.users.iter().find(|u| u.key == key)
    }

    pub fn location(&self, key: &str) -> Option<&Location> {
        self.locations.iter().find(|l| l.key == key)
    }
}

#[derive(Debug)]
enum Query {
    Snapshot(oneshot::Sender<Snapshot>),
}

/// Cheap handle for talking to a running `PresenceService`.
#[derive(Debug, Clone)]
pub struct PresenceHandle {
    queries: mpsc::Sender<Query>,
    notifications: broadcast::Sender<Notification>,
}

impl PresenceHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }

    /// `None` once the service has stopped.
    pub async fn snapshot(&self) -> Option<Snapshot> {
        let (tx, rx) = oneshot::channel();
        self.queries.send(Query::Snapshot(tx)).await.ok()?;
        rx.await.ok()
    }
}

pub struct PresenceService {
    broker: SharedBroker,
    handler: ProtocolHandler,
    tracker: PresenceTracker,
    timers: TrackerTimers,
    regions: RegionRegistry,
    encryption_key: Option<String>,
    publish_regions: bool,
    cards: HashMap<String, UserCard>,
    ingest: mpsc::Receiver<Message>,
    queries: mpsc::Receiver<Query>,
    notifications: broadcast::Sender<Notification>,
}

impl PresenceService {
    /// Build the service and attach it to the broker's ingest channel.
    pub fn new(
        broker: SharedBroker,
        settings: PresenceSettings,
        store: Option<Persistence>,
    ) -> (Self, PresenceHandle) {
        let (namespace, ingest) = {
            let mut b = broker::lock(&broker);
            let (ingest_tx, ingest) = mpsc::channel(b.settings().ingest_queue.max(1));
            b.set_ingest(ingest_tx);
            (b.settings().namespace.clone(), ingest)
        };
        let (queries_tx, queries) = mpsc::channel(QUERY_CAPACITY);
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);

        let (tracker, timers) = PresenceTracker::new(&settings, store.clone());
        let service = Self {
            broker,
            handler: ProtocolHandler::new(namespace, settings.clone()),
            tracker,
            timers,
            regions: RegionRegistry::new(settings.regions.clone(), store),
            encryption_key: settings.encryption_key.clone(),
            publish_regions: settings.publish_regions,
            cards: settings
                .cards
                .iter()
                .map(|card| (normalize_key(&card.name), card.clone()))
                .collect(),
            ingest,
            queries,
            notifications: notifications.clone(),
        };
        let handle = PresenceHandle {
            queries: queries_tx,
            notifications,
        };
        (service, handle)
    }

    /// Runs until the broker's ingest channel closes.
    pub async fn run(mut self) {
        info!("Presence service started");
        loop {
            tokio::select! {
                msg = self.ingest.recv() => match msg {
                    Some(msg) => self.handle_message(msg),
                    None => break,
                },
                Some(expiry) = self.timers.inactivity.recv() => {
                    if let Some(n) = self.tracker.expire_inactivity(expiry) {
                        self.on_liveness_lost(&n);
                        self.notify(n);
                    }
                }
                Some(expiry) = self.timers.geofence.recv() => {
                    if let Some(n) = self.tracker.expire_geofence(expiry) {
                        self.notify(n);
                    }
                }
                Some(query) = self.queries.recv() => self.answer(query),
            }
        }
        info!("Presence service stopped");
    }

    fn handle_message(&mut self, msg: Message) {
        match self.handler.decode(&msg.topic, &msg.payload) {
            Ok(decoded) => self.apply(decoded),
            Err(e) => report(&msg.topic, e),
        }
    }

    fn apply(&mut self, decoded: Decoded) {
        let update = self.tracker.apply(&decoded);
        for n in update.notifications {
            self.notify(n);
        }

        if update.send_regions {
            self.send_regions(&decoded.reporter.base_topic);
            self.send_card(&decoded.reporter.key, &decoded.reporter.base_topic);
        }

        if let Event::RegionImport(waypoints) = decoded.event {
            info!("Region import from {}", decoded.reporter.display_name);
            if self.regions.merge(waypoints) {
                self.notify(Notification::RegionsChanged {
                    regions: self.regions.regions().to_vec(),
                });
                let targets: Vec<String> = self
                    .tracker
                    .users()
                    .filter_map(|u| u.base_topic.clone())
                    .collect();
                for base_topic in targets {
                    self.send_regions(&base_topic);
                }
            }
        }
    }

    /// Announce inactivity on the user's topic so subscribed apps see it.
    fn on_liveness_lost(&mut self, notification: &Notification) {
        let Notification::LivenessLost { user, .. } = notification else {
            return;
        };
        let Some(base_topic) = self.tracker.user(user).and_then(|u| u.base_topic.clone()) else {
            return;
        };
        match command::last_will(Utc::now().timestamp(), self.encryption_key.as_deref()) {
            Ok(payload) => {
                broker::lock(&self.broker).publish_internal(&base_topic, payload, QoS::AtMostOnce)
            }
            Err(e) => warn!("Could not build lwt for {}: {}", user, e),
        }
    }

    fn send_regions(&mut self, base_topic: &str) {
        if !self.publish_regions {
            return;
        }
        let topic = format!("{base_topic}/cmd");
        match command::set_waypoints(self.regions.regions(), self.encryption_key.as_deref()) {
            Ok(payload) => {
                info!("Sending {} regions to {}", self.regions.regions().len(), topic);
                broker::lock(&self.broker).publish_internal(&topic, payload, QoS::AtLeastOnce);
            }
            Err(e) => warn!("Could not build setWaypoints command: {}", e),
        }
    }

    /// Publish the configured avatar for `user` to `<base_topic>/info`.
    fn send_card(&self, user: &str, base_topic: &str) {
        let Some(card) = self.cards.get(user) else {
            return;
        };
        let topic = format!("{base_topic}/info");
        match command::card(card, self.encryption_key.as_deref()) {
            Ok(payload) => {
                debug!("Sending card of {} to {}", card.name, topic);
                broker::lock(&self.broker).publish_internal(&topic, payload, QoS::AtLeastOnce);
            }
            Err(e) => warn!("Could not build card for {}: {}", user, e),
        }
    }

    fn notify(&self, notification: Notification) {
        // no subscribers is fine
        let _ = self.notifications.send(notification);
    }

    fn answer(&self, query: Query) {
        match query {
            Query::Snapshot(reply) => {
                let snapshot = Snapshot {
                    users: self.tracker.users().cloned().collect(),
                    locations: self.tracker.locations().cloned().collect(),
                    regions: self.regions.regions().to_vec(),
                };
                let _ = reply.send(snapshot);
            }
        }
    }
}

fn report(topic: &str, err: ProtocolError) {
    match err {
        ProtocolError::Topic(_) => debug!("{}", err),
        ProtocolError::MissingKey => error!("{} (topic {})", err, topic),
        ProtocolError::Decrypt(_) => warn!("{} (topic {})", err, topic),
        ProtocolError::Parse(_) | ProtocolError::NestedEnvelope => {
            warn!("Dropping payload on {}: {}", topic, err)
        }
    }
}
