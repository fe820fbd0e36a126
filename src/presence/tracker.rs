//! Presence state machine
//!
//! Consumes decoded events and keeps user and location records consistent:
//! a user key is in a location's user set exactly when that user's
//! `current_location` is that location. Every transition updates the user
//! record first, then the location record, and appends to both histories.
//! Entering a location while still inside another one records an implicit
//! leave of the old location first.
//!
//! Two timer families run per user: inactivity (any event re-arms it; on
//! expiry the user is marked disconnected) and geofence debounce (armed on
//! enter; on expiry the geofence flags are cleared even if no leave came).

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn};

use crate::config::PresenceSettings;
use crate::persistence::Persistence;
use crate::presence::model::{Location, TransitionRecord, User, normalize_key};
use crate::presence::timers::{Expiry, TimerRegistry};
use crate::protocol::handler::{Decoded, Event, Reporter};
use crate::protocol::payload::{LocationReport, TransitionKind, TransitionReport, Waypoint};

type GeofenceKey = (String, String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LivenessCause {
    LastWill,
    Inactivity,
}

/// What changed, for in-process subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    LocationUpdated {
        user: String,
        report: LocationReport,
    },
    Transition(TransitionRecord),
    Reconnected {
        user: String,
    },
    LivenessLost {
        user: String,
        cause: LivenessCause,
    },
    GeofenceCleared {
        user: String,
        location: String,
    },
    RegionsChanged { regions: Vec<Waypoint> },
}

/// Result of applying one event.
#[derive(Debug, Default)]
pub struct Update {
    pub notifications: Vec<Notification>,
    /// The user should be sent the region list (first location report since
    /// start, or first after being disconnected).
    pub send_regions: bool,
}

/// Receivers for timer expiries; the owner feeds them back through
/// `expire_inactivity` and `expire_geofence`.
#[derive(Debug)]
pub struct TrackerTimers {
    pub inactivity: UnboundedReceiver<Expiry<String>>,
    pub geofence: UnboundedReceiver<Expiry<GeofenceKey>>,
}

#[derive(Debug)]
pub struct PresenceTracker {
    users: HashMap<String, User>,
    locations: HashMap<String, Location>,
    store: Option<Persistence>,
    inactivity_timeout: Duration,
    geofence_timeout: Duration,
    history_max: usize,
    inactivity: TimerRegistry<String>,
    geofence: TimerRegistry<GeofenceKey>,
}

impl PresenceTracker {
    pub fn new(settings: &PresenceSettings, store: Option<Persistence>) -> (Self, TrackerTimers) {
        let (inactivity, inactivity_rx) = TimerRegistry::new();
        let (geofence, geofence_rx) = TimerRegistry::new();
        let tracker = Self {
            users: HashMap::new(),
            locations: HashMap::new(),
            store,
            inactivity_timeout: settings.inactivity_timeout(),
            geofence_timeout: settings.geofence_timeout(),
            history_max: settings.history_max,
            inactivity,
            geofence,
        };
        let timers = TrackerTimers {
            inactivity: inactivity_rx,
            geofence: geofence_rx,
        };
        (tracker, timers)
    }

    pub fn user(&self, key: &str) -> Option<&User> {
        self.users.get(key)
    }

    pub fn location(&self, key: &str) -> Option<&Location> {
        self.locations.get(key)
    }

    pub fn users(&self) -> impl Iterator<Item = &User> {
        self.users.values()
    }

    pub fn locations(&self) -> impl Iterator<Item = &Location> {
        self.locations.values()
    }

    pub fn has_inactivity_timer(&self, user: &str) -> bool {
        self.inactivity.is_scheduled(&user.to_string())
    }

    /// Apply one decoded event.
    pub fn apply(&mut self, decoded: &Decoded) -> Update {
        let reporter = &decoded.reporter;
        match &decoded.event {
            Event::Ignored(kind) => {
                debug!("Ignoring {} payload from {}", kind, reporter.key);
                self.refresh(reporter)
            }
            Event::LastWill { tst } => self.lose_liveness(reporter, *tst),
            Event::LocationUpdate(report) => {
                let mut update = self.refresh(reporter);
                let user = self.user_entry(&reporter.key, &reporter.display_name);
                user.position = Some(report.clone());
                if !user.regions_sent {
                    user.regions_sent = true;
                    update.send_regions = true;
                }
                self.save_user(&reporter.key);
                update.notifications.push(Notification::LocationUpdated {
                    user: reporter.key.clone(),
                    report: report.clone(),
                });
                update
            }
            Event::Transition(report) => {
                let mut update = self.refresh(reporter);
                for record in self.transition(reporter, report) {
                    update.notifications.push(Notification::Transition(record));
                }
                update
            }
            Event::RegionImport(_) => self.refresh(reporter),
        }
    }

    fn user_entry(&mut self, key: &str, display_name: &str) -> &mut User {
        let store = &self.store;
        let history_max = self.history_max;
        self.users.entry(key.to_string()).or_insert_with(|| {
            let loaded = store.as_ref().and_then(|s| match s.load_user(key) {
                Ok(user) => user,
                Err(e) => {
                    warn!("Could not load user {}: {}", key, e);
                    None
                }
            });
            let mut user = loaded.unwrap_or_else(|| User::new(key, display_name, history_max));
            user.history.set_cap(history_max);
            user
        })
    }

    fn location_entry(&mut self, key: &str, display_name: &str) -> &mut Location {
        let store = &self.store;
        let history_max = self.history_max;
        self.locations.entry(key.to_string()).or_insert_with(|| {
            let loaded = store.as_ref().and_then(|s| match s.load_location(key) {
                Ok(location) => location,
                Err(e) => {
                    warn!("Could not load location {}: {}", key, e);
                    None
                }
            });
            let mut location =
                loaded.unwrap_or_else(|| Location::new(key, display_name, history_max));
            location.history.set_cap(history_max);
            location
        })
    }

    fn save_user(&self, key: &str) {
        if let (Some(store), Some(user)) = (&self.store, self.users.get(key)) {
            if let Err(e) = store.save_user(user) {
                warn!("Could not save user {}: {}", key, e);
            }
        }
    }

    fn save_location(&self, key: &str) {
        if let (Some(store), Some(location)) = (&self.store, self.locations.get(key)) {
            if let Err(e) = store.save_location(location) {
                warn!("Could not save location {}: {}", key, e);
            }
        }
    }

    /// Mark the reporter alive and re-arm its inactivity timer. A user coming
    /// back from being disconnected is due the region list again.
    fn refresh(&mut self, reporter: &Reporter) -> Update {
        let now = Utc::now().timestamp();
        let user = self.user_entry(&reporter.key, &reporter.display_name);
        let reconnected = !user.connected && user.last_seen > 0;
        user.display_name = reporter.display_name.clone();
        user.base_topic = Some(reporter.base_topic.clone());
        user.last_seen = now;
        user.connected = true;
        if reconnected {
            user.regions_sent = false;
        }

        self.inactivity
            .schedule(reporter.key.clone(), self.inactivity_timeout);
        self.save_user(&reporter.key);

        let mut update = Update::default();
        if reconnected {
            info!("User {} reconnected", reporter.display_name);
            update.notifications.push(Notification::Reconnected {
                user: reporter.key.clone(),
            });
        }
        update
    }

    fn lose_liveness(&mut self, reporter: &Reporter, tst: i64) -> Update {
        let user = self.user_entry(&reporter.key, &reporter.display_name);
        let was_connected = user.connected;
        user.connected = false;
        user.last_seen = user.last_seen.max(tst);
        user.base_topic = Some(reporter.base_topic.clone());
        self.inactivity.cancel(&reporter.key);
        self.save_user(&reporter.key);

        let mut update = Update::default();
        if was_connected {
            info!("User {} disconnected (last will)", reporter.display_name);
            update.notifications.push(Notification::LivenessLost {
                user: reporter.key.clone(),
                cause: LivenessCause::LastWill,
            });
        }
        update
    }

    /// Apply `report` and return the records it produced, oldest first.
    fn transition(&mut self, reporter: &Reporter, report: &TransitionReport) -> Vec<TransitionRecord> {
        let location_key = normalize_key(&report.desc);
        let mut records = Vec::with_capacity(2);

        if report.event == TransitionKind::Enter {
            let previous = self
                .users
                .get(&reporter.key)
                .and_then(|u| u.current_location.clone())
                .filter(|previous| *previous != location_key);
            if let Some(previous) = previous {
                records.push(self.vacate(reporter, &previous, report.tst));
            }
        }

        let record = TransitionRecord {
            user: reporter.key.clone(),
            user_name: reporter.display_name.clone(),
            location: location_key.clone(),
            location_name: report.desc.clone(),
            event: report.event,
            tst: report.tst,
        };

        // user record
        let user = self.user_entry(&reporter.key, &reporter.display_name);
        match report.event {
            TransitionKind::Enter => {
                info!("User {} entered location {}", reporter.display_name, report.desc);
                user.current_location = Some(location_key.clone());
                user.geofence = true;
                user.entered_last = Some(report.desc.clone());
                user.entered = Some(report.tst);
            }
            TransitionKind::Leave => {
                info!("User {} left location {}", reporter.display_name, report.desc);
                if user.current_location.as_deref() == Some(location_key.as_str()) {
                    user.current_location = None;
                }
                user.geofence = false;
                user.entered_last = None;
                user.entered = None;
                user.left_last = Some(report.desc.clone());
                user.left = Some(report.tst);
            }
        }
        user.history.push(record.clone());
        self.save_user(&reporter.key);

        // location record
        let geofence_key = (reporter.key.clone(), location_key.clone());
        let location = self.location_entry(&location_key, &report.desc);
        location.display_name = report.desc.clone();
        match report.event {
            TransitionKind::Enter => {
                location.users.insert(reporter.key.clone());
                location.geofence = true;
            }
            TransitionKind::Leave => {
                location.users.remove(&reporter.key);
                location.geofence = false;
            }
        }
        location.presence = !location.users.is_empty();
        location.history.push(record.clone());
        self.save_location(&location_key);

        match report.event {
            TransitionKind::Enter => self.geofence.schedule(geofence_key, self.geofence_timeout),
            TransitionKind::Leave => {
                self.geofence.cancel(&geofence_key);
            }
        }

        records.push(record);
        records
    }

    /// Record that the user left `previous` because they entered somewhere
    /// else, on both sides, as a regular leave would.
    fn vacate(&mut self, reporter: &Reporter, previous: &str, tst: i64) -> TransitionRecord {
        let location_name = self
            .locations
            .get(previous)
            .map_or_else(|| previous.to_string(), |l| l.display_name.clone());
        info!(
            "User {} left location {} (entered another)",
            reporter.display_name, location_name
        );
        let record = TransitionRecord {
            user: reporter.key.clone(),
            user_name: reporter.display_name.clone(),
            location: previous.to_string(),
            location_name: location_name.clone(),
            event: TransitionKind::Leave,
            tst,
        };

        let user = self.user_entry(&reporter.key, &reporter.display_name);
        user.current_location = None;
        user.geofence = false;
        user.entered_last = None;
        user.entered = None;
        user.left_last = Some(location_name.clone());
        user.left = Some(tst);
        user.history.push(record.clone());
        self.save_user(&reporter.key);

        let location = self.location_entry(previous, &location_name);
        location.users.remove(&reporter.key);
        location.geofence = false;
        location.presence = !location.users.is_empty();
        location.history.push(record.clone());
        self.save_location(previous);

        self.geofence
            .cancel(&(reporter.key.clone(), previous.to_string()));
        record
    }

    /// Handle an inactivity expiry. Emits `LivenessLost` once; a stale or
    /// repeated expiry yields nothing.
    pub fn expire_inactivity(&mut self, expiry: Expiry<String>) -> Option<Notification> {
        let key = self.inactivity.fire(expiry)?;
        let user = self.users.get_mut(&key)?;
        if !user.connected {
            return None;
        }
        user.connected = false;
        info!("User {} inactive, marking disconnected", user.display_name);
        self.save_user(&key);
        Some(Notification::LivenessLost {
            user: key,
            cause: LivenessCause::Inactivity,
        })
    }

    /// Handle a geofence debounce expiry. Clearing flags that are already
    /// false changes nothing and notifies nothing.
    pub fn expire_geofence(&mut self, expiry: Expiry<GeofenceKey>) -> Option<Notification> {
        let (user_key, location_key) = self.geofence.fire(expiry)?;
        self.clear_geofence(&user_key, &location_key)
    }

    pub fn clear_geofence(&mut self, user_key: &str, location_key: &str) -> Option<Notification> {
        let mut changed = false;
        if let Some(user) = self.users.get_mut(user_key) {
            if user.geofence {
                user.geofence = false;
                changed = true;
            }
        }
        if let Some(location) = self.locations.get_mut(location_key) {
            if location.geofence {
                location.geofence = false;
                changed = true;
            }
        }
        if !changed {
            return None;
        }
        debug!("Geofence of {} at {} expired", user_key, location_key);
        self.save_user(user_key);
        self.save_location(location_key);
        Some(Notification::GeofenceCleared {
            user: user_key.to_string(),
            location: location_key.to_string(),
        })
    }
}
