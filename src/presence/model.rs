//! User and location records kept by the presence tracker.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::presence::history::History;
use crate::protocol::payload::{LocationReport, TransitionKind};

/// Canonical key for a user or region name: lower-cased, with whitespace
/// and `.` replaced by `_`.
pub fn normalize_key(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_whitespace() || c == '.' { '_' } else { c })
        .collect::<String>()
        .to_lowercase()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub user: String,
    pub user_name: String,
    pub location: String,
    pub location_name: String,
    pub event: TransitionKind,
    pub tst: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub key: String,
    pub display_name: String,
    /// `<namespace>/<identity>/<device>` the user last published under.
    pub base_topic: Option<String>,
    pub last_seen: i64,
    pub connected: bool,
    /// Key of the region the user is in.
    pub current_location: Option<String>,
    pub geofence: bool,
    pub entered_last: Option<String>,
    pub entered: Option<i64>,
    pub left_last: Option<String>,
    pub left: Option<i64>,
    pub position: Option<LocationReport>,
    pub history: History<TransitionRecord>,
    /// Regions were sent since the process started.
    #[serde(skip)]
    pub regions_sent: bool,
}

impl User {
    pub fn new(key: &str, display_name: &str, history_max: usize) -> Self {
        Self {
            key: key.to_string(),
            display_name: display_name.to_string(),
            base_topic: None,
            last_seen: 0,
            connected: false,
            current_location: None,
            geofence: false,
            entered_last: None,
            entered: None,
            left_last: None,
            left: None,
            position: None,
            history: History::new(history_max),
            regions_sent: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub key: String,
    pub display_name: String,
    pub users: BTreeSet<String>,
    pub presence: bool,
    pub geofence: bool,
    pub history: History<TransitionRecord>,
}

impl Location {
    pub fn new(key: &str, display_name: &str, history_max: usize) -> Self {
        Self {
            key: key.to_string(),
            display_name: display_name.to_string(),
            users: BTreeSet::new(),
            presence: false,
            geofence: false,
            history: History::new(history_max),
        }
    }

    /// Occupants as a comma-delimited string, in sorted order.
    pub fn users_string(&self) -> String {
        self.users.iter().cloned().collect::<Vec<_>>().join(",")
    }
}
