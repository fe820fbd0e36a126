//! Application payloads carried on the location topics.
//!
//! Decoded once, at the protocol boundary, into a closed sum type keyed by the
//! `_type` field. Downstream code never looks at raw JSON again.

use serde::{Deserialize, Serialize};

/// A region definition as exchanged with the apps (`waypoint`, `waypoints`,
/// `setWaypoints`). `tst` doubles as the region's identity when merging.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Waypoint {
    pub desc: String,
    pub lat: f64,
    pub lon: f64,
    pub rad: u32,
    pub tst: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rid: Option<String>,
}

/// Avatar shown by the apps for a user, published as `{"_type":"card"}`.
/// `face` is a base64 image and may still carry its `data:` URL prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserCard {
    pub name: String,
    #[serde(default)]
    pub face: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationReport {
    pub lat: f64,
    pub lon: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acc: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alt: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vel: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batt: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tid: Option<String>,
    /// Unix seconds. Filled with the receive time when the app omits it.
    #[serde(default)]
    pub tst: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransitionKind {
    Enter,
    Leave,
}

impl TransitionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransitionKind::Enter => "enter",
            TransitionKind::Leave => "leave",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionReport {
    pub desc: String,
    pub event: TransitionKind,
    #[serde(default)]
    pub tst: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lat: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lon: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acc: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tid: Option<String>,
}

/// Every payload kind the apps publish, plus `Unknown` for anything else.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "_type", rename_all = "lowercase")]
pub enum Payload {
    Location(LocationReport),
    Transition(TransitionReport),
    Lwt {
        #[serde(default)]
        tst: i64,
    },
    Encrypted {
        data: String,
    },
    Card {},
    Cmd {},
    Waypoint {},
    Waypoints {
        #[serde(default)]
        waypoints: Vec<Waypoint>,
    },
    #[serde(other)]
    Unknown,
}

impl Payload {
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Location(_) => "location",
            Payload::Transition(_) => "transition",
            Payload::Lwt { .. } => "lwt",
            Payload::Encrypted { .. } => "encrypted",
            Payload::Card {} => "card",
            Payload::Cmd {} => "cmd",
            Payload::Waypoint {} => "waypoint",
            Payload::Waypoints { .. } => "waypoints",
            Payload::Unknown => "unknown",
        }
    }
}
