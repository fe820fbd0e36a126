//! Outbound payloads the service publishes to the apps.

use serde::Serialize;

use crate::codec;
use crate::protocol::payload::{UserCard, Waypoint};
use crate::utils::error::CommandError;

#[derive(Serialize)]
struct WaypointList<'a> {
    waypoints: &'a [Waypoint],
    #[serde(rename = "_type")]
    kind: &'static str,
}

#[derive(Serialize)]
struct SetWaypoints<'a> {
    #[serde(rename = "_type")]
    kind: &'static str,
    action: &'static str,
    waypoints: WaypointList<'a>,
}

#[derive(Serialize)]
struct Lwt {
    #[serde(rename = "_type")]
    kind: &'static str,
    tst: i64,
}

#[derive(Serialize)]
struct Card<'a> {
    #[serde(rename = "_type")]
    kind: &'static str,
    name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    face: Option<&'a str>,
}

#[derive(Serialize)]
struct Encrypted {
    #[serde(rename = "_type")]
    kind: &'static str,
    data: String,
}

/// `{"_type":"cmd","action":"setWaypoints","waypoints":{"waypoints":[..],"_type":"waypoints"}}`,
/// wrapped in the encrypted envelope when `key` is set.
pub fn set_waypoints(regions: &[Waypoint], key: Option<&str>) -> Result<Vec<u8>, CommandError> {
    let cmd = SetWaypoints {
        kind: "cmd",
        action: "setWaypoints",
        waypoints: WaypointList {
            waypoints: regions,
            kind: "waypoints",
        },
    };
    seal(serde_json::to_vec(&cmd)?, key)
}

/// The lwt announced on a user's topic when they go quiet.
pub fn last_will(tst: i64, key: Option<&str>) -> Result<Vec<u8>, CommandError> {
    seal(serde_json::to_vec(&Lwt { kind: "lwt", tst })?, key)
}

/// `{"_type":"card","name":..,"face":..}` for `<base_topic>/info`. A data URL
/// prefix on `face` is cut at the first comma.
pub fn card(card: &UserCard, key: Option<&str>) -> Result<Vec<u8>, CommandError> {
    let face = card
        .face
        .as_deref()
        .map(|face| face.split_once(',').map_or(face, |(_, data)| data));
    let payload = Card {
        kind: "card",
        name: &card.name,
        face,
    };
    seal(serde_json::to_vec(&payload)?, key)
}

fn seal(plain: Vec<u8>, key: Option<&str>) -> Result<Vec<u8>, CommandError> {
    match key {
        Some(key) => Ok(serde_json::to_vec(&Encrypted {
            kind: "encrypted",
            data: codec::encrypt(key, &plain)?,
        })?),
        None => Ok(plain),
    }
}
