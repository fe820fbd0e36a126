//! # geobroker
//!
//! `geobroker` is a small MQTT 3.1.1 broker with a built-in presence tracker
//! for location-reporting phone apps. Devices publish location and region
//! enter/leave reports (plain or encrypted) to `<namespace>/<user>/<device>`
//! topics; the broker fans them out to subscribers and feeds them to the
//! presence tracker, which keeps per-user and per-location state.
//!
//! ## Core Modules
//!
//! - `broker`: sessions, topic matching, fan-out and QoS acknowledgements.
//! - `client`: one connected client and its outbound queue.
//! - `codec`: symmetric payload encryption.
//! - `config`: layered configuration loading.
//! - `persistence`: `sled` snapshots of users, locations and regions.
//! - `presence`: the enter/leave state machine and its service task.
//! - `protocol`: payload decoding into typed events, and outbound commands.
//! - `transport`: MQTT framing and the TCP/TLS/WebSocket listeners.
//! - `utils`: error types and logging setup.

pub mod broker;
pub mod client;
pub mod codec;
pub mod config;
pub mod persistence;
pub mod presence;
pub mod protocol;
pub mod transport;
pub mod utils;
