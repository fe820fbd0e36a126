//! The `presence` module turns decoded events into user and location state.
//!
//! - `model`: user, location and transition records.
//! - `history`: capped append-only history.
//! - `timers`: per-key cancelable timers.
//! - `tracker`: the enter/leave state machine with inactivity and geofence
//!   debounce.
//! - `regions`: the region list and client region import.
//! - `service`: the task that owns all of the above.

pub mod history;
pub mod model;
pub mod regions;
pub mod service;
pub mod timers;
pub mod tracker;

pub use model::{Location, TransitionRecord, User, normalize_key};
pub use service::{PresenceHandle, PresenceService, Snapshot};
pub use tracker::{LivenessCause, Notification, PresenceTracker};
