use chrono::Utc;
use tracing::debug;

use crate::codec;
use crate::config::PresenceSettings;
use crate::presence::model::normalize_key;
use crate::protocol::payload::{LocationReport, Payload, TransitionReport, Waypoint};
use crate::utils::error::ProtocolError;

/// Topic suffixes the apps publish under; no suffix carries location and lwt.
pub const KNOWN_SUFFIXES: [&str; 6] = ["cmd", "event", "info", "step", "beacon", "dump"];

/// Who published a payload, derived from `<namespace>/<identity>/<device>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reporter {
    pub display_name: String,
    pub key: String,
    /// First three topic levels; commands go to `<base_topic>/cmd`.
    pub base_topic: String,
}

impl Reporter {
    pub fn from_topic(namespace: &str, topic: &str) -> Result<Self, ProtocolError> {
        let levels: Vec<&str> = topic.split('/').collect();
        let shape_ok = match levels.as_slice() {
            [ns, identity, device] => *ns == namespace && !identity.is_empty() && !device.is_empty(),
            [ns, identity, device, suffix] => {
                *ns == namespace
                    && !identity.is_empty()
                    && !device.is_empty()
                    && KNOWN_SUFFIXES.contains(suffix)
            }
            _ => false,
        };
        if !shape_ok {
            return Err(ProtocolError::Topic(topic.to_string()));
        }

        let display_name = levels[2].to_string();
        Ok(Self {
            key: normalize_key(&display_name),
            base_topic: levels[..3].join("/"),
            display_name,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    LocationUpdate(LocationReport),
    Transition(TransitionReport),
    /// Liveness lost, either the broker-published will or an app-sent lwt.
    LastWill { tst: i64 },
    /// Client-submitted region list, only produced when the reporter may
    /// define regions.
    RegionImport(Vec<Waypoint>),
    /// Recognised or unknown kinds that carry nothing for presence.
    Ignored(&'static str),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    pub reporter: Reporter,
    pub event: Event,
    /// The payload arrived inside an encrypted envelope.
    pub encrypted: bool,
}

/// Turns one published message into a typed `Event`.
///
/// Stateless apart from configuration, so a failure never leaves anything
/// half-applied.
#[derive(Debug, Clone)]
pub struct ProtocolHandler {
    namespace: String,
    settings: PresenceSettings,
}

impl ProtocolHandler {
    pub fn new(namespace: impl Into<String>, settings: PresenceSettings) -> Self {
        Self {
            namespace: namespace.into(),
            settings,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn decode(&self, topic: &str, payload: &[u8]) -> Result<Decoded, ProtocolError> {
        let reporter = Reporter::from_topic(&self.namespace, topic)?;

        let mut payload: Payload = serde_json::from_slice(payload)?;
        let mut encrypted = false;

        if let Payload::Encrypted { data } = &payload {
            let key = self
                .settings
                .encryption_key
                .as_deref()
                .ok_or(ProtocolError::MissingKey)?;
            let plain = codec::decrypt(key, data)?;
            payload = serde_json::from_slice(&plain)?;
            if matches!(payload, Payload::Encrypted { .. }) {
                return Err(ProtocolError::NestedEnvelope);
            }
            encrypted = true;
        }

        debug!(
            "Received {} {} payload from {} ({})",
            if encrypted { "encrypted" } else { "unencrypted" },
            payload.kind(),
            reporter.display_name,
            reporter.key
        );

        let event = self.dispatch(&reporter, payload);
        Ok(Decoded {
            reporter,
            event,
            encrypted,
        })
    }

    fn dispatch(&self, reporter: &Reporter, payload: Payload) -> Event {
        let now = Utc::now().timestamp();
        match payload {
            Payload::Location(mut report) => {
                if report.tst == 0 {
                    report.tst = now;
                }
                Event::LocationUpdate(report)
            }
            Payload::Transition(mut report) => {
                if report.tst == 0 {
                    report.tst = now;
                }
                Event::Transition(report)
            }
            Payload::Lwt { tst } => Event::LastWill {
                tst: if tst == 0 { now } else { tst },
            },
            Payload::Waypoints { waypoints } if self.settings.may_import_regions(&reporter.key) => {
                Event::RegionImport(waypoints)
            }
            other => Event::Ignored(other.kind()),
        }
    }
}
