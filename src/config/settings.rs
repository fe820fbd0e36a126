use std::fmt;
use std::time::Duration;

use serde::Deserialize;

use crate::protocol::payload::{UserCard, Waypoint};

/// Top-level configuration settings for the application.
///
/// Includes settings for the listeners, the broker, presence tracking and
/// storage.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    pub server: ServerSettings,
    pub broker: BrokerSettings,
    pub presence: PresenceSettings,
    pub storage: StorageSettings,
}

/// Configuration settings for the listeners.
///
/// When both `tls_cert` and `tls_key` are set the TCP listener speaks TLS and
/// the WebSocket listener (port + 1) speaks WSS; there is no mixed mode.
#[derive(Deserialize, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub websocket: bool,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub max_packet_size: u32,
}

impl ServerSettings {
    pub fn tls_enabled(&self) -> bool {
        self.tls_cert.is_some() && self.tls_key.is_some()
    }
}

impl fmt::Debug for ServerSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("websocket", &self.websocket)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("tls_cert", &self.tls_cert)
            .field("tls_key", &self.tls_key)
            .field("max_packet_size", &self.max_packet_size)
            .finish()
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1883,
            websocket: false,
            username: None,
            password: None,
            tls_cert: None,
            tls_key: None,
            max_packet_size: 256 * 1024,
        }
    }
}

/// Configuration settings for the broker.
///
/// Controls connection limits, outbound queue sizing and QoS redelivery.
#[derive(Debug, Deserialize, Clone)]
pub struct BrokerSettings {
    pub max_connections: usize,
    pub outbound_queue: usize,
    pub max_queue_strikes: u32,
    pub ack_timeout_ms: i64,
    pub max_retries: u8,
    pub namespace: String,
    pub ingest_queue: usize,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            max_connections: 1000,
            outbound_queue: 256,
            max_queue_strikes: 8,
            ack_timeout_ms: 5000,
            max_retries: 5,
            namespace: "owntracks".to_string(),
            ingest_queue: 1024,
        }
    }
}

/// Configuration settings for presence tracking and payload decoding.
#[derive(Deserialize, Clone)]
pub struct PresenceSettings {
    pub encryption_key: Option<String>,
    pub inactivity_timeout_secs: u64,
    pub geofence_timeout_mins: u64,
    pub history_max: usize,
    pub trust_client_regions: bool,
    pub client_region_whitelist: Vec<String>,
    pub publish_regions: bool,
    pub regions: Vec<Waypoint>,
    pub cards: Vec<UserCard>,
}

impl PresenceSettings {
    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.inactivity_timeout_secs)
    }

    pub fn geofence_timeout(&self) -> Duration {
        Duration::from_secs(self.geofence_timeout_mins * 60)
    }

    /// Whether `user_key` may replace the configured regions.
    pub fn may_import_regions(&self, user_key: &str) -> bool {
        self.trust_client_regions
            && (self.client_region_whitelist.is_empty()
                || self.client_region_whitelist.iter().any(|k| k == user_key))
    }
}

impl fmt::Debug for PresenceSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PresenceSettings")
            .field(
                "encryption_key",
                &self.encryption_key.as_ref().map(|_| "<redacted>"),
            )
            .field("inactivity_timeout_secs", &self.inactivity_timeout_secs)
            .field("geofence_timeout_mins", &self.geofence_timeout_mins)
            .field("history_max", &self.history_max)
            .field("trust_client_regions", &self.trust_client_regions)
            .field("client_region_whitelist", &self.client_region_whitelist)
            .field("publish_regions", &self.publish_regions)
            .field("regions", &self.regions.len())
            .field("cards", &self.cards.len())
            .finish()
    }
}

impl Default for PresenceSettings {
    fn default() -> Self {
        Self {
            encryption_key: None,
            inactivity_timeout_secs: 3600,
            geofence_timeout_mins: 15,
            history_max: 100,
            trust_client_regions: false,
            client_region_whitelist: Vec::new(),
            publish_regions: false,
            regions: Vec::new(),
            cards: Vec::new(),
        }
    }
}

/// Where user/location snapshots are kept. `None` keeps state in memory only.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct StorageSettings {
    pub path: Option<String>,
}

/// Partial configuration settings loaded from files or environment.
///
/// Any subset of settings may be given. Missing values are filled from
/// `Settings::default()`.
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub broker: Option<PartialBrokerSettings>,
    pub presence: Option<PartialPresenceSettings>,
    pub storage: Option<StorageSettings>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub websocket: Option<bool>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub max_packet_size: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialBrokerSettings {
    pub max_connections: Option<usize>,
    pub outbound_queue: Option<usize>,
    pub max_queue_strikes: Option<u32>,
    pub ack_timeout_ms: Option<i64>,
    pub max_retries: Option<u8>,
    pub namespace: Option<String>,
    pub ingest_queue: Option<usize>,
}

#[derive(Deserialize, Default)]
pub struct PartialPresenceSettings {
    pub encryption_key: Option<String>,
    pub inactivity_timeout_secs: Option<u64>,
    pub geofence_timeout_mins: Option<u64>,
    pub history_max: Option<usize>,
    pub trust_client_regions: Option<bool>,
    pub client_region_whitelist: Option<Vec<String>>,
    pub publish_regions: Option<bool>,
    pub regions: Option<Vec<Waypoint>>,
    pub cards: Option<Vec<UserCard>>,
}

impl fmt::Debug for PartialPresenceSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartialPresenceSettings")
            .field(
                "encryption_key",
                &self.encryption_key.as_ref().map(|_| "<redacted>"),
            )
            .finish_non_exhaustive()
    }
}

impl PartialServerSettings {
    pub fn merge(self, default: ServerSettings) -> ServerSettings {
        ServerSettings {
            host: self.host.unwrap_or(default.host),
            port: self.port.unwrap_or(default.port),
            websocket: self.websocket.unwrap_or(default.websocket),
            username: self.username.or(default.username),
            password: self.password.or(default.password),
            tls_cert: self.tls_cert.or(default.tls_cert),
            tls_key: self.tls_key.or(default.tls_key),
            max_packet_size: self.max_packet_size.unwrap_or(default.max_packet_size),
        }
    }
}

impl PartialBrokerSettings {
    pub fn merge(self, default: BrokerSettings) -> BrokerSettings {
        BrokerSettings {
            max_connections: self.max_connections.unwrap_or(default.max_connections),
            outbound_queue: self.outbound_queue.unwrap_or(default.outbound_queue),
            max_queue_strikes: self.max_queue_strikes.unwrap_or(default.max_queue_strikes),
            ack_timeout_ms: self.ack_timeout_ms.unwrap_or(default.ack_timeout_ms),
            max_retries: self.max_retries.unwrap_or(default.max_retries),
            namespace: self.namespace.unwrap_or(default.namespace),
            ingest_queue: self.ingest_queue.unwrap_or(default.ingest_queue),
        }
    }
}

impl PartialPresenceSettings {
    pub fn merge(self, default: PresenceSettings) -> PresenceSettings {
        PresenceSettings {
            encryption_key: self
                .encryption_key
                .filter(|k| !k.is_empty())
                .or(default.encryption_key),
            inactivity_timeout_secs: self
                .inactivity_timeout_secs
                .unwrap_or(default.inactivity_timeout_secs),
            geofence_timeout_mins: self
                .geofence_timeout_mins
                .unwrap_or(default.geofence_timeout_mins),
            history_max: self.history_max.unwrap_or(default.history_max),
            trust_client_regions: self
                .trust_client_regions
                .unwrap_or(default.trust_client_regions),
            client_region_whitelist: self
                .client_region_whitelist
                .unwrap_or(default.client_region_whitelist),
            publish_regions: self.publish_regions.unwrap_or(default.publish_regions),
            regions: self.regions.unwrap_or(default.regions),
            cards: self.cards.unwrap_or(default.cards),
        }
    }
}
