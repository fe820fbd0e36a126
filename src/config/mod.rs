mod settings;

use config::{Config, ConfigError, Environment, File};
use tracing::warn;

use settings::PartialSettings;

pub use settings::{BrokerSettings, PresenceSettings, ServerSettings, Settings, StorageSettings};

/// Default location of the optional configuration file (any extension the
/// `config` crate understands).
pub const DEFAULT_CONFIG_FILE: &str = "config/default";

/// Loads the configuration from the default file and environment variables.
pub fn load_config() -> Result<Settings, ConfigError> {
    load_config_from(DEFAULT_CONFIG_FILE)
}

/// Loads `path` (optional) and `GEOBROKER__SECTION__KEY` environment
/// variables, merging whatever is present over the defaults.
pub fn load_config_from(path: &str) -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name(path).required(false))
        .add_source(
            Environment::with_prefix("GEOBROKER")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("presence.client_region_whitelist"),
        );

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    // Merge with defaults
    let default = Settings::default();

    let settings = Settings {
        server: partial.server.unwrap_or_default().merge(default.server),
        broker: partial.broker.unwrap_or_default().merge(default.broker),
        presence: partial.presence.unwrap_or_default().merge(default.presence),
        storage: partial.storage.unwrap_or(default.storage),
    };

    if settings.presence.encryption_key.is_none() {
        warn!("No encryption key configured; clients should encrypt their payloads");
    }

    Ok(settings)
}
