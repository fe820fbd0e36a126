//! CLI for geobroker
//!
//! Subcommands:
//! - `server`: run the broker and presence tracker
//! - `encrypt` / `decrypt`: apply the payload codec to a message

use clap::Parser;
use geobroker::broker::{Broker, Credentials};
use geobroker::codec;
use geobroker::config::{Settings, load_config, load_config_from};
use geobroker::persistence::Persistence;
use geobroker::presence::PresenceService;
use geobroker::transport::server;
use geobroker::utils::error::StartupError;
use geobroker::utils::logging;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "geobroker")]
enum Command {
    /// Start the broker
    Server {
        /// Configuration file (without extension is fine)
        #[arg(long)]
        config: Option<String>,
        /// Log level used when RUST_LOG is not set
        #[arg(long, default_value = "info")]
        log_level: String,
    },
    /// Encrypt a message the way devices do
    Encrypt {
        #[arg(long)]
        key: String,
        message: String,
    },
    /// Decrypt a base64 payload produced by a device or `encrypt`
    Decrypt {
        #[arg(long)]
        key: String,
        data: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    match Command::parse() {
        Command::Server { config, log_level } => {
            logging::init(&log_level);
            if let Err(e) = run_server(config.as_deref()).await {
                error!("Server failed: {}", e);
                return Err(e.into());
            }
        }
        Command::Encrypt { key, message } => {
            println!("{}", codec::encrypt(&key, message.as_bytes())?);
        }
        Command::Decrypt { key, data } => {
            let plain = codec::decrypt(&key, &data)?;
            println!("{}", String::from_utf8_lossy(&plain));
        }
    }
    Ok(())
}

async fn run_server(config_path: Option<&str>) -> Result<(), StartupError> {
    let settings: Settings = match config_path {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    info!("Loaded configuration: {:?}", settings);

    let credentials = match (&settings.server.username, &settings.server.password) {
        (Some(username), Some(password)) => Some(Credentials {
            username: username.clone(),
            password: password.clone(),
        }),
        (None, None) => None,
        _ => {
            warn!("Only one of username/password is set; authentication disabled");
            None
        }
    };

    let store = match &settings.storage.path {
        Some(path) => Some(Persistence::open(path)?),
        None => None,
    };

    let broker = Broker::new(settings.broker.clone(), credentials).into_shared();
    let (presence, _handle) = PresenceService::new(broker.clone(), settings.presence.clone(), store.clone());

    tokio::spawn(presence.run());
    tokio::spawn(Broker::start_retry_loop(broker.clone()));

    let result = tokio::select! {
        res = server::run(settings.server.clone(), broker) => {
            if res.is_ok() {
                error!("Listeners exited unexpectedly.");
            }
            res
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Exiting gracefully.");
            Ok(())
        }
    };

    if let Some(store) = store {
        if let Err(e) = store.flush() {
            warn!("Could not flush storage: {}", e);
        }
    }
    result
}
