//! Cadence broker binary.
//!
//! Loads configuration, opens the store and serves the broker until a
//! shutdown signal arrives.

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use cadence_sched::{DriverKind, Server, ServerConfig};
use cadence_store::{Driver, MemoryDriver, RedbDriver};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config: ServerConfig = Figment::new()
        .merge(Toml::file("cadenced.toml"))
        .merge(Env::prefixed("CADENCE_").split("__"))
        .extract()?;

    info!(listen = %config.listen.url, "configuration loaded");

    let driver: Arc<dyn Driver> = match config.store.driver {
        DriverKind::Memory => Arc::new(MemoryDriver::new()),
        DriverKind::Redb => {
            info!(path = %config.store.path.display(), "opening job store");
            Arc::new(RedbDriver::open(&config.store.path)?)
        }
    };

    let shutdown = CancellationToken::new();
    let server = Server::new(&config, driver, shutdown.clone())?;

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            signal_token.cancel();
        }
    });

    if let Err(e) = server.serve().await {
        error!(error = %e, "broker exited with error");
        return Err(e.into());
    }
    Ok(())
}
