//! Logging setup
//!
//! Installs a compact `tracing` fmt subscriber. `RUST_LOG` wins over the
//! configured level.

use crate::config::LoggingConfig;
use anyhow::{Context, Result, anyhow};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Install the global subscriber
///
/// Fails if one is already installed.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level)
            .with_context(|| format!("Invalid log level {:?}", config.level))?,
    };

    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .try_init()
        .map_err(|e| anyhow!("Logging already initialised: {}", e))?;

    tracing::debug!("Logging initialised (default level {})", config.level);
    Ok(())
}
