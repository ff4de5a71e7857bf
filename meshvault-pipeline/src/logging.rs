//! Tracing subscriber setup

use crate::config::LoggingSettings;
use meshvault_core::{MeshVaultError, Result};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Install the global subscriber
///
/// `RUST_LOG` wins over `settings.level`. Returns `false` when a subscriber
/// was already installed, so tests can call this freely.
pub fn init_tracing(settings: &LoggingSettings) -> Result<bool> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&settings.level).map_err(|e| {
            MeshVaultError::Configuration(format!("invalid log level {:?}: {e}", settings.level))
        })?,
    };

    let registry = tracing_subscriber::registry().with(filter);
    let installed = if settings.json {
        registry
            .with(fmt::layer().json().with_target(true))
            .try_init()
    } else {
        registry.with(fmt::layer().with_target(true)).try_init()
    };
    Ok(installed.is_ok())
}
