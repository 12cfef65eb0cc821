//! Observability module for vaultlock.
//!
//! Structured logging through `tracing`. Logs go to stderr so command output
//! on stdout stays machine-readable.

use crate::config::ObservabilityConfig;
use crate::error::{Result, VaultError};
use ::tracing::debug;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize logging.
///
/// `RUST_LOG` takes precedence over the configured level.
pub fn init(config: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .map_err(|e| VaultError::InvalidConfig {
            field: "observability.log_level".to_string(),
            reason: e.to_string(),
        })?;

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
            .map_err(|e| VaultError::Internal(format!("Failed to init logging: {}", e)))?;
    } else {
        subscriber
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init()
            .map_err(|e| VaultError::Internal(format!("Failed to init logging: {}", e)))?;
    }

    debug!(level = %config.log_level, json = config.json_logs, "Logging initialized");
    Ok(())
}

