//! Tracing subscriber setup for binaries.
//!
//! The library only emits `tracing` events; installing a subscriber is left
//! to the executable.

use crate::config::{LogFormat, LoggingConfig};
use crate::error::{AicError, AicResult};
use tracing_subscriber::EnvFilter;

/// Filter from `RUST_LOG`, falling back to the configured level.
pub fn env_filter(config: &LoggingConfig) -> AicResult<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.level).map_err(|e| {
            AicError::Configuration(format!("Invalid log level '{}': {e}", config.level))
        }),
    }
}

/// Install the global fmt subscriber.
pub fn init_tracing(config: &LoggingConfig) -> AicResult<()> {
    let filter = env_filter(config)?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    let installed = match config.format {
        LogFormat::Pretty => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };

    installed.map_err(|e| AicError::Configuration(format!("Failed to install subscriber: {e}")))
}
