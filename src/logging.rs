//! Tracing subscriber installation
//!
//! Library code only emits `tracing` events; binaries and demos call one of
//! these helpers once at startup. `RUST_LOG` takes precedence over the
//! level passed in.

use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::{Error, Result};

/// Install a fmt subscriber filtering at `level` (e.g. `"info"`, `"protos_db=debug"`).
///
/// # Errors
///
/// Returns [`Error::InvalidConfig`] if the filter does not parse or a
/// global subscriber is already installed.
pub fn init(level: &str) -> Result<()> {
    let filter = match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(from_env) if !from_env.is_empty() => EnvFilter::try_new(from_env),
        _ => EnvFilter::try_new(level),
    }
    .map_err(|err| Error::InvalidConfig(format!("invalid log filter: {err}")))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|err| Error::InvalidConfig(format!("logging already initialized: {err}")))
}

/// Install a subscriber using `RUST_LOG`, defaulting to `info`.
///
/// # Errors
///
/// See [`init`].
pub fn init_from_env() -> Result<()> {
    init("info")
}

/// Install a subscriber at the configured `log_level`.
///
/// # Errors
///
/// See [`init`].
pub fn init_from_config(config: &Config) -> Result<()> {
    init(&config.log_level)
}
