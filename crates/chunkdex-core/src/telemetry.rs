//! Tracing subscriber setup.

use tracing_subscriber::EnvFilter;

use crate::error::{ChunkdexError, Result};

/// Install a global fmt subscriber.
///
/// `RUST_LOG` takes precedence over `default_level`. Fails if a global
/// subscriber is already installed.
pub fn init_tracing(default_level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .map_err(|e| ChunkdexError::Config(format!("Invalid log level: {}", e)))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| ChunkdexError::Config(format!("Tracing already initialized: {}", e)))
}
