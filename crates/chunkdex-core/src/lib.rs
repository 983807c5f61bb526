//! chunkdex core - shared data model, errors, configuration, and filters.

pub mod config;
pub mod error;
pub mod filter;
pub mod telemetry;
pub mod time;
pub mod types;

pub use config::ChunkdexConfig;
pub use error::{ChunkdexError, Result};
pub use filter::Filter;
pub use types::*;
