use thiserror::Error;

/// Top-level error type for chunkdex.
///
/// Caller bugs (`DimensionMismatch`, `InvalidFilter`, `InvalidMetadata`,
/// `InvalidArgument`) are never retried. `StoreUnavailable` is what a
/// transient storage failure becomes once the retry budget is spent.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ChunkdexError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    #[error("Invalid metadata: {0}")]
    InvalidMetadata(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Collection is closed")]
    Closed,
}

impl ChunkdexError {
    /// Whether the failure may succeed if the same operation is attempted again.
    pub fn is_transient(&self) -> bool {
        matches!(self, ChunkdexError::StoreUnavailable(_))
    }
}

impl From<toml::de::Error> for ChunkdexError {
    fn from(err: toml::de::Error) -> Self {
        ChunkdexError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for ChunkdexError {
    fn from(err: toml::ser::Error) -> Self {
        ChunkdexError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for ChunkdexError {
    fn from(err: serde_json::Error) -> Self {
        ChunkdexError::Serialization(err.to_string())
    }
}

/// A specialized `Result` type for chunkdex operations.
pub type Result<T> = std::result::Result<T, ChunkdexError>;
