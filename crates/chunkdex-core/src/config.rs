use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{ChunkdexError, Result};
use crate::types::{FieldSpec, IndexKind, Metric, Schema, VideoChunk};

/// Top-level chunkdex configuration.
///
/// Loaded from a TOML file. Every section falls back to its defaults, so a
/// partial (or empty) file is valid.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkdexConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub collection: CollectionConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

impl ChunkdexConfig {
    /// Load configuration from a TOML file.
    ///
    /// Returns an error if the file cannot be read, parsed, or fails validation.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ChunkdexConfig = toml::from_str(&content)?;
        config.validate()?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Load configuration, falling back to defaults if the file is missing or invalid.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    "Failed to load config from {}: {}. Using defaults.",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Save the current configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        info!("Configuration saved to {}", path.display());
        Ok(())
    }

    /// Reject values no collection could be built from.
    pub fn validate(&self) -> Result<()> {
        if self.collection.name.trim().is_empty() {
            return Err(ChunkdexError::Config("collection.name is empty".into()));
        }
        if self.collection.dimension == 0 {
            return Err(ChunkdexError::Config(
                "collection.dimension must be positive".into(),
            ));
        }
        if self.index.m < 2 {
            return Err(ChunkdexError::Config("index.m must be at least 2".into()));
        }
        if self.index.ef_construction == 0 || self.index.ef_search == 0 {
            return Err(ChunkdexError::Config(
                "index.ef_construction and index.ef_search must be positive".into(),
            ));
        }
        if self.search.max_top_k == 0 || self.search.default_top_k == 0 {
            return Err(ChunkdexError::Config(
                "search.default_top_k and search.max_top_k must be positive".into(),
            ));
        }
        if self.storage.retry_attempts == 0 {
            return Err(ChunkdexError::Config(
                "storage.retry_attempts must be at least 1".into(),
            ));
        }
        self.collection.schema()?;
        Ok(())
    }

    /// Path of the SQLite file inside the data directory.
    pub fn db_path(&self) -> PathBuf {
        expand_home(&self.general.data_dir).join(&self.storage.db_file)
    }
}

/// Expand a leading `~/` using `HOME` (or `USERPROFILE` on Windows).
fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        let home = std::env::var("HOME").or_else(|_| std::env::var("USERPROFILE"));
        if let Ok(home) = home {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}

/// General settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Directory holding the SQLite database.
    pub data_dir: String,
    /// Log level: trace, debug, info, warn, error.
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: "~/.chunkdex/data".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Collection definition: name, vector shape, and attribute schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionConfig {
    pub name: String,
    /// Embedding dimension; must match the embedding service.
    pub dimension: usize,
    pub metric: Metric,
    /// Store the source text as the `text` attribute.
    pub retain_text: bool,
    /// Declared attributes. Defaults to the video-chunk layout.
    pub fields: Vec<FieldSpec>,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            name: "summary_till_now".to_string(),
            dimension: 384,
            metric: Metric::Cosine,
            retain_text: true,
            fields: VideoChunk::schema_fields(),
        }
    }
}

impl CollectionConfig {
    /// Build the validated schema, including `text` when it is retained.
    pub fn schema(&self) -> Result<Schema> {
        let schema = Schema::new(self.fields.clone())?;
        Ok(if self.retain_text {
            schema.with_text_field()
        } else {
            schema
        })
    }
}

/// Vector index parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// "flat" (exact scan) or "hnsw".
    pub kind: IndexKind,
    /// HNSW: neighbors per node on upper layers (layer 0 keeps 2 * m).
    pub m: usize,
    /// HNSW: candidate list size while inserting.
    pub ef_construction: usize,
    /// HNSW: candidate list size while searching (raised to k when smaller).
    pub ef_search: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            kind: IndexKind::Hnsw,
            m: 16,
            ef_construction: 200,
            ef_search: 64,
        }
    }
}

/// Search settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Number of results when the caller does not specify one.
    pub default_top_k: usize,
    /// Upper bound applied to caller-supplied top_k.
    pub max_top_k: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_top_k: 5,
            max_top_k: 100,
        }
    }
}

/// Persistence and retry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite file name inside `general.data_dir`.
    pub db_file: String,
    /// Attempts for a store write that fails transiently (first try included).
    pub retry_attempts: u32,
    /// Delay before the first retry.
    pub retry_initial_backoff_ms: u64,
    /// Cap on the exponentially growing delay.
    pub retry_max_backoff_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_file: "chunkdex.db".to_string(),
            retry_attempts: 3,
            retry_initial_backoff_ms: 50,
            retry_max_backoff_ms: 1_000,
        }
    }
}

impl StorageConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_max_backoff_ms)
    }
}
