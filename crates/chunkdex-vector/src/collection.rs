//! The collection handle: one vector index and one metadata store kept in
//! step, optionally backed by SQLite.
//!
//! Locking:
//! - `state` is a gate. `add`, `search`, `query` and `get` hold its read side;
//!   maintenance holds the write side and may replace the stores outright.
//! - `writer` serializes the write phase of `add` and owns the id counter.
//! - `published` is the highest id whose writes have all committed. Readers
//!   ignore ids above it, so a record that is still being written (or is being
//!   rolled back) is never observed.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use chunkdex_core::config::ChunkdexConfig;
use chunkdex_core::error::{ChunkdexError, Result};
use chunkdex_core::types::{ChunkId, Schema};
use chunkdex_storage::{CollectionRepository, CollectionRow, Database};

use crate::embedding::DynEmbeddingService;
use crate::index::VectorIndex;
use crate::metadata::MetadataStore;
use crate::retry::RetryPolicy;

/// The two stores of a collection. Replaced wholesale by `drop_collection`.
#[derive(Debug)]
pub(crate) struct Stores {
    pub(crate) index: VectorIndex,
    pub(crate) metadata: MetadataStore,
}

impl Stores {
    pub(crate) fn empty(config: &ChunkdexConfig, schema: Schema) -> Self {
        Self {
            index: VectorIndex::new(
                config.collection.dimension,
                config.collection.metric,
                &config.index,
            ),
            metadata: MetadataStore::new(schema),
        }
    }
}

/// A named collection of embedded chunks.
pub struct Collection {
    pub(crate) name: String,
    pub(crate) config: ChunkdexConfig,
    pub(crate) embedder: Arc<dyn DynEmbeddingService>,
    pub(crate) repo: Option<CollectionRepository>,
    pub(crate) retry: RetryPolicy,
    pub(crate) state: RwLock<Stores>,
    /// Next id to allocate.
    pub(crate) writer: Mutex<ChunkId>,
    pub(crate) published: AtomicU64,
    closed: AtomicBool,
}

impl std::fmt::Debug for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection")
            .field("name", &self.name)
            .field("persistent", &self.repo.is_some())
            .field("published", &self.published.load(Ordering::Relaxed))
            .finish()
    }
}

impl Collection {
    /// Open (or create) the configured collection in `db` and rebuild its
    /// stores from the persisted chunks.
    pub fn open(
        config: ChunkdexConfig,
        db: Arc<Database>,
        embedder: Arc<dyn DynEmbeddingService>,
    ) -> Result<Self> {
        Self::check_config(&config, embedder.as_ref())?;
        let configured = config.collection.schema()?;
        let repo = CollectionRepository::new(db);
        let name = config.collection.name.clone();

        let (schema, stored_next) = match repo.find(&name)? {
            Some(row) => {
                if row.dimension != config.collection.dimension {
                    return Err(ChunkdexError::Config(format!(
                        "Collection '{}' has dimension {}, configuration says {}",
                        name, row.dimension, config.collection.dimension
                    )));
                }
                if row.metric != config.collection.metric {
                    return Err(ChunkdexError::Config(format!(
                        "Collection '{}' uses metric {}, configuration says {}",
                        name,
                        row.metric.as_str(),
                        config.collection.metric.as_str()
                    )));
                }
                if row.schema != configured {
                    warn!(
                        collection = %name,
                        "Stored schema differs from configuration; keeping stored schema until drop_collection"
                    );
                }
                (row.schema, row.next_id)
            }
            None => {
                repo.upsert(&CollectionRow {
                    name: name.clone(),
                    dimension: config.collection.dimension,
                    metric: config.collection.metric,
                    schema: configured.clone(),
                    next_id: 1,
                })?;
                info!(collection = %name, "Created collection");
                (configured, 1)
            }
        };

        let stores = Stores::empty(&config, schema);
        let mut next_id = stored_next.max(1);
        for record in repo.load_chunks(&name)? {
            stores.index.insert(record.id, record.embedding)?;
            stores
                .metadata
                .put(record.id, record.metadata)
                .map_err(|e| {
                    ChunkdexError::Storage(format!(
                        "Persisted chunk {} no longer validates: {}",
                        record.id, e
                    ))
                })?;
            next_id = next_id.max(record.id + 1);
        }

        info!(
            collection = %name,
            records = stores.metadata.len(),
            next_id,
            index = ?config.index.kind,
            "Collection opened"
        );

        let retry = RetryPolicy::from_config(&config.storage);
        Ok(Self::assemble(config, embedder, Some(repo), retry, stores, next_id))
    }

    /// Open an ephemeral collection that lives only in memory.
    pub fn open_in_memory(
        config: ChunkdexConfig,
        embedder: Arc<dyn DynEmbeddingService>,
    ) -> Result<Self> {
        Self::check_config(&config, embedder.as_ref())?;
        let stores = Stores::empty(&config, config.collection.schema()?);
        info!(collection = %config.collection.name, "In-memory collection opened");
        Ok(Self::assemble(
            config,
            embedder,
            None,
            RetryPolicy::none(),
            stores,
            1,
        ))
    }

    fn check_config(config: &ChunkdexConfig, embedder: &dyn DynEmbeddingService) -> Result<()> {
        config.validate()?;
        if embedder.dimensions() != config.collection.dimension {
            return Err(ChunkdexError::Config(format!(
                "Embedding service produces {} dimensions, collection expects {}",
                embedder.dimensions(),
                config.collection.dimension
            )));
        }
        Ok(())
    }

    fn assemble(
        config: ChunkdexConfig,
        embedder: Arc<dyn DynEmbeddingService>,
        repo: Option<CollectionRepository>,
        retry: RetryPolicy,
        stores: Stores,
        next_id: ChunkId,
    ) -> Self {
        Self {
            name: config.collection.name.clone(),
            config,
            embedder,
            repo,
            retry,
            state: RwLock::new(stores),
            writer: Mutex::new(next_id),
            published: AtomicU64::new(next_id - 1),
            closed: AtomicBool::new(false),
        }
    }

    /// Override the store retry policy.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Wait for in-flight operations and refuse new ones.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _exclusive = self.state.write().await;
        info!(collection = %self.name, "Collection closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ChunkdexConfig {
        &self.config
    }

    pub fn is_persistent(&self) -> bool {
        self.repo.is_some()
    }

    /// Schema currently enforced on writes.
    pub async fn schema(&self) -> Schema {
        self.state.read().await.metadata.schema().clone()
    }

    /// Number of visible records.
    pub async fn len(&self) -> Result<usize> {
        let stores = self.shared().await?;
        let watermark = self.watermark();
        Ok(stores.metadata.count(|id| id <= watermark))
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(ChunkdexError::Closed);
        }
        Ok(())
    }

    /// Shared side of the gate, after checking the handle is open.
    pub(crate) async fn shared(&self) -> Result<tokio::sync::RwLockReadGuard<'_, Stores>> {
        self.ensure_open()?;
        let guard = self.state.read().await;
        // close() may have won the race while we waited.
        self.ensure_open()?;
        Ok(guard)
    }

    /// Exclusive side of the gate, after checking the handle is open.
    pub(crate) async fn exclusive(&self) -> Result<tokio::sync::RwLockWriteGuard<'_, Stores>> {
        self.ensure_open()?;
        let guard = self.state.write().await;
        self.ensure_open()?;
        Ok(guard)
    }

    pub(crate) fn watermark(&self) -> ChunkId {
        self.published.load(Ordering::Acquire)
    }

    pub(crate) fn publish(&self, id: ChunkId) {
        self.published.store(id, Ordering::Release);
    }

    /// Row describing this collection as configured, carrying `next_id`.
    pub(crate) fn configured_row(&self, next_id: ChunkId) -> Result<CollectionRow> {
        Ok(CollectionRow {
            name: self.name.clone(),
            dimension: self.config.collection.dimension,
            metric: self.config.collection.metric,
            schema: self.config.collection.schema()?,
            next_id,
        })
    }
}
