//! Collection and chunk persistence.
//!
//! A collection row records the definition (`dimension`, `metric`, schema)
//! and the next id to allocate. Chunk rows hold the embedding as a
//! little-endian `f32` blob and the metadata as JSON.

use std::sync::Arc;

use rusqlite::{params, OptionalExtension};
use tracing::debug;

use chunkdex_core::error::{ChunkdexError, Result};
use chunkdex_core::types::{ChunkId, ChunkRecord, Metadata, Metric, Schema};

use crate::db::{sqlite_error, Database};

/// Persisted definition of a collection.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionRow {
    pub name: String,
    pub dimension: usize,
    pub metric: Metric,
    pub schema: Schema,
    /// Next id to hand out; never decreases.
    pub next_id: ChunkId,
}

/// Repository for collection definitions and their chunks.
#[derive(Debug, Clone)]
pub struct CollectionRepository {
    db: Arc<Database>,
}

impl CollectionRepository {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Fetch a collection definition by name.
    pub fn find(&self, name: &str) -> Result<Option<CollectionRow>> {
        self.db.with_conn(|conn| {
            let raw = conn
                .query_row(
                    "SELECT name, dimension, metric, schema_json, next_id
                     FROM collections WHERE name = ?1",
                    params![name],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, i64>(4)?,
                        ))
                    },
                )
                .optional()
                .map_err(|e| sqlite_error("Failed to load collection", e))?;

            match raw {
                Some((name, dimension, metric, schema_json, next_id)) => Ok(Some(CollectionRow {
                    name,
                    dimension: dimension as usize,
                    metric: Metric::parse(&metric)?,
                    schema: serde_json::from_str(&schema_json)?,
                    next_id: next_id as ChunkId,
                })),
                None => Ok(None),
            }
        })
    }

    /// Create or overwrite a collection definition without touching its chunks.
    pub fn upsert(&self, row: &CollectionRow) -> Result<()> {
        let schema_json = serde_json::to_string(&row.schema)?;
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO collections (name, dimension, metric, schema_json, next_id)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(name) DO UPDATE SET
                    dimension = excluded.dimension,
                    metric = excluded.metric,
                    schema_json = excluded.schema_json,
                    next_id = MAX(collections.next_id, excluded.next_id)",
                params![
                    row.name,
                    row.dimension as i64,
                    row.metric.as_str(),
                    schema_json,
                    row.next_id as i64,
                ],
            )
            .map_err(|e| sqlite_error("Failed to save collection", e))?;
            Ok(())
        })
    }

    /// Store one chunk and advance the collection's id counter past it.
    pub fn insert_chunk(&self, collection: &str, record: &ChunkRecord) -> Result<()> {
        let metadata_json = serde_json::to_string(&record.metadata)?;
        let blob = encode_embedding(&record.embedding);

        self.db.with_transaction(|tx| {
            tx.execute(
                "INSERT INTO chunks (collection, id, embedding, metadata) VALUES (?1, ?2, ?3, ?4)",
                params![collection, record.id as i64, blob, metadata_json],
            )
            .map_err(|e| sqlite_error("Failed to save chunk", e))?;

            let updated = tx
                .execute(
                    "UPDATE collections SET next_id = MAX(next_id, ?2) WHERE name = ?1",
                    params![collection, record.id as i64 + 1],
                )
                .map_err(|e| sqlite_error("Failed to advance id counter", e))?;
            if updated == 0 {
                return Err(ChunkdexError::Storage(format!(
                    "Collection '{}' is not persisted",
                    collection
                )));
            }
            Ok(())
        })?;

        debug!(collection, id = record.id, "Chunk persisted");
        Ok(())
    }

    /// Load every chunk of a collection in ascending id order.
    pub fn load_chunks(&self, collection: &str) -> Result<Vec<ChunkRecord>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, embedding, metadata FROM chunks
                     WHERE collection = ?1 ORDER BY id ASC",
                )
                .map_err(|e| sqlite_error("Failed to prepare chunk scan", e))?;

            let rows = stmt
                .query_map(params![collection], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, Vec<u8>>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })
                .map_err(|e| sqlite_error("Failed to scan chunks", e))?;

            let mut records = Vec::new();
            for row in rows {
                let (id, blob, metadata_json) =
                    row.map_err(|e| sqlite_error("Failed to read chunk row", e))?;
                let metadata: Metadata = serde_json::from_str(&metadata_json)?;
                records.push(ChunkRecord {
                    id: id as ChunkId,
                    embedding: decode_embedding(&blob)?,
                    metadata,
                });
            }
            Ok(records)
        })
    }

    /// Delete the given chunk ids in one transaction. Returns rows removed.
    pub fn delete_chunks(&self, collection: &str, ids: &[ChunkId]) -> Result<usize> {
        self.db.with_transaction(|tx| {
            let mut stmt = tx
                .prepare("DELETE FROM chunks WHERE collection = ?1 AND id = ?2")
                .map_err(|e| sqlite_error("Failed to prepare delete", e))?;
            let mut removed = 0;
            for id in ids {
                removed += stmt
                    .execute(params![collection, *id as i64])
                    .map_err(|e| sqlite_error("Failed to delete chunk", e))?;
            }
            Ok(removed)
        })
    }

    /// Delete every chunk of a collection, keeping its definition.
    pub fn clear_chunks(&self, collection: &str) -> Result<usize> {
        self.db.with_conn(|conn| {
            conn.execute(
                "DELETE FROM chunks WHERE collection = ?1",
                params![collection],
            )
            .map_err(|e| sqlite_error("Failed to clear chunks", e))
        })
    }

    /// Replace a collection with an empty one defined by `row`, atomically.
    ///
    /// The id counter never moves backwards.
    pub fn reset(&self, row: &CollectionRow) -> Result<()> {
        let schema_json = serde_json::to_string(&row.schema)?;
        self.db.with_transaction(|tx| {
            tx.execute(
                "DELETE FROM chunks WHERE collection = ?1",
                params![row.name],
            )
            .map_err(|e| sqlite_error("Failed to drop chunks", e))?;

            tx.execute(
                "INSERT INTO collections (name, dimension, metric, schema_json, next_id)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(name) DO UPDATE SET
                    dimension = excluded.dimension,
                    metric = excluded.metric,
                    schema_json = excluded.schema_json,
                    next_id = MAX(collections.next_id, excluded.next_id),
                    created_at = strftime('%s', 'now')",
                params![
                    row.name,
                    row.dimension as i64,
                    row.metric.as_str(),
                    schema_json,
                    row.next_id as i64,
                ],
            )
            .map_err(|e| sqlite_error("Failed to recreate collection", e))?;
            Ok(())
        })
    }

    /// Number of persisted chunks in a collection.
    pub fn count_chunks(&self, collection: &str) -> Result<u64> {
        self.db.with_conn(|conn| {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM chunks WHERE collection = ?1",
                    params![collection],
                    |row| row.get(0),
                )
                .map_err(|e| sqlite_error("Failed to count chunks", e))?;
            Ok(count as u64)
        })
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }
}

/// Serialize an embedding as little-endian `f32`s.
pub fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Inverse of [`encode_embedding`].
pub fn decode_embedding(blob: &[u8]) -> Result<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return Err(ChunkdexError::Storage(format!(
            "Embedding blob length {} is not a multiple of 4",
            blob.len()
        )));
    }
    Ok(blob
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}
