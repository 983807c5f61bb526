//! Bulk deletion and collection reset.
//!
//! Every operation here holds the exclusive side of the collection gate.
//! The database is changed first, in one transaction; in-memory state is
//! only touched once that commit has succeeded.

use std::collections::HashSet;

use tracing::info;

use chunkdex_core::error::Result;
use chunkdex_core::types::ChunkId;

use crate::collection::{Collection, Stores};

impl Collection {
    /// Remove every record, keeping the schema. Idempotent.
    pub async fn drop_data(&self) -> Result<()> {
        let stores = self.exclusive().await?;

        if let Some(repo) = &self.repo {
            self.retry
                .run("clear_chunks", || repo.clear_chunks(&self.name))
                .await?;
        }

        let removed = stores.metadata.len();
        stores.index.rebuild()?;
        stores.metadata.clear()?;

        info!(collection = %self.name, removed, "Collection data dropped");
        Ok(())
    }

    /// Destroy the collection and recreate it from configuration: empty
    /// stores, configured schema, fresh index. Ids keep counting upward.
    pub async fn drop_collection(&self) -> Result<()> {
        let mut stores = self.exclusive().await?;

        let schema = self.config.collection.schema()?;
        let replacement = Stores::empty(&self.config, schema);

        if let Some(repo) = &self.repo {
            let next_id = *self.writer.lock().await;
            let row = self.configured_row(next_id)?;
            self.retry.run("reset_collection", || repo.reset(&row)).await?;
        }

        *stores = replacement;
        info!(collection = %self.name, "Collection recreated");
        Ok(())
    }

    /// Delete every record matching `filter`. Returns how many were removed.
    pub async fn delete(&self, filter: &str) -> Result<usize> {
        let stores = self.exclusive().await?;
        let parsed = stores.metadata.parse_filter(filter)?;
        let ids = stores.metadata.matching_ids(&parsed)?;
        if ids.is_empty() {
            return Ok(0);
        }

        if let Some(repo) = &self.repo {
            self.retry
                .run("delete_chunks", || repo.delete_chunks(&self.name, &ids))
                .await?;
        }

        let doomed: HashSet<ChunkId> = ids.iter().copied().collect();
        let removed = stores.metadata.delete(|id, _| doomed.contains(&id))?;
        for id in &removed {
            stores.index.remove(*id)?;
        }

        info!(collection = %self.name, removed = removed.len(), "Records deleted");
        Ok(removed.len())
    }
}
