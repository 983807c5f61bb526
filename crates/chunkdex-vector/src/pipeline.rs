//! Ingestion: encode, validate, then write the index, the metadata store and
//! the database as one unit.

use tracing::{debug, error, warn};

use chunkdex_core::error::{ChunkdexError, Result};
use chunkdex_core::types::{AttrValue, ChunkId, ChunkRecord, Metadata, VideoChunk, TEXT_FIELD};

use crate::collection::{Collection, Stores};

impl Collection {
    /// Embed `text` and store it with `metadata`. Returns the new id.
    ///
    /// Nothing is written unless the vector has the collection dimension and
    /// the metadata validates. If any write fails, the earlier writes are
    /// undone before the error is returned.
    pub async fn add(&self, text: &str, metadata: Metadata) -> Result<ChunkId> {
        self.ensure_open()?;
        let embedding = self.embedder.embed_boxed(text).await?;

        let stores = self.shared().await?;
        if embedding.len() != stores.index.dimension() {
            return Err(ChunkdexError::DimensionMismatch {
                expected: stores.index.dimension(),
                actual: embedding.len(),
            });
        }

        let mut metadata = metadata;
        if self.config.collection.retain_text {
            metadata.insert(TEXT_FIELD.to_string(), AttrValue::Str(text.to_string()));
        }
        let metadata = stores.metadata.schema().validate(metadata)?;

        let mut next_id = self.writer.lock().await;
        let id = *next_id;
        *next_id += 1;

        let record = ChunkRecord {
            id,
            embedding,
            metadata,
        };
        self.write_record(&stores, &record).await?;
        self.publish(id);

        debug!(collection = %self.name, id, "Chunk added");
        Ok(id)
    }

    /// Store a typed video-summary segment.
    pub async fn add_chunk(&self, text: &str, chunk: &VideoChunk) -> Result<ChunkId> {
        self.add(text, chunk.to_metadata()?).await
    }

    async fn write_record(&self, stores: &Stores, record: &ChunkRecord) -> Result<()> {
        stores.index.insert(record.id, record.embedding.clone())?;

        let written = match stores.metadata.put(record.id, record.metadata.clone()) {
            Ok(()) => match &self.repo {
                Some(repo) => {
                    self.retry
                        .run("insert_chunk", || repo.insert_chunk(&self.name, record))
                        .await
                }
                None => Ok(()),
            },
            Err(e) => Err(e),
        };

        if let Err(e) = written {
            warn!(collection = %self.name, id = record.id, error = %e, "Add failed, rolling back");
            self.roll_back(stores, record.id);
            return Err(e);
        }
        Ok(())
    }

    /// Undo a partial add. Returns false if either store could not be
    /// reverted, in which case the two stores disagree about `id`.
    fn roll_back(&self, stores: &Stores, id: ChunkId) -> bool {
        let mut reverted = true;
        if let Err(e) = stores.metadata.remove(id) {
            error!(collection = %self.name, id, error = %e, "Metadata rollback failed");
            reverted = false;
        }
        if let Err(e) = stores.index.remove(id) {
            error!(collection = %self.name, id, error = %e, "Index rollback failed");
            reverted = false;
        }
        reverted
    }
}
