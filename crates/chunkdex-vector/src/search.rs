//! Similarity search and attribute queries.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use chunkdex_core::error::{ChunkdexError, Result};
use chunkdex_core::types::{ChunkId, Metadata};

use crate::collection::Collection;

/// One ranked result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub metadata: Metadata,
    /// Distance under the collection metric; smaller is closer.
    pub distance: f32,
}

/// An id the index returned but the metadata store does not know.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorruptionSignal {
    pub id: ChunkId,
}

/// Ranked hits, closest first, plus any index entries that could not be joined.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchResults {
    pub hits: Vec<SearchHit>,
    pub corruption: Vec<CorruptionSignal>,
}

impl SearchResults {
    pub fn len(&self) -> usize {
        self.hits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    /// True when every index hit had a metadata row.
    pub fn is_consistent(&self) -> bool {
        self.corruption.is_empty()
    }
}

impl Collection {
    /// The `top_k` records closest to `query_text`.
    ///
    /// `top_k` must be positive and is clamped to `search.max_top_k`.
    pub async fn search(&self, query_text: &str, top_k: usize) -> Result<SearchResults> {
        if top_k == 0 {
            return Err(ChunkdexError::InvalidArgument(
                "top_k must be at least 1".into(),
            ));
        }
        let k = top_k.min(self.config.search.max_top_k);

        self.ensure_open()?;
        let query = self.embedder.embed_boxed(query_text).await?;

        let stores = self.shared().await?;
        let watermark = self.watermark();
        let neighbors = stores
            .index
            .search_where(&query, k, &|id| id <= watermark)?;

        let mut results = SearchResults::default();
        for neighbor in neighbors {
            match stores.metadata.get(neighbor.id) {
                Some(metadata) => results.hits.push(SearchHit {
                    metadata,
                    distance: neighbor.distance,
                }),
                None => {
                    warn!(
                        collection = %self.name,
                        id = neighbor.id,
                        "Index entry has no metadata row; skipping"
                    );
                    results.corruption.push(CorruptionSignal { id: neighbor.id });
                }
            }
        }

        debug!(collection = %self.name, k, hits = results.hits.len(), "Search complete");
        Ok(results)
    }

    /// Search with `search.default_top_k`.
    pub async fn search_default(&self, query_text: &str) -> Result<SearchResults> {
        self.search(query_text, self.config.search.default_top_k).await
    }

    /// Rows matching `filter`, projected onto `fields` (empty means all
    /// declared fields), in id order. The id itself is never returned.
    pub async fn query(&self, filter: &str, fields: &[&str]) -> Result<Vec<Metadata>> {
        let stores = self.shared().await?;
        let parsed = stores.metadata.parse_filter(filter)?;
        let fields = stores.metadata.projection(fields)?;
        let watermark = self.watermark();
        stores
            .metadata
            .select(&parsed, &fields, |id| id <= watermark)
    }

    /// Metadata of one record, or `None` if it does not exist (yet).
    pub async fn get(&self, id: ChunkId) -> Result<Option<Metadata>> {
        let stores = self.shared().await?;
        if id > self.watermark() {
            return Ok(None);
        }
        Ok(stores.metadata.get(id))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chunkdex_core::config::ChunkdexConfig;
    use chunkdex_core::types::{AttrType, AttrValue, FieldSpec};

    use super::*;
    use crate::embedding::MockEmbedding;

    fn make_collection() -> Collection {
        let mut config = ChunkdexConfig::default();
        config.collection.dimension = 64;
        config.collection.fields = vec![FieldSpec::required("chunkIdx", AttrType::Int)];
        config.search.max_top_k = 3;
        Collection::open_in_memory(config, Arc::new(MockEmbedding::new(64))).unwrap()
    }

    fn meta(idx: i64) -> Metadata {
        let mut m = Metadata::new();
        m.insert("chunkIdx".into(), AttrValue::Int(idx));
        m
    }

    #[tokio::test]
    async fn test_empty_collection_search() {
        let c = make_collection();
        let results = c.search("anything", 5).await.unwrap();
        assert!(results.is_empty());
        assert!(results.is_consistent());
    }

    #[tokio::test]
    async fn test_zero_top_k_rejected() {
        let c = make_collection();
        let err = c.search("anything", 0).await.unwrap_err();
        assert!(matches!(err, ChunkdexError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_top_k_clamped() {
        let c = make_collection();
        for i in 0..6 {
            c.add(&format!("segment number {}", i), meta(i)).await.unwrap();
        }
        assert_eq!(c.search("segment", 50).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_round_trip_single_record() {
        let c = make_collection();
        c.add("a white van parks outside", meta(1)).await.unwrap();

        let results = c.search("a white van parks outside", 1).await.unwrap();
        assert_eq!(results.len(), 1);
        let hit = &results.hits[0];
        assert_eq!(hit.metadata["chunkIdx"], AttrValue::Int(1));
        assert_eq!(
            hit.metadata["text"],
            AttrValue::Str("a white van parks outside".into())
        );
        assert!(!hit.metadata.contains_key("id"));
        assert!(hit.distance < 1e-5);
    }

    #[tokio::test]
    async fn test_missing_metadata_reported_not_fatal() {
        let c = make_collection();
        let lost = c.add("people queue at the counter", meta(1)).await.unwrap();
        c.add("people leave the counter", meta(2)).await.unwrap();

        c.state.read().await.metadata.remove(lost).unwrap();

        let results = c.search("people queue at the counter", 2).await.unwrap();
        assert_eq!(results.corruption, vec![CorruptionSignal { id: lost }]);
        assert_eq!(results.len(), 1);
        assert_eq!(results.hits[0].metadata["chunkIdx"], AttrValue::Int(2));
    }

    #[tokio::test]
    async fn test_unpublished_ids_are_invisible() {
        let c = make_collection();
        let id = c.add("visible record", meta(1)).await.unwrap();

        // Simulate a write in progress: stores hold id + 1 but it is not published.
        {
            let stores = c.state.read().await;
            stores.index.insert(id + 1, vec![1.0; 64]).unwrap();
            stores.metadata.put(id + 1, meta(2)).unwrap();
        }

        let results = c.search("visible record", 3).await.unwrap();
        assert_eq!(results.len(), 1);
        assert!(results.is_consistent());
        assert!(c.get(id + 1).await.unwrap().is_none());
        assert_eq!(c.query("", &[]).await.unwrap().len(), 1);
        assert_eq!(c.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_query_projection_and_filter() {
        let c = make_collection();
        for i in 1..=3 {
            c.add(&format!("chunk {}", i), meta(i)).await.unwrap();
        }

        let rows = c.query("chunkIdx > 1", &["chunkIdx"]).await.unwrap();
        assert_eq!(rows, vec![meta(2), meta(3)]);

        let err = c.query("nope = 1", &[]).await.unwrap_err();
        assert!(matches!(err, ChunkdexError::InvalidFilter(_)));
    }

    #[tokio::test]
    async fn test_results_serialize() {
        let c = make_collection();
        c.add("serialize me", meta(1)).await.unwrap();
        let results = c.search("serialize me", 1).await.unwrap();
        let json = serde_json::to_value(&results).unwrap();
        assert_eq!(json["hits"][0]["metadata"]["chunkIdx"], 1);
        assert!(json["corruption"].as_array().unwrap().is_empty());
    }
}
