//! Nearest-neighbor index over a collection's embeddings.
//!
//! [`VectorIndex`] fixes the dimension and metric and owns one
//! [`AnnBackend`] behind an `RwLock`, so inserts and searches can run from
//! many tasks. Results are ordered by ascending distance, ties by ascending id.

mod flat;
mod hnsw;

use std::cmp::Ordering;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use chunkdex_core::config::IndexConfig;
use chunkdex_core::error::{ChunkdexError, Result};
use chunkdex_core::types::{ChunkId, IndexKind, Metric};

pub use flat::FlatBackend;
pub use hnsw::HnswBackend;

/// One search result from the index.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Neighbor {
    pub id: ChunkId,
    pub distance: f32,
}

impl Neighbor {
    /// Total order: distance first, then id.
    pub(crate) fn rank(&self, other: &Self) -> Ordering {
        self.distance
            .total_cmp(&other.distance)
            .then(self.id.cmp(&other.id))
    }
}

/// A nearest-neighbor structure. Dimension checks happen in [`VectorIndex`].
pub trait AnnBackend: Send + Sync + std::fmt::Debug {
    /// Insert or replace the vector stored under `id`.
    fn insert(&mut self, id: ChunkId, vector: Vec<f32>);

    /// Up to `k` accepted ids closest to `query`, ranked.
    fn search(&self, query: &[f32], k: usize, accept: &dyn Fn(ChunkId) -> bool) -> Vec<Neighbor>;

    /// Returns whether `id` was present.
    fn remove(&mut self, id: ChunkId) -> bool;

    fn contains(&self, id: ChunkId) -> bool;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn make_backend(metric: Metric, config: &IndexConfig) -> Box<dyn AnnBackend> {
    match config.kind {
        IndexKind::Flat => Box::new(FlatBackend::new(metric)),
        IndexKind::Hnsw => Box::new(HnswBackend::new(
            metric,
            config.m,
            config.ef_construction,
            config.ef_search,
        )),
    }
}

/// Thread-safe vector index with a fixed dimension and metric.
#[derive(Debug)]
pub struct VectorIndex {
    dimension: usize,
    metric: Metric,
    config: IndexConfig,
    backend: RwLock<Box<dyn AnnBackend>>,
}

impl VectorIndex {
    pub fn new(dimension: usize, metric: Metric, config: &IndexConfig) -> Self {
        Self {
            dimension,
            metric,
            config: config.clone(),
            backend: RwLock::new(make_backend(metric, config)),
        }
    }

    /// Insert a vector. Fails with `DimensionMismatch` before touching the index.
    pub fn insert(&self, id: ChunkId, vector: Vec<f32>) -> Result<()> {
        self.check_dimension(vector.len())?;
        let mut backend = self
            .backend
            .write()
            .map_err(|e| ChunkdexError::Storage(format!("Lock poisoned: {}", e)))?;
        backend.insert(id, vector);
        Ok(())
    }

    /// The `k` nearest stored vectors.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>> {
        self.search_where(query, k, &|_| true)
    }

    /// The `k` nearest vectors among ids for which `accept` holds.
    pub fn search_where(
        &self,
        query: &[f32],
        k: usize,
        accept: &dyn Fn(ChunkId) -> bool,
    ) -> Result<Vec<Neighbor>> {
        self.check_dimension(query.len())?;
        if k == 0 {
            return Ok(Vec::new());
        }
        let backend = self
            .backend
            .read()
            .map_err(|e| ChunkdexError::Storage(format!("Lock poisoned: {}", e)))?;
        Ok(backend.search(query, k, accept))
    }

    /// Remove `id` if present. Idempotent.
    pub fn remove(&self, id: ChunkId) -> Result<bool> {
        let mut backend = self
            .backend
            .write()
            .map_err(|e| ChunkdexError::Storage(format!("Lock poisoned: {}", e)))?;
        Ok(backend.remove(id))
    }

    /// Replace the structure with an empty one built from the same settings.
    pub fn rebuild(&self) -> Result<()> {
        let mut backend = self
            .backend
            .write()
            .map_err(|e| ChunkdexError::Storage(format!("Lock poisoned: {}", e)))?;
        *backend = make_backend(self.metric, &self.config);
        Ok(())
    }

    pub fn contains(&self, id: ChunkId) -> bool {
        self.backend.read().map(|b| b.contains(id)).unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.backend.read().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    pub fn kind(&self) -> IndexKind {
        self.config.kind
    }

    fn check_dimension(&self, actual: usize) -> Result<()> {
        if actual != self.dimension {
            return Err(ChunkdexError::DimensionMismatch {
                expected: self.dimension,
                actual,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(kind: IndexKind) -> IndexConfig {
        IndexConfig {
            kind,
            ..IndexConfig::default()
        }
    }

    fn both(dimension: usize, metric: Metric) -> Vec<VectorIndex> {
        [IndexKind::Flat, IndexKind::Hnsw]
            .into_iter()
            .map(|kind| VectorIndex::new(dimension, metric, &config(kind)))
            .collect()
    }

    /// Deterministic pseudo-random vectors.
    pub(crate) fn random_vectors(count: usize, dim: usize, seed: u64) -> Vec<Vec<f32>> {
        let mut state = seed;
        let mut next = move || {
            state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
            let mut z = state;
            z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
            z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
            z ^= z >> 31;
            (z >> 11) as f32 / (1u64 << 53) as f32 * 2.0 - 1.0
        };
        (0..count)
            .map(|_| (0..dim).map(|_| next()).collect())
            .collect()
    }

    #[test]
    fn test_insert_and_search_order() {
        for index in both(3, Metric::Euclidean) {
            index.insert(1, vec![0.0, 0.0, 0.0]).unwrap();
            index.insert(2, vec![1.0, 0.0, 0.0]).unwrap();
            index.insert(3, vec![5.0, 0.0, 0.0]).unwrap();

            let hits = index.search(&[0.9, 0.0, 0.0], 3).unwrap();
            let ids: Vec<ChunkId> = hits.iter().map(|h| h.id).collect();
            assert_eq!(ids, vec![2, 1, 3], "{:?}", index.kind());
            assert!(hits.windows(2).all(|w| w[0].distance <= w[1].distance));
        }
    }

    #[test]
    fn test_ties_broken_by_id() {
        for index in both(2, Metric::Cosine) {
            for id in [9, 4, 7] {
                index.insert(id, vec![1.0, 1.0]).unwrap();
            }
            let ids: Vec<ChunkId> = index
                .search(&[1.0, 1.0], 3)
                .unwrap()
                .iter()
                .map(|h| h.id)
                .collect();
            assert_eq!(ids, vec![4, 7, 9], "{:?}", index.kind());
        }
    }

    #[test]
    fn test_dimension_mismatch() {
        for index in both(4, Metric::Cosine) {
            let err = index.insert(1, vec![1.0; 3]).unwrap_err();
            assert!(matches!(
                err,
                ChunkdexError::DimensionMismatch {
                    expected: 4,
                    actual: 3
                }
            ));
            assert!(index.is_empty());
            assert!(index.search(&[1.0; 5], 1).is_err());
        }
    }

    #[test]
    fn test_empty_search() {
        for index in both(2, Metric::Cosine) {
            assert!(index.search(&[1.0, 0.0], 10).unwrap().is_empty());
        }
    }

    #[test]
    fn test_respects_k() {
        for index in both(8, Metric::Cosine) {
            for (id, v) in random_vectors(40, 8, 1).into_iter().enumerate() {
                index.insert(id as ChunkId, v).unwrap();
            }
            assert_eq!(index.search(&[0.5; 8], 5).unwrap().len(), 5);
            assert!(index.search(&[0.5; 8], 0).unwrap().is_empty());
        }
    }

    #[test]
    fn test_remove_is_idempotent() {
        for index in both(2, Metric::Cosine) {
            index.insert(1, vec![1.0, 0.0]).unwrap();
            assert!(index.remove(1).unwrap());
            assert!(!index.remove(1).unwrap());
            assert!(!index.contains(1));
            assert!(index.search(&[1.0, 0.0], 1).unwrap().is_empty());
        }
    }

    #[test]
    fn test_insert_overwrites() {
        for index in both(2, Metric::Euclidean) {
            index.insert(1, vec![0.0, 0.0]).unwrap();
            index.insert(1, vec![10.0, 0.0]).unwrap();
            assert_eq!(index.len(), 1);
            let hit = index.search(&[10.0, 0.0], 1).unwrap()[0];
            assert_eq!(hit.id, 1);
            assert!(hit.distance < 1e-6);
        }
    }

    #[test]
    fn test_rebuild_empties_and_keeps_settings() {
        for index in both(2, Metric::Euclidean) {
            index.insert(1, vec![0.0, 1.0]).unwrap();
            let kind = index.kind();
            index.rebuild().unwrap();
            assert!(index.is_empty());
            assert_eq!(index.kind(), kind);
            index.insert(2, vec![0.0, 1.0]).unwrap();
            assert_eq!(index.search(&[0.0, 1.0], 1).unwrap()[0].id, 2);
        }
    }

    #[test]
    fn test_search_where_skips_rejected_ids() {
        for index in both(2, Metric::Euclidean) {
            index.insert(1, vec![0.0, 0.0]).unwrap();
            index.insert(2, vec![0.1, 0.0]).unwrap();
            index.insert(3, vec![0.2, 0.0]).unwrap();

            let hits = index.search_where(&[0.0, 0.0], 2, &|id| id != 1).unwrap();
            let ids: Vec<ChunkId> = hits.iter().map(|h| h.id).collect();
            assert_eq!(ids, vec![2, 3], "{:?}", index.kind());
        }
    }

    #[test]
    fn test_hnsw_exact_match_agrees_with_flat() {
        let vectors = random_vectors(300, 16, 7);
        let flat = VectorIndex::new(16, Metric::Cosine, &config(IndexKind::Flat));
        let hnsw = VectorIndex::new(16, Metric::Cosine, &config(IndexKind::Hnsw));
        for (id, v) in vectors.iter().enumerate() {
            flat.insert(id as ChunkId, v.clone()).unwrap();
            hnsw.insert(id as ChunkId, v.clone()).unwrap();
        }

        for (id, v) in vectors.iter().enumerate().step_by(17) {
            assert_eq!(flat.search(v, 1).unwrap()[0].id, id as ChunkId);
            assert_eq!(hnsw.search(v, 1).unwrap()[0].id, id as ChunkId);
        }
    }
}
