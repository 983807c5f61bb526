use std::collections::BTreeMap;

use chunkdex_core::types::{ChunkId, Metric};

use super::{AnnBackend, Neighbor};
use crate::distance::distance;

/// Exact linear scan. O(n) per query; also the oracle for HNSW recall tests.
#[derive(Debug)]
pub struct FlatBackend {
    metric: Metric,
    vectors: BTreeMap<ChunkId, Vec<f32>>,
}

impl FlatBackend {
    pub fn new(metric: Metric) -> Self {
        Self {
            metric,
            vectors: BTreeMap::new(),
        }
    }
}

impl AnnBackend for FlatBackend {
    fn insert(&mut self, id: ChunkId, vector: Vec<f32>) {
        self.vectors.insert(id, vector);
    }

    fn search(&self, query: &[f32], k: usize, accept: &dyn Fn(ChunkId) -> bool) -> Vec<Neighbor> {
        let mut scored: Vec<Neighbor> = self
            .vectors
            .iter()
            .filter(|(id, _)| accept(**id))
            .map(|(id, v)| Neighbor {
                id: *id,
                distance: distance(self.metric, query, v),
            })
            .collect();

        scored.sort_by(|a, b| a.rank(b));
        scored.truncate(k);
        scored
    }

    fn remove(&mut self, id: ChunkId) -> bool {
        self.vectors.remove(&id).is_some()
    }

    fn contains(&self, id: ChunkId) -> bool {
        self.vectors.contains_key(&id)
    }

    fn len(&self) -> usize {
        self.vectors.len()
    }
}
