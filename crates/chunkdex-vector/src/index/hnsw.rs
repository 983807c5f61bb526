//! Hierarchical navigable small world graph.
//!
//! Greedy descent through the upper layers, beam search of width `ef` on
//! layer 0. A node's level is a pure function of its id, so rebuilding the
//! graph from persisted rows in id order reproduces the same layering.
//!
//! Removal drops every edge pointing at the node, then refills the lists of
//! the nodes that lost an edge from the removed node's own neighborhood, and
//! elects the highest remaining node as the new entry point.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use chunkdex_core::types::{ChunkId, Metric};

use super::{AnnBackend, Neighbor};
use crate::distance::distance;

const MAX_LEVEL: usize = 16;

#[derive(Debug)]
struct Node {
    vector: Vec<f32>,
    /// Neighbor ids per layer; `links.len() - 1` is the node's level.
    links: Vec<Vec<ChunkId>>,
}

impl Node {
    fn level(&self) -> usize {
        self.links.len().saturating_sub(1)
    }
}

/// Heap entry ordered by (distance, id).
#[derive(Debug, Clone, Copy)]
struct Scored(Neighbor);

impl PartialEq for Scored {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other).is_eq()
    }
}

impl Eq for Scored {}

impl PartialOrd for Scored {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scored {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.rank(&other.0)
    }
}

#[derive(Debug)]
pub struct HnswBackend {
    metric: Metric,
    /// Max links per node on layers above 0.
    m: usize,
    /// Max links per node on layer 0.
    m0: usize,
    ef_construction: usize,
    ef_search: usize,
    level_mult: f64,
    nodes: HashMap<ChunkId, Node>,
    entry_point: Option<ChunkId>,
    max_level: usize,
}

impl HnswBackend {
    pub fn new(metric: Metric, m: usize, ef_construction: usize, ef_search: usize) -> Self {
        let m = m.max(2);
        Self {
            metric,
            m,
            m0: m * 2,
            ef_construction: ef_construction.max(1),
            ef_search: ef_search.max(1),
            level_mult: 1.0 / (m as f64).ln(),
            nodes: HashMap::new(),
            entry_point: None,
            max_level: 0,
        }
    }

    /// Level for `id`: `floor(-ln(u) / ln(m))` with `u` drawn from a hash of the id.
    fn level_for(&self, id: ChunkId) -> usize {
        let mut z = id.wrapping_add(0x9E37_79B9_7F4A_7C15);
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^= z >> 31;
        // u in (0, 1]
        let u = ((z >> 11) as f64 + 1.0) / (1u64 << 53) as f64;
        ((-u.ln() * self.level_mult).floor() as usize).min(MAX_LEVEL)
    }

    fn capacity(&self, layer: usize) -> usize {
        if layer == 0 {
            self.m0
        } else {
            self.m
        }
    }

    fn score(&self, query: &[f32], id: ChunkId) -> Option<Scored> {
        self.nodes.get(&id).map(|n| {
            Scored(Neighbor {
                id,
                distance: distance(self.metric, query, &n.vector),
            })
        })
    }

    /// Beam search on one layer. Every reachable node is traversed, but only
    /// accepted ids enter the result set. Returns results closest first.
    fn search_layer(
        &self,
        query: &[f32],
        entries: &[ChunkId],
        ef: usize,
        layer: usize,
        accept: &dyn Fn(ChunkId) -> bool,
    ) -> Vec<Neighbor> {
        let mut visited: HashSet<ChunkId> = HashSet::new();
        let mut candidates: BinaryHeap<Reverse<Scored>> = BinaryHeap::new();
        let mut results: BinaryHeap<Scored> = BinaryHeap::new();

        for &id in entries {
            if !visited.insert(id) {
                continue;
            }
            if let Some(s) = self.score(query, id) {
                candidates.push(Reverse(s));
                if accept(id) {
                    results.push(s);
                }
            }
        }
        while results.len() > ef {
            results.pop();
        }

        while let Some(Reverse(current)) = candidates.pop() {
            if results.len() >= ef {
                if let Some(worst) = results.peek() {
                    if current > *worst {
                        break;
                    }
                }
            }

            let Some(links) = self
                .nodes
                .get(&current.0.id)
                .and_then(|n| n.links.get(layer))
            else {
                continue;
            };

            for &next in links {
                if !visited.insert(next) {
                    continue;
                }
                let Some(s) = self.score(query, next) else {
                    continue;
                };
                let improves = results.len() < ef || results.peek().map_or(true, |w| s < *w);
                if improves {
                    candidates.push(Reverse(s));
                    if accept(next) {
                        results.push(s);
                        if results.len() > ef {
                            results.pop();
                        }
                    }
                }
            }
        }

        results.into_sorted_vec().into_iter().map(|s| s.0).collect()
    }

    /// Greedy walk from the entry point down to (but excluding) `stop_layer`.
    fn descend(&self, query: &[f32], entry: ChunkId, stop_layer: usize) -> ChunkId {
        let mut current = entry;
        let mut layer = self.max_level;
        while layer > stop_layer {
            if let Some(best) = self
                .search_layer(query, &[current], 1, layer, &|_| true)
                .first()
            {
                current = best.id;
            }
            layer -= 1;
        }
        current
    }

    /// Keep the `cap` candidates closest to `origin`.
    fn closest(&self, origin: &[f32], candidates: &[ChunkId], cap: usize) -> Vec<ChunkId> {
        let mut scored: Vec<Scored> = candidates
            .iter()
            .filter_map(|id| self.score(origin, *id))
            .collect();
        scored.sort();
        scored.truncate(cap);
        scored.into_iter().map(|s| s.0.id).collect()
    }

    fn link(&mut self, from: ChunkId, to: ChunkId, layer: usize) {
        let cap = self.capacity(layer);
        let overflow = match self.nodes.get_mut(&from).and_then(|n| n.links.get_mut(layer)) {
            Some(links) if !links.contains(&to) => {
                links.push(to);
                links.len() > cap
            }
            _ => false,
        };
        if overflow {
            self.prune(from, layer);
        }
    }

    fn prune(&mut self, id: ChunkId, layer: usize) {
        let Some(node) = self.nodes.get(&id) else {
            return;
        };
        let Some(links) = node.links.get(layer) else {
            return;
        };
        let kept = self.closest(&node.vector, links, self.capacity(layer));
        if let Some(links) = self.nodes.get_mut(&id).and_then(|n| n.links.get_mut(layer)) {
            *links = kept;
        }
    }

    fn elect_entry_point(&mut self) {
        let best = self
            .nodes
            .iter()
            .map(|(id, n)| (n.level(), Reverse(*id)))
            .max();
        match best {
            Some((level, Reverse(id))) => {
                self.entry_point = Some(id);
                self.max_level = level;
            }
            None => {
                self.entry_point = None;
                self.max_level = 0;
            }
        }
    }
}

impl AnnBackend for HnswBackend {
    fn insert(&mut self, id: ChunkId, vector: Vec<f32>) {
        if self.nodes.contains_key(&id) {
            self.remove(id);
        }

        let level = self.level_for(id);
        let Some(entry) = self.entry_point else {
            self.nodes.insert(
                id,
                Node {
                    vector,
                    links: vec![Vec::new(); level + 1],
                },
            );
            self.entry_point = Some(id);
            self.max_level = level;
            return;
        };

        let top = level.min(self.max_level);
        let mut entries = vec![self.descend(&vector, entry, top)];
        let mut links = vec![Vec::new(); level + 1];

        for layer in (0..=top).rev() {
            let found = self.search_layer(&vector, &entries, self.ef_construction, layer, &|_| true);
            let ids: Vec<ChunkId> = found.iter().map(|n| n.id).collect();
            links[layer] = ids.iter().copied().take(self.capacity(layer)).collect();
            entries = ids;
        }

        self.nodes.insert(id, Node { vector, links: links.clone() });
        for (layer, neighbors) in links.iter().enumerate() {
            for &neighbor in neighbors {
                self.link(neighbor, id, layer);
            }
        }

        if level > self.max_level {
            self.entry_point = Some(id);
            self.max_level = level;
        }
    }

    fn search(&self, query: &[f32], k: usize, accept: &dyn Fn(ChunkId) -> bool) -> Vec<Neighbor> {
        let Some(entry) = self.entry_point else {
            return Vec::new();
        };
        if k == 0 {
            return Vec::new();
        }

        let start = self.descend(query, entry, 0);
        let ef = self.ef_search.max(k);
        let mut found = self.search_layer(query, &[start], ef, 0, accept);
        found.truncate(k);
        found
    }

    fn remove(&mut self, id: ChunkId) -> bool {
        let Some(removed) = self.nodes.remove(&id) else {
            return false;
        };

        let mut damaged: Vec<(ChunkId, usize)> = Vec::new();
        for (&node_id, node) in self.nodes.iter_mut() {
            for (layer, links) in node.links.iter_mut().enumerate() {
                let before = links.len();
                links.retain(|l| *l != id);
                if links.len() != before {
                    damaged.push((node_id, layer));
                }
            }
        }

        for (node_id, layer) in damaged {
            let Some(node) = self.nodes.get(&node_id) else {
                continue;
            };
            let mut pool = node.links.get(layer).cloned().unwrap_or_default();
            if let Some(orphans) = removed.links.get(layer) {
                for &o in orphans {
                    if o != node_id && !pool.contains(&o) {
                        pool.push(o);
                    }
                }
            }
            let repaired = self.closest(&node.vector, &pool, self.capacity(layer));
            if let Some(links) = self
                .nodes
                .get_mut(&node_id)
                .and_then(|n| n.links.get_mut(layer))
            {
                *links = repaired;
            }
        }

        if self.entry_point == Some(id) {
            self.elect_entry_point();
        }
        true
    }

    fn contains(&self, id: ChunkId) -> bool {
        self.nodes.contains_key(&id)
    }

    fn len(&self) -> usize {
        self.nodes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::tests::random_vectors;
    use crate::index::FlatBackend;

    fn all(_: ChunkId) -> bool {
        true
    }

    fn build(vectors: &[Vec<f32>]) -> (HnswBackend, FlatBackend) {
        let mut hnsw = HnswBackend::new(Metric::Euclidean, 8, 100, 48);
        let mut flat = FlatBackend::new(Metric::Euclidean);
        for (id, v) in vectors.iter().enumerate() {
            hnsw.insert(id as ChunkId, v.clone());
            flat.insert(id as ChunkId, v.clone());
        }
        (hnsw, flat)
    }

    fn recall(hnsw: &HnswBackend, flat: &FlatBackend, queries: &[Vec<f32>], k: usize) -> f64 {
        let mut hit = 0usize;
        for q in queries {
            let truth: HashSet<ChunkId> = flat.search(q, k, &all).iter().map(|n| n.id).collect();
            hit += hnsw
                .search(q, k, &all)
                .iter()
                .filter(|n| truth.contains(&n.id))
                .count();
        }
        hit as f64 / (queries.len() * k) as f64
    }

    #[test]
    fn test_levels_are_deterministic() {
        let a = HnswBackend::new(Metric::Cosine, 16, 200, 64);
        let b = HnswBackend::new(Metric::Cosine, 16, 200, 64);
        for id in 0..1_000 {
            assert_eq!(a.level_for(id), b.level_for(id));
        }
        // Roughly 1/m of nodes should sit above layer 0.
        let upper = (0..10_000).filter(|id| a.level_for(*id) > 0).count();
        assert!(upper > 300 && upper < 1_200, "upper = {}", upper);
    }

    #[test]
    fn test_recall_against_flat() {
        let vectors = random_vectors(600, 12, 42);
        let queries = random_vectors(25, 12, 4242);
        let (hnsw, flat) = build(&vectors);
        let r = recall(&hnsw, &flat, &queries, 10);
        assert!(r >= 0.9, "recall@10 = {}", r);
    }

    #[test]
    fn test_link_lists_respect_capacity() {
        let vectors = random_vectors(400, 6, 3);
        let (hnsw, _) = build(&vectors);
        for node in hnsw.nodes.values() {
            for (layer, links) in node.links.iter().enumerate() {
                assert!(links.len() <= hnsw.capacity(layer));
            }
        }
    }

    #[test]
    fn test_remove_repairs_graph() {
        let vectors = random_vectors(400, 8, 11);
        let queries = random_vectors(20, 8, 1111);
        let (mut hnsw, mut flat) = build(&vectors);

        for id in (0..400).step_by(3) {
            assert!(hnsw.remove(id));
            flat.remove(id);
        }

        assert_eq!(hnsw.len(), flat.len());
        for node in hnsw.nodes.values() {
            for links in &node.links {
                assert!(links.iter().all(|l| hnsw.nodes.contains_key(l)));
            }
        }
        let r = recall(&hnsw, &flat, &queries, 10);
        assert!(r >= 0.85, "recall@10 after removals = {}", r);
    }

    #[test]
    fn test_remove_entry_point_elects_highest() {
        let vectors = random_vectors(200, 4, 5);
        let (mut hnsw, _) = build(&vectors);

        let entry = hnsw.entry_point.unwrap();
        hnsw.remove(entry);

        let new_entry = hnsw.entry_point.unwrap();
        let highest = hnsw.nodes.values().map(|n| n.level()).max().unwrap();
        assert_eq!(hnsw.nodes[&new_entry].level(), highest);
        assert_eq!(hnsw.max_level, highest);
    }

    #[test]
    fn test_remove_everything() {
        let vectors = random_vectors(30, 4, 9);
        let (mut hnsw, _) = build(&vectors);
        for id in 0..30 {
            hnsw.remove(id);
        }
        assert!(hnsw.is_empty());
        assert!(hnsw.entry_point.is_none());
        assert!(hnsw.search(&vectors[0], 5, &all).is_empty());

        hnsw.insert(99, vectors[0].clone());
        assert_eq!(hnsw.search(&vectors[0], 1, &all)[0].id, 99);
    }

    #[test]
    fn test_filtered_search_fills_k() {
        let vectors = random_vectors(300, 8, 21);
        let (hnsw, flat) = build(&vectors);
        let even = |id: ChunkId| id % 2 == 0;

        let got: Vec<ChunkId> = hnsw.search(&vectors[1], 10, &even).iter().map(|n| n.id).collect();
        assert_eq!(got.len(), 10);
        assert!(got.iter().all(|id| id % 2 == 0));

        let truth: HashSet<ChunkId> = flat.search(&vectors[1], 10, &even).iter().map(|n| n.id).collect();
        let overlap = got.iter().filter(|id| truth.contains(id)).count();
        assert!(overlap >= 8, "overlap = {}", overlap);
    }
}
