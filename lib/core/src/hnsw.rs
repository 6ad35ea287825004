use ahash::AHashMap;
use ordered_float::OrderedFloat;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::cmp::Reverse;
use std::collections::BinaryHeap;

use crate::collection::{Distance, IndexParams};

/// Hard cap on graph height; with m >= 2 the odds of reaching it are negligible.
const MAX_LEVEL: usize = 16;

/// Bitset for visited-node tracking, one per search.
struct VisitedSet {
    bits: Vec<u64>,
}

impl VisitedSet {
    #[inline]
    fn new(capacity: usize) -> Self {
        Self {
            bits: vec![0; capacity.div_ceil(64)],
        }
    }

    /// Returns true if `idx` was not visited before.
    #[inline]
    fn insert(&mut self, idx: usize) -> bool {
        let (word, mask) = (idx / 64, 1u64 << (idx % 64));
        if word >= self.bits.len() {
            self.bits.resize(word + 1, 0);
        }
        let fresh = self.bits[word] & mask == 0;
        self.bits[word] |= mask;
        fresh
    }

    #[cfg(test)]
    fn contains(&self, idx: usize) -> bool {
        self.bits
            .get(idx / 64)
            .map(|w| w & (1u64 << (idx % 64)) != 0)
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone)]
struct HnswNode {
    key: String,
    /// Neighbour lists, one per layer this node lives on (index 0 is the base layer).
    links: Vec<Vec<usize>>,
    deleted: bool,
}

/// Hierarchical navigable small world graph over normalized vectors.
///
/// Removal tombstones a node: it still routes searches but never appears in results.
/// Callers compact by rebuilding once [`HnswIndex::needs_compaction`] reports true.
pub struct HnswIndex {
    distance: Distance,
    params: IndexParams,
    dim: usize,
    nodes: Vec<HnswNode>,
    /// Contiguous storage for all vectors, `dim` floats per node.
    vectors: Vec<f32>,
    key_to_node: AHashMap<String, usize>,
    entry_point: Option<usize>,
    max_level: usize,
    deleted: usize,
    level_mult: f64,
    rng: StdRng,
}

impl HnswIndex {
    pub fn new(dim: usize, distance: Distance, params: IndexParams) -> Self {
        let m = params.m.max(2);
        Self {
            distance,
            params,
            dim,
            nodes: Vec::new(),
            vectors: Vec::new(),
            key_to_node: AHashMap::new(),
            entry_point: None,
            max_level: 0,
            deleted: 0,
            level_mult: 1.0 / (m as f64).ln(),
            rng: StdRng::seed_from_u64(0x5eed_1dea),
        }
    }

    pub fn params(&self) -> &IndexParams {
        &self.params
    }

    #[inline]
    fn vector(&self, node: usize) -> &[f32] {
        let start = node * self.dim;
        &self.vectors[start..start + self.dim]
    }

    #[inline]
    fn dist(&self, query: &[f32], node: usize) -> f32 {
        self.distance.raw(query, self.vector(node))
    }

    fn random_level(&mut self) -> usize {
        let u: f64 = self.rng.random::<f64>().max(f64::MIN_POSITIVE);
        ((-u.ln() * self.level_mult) as usize).min(MAX_LEVEL)
    }

    #[inline]
    fn max_links(&self, layer: usize) -> usize {
        if layer == 0 {
            self.params.m * 2
        } else {
            self.params.m
        }
    }

    /// Best-first search restricted to one layer, ascending by distance.
    ///
    /// Tombstones always route the walk; `with_deleted` also lets them into the
    /// results, which construction needs so new nodes link through them.
    fn search_layer(
        &self,
        query: &[f32],
        entry: usize,
        ef: usize,
        layer: usize,
        with_deleted: bool,
    ) -> Vec<(usize, f32)> {
        let mut visited = VisitedSet::new(self.nodes.len());
        let mut candidates: BinaryHeap<Reverse<(OrderedFloat<f32>, usize)>> = BinaryHeap::new();
        let mut results: BinaryHeap<(OrderedFloat<f32>, usize)> = BinaryHeap::new();

        let d = self.dist(query, entry);
        visited.insert(entry);
        candidates.push(Reverse((OrderedFloat(d), entry)));
        if with_deleted || !self.nodes[entry].deleted {
            results.push((OrderedFloat(d), entry));
        }

        while let Some(Reverse((OrderedFloat(current_dist), current))) = candidates.pop() {
            if results.len() >= ef {
                if let Some(&(OrderedFloat(worst), _)) = results.peek() {
                    if current_dist > worst {
                        break;
                    }
                }
            }

            let Some(neighbours) = self.nodes[current].links.get(layer) else {
                continue;
            };
            for &next in neighbours {
                if !visited.insert(next) {
                    continue;
                }
                let d = self.dist(query, next);
                let worst = results.peek().map(|&(OrderedFloat(w), _)| w).unwrap_or(f32::INFINITY);
                if results.len() < ef || d < worst {
                    candidates.push(Reverse((OrderedFloat(d), next)));
                    if with_deleted || !self.nodes[next].deleted {
                        results.push((OrderedFloat(d), next));
                        if results.len() > ef {
                            results.pop();
                        }
                    }
                }
            }
        }

        let mut out: Vec<(usize, f32)> = results.into_iter().map(|(d, i)| (i, d.0)).collect();
        out.sort_by(|a, b| OrderedFloat(a.1).cmp(&OrderedFloat(b.1)).then(a.0.cmp(&b.0)));
        out
    }

    /// Greedy walk from the entry point down to `target_layer + 1`.
    fn descend(&self, query: &[f32], target_layer: usize) -> Option<usize> {
        let mut current = self.entry_point?;
        let mut current_dist = self.dist(query, current);
        let mut layer = self.max_level;
        while layer > target_layer {
            let mut improved = true;
            while improved {
                improved = false;
                if let Some(neighbours) = self.nodes[current].links.get(layer) {
                    for &next in neighbours {
                        let d = self.dist(query, next);
                        if d < current_dist {
                            current_dist = d;
                            current = next;
                            improved = true;
                        }
                    }
                }
            }
            layer -= 1;
        }
        Some(current)
    }

    /// Insert a vector under `key`, replacing any previous node for the same key.
    pub fn insert(&mut self, key: &str, vector: &[f32]) {
        debug_assert_eq!(vector.len(), self.dim);
        self.remove(key);

        let level = self.random_level();
        let node_idx = self.nodes.len();
        self.vectors.extend_from_slice(vector);
        self.nodes.push(HnswNode {
            key: key.to_string(),
            links: vec![Vec::new(); level + 1],
            deleted: false,
        });
        self.key_to_node.insert(key.to_string(), node_idx);

        let Some(mut entry) = self.descend(vector, level) else {
            self.entry_point = Some(node_idx);
            self.max_level = level;
            return;
        };

        for layer in (0..=level.min(self.max_level)).rev() {
            let candidates = self.search_layer(vector, entry, self.params.ef_construction, layer, true);
            let neighbours: Vec<usize> = candidates
                .iter()
                .filter(|(idx, _)| *idx != node_idx)
                .take(self.max_links(layer))
                .map(|(idx, _)| *idx)
                .collect();

            for &n in &neighbours {
                self.link(n, node_idx, layer);
            }
            self.nodes[node_idx].links[layer] = neighbours;
            if let Some(&(best, _)) = candidates.first() {
                entry = best;
            }
        }

        // Only tombstones left besides the new node: it becomes the entry.
        let entry_dead = self.entry_point.is_some_and(|e| self.nodes[e].deleted) && self.len() == 1;
        if level > self.max_level || entry_dead {
            self.max_level = level;
            self.entry_point = Some(node_idx);
        }
    }

    /// Add a back-link from `from` to `to`, pruning `from`'s list to its closest neighbours.
    fn link(&mut self, from: usize, to: usize, layer: usize) {
        let limit = self.max_links(layer);
        if layer >= self.nodes[from].links.len() {
            return;
        }
        self.nodes[from].links[layer].push(to);
        if self.nodes[from].links[layer].len() > limit {
            let base = self.vector(from).to_vec();
            let mut scored: Vec<(f32, usize)> = self.nodes[from].links[layer]
                .iter()
                .map(|&n| (self.distance.raw(&base, self.vector(n)), n))
                .collect();
            scored.sort_by(|a, b| OrderedFloat(a.0).cmp(&OrderedFloat(b.0)));
            scored.truncate(limit);
            self.nodes[from].links[layer] = scored.into_iter().map(|(_, n)| n).collect();
        }
    }

    /// Tombstone the node stored under `key`.
    pub fn remove(&mut self, key: &str) -> bool {
        match self.key_to_node.remove(key) {
            Some(idx) => {
                self.nodes[idx].deleted = true;
                self.deleted += 1;
                true
            }
            None => false,
        }
    }

    /// k nearest live nodes as `(key, raw distance)`, ascending.
    pub fn search(&self, query: &[f32], k: usize, ef: Option<usize>) -> Vec<(&str, f32)> {
        if k == 0 || self.len() == 0 {
            return Vec::new();
        }
        let ef = ef.unwrap_or(self.params.ef_search).max(k);
        let Some(entry) = self.descend(query, 0) else {
            return Vec::new();
        };
        self.search_layer(query, entry, ef, 0, false)
            .into_iter()
            .take(k)
            .map(|(idx, d)| (self.nodes[idx].key.as_str(), d))
            .collect()
    }

    /// Live node count.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len() - self.deleted
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True once tombstones make up more than a quarter of the graph.
    #[must_use]
    pub fn needs_compaction(&self) -> bool {
        self.deleted > 0 && self.deleted * 4 > self.nodes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Vector;

    fn unit(v: Vec<f32>) -> Vec<f32> {
        Vector::new(v).normalize().into_inner()
    }

    fn random_unit(rng: &mut StdRng, dim: usize) -> Vec<f32> {
        unit((0..dim).map(|_| rng.random_range(-1.0f32..1.0)).collect())
    }

    #[test]
    fn test_hnsw_insert_search() {
        let mut index = HnswIndex::new(3, Distance::Cosine, IndexParams::default());
        for i in 0..10 {
            index.insert(&format!("p{i}"), &unit(vec![1.0, i as f32, 0.5]));
        }
        let results = index.search(&unit(vec![1.0, 5.0, 0.5]), 3, None);
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].0, "p5");
        assert!(results[0].1 < 1e-5);
    }

    #[test]
    fn test_hnsw_recall_against_brute_force() {
        let mut rng = StdRng::seed_from_u64(7);
        let dim = 32;
        let mut index = HnswIndex::new(dim, Distance::Cosine, IndexParams::default());
        let data: Vec<Vec<f32>> = (0..2000).map(|_| random_unit(&mut rng, dim)).collect();
        for (i, v) in data.iter().enumerate() {
            index.insert(&i.to_string(), v);
        }

        let mut hits = 0;
        for _ in 0..20 {
            let q = random_unit(&mut rng, dim);
            let mut exact: Vec<(usize, f32)> = data
                .iter()
                .enumerate()
                .map(|(i, v)| (i, Distance::Cosine.raw(&q, v)))
                .collect();
            exact.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap());
            let approx = index.search(&q, 10, Some(100));
            for (i, _) in exact.iter().take(10) {
                if approx.iter().any(|(k, _)| *k == i.to_string()) {
                    hits += 1;
                }
            }
        }
        assert!(hits >= 160, "recall too low: {hits}/200");
    }

    #[test]
    fn test_remove_and_replace() {
        let mut index = HnswIndex::new(2, Distance::Euclidean, IndexParams::default());
        index.insert("a", &[0.0, 1.0]);
        index.insert("b", &[1.0, 0.0]);
        assert!(index.remove("a"));
        assert!(!index.remove("a"));
        assert_eq!(index.len(), 1);
        let results = index.search(&[0.0, 1.0], 5, None);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, "b");

        index.insert("b", &[0.0, 1.0]);
        assert_eq!(index.len(), 1);
        let results = index.search(&[0.0, 1.0], 5, None);
        assert_eq!(results[0].0, "b");
        assert!(results[0].1 < 1e-6);
        assert!(index.needs_compaction());
    }

    #[test]
    fn test_replaced_nodes_stay_reachable() {
        let mut rng = StdRng::seed_from_u64(11);
        let dim = 16;
        let mut index = HnswIndex::new(dim, Distance::Cosine, IndexParams::default());
        for i in 0..300 {
            index.insert(&format!("k{i}"), &random_unit(&mut rng, dim));
        }
        let mut latest = Vec::new();
        for i in 0..300 {
            let v = random_unit(&mut rng, dim);
            index.insert(&format!("k{i}"), &v);
            latest.push(v);
        }
        assert_eq!(index.len(), 300);
        for (i, v) in latest.iter().enumerate().step_by(7) {
            let results = index.search(v, 1, Some(64));
            assert_eq!(results[0].0, format!("k{i}"));
            assert!(results[0].1 < 1e-5);
        }
    }

    #[test]
    fn test_insert_after_removing_everything() {
        let mut index = HnswIndex::new(2, Distance::Cosine, IndexParams::default());
        index.insert("a", &unit(vec![1.0, 0.0]));
        index.insert("b", &unit(vec![0.0, 1.0]));
        index.remove("a");
        index.remove("b");
        assert!(index.search(&unit(vec![1.0, 0.0]), 1, None).is_empty());

        index.insert("c", &unit(vec![1.0, 1.0]));
        let results = index.search(&unit(vec![1.0, 0.0]), 3, None);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, "c");
        assert!(!index.nodes[index.entry_point.unwrap()].deleted);
    }

    #[test]
    fn test_visited_set() {
        let mut vs = VisitedSet::new(100);
        assert!(!vs.contains(5));
        assert!(vs.insert(5));
        assert!(vs.contains(5));
        assert!(!vs.insert(5));
        assert!(vs.insert(500));
    }
}
