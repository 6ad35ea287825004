use ahash::AHashMap;
use ordered_float::OrderedFloat;
use parking_lot::RwLock;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::simd::{dot_product_simd, l2_squared_simd};
use crate::{Error, Filter, HnswIndex, NormalizedVector, Record, Result, SearchHit};

/// Collections at or below this many live records are always scanned exactly.
pub const EXACT_SCAN_THRESHOLD: usize = 1024;

/// Similarity metric, fixed when a collection is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Distance {
    /// Cosine similarity over normalized vectors; higher is better.
    Cosine,
    /// Euclidean distance; lower is better.
    Euclidean,
}

impl Distance {
    /// Ranking key where lower always means closer. Cosine uses `1 - dot`,
    /// Euclidean the squared distance.
    #[inline]
    pub fn raw(self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Distance::Cosine => 1.0 - dot_product_simd(a, b),
            Distance::Euclidean => l2_squared_simd(a, b),
        }
    }

    /// Convert a ranking key back into the metric's reported value.
    #[inline]
    pub fn score(self, raw: f32) -> f32 {
        match self {
            Distance::Cosine => 1.0 - raw,
            Distance::Euclidean => raw.max(0.0).sqrt(),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Distance::Cosine => "cosine",
            Distance::Euclidean => "euclidean",
        }
    }
}

impl fmt::Display for Distance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Distance {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cosine" | "cos" | "ip" => Ok(Distance::Cosine),
            "euclidean" | "euclid" | "l2" => Ok(Distance::Euclidean),
            other => Err(Error::InvalidConfig(format!(
                "unknown metric '{other}', expected 'cosine' or 'euclidean'"
            ))),
        }
    }
}

/// HNSW build and search parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexParams {
    pub m: usize,
    pub ef_construction: usize,
    pub ef_search: usize,
}

impl Default for IndexParams {
    fn default() -> Self {
        Self {
            m: 16,
            ef_construction: 200,
            ef_search: 64,
        }
    }
}

/// Durable description of a collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionSchema {
    pub name: String,
    pub dim: usize,
    pub metric: Distance,
    #[serde(default)]
    pub index: Option<IndexParams>,
}

impl CollectionSchema {
    pub fn new(name: impl Into<String>, dim: usize, metric: Distance) -> Self {
        Self {
            name: name.into(),
            dim,
            metric,
            index: None,
        }
    }

    pub fn with_index(mut self, params: IndexParams) -> Self {
        self.index = Some(params);
        self
    }

    /// Reject a vector whose length differs from the collection's dimension.
    #[inline]
    pub fn check_dim(&self, actual: usize) -> Result<()> {
        if actual != self.dim {
            return Err(Error::DimensionMismatch {
                expected: self.dim,
                actual,
            });
        }
        Ok(())
    }

    /// Compare against the requested shape of an existing collection.
    pub fn check_compatible(&self, dim: usize, metric: Distance) -> Result<()> {
        if self.dim != dim {
            return Err(Error::SchemaConflict {
                collection: self.name.clone(),
                reason: format!("stored dimension is {}, requested {}", self.dim, dim),
            });
        }
        if self.metric != metric {
            return Err(Error::SchemaConflict {
                collection: self.name.clone(),
                reason: format!("stored metric is {}, requested {}", self.metric, metric),
            });
        }
        Ok(())
    }
}

struct CollectionState {
    records: AHashMap<String, Record>,
    index: Option<HnswIndex>,
}

impl CollectionState {
    fn build_index(&mut self, schema: &CollectionSchema, params: IndexParams) {
        let mut index = HnswIndex::new(schema.dim, schema.metric, params);
        let mut keys: Vec<&String> = self.records.keys().collect();
        keys.sort();
        for key in keys {
            index.insert(key, self.records[key].vector.as_slice());
        }
        self.index = Some(index);
    }

    /// Rebuild the graph once tombstones dominate it.
    fn compact_if_needed(&mut self, schema: &CollectionSchema) {
        let params = match &self.index {
            Some(index) if index.needs_compaction() => *index.params(),
            _ => return,
        };
        self.build_index(schema, params);
    }
}

/// Resident records of one collection plus their similarity index.
///
/// One lock guards both, so a replace is observed by readers as a single step.
pub struct Collection {
    schema: CollectionSchema,
    state: RwLock<CollectionState>,
}

impl Collection {
    pub fn new(schema: CollectionSchema) -> Self {
        Self::from_records(schema, std::iter::empty())
    }

    /// Build a resident collection from persisted records.
    pub fn from_records(schema: CollectionSchema, records: impl IntoIterator<Item = Record>) -> Self {
        let mut state = CollectionState {
            records: records.into_iter().map(|r| (r.key.clone(), r)).collect(),
            index: None,
        };
        if let Some(params) = schema.index {
            state.build_index(&schema, params);
        }
        Self {
            schema,
            state: RwLock::new(state),
        }
    }

    /// Current schema, including the parameters of the live index.
    pub fn schema(&self) -> CollectionSchema {
        let mut schema = self.schema.clone();
        schema.index = self.state.read().index.as_ref().map(|i| *i.params());
        schema
    }

    pub fn name(&self) -> &str {
        &self.schema.name
    }

    pub fn dim(&self) -> usize {
        self.schema.dim
    }

    pub fn metric(&self) -> Distance {
        self.schema.metric
    }

    pub fn len(&self) -> usize {
        self.state.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &str) -> bool {
        self.state.read().records.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<Record> {
        self.state.read().records.get(key).cloned()
    }

    pub fn has_index(&self) -> bool {
        self.state.read().index.is_some()
    }

    /// (Re)build the HNSW graph with `params`.
    pub fn build_index(&self, params: IndexParams) {
        let mut state = self.state.write();
        state.build_index(&self.schema, params);
    }

    /// Insert or fully replace a record, returning the one it displaced.
    pub fn upsert(&self, record: Record) -> Result<Option<Record>> {
        self.schema.check_dim(record.vector.dim())?;
        let mut state = self.state.write();
        if let Some(index) = state.index.as_mut() {
            index.insert(&record.key, record.vector.as_slice());
        }
        let displaced = state.records.insert(record.key.clone(), record);
        state.compact_if_needed(&self.schema);
        Ok(displaced)
    }

    pub fn remove(&self, key: &str) -> Option<Record> {
        let mut state = self.state.write();
        let removed = state.records.remove(key)?;
        if let Some(index) = state.index.as_mut() {
            index.remove(key);
        }
        state.compact_if_needed(&self.schema);
        Some(removed)
    }

    /// Best-first hits for `query`, at most `top_k`.
    pub fn search(
        &self,
        query: &NormalizedVector,
        top_k: usize,
        filter: Option<&dyn Filter>,
    ) -> Result<Vec<SearchHit>> {
        self.schema.check_dim(query.dim())?;
        if top_k == 0 {
            return Ok(Vec::new());
        }
        let state = self.state.read();
        Ok(self.search_locked(&state, query, top_k, filter))
    }

    /// Run several queries against one consistent snapshot, preserving input order.
    pub fn search_batch(
        &self,
        queries: &[NormalizedVector],
        top_k: usize,
        filter: Option<&dyn Filter>,
    ) -> Result<Vec<Vec<SearchHit>>> {
        for query in queries {
            self.schema.check_dim(query.dim())?;
        }
        if top_k == 0 {
            return Ok(vec![Vec::new(); queries.len()]);
        }
        let state = self.state.read();
        Ok(queries
            .par_iter()
            .map(|q| self.search_locked(&state, q, top_k, filter))
            .collect())
    }

    fn search_locked(
        &self,
        state: &CollectionState,
        query: &NormalizedVector,
        top_k: usize,
        filter: Option<&dyn Filter>,
    ) -> Vec<SearchHit> {
        let metric = self.schema.metric;
        let to_hit = |record: &Record, raw: f32| SearchHit {
            key: record.key.clone(),
            metadata: record.metadata.clone(),
            score: metric.score(raw),
        };

        match &state.index {
            Some(index) if filter.is_none() && state.records.len() > EXACT_SCAN_THRESHOLD => index
                .search(query.as_slice(), top_k, None)
                .into_iter()
                .filter_map(|(key, raw)| state.records.get(key).map(|r| to_hit(r, raw)))
                .collect(),
            _ => {
                let mut scored: Vec<(OrderedFloat<f32>, &Record)> = state
                    .records
                    .values()
                    .filter(|r| filter.map_or(true, |f| f.matches(r)))
                    .map(|r| (OrderedFloat(metric.raw(query.as_slice(), r.vector.as_slice())), r))
                    .collect();
                let by_rank = |a: &(OrderedFloat<f32>, &Record), b: &(OrderedFloat<f32>, &Record)| {
                    a.0.cmp(&b.0).then_with(|| a.1.key.cmp(&b.1.key))
                };
                if scored.len() > top_k {
                    scored.select_nth_unstable_by(top_k - 1, by_rank);
                    scored.truncate(top_k);
                }
                scored.sort_by(by_rank);
                scored.into_iter().map(|(raw, r)| to_hit(r, raw.0)).collect()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{into_metadata, PayloadFilter, Vector};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use serde_json::json;

    fn record(key: &str, v: Vec<f32>, meta: serde_json::Value) -> Record {
        Record::new(key, Vector::new(v).normalize(), into_metadata(meta))
    }

    fn query(v: Vec<f32>) -> NormalizedVector {
        Vector::new(v).normalize()
    }

    #[test]
    fn test_distance_parse() {
        assert_eq!("cosine".parse::<Distance>().unwrap(), Distance::Cosine);
        assert_eq!("L2".parse::<Distance>().unwrap(), Distance::Euclidean);
        assert!("manhattan".parse::<Distance>().is_err());
        assert_eq!(serde_json::to_value(Distance::Euclidean).unwrap(), json!("euclidean"));
    }

    #[test]
    fn test_schema_compatibility() {
        let schema = CollectionSchema::new("images", 4, Distance::Cosine);
        assert!(schema.check_compatible(4, Distance::Cosine).is_ok());
        assert!(matches!(
            schema.check_compatible(8, Distance::Cosine),
            Err(Error::SchemaConflict { .. })
        ));
        assert!(matches!(
            schema.check_compatible(4, Distance::Euclidean),
            Err(Error::SchemaConflict { .. })
        ));
    }

    #[test]
    fn test_cosine_ranking() {
        let c = Collection::new(CollectionSchema::new("t", 2, Distance::Cosine));
        c.upsert(record("opposite", vec![-1.0, 0.0], json!({}))).unwrap();
        c.upsert(record("orthogonal", vec![0.0, 1.0], json!({}))).unwrap();
        c.upsert(record("identical", vec![2.0, 0.0], json!({}))).unwrap();

        let hits = c.search(&query(vec![1.0, 0.0]), 3, None).unwrap();
        let keys: Vec<&str> = hits.iter().map(|h| h.key.as_str()).collect();
        assert_eq!(keys, vec!["identical", "orthogonal", "opposite"]);
        assert!((hits[0].score - 1.0).abs() < 1e-6);
        assert!(hits[1].score.abs() < 1e-6);
        assert!((hits[2].score + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_euclidean_ranking() {
        let c = Collection::new(CollectionSchema::new("t", 2, Distance::Euclidean));
        c.upsert(record("far", vec![-1.0, 0.0], json!({}))).unwrap();
        c.upsert(record("near", vec![1.0, 0.0], json!({}))).unwrap();
        c.upsert(record("mid", vec![0.0, 1.0], json!({}))).unwrap();

        let hits = c.search(&query(vec![1.0, 0.0]), 10, None).unwrap();
        let keys: Vec<&str> = hits.iter().map(|h| h.key.as_str()).collect();
        assert_eq!(keys, vec!["near", "mid", "far"]);
        assert!(hits[0].score < 1e-6);
        assert!((hits[1].score - 2f32.sqrt()).abs() < 1e-5);
        assert!((hits[2].score - 2.0).abs() < 1e-5);
    }

    #[test]
    fn test_upsert_replaces() {
        let c = Collection::new(CollectionSchema::new("t", 2, Distance::Cosine));
        assert!(c.upsert(record("k", vec![1.0, 0.0], json!({"v": 1}))).unwrap().is_none());
        let prev = c.upsert(record("k", vec![0.0, 1.0], json!({"w": 2}))).unwrap();
        assert_eq!(prev.unwrap().metadata["v"], json!(1));
        assert_eq!(c.len(), 1);
        let stored = c.get("k").unwrap();
        assert_eq!(stored.metadata.get("v"), None);
        assert_eq!(stored.metadata["w"], json!(2));
    }

    #[test]
    fn test_dimension_guard() {
        let c = Collection::new(CollectionSchema::new("t", 3, Distance::Cosine));
        let err = c.upsert(record("k", vec![1.0, 0.0], json!({}))).unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch { expected: 3, actual: 2 }));
        assert!(c.is_empty());
        assert!(c.search(&query(vec![1.0]), 1, None).is_err());
    }

    #[test]
    fn test_top_k_zero_and_batch_order() {
        let c = Collection::new(CollectionSchema::new("t", 2, Distance::Cosine));
        c.upsert(record("x", vec![1.0, 0.0], json!({}))).unwrap();
        c.upsert(record("y", vec![0.0, 1.0], json!({}))).unwrap();

        assert!(c.search(&query(vec![1.0, 0.0]), 0, None).unwrap().is_empty());

        let queries = vec![query(vec![0.0, 1.0]), query(vec![1.0, 0.0])];
        let batch = c.search_batch(&queries, 1, None).unwrap();
        assert_eq!(batch[0][0].key, "y");
        assert_eq!(batch[1][0].key, "x");
        assert_eq!(batch[1], c.search(&queries[1], 1, None).unwrap());
    }

    #[test]
    fn test_filtered_search() {
        let c = Collection::new(CollectionSchema::new("t", 2, Distance::Cosine));
        c.upsert(record("a", vec![1.0, 0.0], json!({"item_id": "cat"}))).unwrap();
        c.upsert(record("b", vec![0.9, 0.1], json!({"item_id": "dog"}))).unwrap();

        let filter = PayloadFilter::parse(r#"item_id == "dog""#).unwrap();
        let hits = c.search(&query(vec![1.0, 0.0]), 5, Some(&filter)).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].key, "b");
    }

    #[test]
    fn test_indexed_search_and_compaction() {
        let schema = CollectionSchema::new("t", 8, Distance::Cosine).with_index(IndexParams::default());
        let c = Collection::new(schema);
        let mut rng = StdRng::seed_from_u64(11);
        for i in 0..(EXACT_SCAN_THRESHOLD + 200) {
            let v: Vec<f32> = (0..8).map(|_| rng.random_range(-1.0f32..1.0)).collect();
            c.upsert(record(&format!("k{i}"), v, json!({"i": i}))).unwrap();
        }
        let target = c.get("k42").unwrap();
        let hits = c.search(&target.vector, 1, None).unwrap();
        assert!((hits[0].score - 1.0).abs() < 1e-5);

        for i in 0..600 {
            c.remove(&format!("k{i}"));
        }
        assert_eq!(c.len(), EXACT_SCAN_THRESHOLD + 200 - 600);
        assert!(c.search(&target.vector, 5, None).unwrap().iter().all(|h| h.key != "k42"));
        assert_eq!(c.schema().index, Some(IndexParams::default()));
    }

    fn indexed(n: usize, rng: &mut StdRng) -> Collection {
        let schema = CollectionSchema::new("t", 8, Distance::Cosine).with_index(IndexParams::default());
        let c = Collection::new(schema);
        for i in 0..n {
            let v: Vec<f32> = (0..8).map(|_| rng.random_range(-1.0f32..1.0)).collect();
            c.upsert(record(&format!("k{i}"), v, json!({"i": i}))).unwrap();
        }
        c
    }

    #[test]
    fn test_replace_found_through_index() {
        let mut rng = StdRng::seed_from_u64(5);
        let c = indexed(EXACT_SCAN_THRESHOLD + 100, &mut rng);
        let fresh = vec![0.3, -0.9, 0.1, 0.4, -0.2, 0.8, -0.5, 0.6];
        c.upsert(record("k17", fresh.clone(), json!({"v": 2}))).unwrap();

        let hits = c.search(&query(fresh), 3, None).unwrap();
        assert_eq!(hits[0].key, "k17");
        assert!((hits[0].score - 1.0).abs() < 1e-5);
        assert_eq!(hits[0].metadata.get("v"), Some(&json!(2)));
        assert_eq!(hits.iter().filter(|h| h.key == "k17").count(), 1);
    }

    #[test]
    fn test_repeated_upserts_compact_the_index() {
        let mut rng = StdRng::seed_from_u64(9);
        let c = indexed(EXACT_SCAN_THRESHOLD + 10, &mut rng);
        for i in 0..2000 {
            let v: Vec<f32> = (0..8).map(|j| ((i + j) % 7) as f32 - 3.0).collect();
            c.upsert(record("same", v, json!({"i": i}))).unwrap();
        }
        let state = c.state.read();
        let index = state.index.as_ref().unwrap();
        assert!(!index.needs_compaction());
        assert_eq!(index.len(), state.records.len());
    }

    #[test]
    fn test_readers_see_exactly_one_version() {
        let mut rng = StdRng::seed_from_u64(21);
        let c = indexed(EXACT_SCAN_THRESHOLD + 100, &mut rng);
        let a = vec![1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0];
        let b = vec![1.0, 0.01, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0];
        c.upsert(record("hot", a.clone(), json!({"v": 0}))).unwrap();

        std::thread::scope(|scope| {
            scope.spawn(|| {
                for i in 0..400 {
                    let v = if i % 2 == 0 { b.clone() } else { a.clone() };
                    c.upsert(record("hot", v, json!({"v": i + 1}))).unwrap();
                }
            });
            for _ in 0..2 {
                scope.spawn(|| {
                    for _ in 0..200 {
                        let hits = c.search(&query(a.clone()), 5, None).unwrap();
                        assert_eq!(hits.iter().filter(|h| h.key == "hot").count(), 1);
                        assert_eq!(hits[0].key, "hot");
                    }
                });
            }
        });
        assert_eq!(c.len(), EXACT_SCAN_THRESHOLD + 101);
    }
}
