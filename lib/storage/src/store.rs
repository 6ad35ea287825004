use ahash::AHashMap;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, warn};
use vizdex_core::{
    CollectionSchema, Distance, Error, IndexParams, NormalizedVector, PayloadFilter, Record, Result, SearchHit,
};

use crate::engine::{Engine, IndexEngine};

/// Residency of the store's collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Residency {
    /// Collection and index exist; nothing is held for search yet.
    Ready,
    /// Searchable.
    Loaded,
    /// Explicitly released; the next search reloads.
    Released,
}

/// Longest key accepted, in bytes.
pub const MAX_KEY_BYTES: usize = 128;

/// Keys must be non-empty and at most [`MAX_KEY_BYTES`] long.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::InvalidKey("key must not be empty".to_string()));
    }
    if key.len() > MAX_KEY_BYTES {
        return Err(Error::InvalidKey(format!(
            "key is {} bytes, at most {} allowed",
            key.len(),
            MAX_KEY_BYTES
        )));
    }
    Ok(())
}

#[derive(Default)]
struct KeySlot {
    mutex: Arc<AsyncMutex<()>>,
    /// Guards alive for this key, holding or waiting.
    users: usize,
}

type LockMap = Arc<Mutex<AHashMap<String, KeySlot>>>;

/// Per-key async mutexes; an entry lives only while someone holds or awaits it.
#[derive(Default)]
struct KeyLocks {
    inner: LockMap,
}

/// Registered before the wait starts, so a cancelled wait still releases its slot.
struct KeyGuard {
    key: String,
    locks: LockMap,
    guard: Option<OwnedMutexGuard<()>>,
}

impl KeyLocks {
    async fn lock(&self, key: &str) -> KeyGuard {
        let mutex = {
            let mut locks = self.inner.lock();
            let slot = locks.entry(key.to_string()).or_default();
            slot.users += 1;
            slot.mutex.clone()
        };
        let mut guard = KeyGuard {
            key: key.to_string(),
            locks: self.inner.clone(),
            guard: None,
        };
        guard.guard = Some(mutex.lock_owned().await);
        guard
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().len()
    }
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = self.locks.lock();
        if let Some(slot) = locks.get_mut(&self.key) {
            slot.users -= 1;
            if slot.users == 0 {
                locks.remove(&self.key);
            }
        }
    }
}

/// Durable, searchable home of the image records of one collection.
pub struct SimilarityStore<E: IndexEngine = Engine> {
    engine: E,
    schema: CollectionSchema,
    residency: AsyncMutex<Residency>,
    key_locks: KeyLocks,
}

impl<E: IndexEngine> SimilarityStore<E> {
    /// Ensure the collection and its index exist, then hand back a ready store.
    pub async fn open(engine: E, name: &str, dim: usize, metric: Distance, params: IndexParams) -> Result<Self> {
        if dim == 0 {
            return Err(Error::InvalidConfig("vector dimension must be positive".to_string()));
        }
        let requested = CollectionSchema::new(name, dim, metric).with_index(params);
        let schema = match engine.describe(name).await? {
            Some(existing) => {
                existing.check_compatible(dim, metric)?;
                existing
            }
            None => {
                engine.create_collection(&requested).await?;
                info!("Created collection '{}' (dim={}, metric={})", name, dim, metric);
                requested
            }
        };
        engine.create_index(name, params, false).await?;
        info!("Collection '{}' ready", name);

        Ok(Self {
            engine,
            schema,
            residency: AsyncMutex::new(Residency::Ready),
            key_locks: KeyLocks::default(),
        })
    }

    pub fn schema(&self) -> &CollectionSchema {
        &self.schema
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub async fn residency(&self) -> Residency {
        *self.residency.lock().await
    }

    /// Rebuild the similarity index; without `force` an existing index is kept.
    pub async fn create_index(&self, params: IndexParams, force: bool) -> Result<()> {
        self.engine.create_index(&self.schema.name, params, force).await
    }

    /// Insert or fully replace the record stored under `key`.
    pub async fn upsert(&self, key: &str, vector: NormalizedVector, metadata: Map<String, Value>) -> Result<()> {
        validate_key(key)?;
        self.schema.check_dim(vector.dim())?;
        let _guard = self.key_locks.lock(key).await;
        self.engine
            .upsert(&self.schema.name, Record::new(key, vector, metadata))
            .await?;
        debug!("Upserted '{}' into '{}'", key, self.schema.name);
        Ok(())
    }

    /// Point lookup that surfaces read failures.
    pub async fn try_exists(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        self.engine.contains(&self.schema.name, key).await
    }

    /// Point lookup; a failed read is logged and reported as absent.
    pub async fn exists(&self, key: &str) -> bool {
        match self.try_exists(key).await {
            Ok(found) => found,
            Err(e) => {
                warn!("exists('{}') failed, treating as absent: {}", key, e);
                false
            }
        }
    }

    /// Remove `key`; returns whether a record was there.
    pub async fn delete(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        let _guard = self.key_locks.lock(key).await;
        let existed = self.engine.delete(&self.schema.name, key).await?;
        debug!("Deleted '{}' from '{}' (existed: {})", key, self.schema.name, existed);
        Ok(existed)
    }

    pub async fn search(
        &self,
        query: NormalizedVector,
        top_k: usize,
        filter: Option<&PayloadFilter>,
    ) -> Result<Vec<SearchHit>> {
        let mut results = self.search_batch(vec![query], top_k, filter).await?;
        Ok(results.pop().unwrap_or_default())
    }

    /// One result list per query, in input order.
    pub async fn search_batch(
        &self,
        queries: Vec<NormalizedVector>,
        top_k: usize,
        filter: Option<&PayloadFilter>,
    ) -> Result<Vec<Vec<SearchHit>>> {
        for query in &queries {
            self.schema.check_dim(query.dim())?;
        }
        if top_k == 0 || queries.is_empty() {
            return Ok(vec![Vec::new(); queries.len()]);
        }
        self.ensure_loaded().await?;
        self.engine
            .search_batch(&self.schema.name, queries, top_k, filter)
            .await
    }

    async fn ensure_loaded(&self) -> Result<()> {
        let mut residency = self.residency.lock().await;
        if *residency != Residency::Loaded {
            self.engine.load(&self.schema.name).await?;
            *residency = Residency::Loaded;
        }
        Ok(())
    }

    pub async fn load(&self) -> Result<()> {
        self.ensure_loaded().await
    }

    pub async fn release(&self) -> Result<()> {
        let mut residency = self.residency.lock().await;
        if *residency == Residency::Loaded {
            self.engine.release(&self.schema.name).await?;
        }
        *residency = Residency::Released;
        Ok(())
    }

    pub async fn flush(&self) -> Result<()> {
        self.engine.flush().await
    }

    pub async fn count(&self) -> Result<usize> {
        self.engine.count(&self.schema.name).await
    }

    /// Release the collection and shut the engine down.
    pub async fn close(&self) -> Result<()> {
        self.release().await?;
        self.engine.close().await?;
        info!("Closed collection '{}'", self.schema.name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedded::EmbeddedEngine;
    use crate::lmdb_storage::LmdbStorage;
    use serde_json::json;
    use tempfile::TempDir;
    use vizdex_core::{into_metadata, Vector};

    fn engine(dir: &TempDir) -> EmbeddedEngine {
        EmbeddedEngine::from_storage(LmdbStorage::with_map_size(dir.path(), 64 * 1024 * 1024).unwrap()).unwrap()
    }

    fn unit(v: Vec<f32>) -> NormalizedVector {
        Vector::new(v).normalize()
    }

    async fn open(dir: &TempDir, dim: usize, metric: Distance) -> SimilarityStore<EmbeddedEngine> {
        SimilarityStore::open(engine(dir), "images", dim, metric, IndexParams::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_upsert_replace_law() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, 2, Distance::Cosine).await;

        store.upsert("k", unit(vec![1.0, 0.0]), into_metadata(json!({"m": 1}))).await.unwrap();
        store.upsert("k", unit(vec![0.0, 1.0]), into_metadata(json!({"m": 2}))).await.unwrap();

        assert!(store.exists("k").await);
        assert_eq!(store.count().await.unwrap(), 1);
        let hits = store.search(unit(vec![0.0, 1.0]), 5, None).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].metadata["m"], json!(2));
        assert!((hits[0].score - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_dimension_guard_has_no_side_effect() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, 3, Distance::Cosine).await;
        let err = store.upsert("k", unit(vec![1.0, 0.0]), Map::new()).await.unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch { expected: 3, actual: 2 }));
        assert_eq!(store.count().await.unwrap(), 0);
        assert!(store.search(unit(vec![1.0]), 1, None).await.is_err());
    }

    #[tokio::test]
    async fn test_schema_conflict() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, 4, Distance::Cosine).await;
        let engine = store.engine().clone();
        drop(store);

        let err = SimilarityStore::open(engine.clone(), "images", 8, Distance::Cosine, IndexParams::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::SchemaConflict { .. }));
        let err = SimilarityStore::open(engine.clone(), "images", 4, Distance::Euclidean, IndexParams::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::SchemaConflict { .. }));
        assert!(SimilarityStore::open(engine, "images", 4, Distance::Cosine, IndexParams::default())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_residency_transitions() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, 2, Distance::Euclidean).await;
        assert_eq!(store.residency().await, Residency::Ready);

        store.upsert("a", unit(vec![1.0, 0.0]), Map::new()).await.unwrap();
        store.search(unit(vec![1.0, 0.0]), 1, None).await.unwrap();
        assert_eq!(store.residency().await, Residency::Loaded);

        store.release().await.unwrap();
        store.release().await.unwrap();
        assert_eq!(store.residency().await, Residency::Released);
        assert!(!store.engine().is_resident("images"));

        store.upsert("b", unit(vec![0.0, 1.0]), Map::new()).await.unwrap();
        let hits = store.search(unit(vec![0.0, 1.0]), 1, None).await.unwrap();
        assert_eq!(hits[0].key, "b");
        store.load().await.unwrap();
        assert_eq!(store.residency().await, Residency::Loaded);
    }

    #[tokio::test]
    async fn test_delete_and_top_k_zero() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, 2, Distance::Cosine).await;
        store.upsert("a", unit(vec![1.0, 0.0]), Map::new()).await.unwrap();

        assert!(store.search(unit(vec![1.0, 0.0]), 0, None).await.unwrap().is_empty());
        assert!(store.delete("a").await.unwrap());
        assert!(!store.delete("a").await.unwrap());
        assert!(!store.exists("a").await);
        assert!(store.search(unit(vec![1.0, 0.0]), 3, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_same_key_writes_are_serialized() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(open(&dir, 2, Distance::Cosine).await);

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let key = if i % 2 == 0 { "shared" } else { "other" };
                store
                    .upsert(key, unit(vec![1.0, i as f32]), into_metadata(json!({"i": i})))
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(store.count().await.unwrap(), 2);
        assert_eq!(store.key_locks.len(), 0);
    }

    #[tokio::test]
    async fn test_key_length_is_validated() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, 2, Distance::Cosine).await;
        let long = "k".repeat(600);

        let err = store.upsert(&long, unit(vec![1.0, 0.0]), Map::new()).await.unwrap_err();
        assert!(matches!(err, Error::InvalidKey(_)));
        assert!(err.is_client_error());
        assert!(matches!(store.delete(&long).await, Err(Error::InvalidKey(_))));
        assert!(matches!(store.upsert("", unit(vec![1.0, 0.0]), Map::new()).await, Err(Error::InvalidKey(_))));
        assert!(!store.exists(&long).await);

        let widest = "k".repeat(MAX_KEY_BYTES);
        store.upsert(&widest, unit(vec![1.0, 0.0]), Map::new()).await.unwrap();
        assert!(store.exists(&widest).await);
        assert!(store.delete(&widest).await.unwrap());
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_lock_wait_leaves_no_entry() {
        let locks = KeyLocks::default();
        let held = locks.lock("k").await;

        let waited = tokio::time::timeout(std::time::Duration::from_millis(20), locks.lock("k")).await;
        assert!(waited.is_err());
        assert_eq!(locks.len(), 1);

        drop(held);
        assert_eq!(locks.len(), 0);

        let again = tokio::time::timeout(std::time::Duration::from_millis(20), locks.lock("k")).await;
        assert!(again.is_ok());
        drop(again);
        assert_eq!(locks.len(), 0);
    }

    #[tokio::test]
    async fn test_lock_waiters_keep_the_entry() {
        let locks = Arc::new(KeyLocks::default());
        let held = locks.lock("k").await;
        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _g = locks.lock("k").await;
            })
        };
        tokio::task::yield_now().await;
        drop(held);
        waiter.await.unwrap();
        assert_eq!(locks.len(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_replace_and_search_on_indexed_collection() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(open(&dir, 8, Distance::Cosine).await);
        for i in 0..1100 {
            let v: Vec<f32> = (0..8).map(|j| ((i * 8 + j) as f32 * 12.9898).sin()).collect();
            store.upsert(&format!("k{i}"), unit(v), Map::new()).await.unwrap();
        }
        let a = vec![1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0];
        let b = vec![1.0, 0.01, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0];
        store.upsert("hot", unit(a.clone()), into_metadata(json!({"v": 0}))).await.unwrap();

        let writer = {
            let store = store.clone();
            let (a, b) = (a.clone(), b.clone());
            tokio::spawn(async move {
                for i in 0..100 {
                    let v = if i % 2 == 0 { b.clone() } else { a.clone() };
                    store.upsert("hot", unit(v), into_metadata(json!({"v": i + 1}))).await.unwrap();
                }
            })
        };
        let mut readers = Vec::new();
        for _ in 0..3 {
            let store = store.clone();
            let a = a.clone();
            readers.push(tokio::spawn(async move {
                for _ in 0..100 {
                    let hits = store.search(unit(a.clone()), 5, None).await.unwrap();
                    assert_eq!(hits.iter().filter(|h| h.key == "hot").count(), 1);
                    assert_eq!(hits[0].key, "hot");
                    tokio::task::yield_now().await;
                }
            }));
        }
        writer.await.unwrap();
        for reader in readers {
            reader.await.unwrap();
        }
        assert_eq!(store.count().await.unwrap(), 1101);
        assert_eq!(store.key_locks.len(), 0);
    }
}
