use ahash::AHashMap;
use parking_lot::RwLock;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};
use vizdex_core::{
    Collection, CollectionSchema, Error, Filter, IndexParams, NormalizedVector, PayloadFilter, Record, Result,
    SearchHit,
};

use crate::engine::IndexEngine;
use crate::lmdb_storage::LmdbStorage;

fn storage_err(e: anyhow::Error) -> Error {
    Error::Storage(e.to_string())
}

/// Run LMDB/HNSW work on the blocking pool.
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Storage(format!("storage worker failed: {e}")))?
}

struct EmbeddedInner {
    lmdb: LmdbStorage,
    /// Collections currently held in memory with their HNSW graphs.
    resident: RwLock<AHashMap<String, Arc<Collection>>>,
}

impl EmbeddedInner {
    fn schema(&self, name: &str) -> Result<CollectionSchema> {
        self.lmdb
            .get_schema(name)
            .map_err(storage_err)?
            .ok_or_else(|| Error::NotFound(format!("collection '{name}'")))
    }

    fn resident(&self, name: &str) -> Option<Arc<Collection>> {
        self.resident.read().get(name).cloned()
    }

    fn load(&self, name: &str) -> Result<Arc<Collection>> {
        if let Some(collection) = self.resident(name) {
            return Ok(collection);
        }
        // Writers hold the read side while touching LMDB, so no write can slip
        // between reading the records and publishing the collection.
        let mut resident = self.resident.write();
        if let Some(collection) = resident.get(name) {
            return Ok(collection.clone());
        }
        let schema = self.schema(name)?;
        let records = self.lmdb.load_records(name).map_err(storage_err)?;
        let count = records.len();
        let collection = Arc::new(Collection::from_records(schema, records));
        resident.insert(name.to_string(), collection.clone());
        info!("Loaded collection '{}' ({} records)", name, count);
        Ok(collection)
    }
}

/// In-process engine: records persisted in LMDB, searched through a resident HNSW graph.
#[derive(Clone)]
pub struct EmbeddedEngine {
    inner: Arc<EmbeddedInner>,
}

impl EmbeddedEngine {
    pub fn open<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        Self::from_storage(LmdbStorage::new(data_dir.as_ref().join("lmdb")).map_err(storage_err)?)
    }

    pub fn from_storage(lmdb: LmdbStorage) -> Result<Self> {
        Ok(Self {
            inner: Arc::new(EmbeddedInner {
                lmdb,
                resident: RwLock::new(AHashMap::new()),
            }),
        })
    }

    /// Whether `name` is currently held in memory.
    pub fn is_resident(&self, name: &str) -> bool {
        self.inner.resident(name).is_some()
    }
}

impl IndexEngine for EmbeddedEngine {
    async fn describe(&self, name: &str) -> Result<Option<CollectionSchema>> {
        let inner = self.inner.clone();
        let name = name.to_string();
        blocking(move || inner.lmdb.get_schema(&name).map_err(storage_err)).await
    }

    async fn create_collection(&self, schema: &CollectionSchema) -> Result<()> {
        let inner = self.inner.clone();
        let schema = schema.clone();
        blocking(move || inner.lmdb.save_schema(&schema).map_err(storage_err)).await
    }

    async fn create_index(&self, name: &str, params: IndexParams, force: bool) -> Result<()> {
        let inner = self.inner.clone();
        let name = name.to_string();
        blocking(move || {
            let mut schema = inner.schema(&name)?;
            if schema.index.is_some() && !force {
                return Ok(());
            }
            schema.index = Some(params);
            inner.lmdb.save_schema(&schema).map_err(storage_err)?;
            if let Some(collection) = inner.resident(&name) {
                collection.build_index(params);
            }
            info!("Built index for '{}' (m={}, ef_construction={})", name, params.m, params.ef_construction);
            Ok(())
        })
        .await
    }

    async fn load(&self, name: &str) -> Result<()> {
        let inner = self.inner.clone();
        let name = name.to_string();
        blocking(move || inner.load(&name).map(|_| ())).await
    }

    async fn release(&self, name: &str) -> Result<()> {
        if self.inner.resident.write().remove(name).is_some() {
            info!("Released collection '{}'", name);
        }
        Ok(())
    }

    async fn upsert(&self, name: &str, record: Record) -> Result<()> {
        let inner = self.inner.clone();
        let name = name.to_string();
        blocking(move || {
            let schema = inner.schema(&name)?;
            schema.check_dim(record.vector.dim())?;
            let resident = inner.resident.read();
            inner.lmdb.put_record(&name, &record).map_err(storage_err)?;
            if let Some(collection) = resident.get(&name) {
                collection.upsert(record)?;
            }
            Ok(())
        })
        .await
    }

    async fn contains(&self, name: &str, key: &str) -> Result<bool> {
        let inner = self.inner.clone();
        let (name, key) = (name.to_string(), key.to_string());
        blocking(move || inner.lmdb.contains_record(&name, &key).map_err(storage_err)).await
    }

    async fn delete(&self, name: &str, key: &str) -> Result<bool> {
        let inner = self.inner.clone();
        let (name, key) = (name.to_string(), key.to_string());
        blocking(move || {
            let resident = inner.resident.read();
            let existed = inner.lmdb.delete_record(&name, &key).map_err(storage_err)?;
            if let Some(collection) = resident.get(&name) {
                collection.remove(&key);
            }
            Ok(existed)
        })
        .await
    }

    async fn search_batch(
        &self,
        name: &str,
        queries: Vec<NormalizedVector>,
        top_k: usize,
        filter: Option<&PayloadFilter>,
    ) -> Result<Vec<Vec<SearchHit>>> {
        let inner = self.inner.clone();
        let name = name.to_string();
        let filter = filter.cloned();
        blocking(move || {
            let collection = inner.load(&name)?;
            let hits = collection.search_batch(&queries, top_k, filter.as_ref().map(|f| f as &dyn Filter))?;
            debug!("Searched '{}' with {} queries", name, queries.len());
            Ok(hits)
        })
        .await
    }

    async fn count(&self, name: &str) -> Result<usize> {
        if let Some(collection) = self.inner.resident(name) {
            return Ok(collection.len());
        }
        let inner = self.inner.clone();
        let name = name.to_string();
        blocking(move || inner.lmdb.count_records(&name).map_err(storage_err)).await
    }

    async fn flush(&self) -> Result<()> {
        let inner = self.inner.clone();
        blocking(move || inner.lmdb.sync().map_err(storage_err)).await
    }

    async fn close(&self) -> Result<()> {
        self.flush().await?;
        self.inner.resident.write().clear();
        Ok(())
    }
}
