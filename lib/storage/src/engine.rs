use std::future::Future;
use std::path::Path;
use vizdex_core::{CollectionSchema, IndexParams, NormalizedVector, PayloadFilter, Record, Result, SearchHit};

use crate::embedded::EmbeddedEngine;
use crate::remote::RemoteEngine;

/// Seam between the similarity store and whatever holds the vectors.
///
/// Engines are collection-addressed and stateless towards callers; residency
/// bookkeeping and write serialization live in [`crate::SimilarityStore`].
pub trait IndexEngine: Send + Sync + 'static {
    /// Stored schema of `name`, if the collection exists.
    fn describe(&self, name: &str) -> impl Future<Output = Result<Option<CollectionSchema>>> + Send;

    fn create_collection(&self, schema: &CollectionSchema) -> impl Future<Output = Result<()>> + Send;

    /// Build the similarity index. Without `force` an existing index is kept.
    fn create_index(
        &self,
        name: &str,
        params: IndexParams,
        force: bool,
    ) -> impl Future<Output = Result<()>> + Send;

    fn load(&self, name: &str) -> impl Future<Output = Result<()>> + Send;

    fn release(&self, name: &str) -> impl Future<Output = Result<()>> + Send;

    /// Replace whatever is stored under `record.key` in one step.
    fn upsert(&self, name: &str, record: Record) -> impl Future<Output = Result<()>> + Send;

    fn contains(&self, name: &str, key: &str) -> impl Future<Output = Result<bool>> + Send;

    /// Remove `key`, reporting whether it was present.
    fn delete(&self, name: &str, key: &str) -> impl Future<Output = Result<bool>> + Send;

    fn search_batch(
        &self,
        name: &str,
        queries: Vec<NormalizedVector>,
        top_k: usize,
        filter: Option<&PayloadFilter>,
    ) -> impl Future<Output = Result<Vec<Vec<SearchHit>>>> + Send;

    fn count(&self, name: &str) -> impl Future<Output = Result<usize>> + Send;

    fn flush(&self) -> impl Future<Output = Result<()>> + Send;

    fn close(&self) -> impl Future<Output = Result<()>> + Send;
}

/// The engines a deployment can choose between at startup.
pub enum Engine {
    Embedded(EmbeddedEngine),
    Remote(RemoteEngine),
}

impl Engine {
    pub fn embedded<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        Ok(Engine::Embedded(EmbeddedEngine::open(data_dir)?))
    }

    /// Connect to a Qdrant-compatible server; an unreachable server is fatal.
    pub async fn remote(host: &str, port: u16) -> Result<Self> {
        Ok(Engine::Remote(RemoteEngine::connect(host, port).await?))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Engine::Embedded(_) => "embedded",
            Engine::Remote(_) => "remote",
        }
    }
}

macro_rules! dispatch {
    ($self:ident, $engine:ident => $call:expr) => {
        match $self {
            Engine::Embedded($engine) => $call.await,
            Engine::Remote($engine) => $call.await,
        }
    };
}

impl IndexEngine for Engine {
    async fn describe(&self, name: &str) -> Result<Option<CollectionSchema>> {
        dispatch!(self, e => e.describe(name))
    }

    async fn create_collection(&self, schema: &CollectionSchema) -> Result<()> {
        dispatch!(self, e => e.create_collection(schema))
    }

    async fn create_index(&self, name: &str, params: IndexParams, force: bool) -> Result<()> {
        dispatch!(self, e => e.create_index(name, params, force))
    }

    async fn load(&self, name: &str) -> Result<()> {
        dispatch!(self, e => e.load(name))
    }

    async fn release(&self, name: &str) -> Result<()> {
        dispatch!(self, e => e.release(name))
    }

    async fn upsert(&self, name: &str, record: Record) -> Result<()> {
        dispatch!(self, e => e.upsert(name, record))
    }

    async fn contains(&self, name: &str, key: &str) -> Result<bool> {
        dispatch!(self, e => e.contains(name, key))
    }

    async fn delete(&self, name: &str, key: &str) -> Result<bool> {
        dispatch!(self, e => e.delete(name, key))
    }

    async fn search_batch(
        &self,
        name: &str,
        queries: Vec<NormalizedVector>,
        top_k: usize,
        filter: Option<&PayloadFilter>,
    ) -> Result<Vec<Vec<SearchHit>>> {
        dispatch!(self, e => e.search_batch(name, queries, top_k, filter))
    }

    async fn count(&self, name: &str) -> Result<usize> {
        dispatch!(self, e => e.count(name))
    }

    async fn flush(&self) -> Result<()> {
        dispatch!(self, e => e.flush())
    }

    async fn close(&self) -> Result<()> {
        dispatch!(self, e => e.close())
    }
}
