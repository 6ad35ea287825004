//! # vizdex
//!
//! Content-based image retrieval: embed images with a vision model, keep the
//! vectors in a similarity index, and find the stored images that look most
//! like a query.
//!
//! ## As a Server
//!
//! ```bash
//! cargo run --release --features onnx -- --vector-dim 512 --model-path ./model
//! ```
//!
//! The HTTP surface is `GET /health`, `POST /upsert/`, `POST /retrieve/` and
//! `DELETE /record/{image_id}`.
//!
//! ## As a Library
//!
//! ```rust,no_run
//! use vizdex::prelude::*;
//!
//! # async fn run() -> vizdex::Result<()> {
//! let engine = Engine::embedded("./data")?;
//! let store = SimilarityStore::open(engine, "images", 3, Distance::Cosine, IndexParams::default()).await?;
//!
//! let vector = Vector::new(vec![0.1, 0.2, 0.3]).normalize();
//! store.upsert("img_1", vector.clone(), serde_json::Map::new()).await?;
//!
//! let hits = store.search(vector, 5, None).await?;
//! assert_eq!(hits[0].key, "img_1");
//! # Ok(())
//! # }
//! ```
//!
//! ## Crate Structure
//!
//! - `vizdex-core` - vectors, records, filters, HNSW and the in-memory collection
//! - `vizdex-storage` - LMDB persistence, the embedded and remote engines, and the similarity store
//! - `vizdex-embed` - image loading, preprocessing and feature extraction
//! - `vizdex-api` - the retrieval pipeline and its REST surface

pub mod config;

pub use vizdex_core::{
    Collection, CollectionSchema, Deadline, Distance, Error, Filter, FilterCondition, HnswIndex,
    IndexParams, NormalizedVector, PayloadFilter, Record, Result, SearchHit, Vector,
};

pub use vizdex_storage::{EmbeddedEngine, Engine, IndexEngine, RemoteEngine, Residency, SimilarityStore};

pub use vizdex_embed::{
    BackendOutput, CanonicalImage, Device, FeatureExtractor, ImageInput, ImageLoader, InferenceBackend,
    InputSpec, PreprocessorConfig,
};

pub use vizdex_api::{configure, ApiError, AppState, IngestOutcome, RestApi, RetrievalService};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        Deadline, Distance, Engine, Error, FeatureExtractor, ImageInput, ImageLoader, IndexEngine,
        IndexParams, NormalizedVector, PayloadFilter, Result, RetrievalService, SearchHit,
        SimilarityStore, Vector,
    };
}
