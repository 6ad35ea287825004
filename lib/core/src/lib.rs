//! # vizdex Core
//!
//! Core types for the vizdex image retrieval service:
//!
//! - [`Vector`] / [`NormalizedVector`] - raw embeddings and their unit-length form
//! - [`Record`] / [`SearchHit`] - what gets stored and what a search returns
//! - [`Collection`] - resident records with an [`HnswIndex`] over their vectors
//! - [`PayloadFilter`] - metadata predicates, parsed from expressions like `item_id == "a"`
//! - [`Deadline`] - per-request time budget
//!
//! ## Example
//!
//! ```rust
//! use vizdex_core::{Collection, CollectionSchema, Distance, Record, Vector};
//!
//! let collection = Collection::new(CollectionSchema::new("images", 3, Distance::Cosine));
//! let vector = Vector::new(vec![1.0, 0.0, 0.0]).normalize();
//! collection.upsert(Record::new("img_1", vector.clone(), Default::default())).unwrap();
//!
//! let hits = collection.search(&vector, 5, None).unwrap();
//! assert_eq!(hits[0].key, "img_1");
//! ```

pub mod collection;
pub mod deadline;
pub mod error;
pub mod filter;
pub mod hnsw;
pub mod record;
pub mod vector;

/// SIMD-optimized vector kernels
///
/// - AVX2/FMA on x86_64
/// - NEON on ARM64/Apple Silicon
/// - scalar fallback elsewhere
pub mod simd;

pub use collection::{Collection, CollectionSchema, Distance, IndexParams, EXACT_SCAN_THRESHOLD};
pub use deadline::Deadline;
pub use error::{Error, Result};
pub use filter::{Filter, FilterCondition, PayloadFilter};
pub use hnsw::HnswIndex;
pub use record::{into_metadata, Record, SearchHit};
pub use vector::{NormalizedVector, Vector};
