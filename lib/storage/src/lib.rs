pub mod embedded;
pub mod engine;
pub mod lmdb_storage;
pub mod remote;
pub mod store;

pub use embedded::EmbeddedEngine;
pub use engine::{Engine, IndexEngine};
pub use lmdb_storage::LmdbStorage;
pub use remote::RemoteEngine;
pub use store::{validate_key, Residency, SimilarityStore, MAX_KEY_BYTES};
