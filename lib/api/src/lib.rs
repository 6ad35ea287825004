pub mod rest;
pub mod retrieval;

pub use rest::{configure, ApiError, AppState, RestApi};
pub use retrieval::{IngestOutcome, RetrievalService};
