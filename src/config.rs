use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use vizdex_core::{Distance, Error, IndexParams, Result};
use vizdex_embed::Device;

/// Content-based image retrieval service
#[derive(Parser, Debug, Clone)]
#[command(name = "vizdex")]
#[command(about = "Embed images, store their vectors, and search by visual similarity", long_about = None)]
pub struct Config {
    /// Embedding dimension produced by the model
    #[arg(long, env = "VECTOR_DIM")]
    pub vector_dim: usize,

    /// Host of a Qdrant-compatible index server; unset runs the embedded engine
    #[arg(long, env = "INDEX_HOST")]
    pub index_host: Option<String>,

    /// Legacy name for --index-host
    #[arg(long, env = "MILVUS_HOST", hide = true)]
    pub milvus_host: Option<String>,

    /// Port of the index server
    #[arg(long, env = "INDEX_PORT", default_value_t = 6333)]
    pub index_port: u16,

    /// Collection holding the image records
    #[arg(long, env = "COLLECTION_NAME", default_value = "images")]
    pub collection_name: String,

    /// Similarity metric: cosine or euclidean
    #[arg(long, env = "METRIC", default_value = "cosine")]
    pub metric: Distance,

    /// ONNX model file, or a directory with model.onnx and preprocessor_config.json
    #[arg(long, env = "MODEL_PATH")]
    pub model_path: Option<PathBuf>,

    /// Inference device: cpu, cuda or cuda:<n>
    #[arg(long, env = "DEVICE", default_value = "cpu")]
    pub device: Device,

    /// Data directory for the embedded engine
    #[arg(short, long, env = "DATA_DIR", default_value = "./data")]
    pub data_dir: PathBuf,

    /// HTTP bind address
    #[arg(long, env = "HTTP_HOST", default_value = "127.0.0.1")]
    pub http_host: String,

    /// HTTP API port
    #[arg(long, env = "HTTP_PORT", default_value_t = 8003)]
    pub http_port: u16,

    /// Per-request time budget in seconds
    #[arg(long, env = "REQUEST_TIMEOUT_SECS", default_value_t = 30)]
    pub request_timeout_secs: u64,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Config {
    /// Reject settings no component could run with.
    pub fn validate(&self) -> Result<()> {
        if self.vector_dim == 0 {
            return Err(Error::InvalidConfig("VECTOR_DIM must be positive".to_string()));
        }
        if self.collection_name.trim().is_empty() {
            return Err(Error::InvalidConfig("COLLECTION_NAME must not be empty".to_string()));
        }
        if self.request_timeout_secs == 0 {
            return Err(Error::InvalidConfig("REQUEST_TIMEOUT_SECS must be positive".to_string()));
        }
        if self.http_host.trim().is_empty() {
            return Err(Error::InvalidConfig("HTTP_HOST must not be empty".to_string()));
        }
        Ok(())
    }

    /// The model's output length must equal the configured collection dimension.
    pub fn check_embedding_dim(&self, produced: usize) -> Result<()> {
        if produced != self.vector_dim {
            return Err(Error::InvalidConfig(format!(
                "model produces {}-dimensional embeddings but VECTOR_DIM is {}",
                produced, self.vector_dim
            )));
        }
        Ok(())
    }

    pub fn index_host(&self) -> Option<&str> {
        self.index_host
            .as_deref()
            .or(self.milvus_host.as_deref())
            .filter(|h| !h.trim().is_empty())
    }

    pub fn index_params(&self) -> IndexParams {
        IndexParams::default()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
