use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Failed to decode image from {input}: {reason}")]
    ImageDecode { input: String, reason: String },

    #[error("Preprocessing failed: {0}")]
    Preprocess(String),

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Invalid vector dimension: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Collection '{collection}' has an incompatible schema: {reason}")]
    SchemaConflict { collection: String, reason: String },

    #[error("Index backend unreachable: {0}")]
    Connection(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Deadline exceeded during {stage}")]
    Timeout { stage: &'static str },

    #[error("Invalid filter expression: {0}")]
    InvalidFilter(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the failure was caused by the request rather than by a broken dependency.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::ImageDecode { .. }
                | Error::Preprocess(_)
                | Error::DimensionMismatch { .. }
                | Error::InvalidFilter(_)
                | Error::InvalidKey(_)
                | Error::NotFound(_)
        )
    }

    pub fn image_decode(input: impl Into<String>, reason: impl ToString) -> Self {
        Error::ImageDecode {
            input: input.into(),
            reason: reason.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
