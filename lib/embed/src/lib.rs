//! Image side of vizdex: decode inputs, shape them for the model, and extract embeddings.
//!
//! The ONNX Runtime backend is behind the `onnx` feature; anything implementing
//! [`InferenceBackend`] can drive a [`FeatureExtractor`].

pub mod backend;
pub mod extractor;
pub mod loader;
#[cfg(feature = "onnx")]
pub mod onnx;
pub mod preprocess;

pub use backend::{BackendOutput, Device, InferenceBackend, InputSpec};
pub use extractor::FeatureExtractor;
pub use loader::{CanonicalImage, ImageInput, ImageLoader};
#[cfg(feature = "onnx")]
pub use onnx::OnnxBackend;
pub use preprocess::{PreprocessorConfig, SizeSpec};
