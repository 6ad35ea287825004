use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};
use vizdex_core::{Error, Result};

use crate::backend::{InferenceBackend, InputSpec};
use crate::loader::CanonicalImage;
use crate::preprocess::PreprocessorConfig;

/// Gray level of the warmup image.
const WARMUP_GRAY: u8 = 127;

struct ExtractorInner {
    backend: Arc<dyn InferenceBackend>,
    config: PreprocessorConfig,
    spec: InputSpec,
    closed: AtomicBool,
}

impl ExtractorInner {
    fn extract(&self, image: &CanonicalImage) -> Result<Vec<f32>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Inference("feature extractor is closed".to_string()));
        }
        let pixels = self.config.prepare(image, self.spec)?;
        let start = Instant::now();
        let output = self.backend.infer(&pixels)?;
        let embedding = output.into_embedding()?;
        debug!(
            "Inference on {}x{} image took {:.2?} ({} dims)",
            image.width(),
            image.height(),
            start.elapsed(),
            embedding.len()
        );
        Ok(embedding)
    }
}

/// Turns decoded images into raw embedding vectors, one backend call per image.
#[derive(Clone)]
pub struct FeatureExtractor {
    inner: Arc<ExtractorInner>,
}

impl FeatureExtractor {
    pub fn new(backend: Arc<dyn InferenceBackend>, config: PreprocessorConfig) -> Self {
        let spec = backend.input_spec();
        Self {
            inner: Arc::new(ExtractorInner {
                backend,
                config,
                spec,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Load an ONNX model from a file or a model directory holding `preprocessor_config.json`.
    #[cfg(feature = "onnx")]
    pub fn from_onnx(model_path: &std::path::Path, device: crate::backend::Device) -> Result<Self> {
        let dir = if model_path.is_dir() {
            model_path.to_path_buf()
        } else {
            model_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_default()
        };
        let config = PreprocessorConfig::load_or_default(&dir)?;
        let backend = crate::onnx::OnnxBackend::load(model_path, device, config.input_spec())?;
        Ok(Self::new(Arc::new(backend), config))
    }

    pub fn input_spec(&self) -> InputSpec {
        self.inner.spec
    }

    pub fn backend_name(&self) -> &str {
        self.inner.backend.name()
    }

    /// Preprocess and infer on the calling thread.
    pub fn extract_blocking(&self, image: &CanonicalImage) -> Result<Vec<f32>> {
        self.inner.extract(image)
    }

    /// Preprocess and infer on the blocking pool.
    pub async fn extract(&self, image: CanonicalImage) -> Result<Vec<f32>> {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || inner.extract(&image))
            .await
            .map_err(|e| Error::Inference(format!("inference worker failed: {e}")))?
    }

    /// One inference on a mid-gray image at the model's input size.
    pub async fn warmup(&self) -> Result<usize> {
        let spec = self.inner.spec;
        let start = Instant::now();
        let embedding = self
            .extract(CanonicalImage::solid(spec.width, spec.height, [WARMUP_GRAY; 3]))
            .await?;
        info!("Warmup completed in {:.2?}", start.elapsed());
        Ok(embedding.len())
    }

    /// Release the backend; every later `extract` fails.
    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::AcqRel) {
            self.inner.backend.release();
            info!("Feature extractor closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}
