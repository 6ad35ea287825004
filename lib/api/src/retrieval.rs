use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};
use vizdex_core::{Deadline, Error, NormalizedVector, PayloadFilter, Result, SearchHit, Vector};
use vizdex_embed::{FeatureExtractor, ImageInput, ImageLoader};
use vizdex_storage::{validate_key, Engine, IndexEngine, SimilarityStore};

/// Metadata field stamped on every ingested record (Unix seconds, UTC).
pub const CREATED_AT_FIELD: &str = "created_at";

#[derive(Debug, Clone, Serialize)]
pub struct IngestOutcome {
    pub key: String,
    pub metadata: Map<String, Value>,
}

/// Load → extract → normalize → store, composed once for ingest and query.
pub struct RetrievalService<E: IndexEngine = Engine> {
    loader: ImageLoader,
    extractor: FeatureExtractor,
    store: Arc<SimilarityStore<E>>,
}

impl<E: IndexEngine> RetrievalService<E> {
    pub fn new(loader: ImageLoader, extractor: FeatureExtractor, store: Arc<SimilarityStore<E>>) -> Self {
        Self {
            loader,
            extractor,
            store,
        }
    }

    pub fn store(&self) -> &SimilarityStore<E> {
        &self.store
    }

    pub fn extractor(&self) -> &FeatureExtractor {
        &self.extractor
    }

    async fn embed(&self, input: ImageInput, deadline: Deadline) -> Result<NormalizedVector> {
        let start = Instant::now();
        let image = deadline.run("image load", self.loader.load(input)).await?;
        let raw = deadline.run("inference", self.extractor.extract(image)).await?;
        let dim = self.store.schema().dim;
        if raw.len() != dim {
            return Err(Error::Inference(format!(
                "model produced {} values, collection expects {}",
                raw.len(),
                dim
            )));
        }
        debug!("Embedded image in {:.2?}", start.elapsed());
        Ok(Vector::new(raw).normalize())
    }

    /// Embed `input` and store it under `key`, replacing any previous record.
    pub async fn ingest(
        &self,
        key: &str,
        input: ImageInput,
        mut metadata: Map<String, Value>,
        deadline: Deadline,
    ) -> Result<IngestOutcome> {
        validate_key(key)?;
        let vector = self.embed(input, deadline).await?;
        metadata.insert(CREATED_AT_FIELD.to_string(), Value::from(chrono::Utc::now().timestamp()));
        deadline
            .run("upsert", self.store.upsert(key, vector, metadata.clone()))
            .await?;
        info!("Ingested '{}'", key);
        Ok(IngestOutcome {
            key: key.to_string(),
            metadata,
        })
    }

    pub async fn query(&self, input: ImageInput, top_k: usize, deadline: Deadline) -> Result<Vec<SearchHit>> {
        let vector = self.embed(input, deadline).await?;
        deadline.run("search", self.store.search(vector, top_k, None)).await
    }

    /// Like [`query`](Self::query), restricted to records whose metadata matches `filter`.
    pub async fn query_filtered(
        &self,
        input: ImageInput,
        top_k: usize,
        filter: &PayloadFilter,
        deadline: Deadline,
    ) -> Result<Vec<SearchHit>> {
        let vector = self.embed(input, deadline).await?;
        deadline
            .run("search", self.store.search(vector, top_k, Some(filter)))
            .await
    }

    pub async fn delete(&self, key: &str, deadline: Deadline) -> Result<bool> {
        deadline.run("delete", self.store.delete(key)).await
    }

    pub async fn exists(&self, key: &str) -> bool {
        self.store.exists(key).await
    }

    /// Close the extractor and the store; called once at process exit.
    pub async fn shutdown(&self) -> Result<()> {
        self.extractor.close();
        self.store.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use ndarray::Array4;
    use std::time::Duration;
    use tempfile::TempDir;
    use vizdex_core::{Distance, Error, IndexParams};
    use vizdex_embed::{BackendOutput, InferenceBackend, InputSpec, PreprocessorConfig};
    use vizdex_storage::{EmbeddedEngine, LmdbStorage};

    /// Per-channel mean of a 4x4 input.
    struct Means;

    impl InferenceBackend for Means {
        fn name(&self) -> &str {
            "means"
        }

        fn input_spec(&self) -> InputSpec {
            InputSpec { height: 4, width: 4 }
        }

        fn infer(&self, pixels: &Array4<f32>) -> Result<BackendOutput> {
            Ok(BackendOutput::Pooled(
                (0..3)
                    .map(|c| pixels.slice(ndarray::s![0, c, .., ..]).mean().unwrap_or(0.0))
                    .collect(),
            ))
        }
    }

    async fn service(dir: &TempDir) -> RetrievalService<EmbeddedEngine> {
        service_with_dim(dir, 3).await
    }

    async fn service_with_dim(dir: &TempDir, dim: usize) -> RetrievalService<EmbeddedEngine> {
        let engine =
            EmbeddedEngine::from_storage(LmdbStorage::with_map_size(dir.path(), 64 * 1024 * 1024).unwrap()).unwrap();
        let store = SimilarityStore::open(engine, "images", dim, Distance::Cosine, IndexParams::default())
            .await
            .unwrap();
        let extractor = FeatureExtractor::new(Arc::new(Means), PreprocessorConfig::default());
        RetrievalService::new(ImageLoader::new().unwrap(), extractor, Arc::new(store))
    }

    fn image(rgb: [u8; 3]) -> ImageInput {
        RgbImage::from_pixel(6, 6, Rgb(rgb)).into()
    }

    #[tokio::test]
    async fn test_ingest_stamps_created_at() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir).await;

        let before = chrono::Utc::now().timestamp();
        let outcome = service
            .ingest("img_1", image([200, 10, 10]), Map::new(), Deadline::after(Duration::from_secs(10)))
            .await
            .unwrap();
        let stamped = outcome.metadata[CREATED_AT_FIELD].as_i64().unwrap();
        assert!(stamped >= before);

        let hits = service.query(image([200, 10, 10]), 1, Deadline::none()).await.unwrap();
        assert_eq!(hits[0].key, "img_1");
        assert_eq!(hits[0].metadata[CREATED_AT_FIELD].as_i64(), Some(stamped));
    }

    #[tokio::test]
    async fn test_shutdown_closes_extractor() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir).await;
        service.shutdown().await.unwrap();

        assert!(service.extractor().is_closed());
        let err = service.query(image([1, 2, 3]), 1, Deadline::none()).await.unwrap_err();
        assert!(matches!(err, Error::Inference(_)));
    }

    #[tokio::test]
    async fn test_model_output_length_mismatch_is_inference_failure() {
        let dir = TempDir::new().unwrap();
        let service = service_with_dim(&dir, 128).await;

        let err = service
            .ingest("img_1", image([10, 20, 30]), Map::new(), Deadline::none())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Inference(_)));
        assert!(!err.is_client_error());
        assert!(!service.exists("img_1").await);

        let err = service.query(image([10, 20, 30]), 1, Deadline::none()).await.unwrap_err();
        assert!(matches!(err, Error::Inference(_)));
    }

    #[tokio::test]
    async fn test_oversized_key_rejected_before_embedding() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir).await;
        service.extractor().close();

        let err = service
            .ingest(&"k".repeat(600), image([1, 2, 3]), Map::new(), Deadline::none())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidKey(_)));
        assert_eq!(service.store().count().await.unwrap(), 0);
    }
}
