use actix_web::web;
use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;
use vizdex::config::Config;
use vizdex_api::{AppState, RestApi, RetrievalService};
use vizdex_embed::{FeatureExtractor, ImageLoader};
use vizdex_storage::{Engine, SimilarityStore};

#[cfg(feature = "onnx")]
fn build_extractor(config: &Config) -> anyhow::Result<FeatureExtractor> {
    let model_path = config
        .model_path
        .as_deref()
        .context("MODEL_PATH is required to serve")?;
    info!("Loading model from {:?} on {}", model_path, config.device);
    Ok(FeatureExtractor::from_onnx(model_path, config.device)?)
}

#[cfg(not(feature = "onnx"))]
fn build_extractor(_config: &Config) -> anyhow::Result<FeatureExtractor> {
    anyhow::bail!("vizdex was built without an inference backend; rebuild with `--features onnx`")
}

async fn build_engine(config: &Config) -> anyhow::Result<Engine> {
    match config.index_host() {
        Some(host) => {
            info!("Index backend: remote at {}:{}", host, config.index_port);
            Engine::remote(host, config.index_port)
                .await
                .with_context(|| format!("connecting to index server at {}:{}", host, config.index_port))
        }
        None => {
            info!("Index backend: embedded, data directory {:?}", config.data_dir);
            Engine::embedded(&config.data_dir)
                .with_context(|| format!("opening data directory {:?}", config.data_dir))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();

    let log_level = match config.log_level.to_ascii_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    config.validate()?;

    info!("Starting vizdex v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Collection '{}': dim {}, metric {}",
        config.collection_name, config.vector_dim, config.metric
    );

    let extractor = build_extractor(&config)?;
    match extractor.warmup().await {
        Ok(produced) => {
            config.check_embedding_dim(produced)?;
            info!("Model warmed up ({}, {} dims)", extractor.backend_name(), produced);
        }
        Err(e) => warn!("Model warmup failed: {}", e),
    }

    let engine = build_engine(&config).await?;
    let store = SimilarityStore::open(
        engine,
        &config.collection_name,
        config.vector_dim,
        config.metric,
        config.index_params(),
    )
    .await?;
    info!("Similarity store ready");

    let service = Arc::new(RetrievalService::new(ImageLoader::new()?, extractor, Arc::new(store)));
    let state = web::Data::new(AppState::new(service.clone(), config.request_timeout()));

    let http_host = config.http_host.clone();
    let http_port = config.http_port;
    let http_handle = std::thread::spawn(move || {
        info!("Starting HTTP server on {}:{}", http_host, http_port);
        let sys = actix_web::rt::System::new();
        sys.block_on(async {
            if let Err(e) = RestApi::start(state, &http_host, http_port).await {
                error!("HTTP server error: {}", e);
            }
        })
    });

    info!("HTTP API: http://{}:{}/", config.http_host, config.http_port);

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
        _ = tokio::task::spawn_blocking(move || {
            http_handle.join().ok();
        }) => {
            info!("HTTP server stopped");
        }
    }

    info!("Shutting down...");
    if let Err(e) = service.shutdown().await {
        error!("Shutdown did not complete cleanly: {}", e);
    }
    Ok(())
}
