use anyhow::{Context, Result};
use presence_core::{Corpus, GalleryStore, OnnxModels, Reconciler, VerificationPipeline};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;

const BUS_NAME: &str = "org.presence.Presence1";
const OBJECT_PATH: &str = "/org/presence/Presence1";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("presenced starting");

    let config = config::Config::load().context("loading configuration")?;
    tracing::info!(
        gallery = %config.gallery_path.display(),
        corpus = %config.corpus_dir.display(),
        models = %config.model_dir.display(),
        threshold = config.similarity_threshold,
        workers = config.workers,
        "configuration loaded"
    );

    let store = Arc::new(GalleryStore::open(&config.gallery_path));
    let snapshot = store.snapshot();
    tracing::info!(
        identities = snapshot.identity_count(),
        embeddings = snapshot.embedding_count(),
        "gallery loaded"
    );

    // Fail fast if any model is missing.
    let paths = config.model_paths();
    let models = (0..config.workers.max(1))
        .map(|_| OnnxModels::load(&paths, config.enforce_detection))
        .collect::<Result<Vec<_>, _>>()
        .context("loading models")?;

    let pipeline_config = config.pipeline_config();
    let pipeline = Arc::new(VerificationPipeline::new(Arc::clone(&store), pipeline_config.clone()));
    let reconciler = Arc::new(Reconciler::new(Arc::clone(&store), Corpus::new(&config.corpus_dir)));
    let engine = engine::spawn_engine(models, pipeline, Arc::clone(&reconciler))?;

    let service = dbus_interface::PresenceService {
        engine,
        store,
        reconciler,
        pipeline: pipeline_config,
    };

    let _conn = zbus::connection::Builder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("registering on the session bus")?;

    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "presenced ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("presenced shutting down");

    Ok(())
}
