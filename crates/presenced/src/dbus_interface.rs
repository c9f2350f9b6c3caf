use crate::engine::{EngineError, EngineHandle};
use presence_core::{
    ErrorCode, ErrorRecord, GalleryStore, PipelineConfig, Reconciler, StoreError, VerifyRequest,
};
use std::sync::Arc;
use zbus::interface;

/// D-Bus interface for the presence daemon.
///
/// Bus name: org.presence.Presence1
/// Object path: /org/presence/Presence1
pub struct PresenceService {
    pub engine: EngineHandle,
    pub store: Arc<GalleryStore>,
    pub reconciler: Arc<Reconciler>,
    pub pipeline: PipelineConfig,
}

#[interface(name = "org.presence.Presence1")]
impl PresenceService {
    /// Verify the face in `image_path`. An empty `claimed_user` means no claim.
    ///
    /// Rejections are part of the returned record, not D-Bus errors.
    async fn verify(&self, image_path: &str, claimed_user: &str) -> zbus::fdo::Result<String> {
        tracing::info!(image = image_path, claimed = claimed_user, "verify requested");

        let mut request = VerifyRequest::new(image_path);
        if !claimed_user.is_empty() {
            request = request.claimed(claimed_user);
        }
        request
            .metadata
            .insert("source".to_string(), "dbus".to_string());

        let result = self.engine.verify(request).await.map_err(engine_failure)?;
        to_json(&result)
    }

    /// Bring the gallery in line with the enrollment corpus.
    async fn reconcile(&self) -> zbus::fdo::Result<String> {
        tracing::info!("reconcile requested");
        let report = self.engine.reconcile().await.map_err(engine_failure)?;
        to_json(&report)
    }

    /// Drop one identity from the gallery. Returns false if it was not enrolled.
    ///
    /// The corpus directory is left alone, so a later reconcile re-enrolls it
    /// unless the directory is removed too.
    async fn remove_identity(&self, identity: &str) -> zbus::fdo::Result<bool> {
        tracing::info!(identity, "remove requested");
        let reconciler = Arc::clone(&self.reconciler);
        let identity = identity.to_string();
        tokio::task::spawn_blocking(move || reconciler.remove_identity(&identity))
            .await
            .map_err(|e| failure(ErrorRecord::new(ErrorCode::StorageError, e.to_string())))?
            .map_err(store_failure)
    }

    /// Enrolled identities with their embedding counts.
    async fn list_identities(&self) -> zbus::fdo::Result<String> {
        to_json(&self.store.snapshot().summaries())
    }

    async fn status(&self) -> zbus::fdo::Result<String> {
        let gallery = self.store.snapshot();
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "workers": self.engine.worker_count(),
            "gallery_path": self.store.path().display().to_string(),
            "identities": gallery.identity_count(),
            "embeddings": gallery.embedding_count(),
            "dimension": gallery.dimension(),
            "threshold": self.pipeline.threshold,
            "crop": self.pipeline.crop.is_some(),
        })
        .to_string())
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

/// Map an engine error to a D-Bus `Failed` carrying an `{code, message}` record.
fn engine_failure(err: EngineError) -> zbus::fdo::Error {
    tracing::warn!(error = %err, "request failed");
    let record = match &err {
        EngineError::Reconcile(e) => ErrorRecord::new(e.code(), err.to_string()),
        _ => ErrorRecord::new(ErrorCode::ExtractionError, err.to_string()),
    };
    failure(record)
}

fn store_failure(err: StoreError) -> zbus::fdo::Error {
    tracing::warn!(error = %err, "gallery update failed");
    failure(ErrorRecord::new(ErrorCode::StorageError, err.to_string()))
}

fn failure(record: ErrorRecord) -> zbus::fdo::Error {
    let body = serde_json::to_string(&record).unwrap_or_else(|_| record.message.clone());
    zbus::fdo::Error::Failed(body)
}
