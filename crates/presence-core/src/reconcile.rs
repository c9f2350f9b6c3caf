//! Dataset reconciliation: align the persisted gallery with the corpus on disk.
//!
//! Identities whose directory disappeared are removed, identities with a new
//! directory are embedded and added, and identities present on both sides are
//! left exactly as they are. The gallery is written once, and only if
//! something changed.

use crate::corpus::{Corpus, CorpusError};
use crate::error::ErrorCode;
use crate::gallery::{GalleryStore, StoreError};
use crate::models::EmbeddingExtractor;
use crate::types::Embedding;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("corpus: {0}")]
    Corpus(#[from] CorpusError),
    #[error("gallery: {0}")]
    Storage(#[from] StoreError),
}

impl ReconcileError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Corpus(e) => e.code(),
            Self::Storage(e) => e.code(),
        }
    }
}

/// An image that could not be embedded. Recorded, never fatal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedImage {
    pub identity: String,
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReconcileReport {
    /// New identities enrolled with at least one embedding.
    pub added: Vec<String>,
    /// Identities dropped because their directory is gone.
    pub removed: Vec<String>,
    /// New identities with no usable image (`partial_enrollment`).
    pub skipped: Vec<String>,
    pub skipped_files: Vec<SkippedImage>,
    pub elapsed_ms: f64,
}

impl ReconcileReport {
    /// Whether the gallery was left untouched.
    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }

    /// Codes describing recovered problems, for callers that surface them.
    pub fn warnings(&self) -> Vec<ErrorCode> {
        if self.skipped.is_empty() {
            Vec::new()
        } else {
            vec![ErrorCode::PartialEnrollment]
        }
    }
}

/// Runs reconciliations, at most one at a time.
pub struct Reconciler {
    store: Arc<GalleryStore>,
    corpus: Corpus,
    running: Mutex<()>,
}

impl Reconciler {
    pub fn new(store: Arc<GalleryStore>, corpus: Corpus) -> Self {
        Self {
            store,
            corpus,
            running: Mutex::new(()),
        }
    }

    pub fn corpus(&self) -> &Corpus {
        &self.corpus
    }

    /// Diff the corpus against the gallery and persist the result.
    ///
    /// Blocks while another reconciliation is running. On a storage error the
    /// in-memory changes are dropped and the committed gallery is unchanged.
    pub fn reconcile<E: EmbeddingExtractor + ?Sized>(
        &self,
        extractor: &mut E,
    ) -> Result<ReconcileReport, ReconcileError> {
        let _running = self.running.lock();
        let start = Instant::now();

        let mut gallery = self.store.load();
        let existing: BTreeSet<String> = gallery.identities().map(str::to_string).collect();
        let current = self.corpus.identities()?;

        let mut report = ReconcileReport::default();

        for identity in existing.difference(&current) {
            if gallery.remove(identity).is_some() {
                tracing::info!(identity = %identity, "identity removed from corpus; dropping embeddings");
                report.removed.push(identity.clone());
            }
        }

        // New embeddings must agree with what is already stored, or with the
        // first one collected in this run.
        let mut dimension = gallery.dimension();

        for identity in current.difference(&existing) {
            let images = match self.corpus.images(identity) {
                Ok(images) => images,
                Err(e) => {
                    tracing::warn!(identity = %identity, error = %e, "cannot list identity images");
                    report.skipped.push(identity.clone());
                    continue;
                }
            };

            let mut embeddings = Vec::with_capacity(images.len());
            for path in images {
                let embedding = extractor
                    .extract_embedding(&path)
                    .map_err(|e| e.to_string())
                    .and_then(|embedding| check_embedding(embedding, dimension));
                match embedding {
                    Ok(embedding) => {
                        dimension.get_or_insert(embedding.dim());
                        embeddings.push(embedding);
                    }
                    Err(reason) => {
                        tracing::warn!(
                            identity = %identity,
                            path = %path.display(),
                            reason = %reason,
                            "skipping image"
                        );
                        report.skipped_files.push(SkippedImage {
                            identity: identity.clone(),
                            path,
                            reason,
                        });
                    }
                }
            }

            if embeddings.is_empty() {
                tracing::warn!(identity = %identity, "no usable images; identity not enrolled");
                report.skipped.push(identity.clone());
            } else {
                tracing::info!(identity = %identity, embeddings = embeddings.len(), "identity enrolled");
                gallery.insert(identity.clone(), embeddings);
                report.added.push(identity.clone());
            }
        }

        if !report.is_noop() {
            self.store.save(gallery)?;
        }

        report.elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        tracing::info!(
            added = report.added.len(),
            removed = report.removed.len(),
            skipped = report.skipped.len(),
            skipped_files = report.skipped_files.len(),
            elapsed_ms = report.elapsed_ms,
            "reconciliation finished"
        );
        Ok(report)
    }

    /// Remove one identity from the gallery, waiting for any running
    /// reconciliation so its save cannot resurrect the identity.
    ///
    /// The corpus directory is left alone; if it still exists the next
    /// reconciliation enrolls the identity again.
    pub fn remove_identity(&self, identity: &str) -> Result<bool, StoreError> {
        let _running = self.running.lock();
        self.store.remove_identity(identity)
    }
}

/// Reject embeddings that could not be stored next to the others.
fn check_embedding(embedding: Embedding, dimension: Option<usize>) -> Result<Embedding, String> {
    if !embedding.is_finite() {
        return Err("embedding contains NaN or infinite values".to_string());
    }
    match dimension {
        Some(expected) if embedding.dim() != expected => Err(format!(
            "embedding is {}-dim, gallery is {expected}-dim",
            embedding.dim()
        )),
        _ => Ok(embedding),
    }
}
