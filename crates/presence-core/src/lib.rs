//! presence-core: face gallery matching and enrollment reconciliation.
//!
//! Keeps a persisted gallery of per-person face embeddings in sync with a
//! folder-per-person image corpus, and verifies submitted photos against it
//! through a fail-fast liveness → detection → embedding → match pipeline.
//! Models run via ONNX Runtime (SCRFD, ArcFace, MiniFASNet) but sit behind
//! traits so any backend can be plugged in.

pub mod alignment;
pub mod backend;
pub mod corpus;
pub mod crop;
pub mod detector;
pub mod error;
pub mod gallery;
pub mod liveness;
pub mod matcher;
pub mod models;
pub mod pipeline;
pub mod reconcile;
pub mod recognizer;
pub mod types;

pub use backend::{BackendError, ModelPaths, OnnxModels};
pub use corpus::Corpus;
pub use crop::CropConfig;
pub use error::{ErrorCode, ErrorRecord};
pub use gallery::{Gallery, GalleryStore, IdentitySummary, StoreError};
pub use matcher::{CosineMatcher, MatchResult, Matcher, DEFAULT_THRESHOLD};
pub use models::{EmbeddingExtractor, FaceDetector, FaceModels, LivenessDetector, LivenessVerdict, ModelError};
pub use pipeline::{Outcome, PipelineConfig, VerificationPipeline, VerificationResult, VerifyRequest};
pub use reconcile::{ReconcileError, ReconcileReport, Reconciler};
pub use types::{BoundingBox, Embedding};
