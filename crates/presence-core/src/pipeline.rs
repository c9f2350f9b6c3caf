//! Verification pipeline: one submitted image through liveness, localization,
//! embedding, gallery match and (for authenticated callers) identity check.
//!
//! Stages run in order and the first failure ends the run. Every stage's
//! duration is recorded for diagnostics. Failures travel as [`StageFailure`]
//! and are turned into a [`VerificationResult`] only at the end, so no model
//! error type leaks to callers.

use crate::crop::{self, CropConfig, CropError};
use crate::error::ErrorCode;
use crate::gallery::GalleryStore;
use crate::matcher::{CosineMatcher, MatchError, MatchResult, Matcher, DEFAULT_THRESHOLD};
use crate::models::{FaceModels, ModelError};
use crate::types::Embedding;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

const MSG_UNPROCESSABLE: &str = "Face could not be processed";

/// Pipeline tuning. The defaults are empirical, not derived.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Minimum cosine similarity for a gallery match.
    pub threshold: f32,
    /// Minimum anti-spoof confidence for a "real" verdict to count.
    pub min_liveness_confidence: f32,
    /// Crop the detected face before embedding. `None` embeds the raw image.
    pub crop: Option<CropConfig>,
    /// Where per-request crops are written (and removed from).
    pub scratch_dir: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            min_liveness_confidence: 0.0,
            crop: Some(CropConfig::default()),
            scratch_dir: std::env::temp_dir(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Liveness,
    Localization,
    Extraction,
    Match,
    Consistency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Matched,
    Mismatched,
    Rejected,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageTiming {
    pub stage: Stage,
    pub elapsed_ms: f64,
}

/// One verification request. Everything request-scoped travels here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VerifyRequest {
    pub image: PathBuf,
    /// Identity of the authenticated caller. `None` runs identification only.
    pub claimed_identity: Option<String>,
    /// Opaque caller context (e.g. location), echoed back in the result.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl VerifyRequest {
    pub fn new(image: impl Into<PathBuf>) -> Self {
        Self {
            image: image.into(),
            ..Self::default()
        }
    }

    pub fn claimed(mut self, identity: impl Into<String>) -> Self {
        self.claimed_identity = Some(identity.into());
        self
    }
}

/// Transient result record returned to the caller. Never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationResult {
    pub outcome: Outcome,
    pub code: Option<ErrorCode>,
    pub message: String,
    /// Matched identity; also set on `mismatched`.
    pub identity: Option<String>,
    pub claimed_identity: Option<String>,
    /// Best gallery score, reported on rejection too.
    pub similarity: Option<f32>,
    pub liveness_confidence: Option<f32>,
    pub timings: Vec<StageTiming>,
    pub total_ms: f64,
    pub metadata: BTreeMap<String, String>,
}

impl VerificationResult {
    /// Record for a run that failed outside any stage, e.g. a panicking model.
    pub fn unprocessable(request: &VerifyRequest) -> Self {
        Self {
            outcome: Outcome::Error,
            code: Some(ErrorCode::ExtractionError),
            message: MSG_UNPROCESSABLE.to_string(),
            identity: None,
            claimed_identity: request.claimed_identity.clone(),
            similarity: None,
            liveness_confidence: None,
            timings: Vec::new(),
            total_ms: 0.0,
            metadata: request.metadata.clone(),
        }
    }
}

/// Why a run stopped early.
#[derive(Error, Debug)]
pub enum StageFailure {
    #[error("no face detected")]
    NoFace,
    #[error("spoof detected (confidence {confidence:.3})")]
    Spoofed { confidence: f32 },
    #[error("{stage:?} model failed: {source}")]
    Model {
        stage: Stage,
        #[source]
        source: ModelError,
    },
    #[error("face crop failed: {0}")]
    Crop(#[from] CropError),
    #[error("gallery match failed: {0}")]
    Match(#[from] MatchError),
    #[error("best similarity {:.3} below threshold", .0.similarity)]
    BelowThreshold(MatchResult),
    #[error("matched {:?} instead of the claimed identity", .0.identity)]
    Mismatch(MatchResult),
}

impl StageFailure {
    fn model(stage: Stage) -> impl FnOnce(ModelError) -> StageFailure {
        move |source| match (stage, source) {
            (Stage::Liveness | Stage::Localization, ModelError::NoFace) => StageFailure::NoFace,
            (stage, source) => StageFailure::Model { stage, source },
        }
    }

    pub fn outcome(&self) -> Outcome {
        match self {
            Self::NoFace | Self::Spoofed { .. } | Self::BelowThreshold(_) => Outcome::Rejected,
            Self::Mismatch(_) => Outcome::Mismatched,
            Self::Model { .. } | Self::Crop(_) | Self::Match(_) => Outcome::Error,
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NoFace => ErrorCode::NoFaceDetected,
            Self::Spoofed { .. } => ErrorCode::SpoofDetected,
            Self::BelowThreshold(_) => ErrorCode::FaceNotFound,
            Self::Mismatch(_) => ErrorCode::FaceMismatch,
            Self::Match(e) => e.code(),
            Self::Model { .. } | Self::Crop(_) => ErrorCode::ExtractionError,
        }
    }

    /// Caller-facing text. Model-specific detail stays in the logs.
    pub fn message(&self) -> String {
        match self {
            Self::NoFace => "No face detected".to_string(),
            Self::Spoofed { .. } => "Spoof detected. Please use a real face.".to_string(),
            Self::BelowThreshold(_) => "No matching face found in database".to_string(),
            Self::Mismatch(m) => format!(
                "Face matched with different user: {}",
                m.identity.as_deref().unwrap_or_default()
            ),
            Self::Model { .. } | Self::Crop(_) | Self::Match(_) => MSG_UNPROCESSABLE.to_string(),
        }
    }

    fn match_result(&self) -> Option<&MatchResult> {
        match self {
            Self::BelowThreshold(m) | Self::Mismatch(m) => Some(m),
            _ => None,
        }
    }
}

/// Per-run diagnostics gathered while the stages execute.
#[derive(Default)]
struct Trace {
    timings: Vec<StageTiming>,
    liveness_confidence: Option<f32>,
}

impl Trace {
    fn time<T>(&mut self, stage: Stage, f: impl FnOnce() -> T) -> T {
        let start = Instant::now();
        let out = f();
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        tracing::debug!(?stage, elapsed_ms, "stage finished");
        self.timings.push(StageTiming { stage, elapsed_ms });
        out
    }
}

pub struct VerificationPipeline<M = CosineMatcher> {
    store: Arc<GalleryStore>,
    matcher: M,
    config: PipelineConfig,
}

impl VerificationPipeline<CosineMatcher> {
    pub fn new(store: Arc<GalleryStore>, config: PipelineConfig) -> Self {
        Self::with_matcher(store, CosineMatcher, config)
    }
}

impl<M: Matcher> VerificationPipeline<M> {
    pub fn with_matcher(store: Arc<GalleryStore>, matcher: M, config: PipelineConfig) -> Self {
        Self {
            store,
            matcher,
            config,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run the whole pipeline for one request. Never fails: every failure
    /// becomes an outcome plus code in the returned record.
    pub fn verify<F: FaceModels + ?Sized>(
        &self,
        models: &mut F,
        request: &VerifyRequest,
    ) -> VerificationResult {
        let start = Instant::now();
        let mut trace = Trace::default();
        let run = self.run_stages(models, request, &mut trace);
        let total_ms = start.elapsed().as_secs_f64() * 1000.0;

        let (outcome, code, message, matched) = match &run {
            Ok(m) => {
                let message = if request.claimed_identity.is_some() {
                    "Face matched with authenticated user"
                } else {
                    "Face matched"
                };
                (Outcome::Matched, None, message.to_string(), Some(m))
            }
            Err(failure) => {
                tracing::debug!(error = %failure, "verification stopped");
                (
                    failure.outcome(),
                    Some(failure.code()),
                    failure.message(),
                    failure.match_result(),
                )
            }
        };

        let result = VerificationResult {
            outcome,
            code,
            message,
            identity: matched.and_then(|m| m.identity.clone()),
            claimed_identity: request.claimed_identity.clone(),
            similarity: matched.map(|m| m.similarity),
            liveness_confidence: trace.liveness_confidence,
            timings: trace.timings,
            total_ms,
            metadata: request.metadata.clone(),
        };

        tracing::info!(
            outcome = ?result.outcome,
            code = result.code.map(|c| c.as_str()),
            identity = result.identity.as_deref(),
            claimed = result.claimed_identity.as_deref(),
            similarity = result.similarity,
            total_ms,
            "verification finished"
        );
        result
    }

    fn run_stages<F: FaceModels + ?Sized>(
        &self,
        models: &mut F,
        request: &VerifyRequest,
        trace: &mut Trace,
    ) -> Result<MatchResult, StageFailure> {
        let image = request.image.as_path();

        let verdicts = trace
            .time(Stage::Liveness, || models.check_liveness(image))
            .map_err(StageFailure::model(Stage::Liveness))?;
        let verdict = verdicts.first().ok_or(StageFailure::NoFace)?;
        trace.liveness_confidence = Some(verdict.confidence);
        if !verdict.is_real || verdict.confidence < self.config.min_liveness_confidence {
            return Err(StageFailure::Spoofed {
                confidence: verdict.confidence,
            });
        }

        let faces = trace
            .time(Stage::Localization, || models.detect_faces(image))
            .map_err(StageFailure::model(Stage::Localization))?;
        let face = faces.into_iter().next().ok_or(StageFailure::NoFace)?;

        let embedding = trace.time(Stage::Extraction, || -> Result<Embedding, StageFailure> {
            // The crop file lives only for this closure; dropping it deletes it.
            let crop = match &self.config.crop {
                Some(cfg) => Some(crop::crop_face(image, &face, cfg, &self.config.scratch_dir)?),
                None => None,
            };
            let input = crop.as_ref().map(|t| t.path()).unwrap_or(image);
            models
                .extract_embedding(input)
                .map_err(StageFailure::model(Stage::Extraction))
        })?;

        let gallery = self.store.snapshot();
        let matched = trace.time(Stage::Match, || {
            self.matcher
                .best_match(&embedding, &gallery, self.config.threshold)
        })?;
        if !matched.is_match() {
            return Err(StageFailure::BelowThreshold(matched));
        }

        if let Some(claimed) = request.claimed_identity.as_deref() {
            let consistent = trace.time(Stage::Consistency, || {
                matched.identity.as_deref() == Some(claimed)
            });
            if !consistent {
                return Err(StageFailure::Mismatch(matched));
            }
        }

        Ok(matched)
    }
}
