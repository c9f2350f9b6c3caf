//! ONNX Runtime implementation of the face model contracts.
//!
//! One [`OnnxModels`] owns a SCRFD detector (also the detector backend for
//! embedding), an ArcFace recognizer and an anti-spoof classifier. Sessions
//! are stateful, so each worker loads its own set.

use crate::detector::{DetectorError, ScrfdDetector};
use crate::liveness::{FasnetLiveness, LivenessError};
use crate::models::{
    EmbeddingExtractor, FaceDetector, LivenessDetector, LivenessVerdict, ModelError,
};
use crate::recognizer::{ArcFaceRecognizer, RecognizerError};
use crate::types::{BoundingBox, Embedding};
use image::RgbImage;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("liveness: {0}")]
    Liveness(#[from] LivenessError),
}

impl From<DetectorError> for ModelError {
    fn from(e: DetectorError) -> Self {
        ModelError::Inference(e.to_string())
    }
}

impl From<RecognizerError> for ModelError {
    fn from(e: RecognizerError) -> Self {
        ModelError::Inference(e.to_string())
    }
}

impl From<LivenessError> for ModelError {
    fn from(e: LivenessError) -> Self {
        ModelError::Inference(e.to_string())
    }
}

/// Locations of the three ONNX model files.
#[derive(Debug, Clone)]
pub struct ModelPaths {
    pub detector: PathBuf,
    pub recognizer: PathBuf,
    pub liveness: PathBuf,
}

impl ModelPaths {
    /// Standard file names inside `model_dir`.
    pub fn in_dir(model_dir: &Path) -> Self {
        Self {
            detector: model_dir.join("det_10g.onnx"),
            recognizer: model_dir.join("w600k_r50.onnx"),
            liveness: model_dir.join("minifasnet_v2.onnx"),
        }
    }
}

pub struct OnnxModels {
    detector: ScrfdDetector,
    recognizer: ArcFaceRecognizer,
    liveness: FasnetLiveness,
    enforce_detection: bool,
}

impl OnnxModels {
    /// Load all three models. Fails fast if any is missing.
    pub fn load(paths: &ModelPaths, enforce_detection: bool) -> Result<Self, BackendError> {
        Ok(Self {
            detector: ScrfdDetector::load(&paths.detector)?,
            recognizer: ArcFaceRecognizer::load(&paths.recognizer)?,
            liveness: FasnetLiveness::load(&paths.liveness)?,
            enforce_detection,
        })
    }

    fn faces(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, ModelError> {
        Ok(self.detector.detect(image)?)
    }
}

fn open_rgb(path: &Path) -> Result<RgbImage, ModelError> {
    Ok(image::open(path)?.to_rgb8())
}

impl LivenessDetector for OnnxModels {
    fn check_liveness(&mut self, image: &Path) -> Result<Vec<LivenessVerdict>, ModelError> {
        let rgb = open_rgb(image)?;
        let faces = self.faces(&rgb)?;

        let mut verdicts = Vec::with_capacity(faces.len());
        for face in faces {
            let score = self.liveness.classify(&rgb, &face)?;
            verdicts.push(LivenessVerdict {
                is_real: score.is_real,
                confidence: score.confidence,
                face: Some(face),
            });
        }
        Ok(verdicts)
    }
}

impl FaceDetector for OnnxModels {
    fn detect_faces(&mut self, image: &Path) -> Result<Vec<BoundingBox>, ModelError> {
        let rgb = open_rgb(image)?;
        self.faces(&rgb)
    }
}

impl EmbeddingExtractor for OnnxModels {
    fn extract_embedding(&mut self, image: &Path) -> Result<Embedding, ModelError> {
        let rgb = open_rgb(image)?;
        let faces = self.faces(&rgb)?;

        match faces.first() {
            Some(face) => Ok(self.recognizer.extract(&rgb, Some(face))?),
            None if self.enforce_detection => Err(ModelError::NoFace),
            None => {
                tracing::debug!(path = %image.display(), "no face found; embedding whole image");
                Ok(self.recognizer.extract(&rgb, None)?)
            }
        }
    }
}
