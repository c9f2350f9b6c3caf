//! Contracts for the face models the core depends on.
//!
//! Detection, anti-spoofing and embedding are black boxes here. The ONNX
//! backend in [`crate::backend`] implements them, and tests use fakes.

use crate::error::ErrorCode;
use crate::types::{BoundingBox, Embedding};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("no detectable face")]
    NoFace,
    #[error("cannot read image: {0}")]
    Image(#[from] image::ImageError),
    #[error("inference failed: {0}")]
    Inference(String),
}

impl ModelError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NoFace => ErrorCode::NoFaceDetected,
            Self::Image(_) | Self::Inference(_) => ErrorCode::ExtractionError,
        }
    }
}

/// Anti-spoof verdict for one detected face.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LivenessVerdict {
    pub is_real: bool,
    /// Classifier confidence in its own verdict, 0..=1.
    pub confidence: f32,
    pub face: Option<BoundingBox>,
}

/// Classifies each face in an image as live or spoofed.
pub trait LivenessDetector {
    /// One verdict per face, most prominent first. Empty means no face.
    fn check_liveness(&mut self, image: &Path) -> Result<Vec<LivenessVerdict>, ModelError>;
}

/// Locates faces in an image.
pub trait FaceDetector {
    /// Bounding boxes sorted by descending confidence. Empty means no face.
    fn detect_faces(&mut self, image: &Path) -> Result<Vec<BoundingBox>, ModelError>;
}

/// Produces one identity embedding per image.
///
/// The embedding model and the detector backend it uses are fixed when the
/// extractor is built. In strict mode an image without a detectable face
/// fails with [`ModelError::NoFace`].
pub trait EmbeddingExtractor {
    fn extract_embedding(&mut self, image: &Path) -> Result<Embedding, ModelError>;
}

/// Everything the verification pipeline needs from the model layer.
pub trait FaceModels: LivenessDetector + FaceDetector + EmbeddingExtractor {}

impl<T: LivenessDetector + FaceDetector + EmbeddingExtractor> FaceModels for T {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_error_codes() {
        assert_eq!(ModelError::NoFace.code(), ErrorCode::NoFaceDetected);
        assert_eq!(ModelError::Inference("oom".into()).code(), ErrorCode::ExtractionError);
    }
}
