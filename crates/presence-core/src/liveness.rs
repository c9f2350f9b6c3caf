//! MiniFASNet anti-spoof classifier via ONNX Runtime.
//!
//! Classifies a face crop as live or as a presentation attack (printed photo,
//! screen replay). The model takes an 80×80 BGR crop of the face enlarged by a
//! fixed context scale and emits three logits; class 1 is a live face.

use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const FASNET_INPUT_SIZE: u32 = 80;
const FASNET_CONTEXT_SCALE: f32 = 2.7;
const FASNET_CLASSES: usize = 3;
const FASNET_REAL_CLASS: usize = 1;

#[derive(Error, Debug)]
pub enum LivenessError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Classifier output for one face.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LivenessScore {
    pub is_real: bool,
    /// Probability of the winning class.
    pub confidence: f32,
}

pub struct FasnetLiveness {
    session: Session,
    context_scale: f32,
}

impl FasnetLiveness {
    pub fn load(model_path: &Path) -> Result<Self, LivenessError> {
        if !model_path.exists() {
            return Err(LivenessError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(1)?
            .commit_from_file(model_path)?;

        tracing::info!(path = %model_path.display(), "loaded anti-spoof model");

        Ok(Self {
            session,
            context_scale: FASNET_CONTEXT_SCALE,
        })
    }

    pub fn classify(
        &mut self,
        image: &RgbImage,
        face: &BoundingBox,
    ) -> Result<LivenessScore, LivenessError> {
        let (x, y, w, h) = context_crop(face, self.context_scale, image.width(), image.height());
        let crop = imageops::crop_imm(image, x, y, w, h).to_image();
        let crop = imageops::resize(&crop, FASNET_INPUT_SIZE, FASNET_INPUT_SIZE, FilterType::Triangle);

        let input = preprocess(&crop);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, logits) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| LivenessError::InferenceFailed(format!("logits: {e}")))?;

        if logits.len() != FASNET_CLASSES {
            return Err(LivenessError::InferenceFailed(format!(
                "expected {FASNET_CLASSES} logits, got {}",
                logits.len()
            )));
        }

        let score = score_from_logits(logits);
        tracing::debug!(is_real = score.is_real, confidence = score.confidence, "anti-spoof verdict");
        Ok(score)
    }
}

/// Square region around the face centre, `scale` times its longer side,
/// shifted (and if necessary shrunk) to stay inside the image.
fn context_crop(face: &BoundingBox, scale: f32, width: u32, height: u32) -> (u32, u32, u32, u32) {
    let side = (face.width.max(face.height) * scale)
        .round()
        .clamp(1.0, width.min(height).max(1) as f32) as u32;
    let cx = face.x + face.width / 2.0;
    let cy = face.y + face.height / 2.0;

    let x = (cx - side as f32 / 2.0).round().clamp(0.0, width.saturating_sub(side) as f32) as u32;
    let y = (cy - side as f32 / 2.0).round().clamp(0.0, height.saturating_sub(side) as f32) as u32;
    (x, y, side, side)
}

/// BGR channel order, raw 0–255 values.
fn preprocess(crop: &RgbImage) -> Array4<f32> {
    let size = FASNET_INPUT_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in crop.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = pixel[2 - c] as f32;
        }
    }
    tensor
}

fn score_from_logits(logits: &[f32]) -> LivenessScore {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|l| (l - max).exp()).collect();
    let sum: f32 = exps.iter().sum();

    let (label, best) = exps
        .iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |acc, (i, &e)| if e > acc.1 { (i, e) } else { acc });

    LivenessScore {
        is_real: label == FASNET_REAL_CLASS,
        confidence: best / sum,
    }
}
