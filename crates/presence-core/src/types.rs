use serde::{Deserialize, Serialize};

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    /// Grow the box by `margin` pixels on every side and clamp it to a
    /// `width` × `height` image. Returns `(x, y, w, h)` in whole pixels.
    pub fn expand_clamped(&self, margin: u32, width: u32, height: u32) -> (u32, u32, u32, u32) {
        let margin = margin as f32;
        let x = (self.x - margin).max(0.0).floor() as u32;
        let y = (self.y - margin).max(0.0).floor() as u32;
        let x = x.min(width.saturating_sub(1));
        let y = y.min(height.saturating_sub(1));

        let w = (self.width + margin * 2.0).max(1.0).round() as u32;
        let h = (self.height + margin * 2.0).max(1.0).round() as u32;

        (x, y, w.min(width - x), h.min(height - y))
    }
}

/// Face embedding vector (512-dimensional for ArcFace, 128 for smaller models).
///
/// Serialized as a bare array of floats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    /// Number of dimensions.
    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Whether every component is a finite number.
    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }

    /// Cosine similarity (`1 - cosine distance`) in [-1, 1]. Higher = more similar.
    ///
    /// Accumulates in f64 so that a vector compared with itself yields exactly 1.0.
    /// A zero-norm vector has similarity 0 with everything.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f64;
        let mut norm_a = 0.0f64;
        let mut norm_b = 0.0f64;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            let (a, b) = (*a as f64, *b as f64);
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = (norm_a * norm_b).sqrt();
        if denom > 0.0 {
            (dot / denom).clamp(-1.0, 1.0) as f32
        } else {
            0.0
        }
    }

    /// Scale to unit length. Zero vectors are returned unchanged.
    pub fn l2_normalized(mut self) -> Self {
        let norm: f32 = self.values.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in self.values.iter_mut() {
                *v /= norm;
            }
        }
        self
    }
}

impl From<Vec<f32>> for Embedding {
    fn from(values: Vec<f32>) -> Self {
        Self { values }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_similarity_identical_is_exact() {
        let a = Embedding::new(vec![0.3, -1.7, 2.25, 0.001]);
        assert_eq!(a.similarity(&a.clone()), 1.0);
    }

    #[test]
    fn test_similarity_orthogonal() {
        let a = Embedding::new(vec![1.0, 0.0]);
        let b = Embedding::new(vec![0.0, 1.0]);
        assert!(a.similarity(&b).abs() < 1e-6);
    }

    #[test]
    fn test_similarity_opposite() {
        let a = Embedding::new(vec![1.0, 0.0]);
        let b = Embedding::new(vec![-1.0, 0.0]);
        assert!((a.similarity(&b) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_similarity_zero_vector() {
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![1.0, 0.0]);
        assert_eq!(a.similarity(&b), 0.0);
    }

    #[test]
    fn test_l2_normalized() {
        let e = Embedding::new(vec![3.0, 4.0]).l2_normalized();
        assert!((e.values[0] - 0.6).abs() < 1e-6);
        assert!((e.values[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_embedding_serializes_as_array() {
        let e = Embedding::new(vec![1.0, 0.5]);
        assert_eq!(serde_json::to_string(&e).unwrap(), "[1.0,0.5]");
    }

    #[test]
    fn test_expand_clamped_inside() {
        let b = BoundingBox {
            x: 100.0, y: 80.0, width: 50.0, height: 60.0,
            confidence: 0.9, landmarks: None,
        };
        assert_eq!(b.expand_clamped(20, 640, 480), (80, 60, 90, 100));
    }

    #[test]
    fn test_expand_clamped_at_edges() {
        let b = BoundingBox {
            x: 5.0, y: 5.0, width: 90.0, height: 90.0,
            confidence: 0.9, landmarks: None,
        };
        // Left/top clamp to 0, right/bottom clamp to the image bounds.
        assert_eq!(b.expand_clamped(20, 100, 100), (0, 0, 100, 100));
    }
}
