//! Face crop written to a scratch file ahead of embedding extraction.

use crate::types::BoundingBox;
use image::imageops::FilterType;
use image::ImageFormat;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tempfile::NamedTempFile;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CropError {
    #[error("image: {0}")]
    Image(#[from] image::ImageError),
    #[error("scratch file: {0}")]
    Io(#[from] std::io::Error),
}

/// Margin added around the detected box, and the square size it is resized to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CropConfig {
    pub margin: u32,
    pub size: u32,
}

impl Default for CropConfig {
    fn default() -> Self {
        Self {
            margin: 20,
            size: 250,
        }
    }
}

/// Crop `face` (plus margin) out of `image`, resize it to `size × size` and
/// write it as PNG into `scratch_dir`.
///
/// The file is deleted when the returned handle is dropped.
pub fn crop_face(
    image: &Path,
    face: &BoundingBox,
    config: &CropConfig,
    scratch_dir: &Path,
) -> Result<NamedTempFile, CropError> {
    let img = image::open(image)?;
    let (x, y, w, h) = face.expand_clamped(config.margin, img.width(), img.height());

    let cropped = img
        .crop_imm(x, y, w, h)
        .resize_exact(config.size, config.size, FilterType::Triangle);

    let tmp = tempfile::Builder::new()
        .prefix("crop_")
        .suffix(".png")
        .tempfile_in(scratch_dir)?;
    cropped.save_with_format(tmp.path(), ImageFormat::Png)?;

    tracing::debug!(x, y, w, h, size = config.size, path = %tmp.path().display(), "face cropped");
    Ok(tmp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crop_resizes_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("upload.png");
        image::RgbImage::from_pixel(120, 90, image::Rgb([10, 200, 30]))
            .save(&src)
            .unwrap();

        let face = BoundingBox {
            x: 40.0, y: 20.0, width: 30.0, height: 40.0,
            confidence: 0.99, landmarks: None,
        };
        let config = CropConfig { margin: 20, size: 64 };
        let scratch = dir.path().join("scratch");
        std::fs::create_dir(&scratch).unwrap();

        let tmp = crop_face(&src, &face, &config, &scratch).unwrap();
        let out = image::open(tmp.path()).unwrap();
        assert_eq!((out.width(), out.height()), (64, 64));

        drop(tmp);
        assert_eq!(std::fs::read_dir(&scratch).unwrap().count(), 0);
    }

    #[test]
    fn test_unreadable_image_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("broken.jpg");
        std::fs::write(&src, b"not a jpeg").unwrap();
        let face = BoundingBox {
            x: 0.0, y: 0.0, width: 10.0, height: 10.0,
            confidence: 0.9, landmarks: None,
        };
        let err = crop_face(&src, &face, &CropConfig::default(), dir.path()).unwrap_err();
        assert!(matches!(err, CropError::Image(_)));
    }
}
