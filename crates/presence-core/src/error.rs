//! Machine-readable failure taxonomy shared by every component.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome/error code carried by every result record handed to callers.
///
/// The HTTP layer maps these to status codes; this crate never does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NoFaceDetected,
    SpoofDetected,
    /// Best gallery score fell below the acceptance threshold.
    FaceNotFound,
    /// Matched a gallery identity other than the claimed one.
    FaceMismatch,
    ExtractionError,
    StorageError,
    /// Reconciliation skipped an identity with zero usable images.
    PartialEnrollment,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoFaceDetected => "no_face_detected",
            Self::SpoofDetected => "spoof_detected",
            Self::FaceNotFound => "face_not_found",
            Self::FaceMismatch => "face_mismatch",
            Self::ExtractionError => "extraction_error",
            Self::StorageError => "storage_error",
            Self::PartialEnrollment => "partial_enrollment",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A code plus a human-readable message, for failures that have no richer record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub code: ErrorCode,
    pub message: String,
}

impl ErrorRecord {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serde_matches_as_str() {
        for code in [
            ErrorCode::NoFaceDetected,
            ErrorCode::SpoofDetected,
            ErrorCode::FaceNotFound,
            ErrorCode::FaceMismatch,
            ErrorCode::ExtractionError,
            ErrorCode::StorageError,
            ErrorCode::PartialEnrollment,
        ] {
            let json = serde_json::to_string(&code).unwrap();
            assert_eq!(json, format!("\"{}\"", code.as_str()));
        }
    }
}
