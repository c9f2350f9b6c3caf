//! Nearest-neighbour matching of a probe embedding against the gallery.

use crate::error::ErrorCode;
use crate::gallery::Gallery;
use crate::types::Embedding;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default cosine similarity a probe must reach to be accepted.
pub const DEFAULT_THRESHOLD: f32 = 0.75;

/// Score reported when there was no candidate at all (empty gallery).
///
/// Any real candidate replaces it, even one scoring exactly -1.
pub const NO_CANDIDATE_SCORE: f32 = -1.0;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MatchError {
    #[error("probe is {probe}-dim but identity {identity} has a {stored}-dim embedding")]
    DimensionMismatch {
        identity: String,
        probe: usize,
        stored: usize,
    },
}

impl MatchError {
    /// A probe from a different model cannot be scored, so it counts as an
    /// extraction failure.
    pub fn code(&self) -> ErrorCode {
        ErrorCode::ExtractionError
    }
}

/// Result of matching a probe embedding against a gallery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    /// Set only when `similarity >= threshold`.
    pub identity: Option<String>,
    /// Best score seen, reported even on rejection.
    pub similarity: f32,
    /// Identity owning the best-scoring candidate, accepted or not.
    pub nearest: Option<String>,
}

impl MatchResult {
    pub fn is_match(&self) -> bool {
        self.identity.is_some()
    }
}

/// Strategy for comparing a probe embedding against the enrolled gallery.
///
/// Implementations may use an index instead of a scan; the inputs and the
/// meaning of the result stay the same.
pub trait Matcher {
    fn best_match(
        &self,
        probe: &Embedding,
        gallery: &Gallery,
        threshold: f32,
    ) -> Result<MatchResult, MatchError>;
}

/// Exhaustive cosine-similarity scan over every stored embedding.
///
/// Ties keep the first candidate in gallery iteration order (identities sorted,
/// then enrollment order). That order is an implementation detail.
#[derive(Debug, Clone, Copy, Default)]
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn best_match(
        &self,
        probe: &Embedding,
        gallery: &Gallery,
        threshold: f32,
    ) -> Result<MatchResult, MatchError> {
        let mut best_sim = NO_CANDIDATE_SCORE;
        let mut best_identity: Option<&str> = None;

        for (identity, candidate) in gallery.candidates() {
            if candidate.dim() != probe.dim() {
                return Err(MatchError::DimensionMismatch {
                    identity: identity.to_string(),
                    probe: probe.dim(),
                    stored: candidate.dim(),
                });
            }
            let sim = probe.similarity(candidate);
            if !sim.is_finite() {
                tracing::warn!(identity, "non-finite similarity; candidate ignored");
                continue;
            }
            if best_identity.is_none() || sim > best_sim {
                best_sim = sim;
                best_identity = Some(identity);
            }
        }

        let nearest = best_identity.map(str::to_string);
        let identity = match best_identity {
            Some(_) if best_sim >= threshold => nearest.clone(),
            _ => None,
        };

        tracing::debug!(
            candidates = gallery.embedding_count(),
            similarity = best_sim,
            nearest = ?nearest,
            accepted = identity.is_some(),
            "gallery scan complete"
        );

        Ok(MatchResult {
            identity,
            similarity: best_sim,
            nearest,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(v: &[f32]) -> Embedding {
        Embedding::new(v.to_vec())
    }

    fn alice_bob() -> Gallery {
        Gallery::from_iter([
            ("alice", vec![emb(&[1.0, 0.0, 0.0])]),
            ("bob", vec![emb(&[0.0, 1.0, 0.0])]),
        ])
    }

    #[test]
    fn test_matches_nearest_above_threshold() {
        let result = CosineMatcher
            .best_match(&emb(&[0.9, 0.1, 0.0]), &alice_bob(), DEFAULT_THRESHOLD)
            .unwrap();
        assert_eq!(result.identity.as_deref(), Some("alice"));
        assert!((result.similarity - 0.9939).abs() < 1e-3, "got {}", result.similarity);
    }

    #[test]
    fn test_orthogonal_probe_is_rejected_with_score() {
        let result = CosineMatcher
            .best_match(&emb(&[0.0, 0.0, 1.0]), &alice_bob(), DEFAULT_THRESHOLD)
            .unwrap();
        assert!(!result.is_match());
        assert!(result.similarity.abs() < 1e-6);
        // The nearest identity is still reported for diagnostics.
        assert_eq!(result.nearest.as_deref(), Some("alice"));
    }

    #[test]
    fn test_empty_gallery_never_matches() {
        let result = CosineMatcher
            .best_match(&emb(&[1.0, 0.0]), &Gallery::new(), -1.0)
            .unwrap();
        assert!(!result.is_match());
        assert!(result.nearest.is_none());
        assert_eq!(result.similarity, NO_CANDIDATE_SCORE);
    }

    #[test]
    fn test_self_similarity_is_exact() {
        let stored = emb(&[0.12, -0.4, 0.77, 0.05]);
        let gallery = Gallery::from_iter([
            ("bob", vec![emb(&[0.5, 0.5, 0.5, 0.5])]),
            ("carol", vec![emb(&[-1.0, 0.0, 0.0, 0.0]), stored.clone()]),
        ]);
        let result = CosineMatcher.best_match(&stored, &gallery, 1.0).unwrap();
        assert_eq!(result.identity.as_deref(), Some("carol"));
        assert_eq!(result.similarity, 1.0);
    }

    #[test]
    fn test_scans_every_embedding_of_every_identity() {
        // Best candidate is the last embedding of the last identity.
        let gallery = Gallery::from_iter([
            ("a", vec![emb(&[0.0, 1.0, 0.0])]),
            ("b", vec![emb(&[0.0, 0.0, 1.0]), emb(&[1.0, 0.0, 0.0])]),
        ]);
        let result = CosineMatcher
            .best_match(&emb(&[1.0, 0.0, 0.0]), &gallery, 0.5)
            .unwrap();
        assert_eq!(result.identity.as_deref(), Some("b"));
    }

    #[test]
    fn test_tie_keeps_first_seen() {
        let gallery = Gallery::from_iter([
            ("first", vec![emb(&[1.0, 0.0])]),
            ("second", vec![emb(&[1.0, 0.0])]),
        ]);
        let result = CosineMatcher.best_match(&emb(&[1.0, 0.0]), &gallery, 0.5).unwrap();
        assert_eq!(result.identity.as_deref(), Some("first"));
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let gallery = Gallery::from_iter([("alice", vec![emb(&[1.0, 0.0])])]);
        let result = CosineMatcher.best_match(&emb(&[1.0, 0.0]), &gallery, 1.0).unwrap();
        assert!(result.is_match());
    }

    #[test]
    fn test_dimension_mismatch_is_an_error() {
        let err = CosineMatcher
            .best_match(&emb(&[1.0, 0.0]), &alice_bob(), DEFAULT_THRESHOLD)
            .unwrap_err();
        assert_eq!(
            err,
            MatchError::DimensionMismatch {
                identity: "alice".into(),
                probe: 2,
                stored: 3,
            }
        );
        assert_eq!(err.code(), ErrorCode::ExtractionError);
    }

    #[test]
    fn test_non_finite_candidate_cannot_win() {
        // An infinite component makes the cosine NaN; it must not pin the best score.
        let gallery = Gallery::from_iter([
            ("aaron", vec![emb(&[f32::INFINITY, 1.0, 0.0])]),
            ("bob", vec![emb(&[1.0, 0.0, 0.0])]),
        ]);
        let result = CosineMatcher
            .best_match(&emb(&[1.0, 0.0, 0.0]), &gallery, DEFAULT_THRESHOLD)
            .unwrap();
        assert_eq!(result.identity.as_deref(), Some("bob"));
        assert_eq!(result.similarity, 1.0);
    }
}
