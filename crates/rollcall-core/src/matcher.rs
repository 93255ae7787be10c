//! Nearest-neighbor classification of a probe embedding against a gallery
//! snapshot.
//!
//! Open-set recognition: the gallery always has *some* nearest neighbor,
//! so a best match below the confidence threshold is rejected rather than
//! returned. "This probe belongs to no one enrolled" is a first-class
//! outcome.

use crate::gallery::GalleryEntry;
use crate::types::{Embedding, MatchOutcome};

/// Strategy for classifying a probe embedding against a gallery snapshot.
pub trait Matcher: Send + Sync {
    fn classify(
        &self,
        probe: &Embedding,
        snapshot: &[GalleryEntry],
        threshold: f32,
    ) -> MatchOutcome;
}

/// Euclidean nearest-neighbor matcher.
///
/// Confidence is `1 - distance`, clamped to [0, 1]: L2-normalized
/// embeddings put pairwise distances in [0, 2], so the raw formula can go
/// negative for dissimilar faces. The full snapshot is always scanned, and
/// exact distance ties resolve to the lowest identity key so recognition
/// is reproducible for the same gallery state.
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn classify(
        &self,
        probe: &Embedding,
        snapshot: &[GalleryEntry],
        threshold: f32,
    ) -> MatchOutcome {
        let Some(first) = snapshot.first() else {
            return MatchOutcome::NoMatch;
        };

        // A probe of the wrong dimensionality is an input fault, not an
        // honest non-match; zip-based distance would silently truncate.
        if probe.dim() != first.embedding.dim() {
            tracing::warn!(
                probe_dim = probe.dim(),
                gallery_dim = first.embedding.dim(),
                "probe dimensionality does not match gallery"
            );
            return MatchOutcome::EncodingFailed;
        }

        let mut best: Option<(&GalleryEntry, f32)> = None;
        for entry in snapshot {
            let distance = probe.euclidean_distance(&entry.embedding);
            let better = match &best {
                None => true,
                Some((best_entry, best_distance)) => {
                    distance < *best_distance
                        || (distance == *best_distance && entry.identity < best_entry.identity)
                }
            };
            if better {
                best = Some((entry, distance));
            }
        }

        let Some((entry, distance)) = best else {
            return MatchOutcome::NoMatch;
        };

        let confidence = (1.0 - distance).clamp(0.0, 1.0);
        if confidence >= threshold {
            MatchOutcome::Matched {
                identity: entry.identity.clone(),
                confidence,
            }
        } else {
            tracing::debug!(
                best_identity = %entry.identity,
                confidence,
                threshold,
                "best match below threshold"
            );
            MatchOutcome::NoMatch
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn entry(identity: &str, values: Vec<f32>) -> GalleryEntry {
        GalleryEntry {
            identity: identity.to_string(),
            embedding: Arc::new(Embedding { values, model_version: None }),
        }
    }

    fn probe(values: Vec<f32>) -> Embedding {
        Embedding { values, model_version: None }
    }

    #[test]
    fn test_empty_snapshot_is_no_match() {
        let outcome = EuclideanMatcher.classify(&probe(vec![0.1; 128]), &[], 0.0);
        assert_eq!(outcome, MatchOutcome::NoMatch);
    }

    #[test]
    fn test_self_match_is_perfect() {
        let snapshot = vec![entry("S1", vec![0.1; 128])];
        let outcome = EuclideanMatcher.classify(&probe(vec![0.1; 128]), &snapshot, 0.6);
        match outcome {
            MatchOutcome::Matched { identity, confidence } => {
                assert_eq!(identity, "S1");
                assert!((confidence - 1.0).abs() < 1e-6);
            }
            other => panic!("expected Matched, got {other:?}"),
        }
    }

    #[test]
    fn test_distant_probe_is_no_match() {
        // distance(v1, probe) = sqrt(128 * 0.09) ≈ 3.39 > 0.4
        let snapshot = vec![entry("S1", vec![0.1; 128])];
        let outcome = EuclideanMatcher.classify(&probe(vec![0.4; 128]), &snapshot, 0.6);
        assert_eq!(outcome, MatchOutcome::NoMatch);
    }

    #[test]
    fn test_full_scan_finds_best_in_last_position() {
        let snapshot = vec![
            entry("S1", vec![0.0, 1.0]),
            entry("S2", vec![1.0, 1.0]),
            entry("S3", vec![1.0, 0.0]),
        ];
        let outcome = EuclideanMatcher.classify(&probe(vec![1.0, 0.0]), &snapshot, 0.5);
        assert_eq!(
            outcome,
            MatchOutcome::Matched { identity: "S3".into(), confidence: 1.0 }
        );
    }

    #[test]
    fn test_exact_tie_resolves_to_lowest_identity() {
        let snapshot = vec![
            entry("S2", vec![0.5, 0.5]),
            entry("S1", vec![0.5, 0.5]),
            entry("S3", vec![0.5, 0.5]),
        ];
        let outcome = EuclideanMatcher.classify(&probe(vec![0.5, 0.5]), &snapshot, 0.5);
        assert_eq!(
            outcome,
            MatchOutcome::Matched { identity: "S1".into(), confidence: 1.0 }
        );
    }

    #[test]
    fn test_threshold_monotonicity() {
        // Raising the threshold can only turn Matched into NoMatch,
        // never the reverse.
        let snapshot = vec![entry("S1", vec![0.3, 0.4])];
        let p = probe(vec![0.3, 0.1]);

        let mut was_matched = true;
        for step in 0..=10 {
            let threshold = step as f32 / 10.0;
            let matched = matches!(
                EuclideanMatcher.classify(&p, &snapshot, threshold),
                MatchOutcome::Matched { .. }
            );
            assert!(
                !(matched && !was_matched),
                "match reappeared at threshold {threshold}"
            );
            was_matched = matched;
        }
    }

    #[test]
    fn test_confidence_clamped_for_distant_vectors() {
        // Opposite unit vectors: distance 2.0, raw confidence -1.0.
        let snapshot = vec![entry("S1", vec![1.0, 0.0])];
        let outcome = EuclideanMatcher.classify(&probe(vec![-1.0, 0.0]), &snapshot, 0.0);
        // threshold 0.0 accepts everything; confidence must be clamped, not negative
        match outcome {
            MatchOutcome::Matched { confidence, .. } => assert_eq!(confidence, 0.0),
            other => panic!("expected Matched at threshold 0.0, got {other:?}"),
        }
    }

    #[test]
    fn test_dimension_mismatch_is_encoding_failure() {
        let snapshot = vec![entry("S1", vec![0.1; 128])];
        let outcome = EuclideanMatcher.classify(&probe(vec![0.1; 64]), &snapshot, 0.6);
        assert_eq!(outcome, MatchOutcome::EncodingFailed);
    }

    #[test]
    fn test_below_threshold_best_match_rejected() {
        // Nearest neighbor exists but confidence 0.8 < threshold 0.9.
        let snapshot = vec![entry("S1", vec![0.2, 0.0])];
        let outcome = EuclideanMatcher.classify(&probe(vec![0.0, 0.0]), &snapshot, 0.9);
        assert_eq!(outcome, MatchOutcome::NoMatch);
    }
}
