use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Face embedding vector (128-dimensional in the stock configuration).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "mfn_128_v2").
    pub model_version: Option<String>,
}

impl Embedding {
    /// Number of dimensions in this embedding.
    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Compute Euclidean distance between two embeddings.
    ///
    /// Always processes every dimension — no early exit — so comparison
    /// cost does not depend on where the vectors diverge.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// Outcome of one recognition attempt against the gallery.
///
/// The inconclusive variants (`NoMatch`, `NoFaceDetected`,
/// `MultipleFacesDetected`) are valid terminal outcomes, not errors:
/// callers must be able to tell "nobody tried" apart from "somebody
/// unrecognized" apart from "more than one face submitted".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MatchOutcome {
    Matched { identity: String, confidence: f32 },
    NoMatch,
    NoFaceDetected,
    MultipleFacesDetected,
    EncodingFailed,
}

/// Why an image could not be turned into a probe embedding.
///
/// `NoFaceDetected` and `MultipleFacesDetected` are expected operator
/// conditions; only `DecodeError` and `EncodingFailed` indicate bad input
/// or an inference fault.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("no face detected in image")]
    NoFaceDetected,
    #[error("multiple faces detected in image")]
    MultipleFacesDetected,
    #[error("image decode failed: {0}")]
    DecodeError(String),
    #[error("embedding extraction failed: {0}")]
    EncodingFailed(String),
}

impl From<&EncodeError> for MatchOutcome {
    fn from(err: &EncodeError) -> Self {
        match err {
            EncodeError::NoFaceDetected => MatchOutcome::NoFaceDetected,
            EncodeError::MultipleFacesDetected => MatchOutcome::MultipleFacesDetected,
            EncodeError::DecodeError(_) | EncodeError::EncodingFailed(_) => {
                MatchOutcome::EncodingFailed
            }
        }
    }
}

/// Extracts a probe embedding from raw image bytes.
///
/// One probe image yields at most one embedding: frames with zero faces or
/// more than one face are rejected outright, never guessed at.
pub trait Encoder: Send {
    fn encode(&mut self, image_bytes: &[u8]) -> Result<Embedding, EncodeError>;
}

/// Liveness gate over a capture sequence.
pub trait LivenessChecker: Send + Sync {
    fn verify(&self, frames: &[Vec<u8>]) -> bool;
}

/// Pass-through liveness checker. Anti-spoofing proper is a model/hardware
/// concern outside this crate; the flag it produces is still recorded per
/// attendance entry.
pub struct AlwaysLive;

impl LivenessChecker for AlwaysLive {
    fn verify(&self, _frames: &[Vec<u8>]) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(values: Vec<f32>) -> Embedding {
        Embedding { values, model_version: None }
    }

    #[test]
    fn test_euclidean_distance_identical() {
        let a = emb(vec![0.1; 128]);
        assert!(a.euclidean_distance(&a).abs() < 1e-6);
    }

    #[test]
    fn test_euclidean_distance_known_value() {
        let a = emb(vec![0.0, 0.0]);
        let b = emb(vec![3.0, 4.0]);
        assert!((a.euclidean_distance(&b) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_euclidean_distance_symmetric() {
        let a = emb(vec![0.2, -0.5, 0.9]);
        let b = emb(vec![-0.1, 0.4, 0.3]);
        assert!((a.euclidean_distance(&b) - b.euclidean_distance(&a)).abs() < 1e-6);
    }

    #[test]
    fn test_match_outcome_json_tags() {
        let matched = MatchOutcome::Matched {
            identity: "S1".into(),
            confidence: 0.91,
        };
        let json = serde_json::to_value(&matched).unwrap();
        assert_eq!(json["outcome"], "matched");
        assert_eq!(json["identity"], "S1");

        let json = serde_json::to_value(MatchOutcome::MultipleFacesDetected).unwrap();
        assert_eq!(json["outcome"], "multiple_faces_detected");
    }

    #[test]
    fn test_encode_error_maps_to_outcome() {
        assert_eq!(
            MatchOutcome::from(&EncodeError::NoFaceDetected),
            MatchOutcome::NoFaceDetected
        );
        assert_eq!(
            MatchOutcome::from(&EncodeError::MultipleFacesDetected),
            MatchOutcome::MultipleFacesDetected
        );
        assert_eq!(
            MatchOutcome::from(&EncodeError::DecodeError("truncated jpeg".into())),
            MatchOutcome::EncodingFailed
        );
    }

    #[test]
    fn test_always_live() {
        assert!(AlwaysLive.verify(&[]));
        assert!(AlwaysLive.verify(&[vec![0u8; 4]]));
    }
}
