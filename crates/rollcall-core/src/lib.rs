//! rollcall-core — face gallery and nearest-neighbor matching.
//!
//! The decision procedure behind face-recognition attendance: an in-memory
//! gallery of enrolled reference embeddings, and an open-set matcher that
//! classifies a probe embedding against it with threshold rejection.

pub mod gallery;
pub mod matcher;
pub mod types;

pub use gallery::{Gallery, GalleryEntry, GalleryError};
pub use matcher::{EuclideanMatcher, Matcher};
pub use types::{AlwaysLive, Embedding, EncodeError, Encoder, LivenessChecker, MatchOutcome};

/// Embedding dimensionality of the stock encoder model.
pub const DEFAULT_EMBEDDING_DIM: usize = 128;
