//! rollcall-vision — face detection and embedding extraction.
//!
//! The concrete [`rollcall_core::Encoder`]: an ONNX detection model gates
//! each probe image to exactly one face, then an embedding model turns the
//! crop into a 128-dimensional vector. Both run on CPU via ONNX Runtime.

pub mod detector;
pub mod encoder;

pub use detector::{DetectorError, FaceBox, FaceDetector};
pub use encoder::{FaceEncoder, EncoderLoadError, EMBEDDING_DIM, ENCODER_MODEL_VERSION};
