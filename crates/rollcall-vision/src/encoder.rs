//! Face embedding extraction.
//!
//! Gates a probe image through the detector — exactly one face or the
//! attempt is rejected — then crops, normalizes, and runs the embedding
//! model. Frames with several people in view are an explicit
//! `MultipleFacesDetected` outcome, never a silent "pick one" guess.

use crate::detector::{DetectorError, FaceBox, FaceDetector};
use image::{imageops::FilterType, RgbImage};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use rollcall_core::{Embedding, EncodeError, Encoder};
use std::path::Path;
use thiserror::Error;

const ENCODER_INPUT_SIZE: usize = 112;
const ENCODER_MEAN: f32 = 127.5;
const ENCODER_STD: f32 = 127.5;
/// Relative margin added around the detected box before cropping.
const CROP_MARGIN: f32 = 0.12;

pub const EMBEDDING_DIM: usize = 128;
pub const ENCODER_MODEL_VERSION: &str = "mfn_128_v2";

#[derive(Error, Debug)]
pub enum EncoderLoadError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// ONNX-backed implementation of [`rollcall_core::Encoder`].
pub struct FaceEncoder {
    detector: FaceDetector,
    session: Session,
}

impl FaceEncoder {
    /// Load the detection and embedding models.
    pub fn load(detector_path: &Path, embedder_path: &Path) -> Result<Self, EncoderLoadError> {
        let detector = FaceDetector::load(detector_path)?;

        if !embedder_path.exists() {
            return Err(EncoderLoadError::ModelNotFound(
                embedder_path.display().to_string(),
            ));
        }
        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(embedder_path)?;

        tracing::info!(
            path = %embedder_path.display(),
            dim = EMBEDDING_DIM,
            version = ENCODER_MODEL_VERSION,
            "face embedding model loaded"
        );

        Ok(Self { detector, session })
    }

    fn extract(&mut self, image: &RgbImage, face: &FaceBox) -> Result<Embedding, EncodeError> {
        let crop = crop_face(image, face);
        let input = preprocess(&crop);

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())
                .map_err(|e| EncodeError::EncodingFailed(e.to_string()))?])
            .map_err(|e| EncodeError::EncodingFailed(e.to_string()))?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EncodeError::EncodingFailed(format!("embedding tensor: {e}")))?;

        if raw.len() != EMBEDDING_DIM {
            return Err(EncodeError::EncodingFailed(format!(
                "expected {EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        Ok(Embedding {
            values: l2_normalize(raw),
            model_version: Some(ENCODER_MODEL_VERSION.to_string()),
        })
    }
}

impl Encoder for FaceEncoder {
    fn encode(&mut self, image_bytes: &[u8]) -> Result<Embedding, EncodeError> {
        let image = decode_rgb(image_bytes)?;
        let faces = self
            .detector
            .detect(&image)
            .map_err(|e| EncodeError::EncodingFailed(e.to_string()))?;
        let face = single_face(&faces)?;
        self.extract(&image, face)
    }
}

/// Decode raw bytes into an RGB image.
fn decode_rgb(image_bytes: &[u8]) -> Result<RgbImage, EncodeError> {
    image::load_from_memory(image_bytes)
        .map(|img| img.to_rgb8())
        .map_err(|e| EncodeError::DecodeError(e.to_string()))
}

/// Enforce the one-probe-one-face policy.
fn single_face(faces: &[FaceBox]) -> Result<&FaceBox, EncodeError> {
    match faces {
        [] => Err(EncodeError::NoFaceDetected),
        [only] => Ok(only),
        many => {
            tracing::debug!(count = many.len(), "rejecting multi-face frame");
            Err(EncodeError::MultipleFacesDetected)
        }
    }
}

/// Crop the face region with margin, clamped to image bounds, resized to
/// the encoder input size.
fn crop_face(image: &RgbImage, face: &FaceBox) -> RgbImage {
    let margin_x = face.width * CROP_MARGIN;
    let margin_y = face.height * CROP_MARGIN;

    let x1 = (face.x - margin_x).max(0.0) as u32;
    let y1 = (face.y - margin_y).max(0.0) as u32;
    let x2 = ((face.x + face.width + margin_x).min(image.width() as f32)) as u32;
    let y2 = ((face.y + face.height + margin_y).min(image.height() as f32)) as u32;

    let w = (x2.saturating_sub(x1)).max(1);
    let h = (y2.saturating_sub(y1)).max(1);

    let crop = image::imageops::crop_imm(image, x1, y1, w, h).to_image();
    image::imageops::resize(
        &crop,
        ENCODER_INPUT_SIZE as u32,
        ENCODER_INPUT_SIZE as u32,
        FilterType::Triangle,
    )
}

/// Normalize a square RGB crop into a NCHW float tensor.
fn preprocess(crop: &RgbImage) -> Array4<f32> {
    let size = ENCODER_INPUT_SIZE;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in crop.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] =
                (pixel.0[c] as f32 - ENCODER_MEAN) / ENCODER_STD;
        }
    }
    tensor
}

/// L2-normalize an embedding. Zero vectors are returned as-is.
fn l2_normalize(raw: &[f32]) -> Vec<f32> {
    let norm: f32 = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        raw.iter().map(|x| x / norm).collect()
    } else {
        raw.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_rgb_rejects_garbage() {
        let err = decode_rgb(b"definitely not an image").unwrap_err();
        assert!(matches!(err, EncodeError::DecodeError(_)));
    }

    #[test]
    fn test_single_face_gate() {
        let face = FaceBox { x: 0.0, y: 0.0, width: 10.0, height: 10.0, score: 0.9 };

        assert!(matches!(
            single_face(&[]),
            Err(EncodeError::NoFaceDetected)
        ));
        assert!(single_face(std::slice::from_ref(&face)).is_ok());
        assert!(matches!(
            single_face(&[face.clone(), face.clone()]),
            Err(EncodeError::MultipleFacesDetected)
        ));
    }

    #[test]
    fn test_crop_face_clamps_to_bounds() {
        let image = RgbImage::from_pixel(100, 100, image::Rgb([10, 20, 30]));
        // Box hangs off the top-left corner.
        let face = FaceBox { x: -20.0, y: -20.0, width: 50.0, height: 50.0, score: 0.9 };
        let crop = crop_face(&image, &face);
        assert_eq!(crop.width() as usize, ENCODER_INPUT_SIZE);
        assert_eq!(crop.height() as usize, ENCODER_INPUT_SIZE);
    }

    #[test]
    fn test_preprocess_normalization() {
        let crop = RgbImage::from_pixel(
            ENCODER_INPUT_SIZE as u32,
            ENCODER_INPUT_SIZE as u32,
            image::Rgb([128, 0, 255]),
        );
        let tensor = preprocess(&crop);
        assert_eq!(tensor.shape(), &[1, 3, ENCODER_INPUT_SIZE, ENCODER_INPUT_SIZE]);
        assert!((tensor[[0, 0, 0, 0]] - (128.0 - ENCODER_MEAN) / ENCODER_STD).abs() < 1e-6);
        assert!((tensor[[0, 1, 0, 0]] - (-1.0)).abs() < 1e-6);
        assert!((tensor[[0, 2, 0, 0]] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_l2_normalize_unit_length() {
        let raw = vec![3.0f32, 4.0];
        let normalized = l2_normalize(&raw);
        let norm: f32 = normalized.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_l2_normalize_zero_vector() {
        let raw = vec![0.0f32; 4];
        assert_eq!(l2_normalize(&raw), raw);
    }
}
