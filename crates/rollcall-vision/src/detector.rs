//! ONNX face detector.
//!
//! Anchor-free, stride-based decoding over three feature levels with NMS
//! post-processing. Operates on RGB images; the caller decides what to do
//! with zero, one, or many detections.

use image::{imageops::FilterType, RgbImage};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const DETECTOR_INPUT_SIZE: usize = 320;
const DETECTOR_MEAN: f32 = 127.5;
const DETECTOR_STD: f32 = 128.0;
const DETECTOR_SCORE_THRESHOLD: f32 = 0.55;
const DETECTOR_NMS_IOU: f32 = 0.4;
const DETECTOR_STRIDES: [usize; 3] = [8, 16, 32];
const ANCHORS_PER_CELL: usize = 2;
/// Output tensor layout: [0..3) = scores per stride, [3..6) = boxes per stride.
const DETECTOR_NUM_OUTPUTS: usize = 6;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// One detected face in original-image coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub score: f32,
}

/// Scale/offset mapping between the letterboxed model input and the
/// original image.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    fn fit(width: u32, height: u32, input: usize) -> Self {
        let scale = (input as f32 / width as f32).min(input as f32 / height as f32);
        let new_w = (width as f32 * scale).round();
        let new_h = (height as f32 * scale).round();
        Self {
            scale,
            pad_x: (input as f32 - new_w) / 2.0,
            pad_y: (input as f32 - new_h) / 2.0,
        }
    }

    fn to_original(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

pub struct FaceDetector {
    session: Session,
}

impl FaceDetector {
    /// Load the detection ONNX model from the given path.
    pub fn load(model_path: &Path) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(
                model_path.display().to_string(),
            ));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let num_outputs = session.outputs().len();
        if num_outputs < DETECTOR_NUM_OUTPUTS {
            return Err(DetectorError::InferenceFailed(format!(
                "detector model requires {DETECTOR_NUM_OUTPUTS} outputs (3 strides × score/box), got {num_outputs}"
            )));
        }

        tracing::info!(
            path = %model_path.display(),
            outputs = num_outputs,
            "face detector loaded"
        );

        Ok(Self { session })
    }

    /// Detect faces, returning boxes in original-image coordinates sorted
    /// by descending score.
    pub fn detect(&mut self, image: &RgbImage) -> Result<Vec<FaceBox>, DetectorError> {
        let letterbox = Letterbox::fit(image.width(), image.height(), DETECTOR_INPUT_SIZE);
        let input = preprocess(image, letterbox);

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut detections = Vec::new();
        for (level, &stride) in DETECTOR_STRIDES.iter().enumerate() {
            let (_, scores) = outputs[level]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("scores stride {stride}: {e}")))?;
            let (_, boxes) = outputs[level + DETECTOR_STRIDES.len()]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("boxes stride {stride}: {e}")))?;

            decode_stride(
                scores,
                boxes,
                stride,
                letterbox,
                DETECTOR_SCORE_THRESHOLD,
                &mut detections,
            );
        }

        let mut kept = nms(detections, DETECTOR_NMS_IOU);
        kept.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        Ok(kept)
    }
}

/// Letterbox-resize an RGB image into a normalized NCHW tensor.
fn preprocess(image: &RgbImage, letterbox: Letterbox) -> Array4<f32> {
    let new_w = (image.width() as f32 * letterbox.scale).round() as u32;
    let new_h = (image.height() as f32 * letterbox.scale).round() as u32;
    let resized = image::imageops::resize(image, new_w.max(1), new_h.max(1), FilterType::Triangle);

    let pad_x = letterbox.pad_x.floor() as u32;
    let pad_y = letterbox.pad_y.floor() as u32;

    // Zero-initialized tensor == mean-padded input after normalization.
    let size = DETECTOR_INPUT_SIZE;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in resized.enumerate_pixels() {
        let tx = (x + pad_x) as usize;
        let ty = (y + pad_y) as usize;
        if tx >= size || ty >= size {
            continue;
        }
        for c in 0..3 {
            tensor[[0, c, ty, tx]] = (pixel.0[c] as f32 - DETECTOR_MEAN) / DETECTOR_STD;
        }
    }
    tensor
}

/// Decode one stride level into face boxes above `threshold`.
fn decode_stride(
    scores: &[f32],
    boxes: &[f32],
    stride: usize,
    letterbox: Letterbox,
    threshold: f32,
    out: &mut Vec<FaceBox>,
) {
    let grid = DETECTOR_INPUT_SIZE / stride;
    let num_anchors = grid * grid * ANCHORS_PER_CELL;

    for idx in 0..num_anchors {
        let score = scores.get(idx).copied().unwrap_or(0.0);
        if score <= threshold {
            continue;
        }

        let cell = idx / ANCHORS_PER_CELL;
        let anchor_cx = (cell % grid) as f32 * stride as f32;
        let anchor_cy = (cell / grid) as f32 * stride as f32;

        let off = idx * 4;
        if off + 3 >= boxes.len() {
            continue;
        }
        // Box regression: distances from the anchor point to each edge.
        let x1 = anchor_cx - boxes[off] * stride as f32;
        let y1 = anchor_cy - boxes[off + 1] * stride as f32;
        let x2 = anchor_cx + boxes[off + 2] * stride as f32;
        let y2 = anchor_cy + boxes[off + 3] * stride as f32;

        let (ox1, oy1) = letterbox.to_original(x1, y1);
        let (ox2, oy2) = letterbox.to_original(x2, y2);

        out.push(FaceBox {
            x: ox1,
            y: oy1,
            width: ox2 - ox1,
            height: oy2 - oy1,
            score,
        });
    }
}

/// Non-Maximum Suppression over score-sorted detections.
fn nms(mut detections: Vec<FaceBox>, iou_threshold: f32) -> Vec<FaceBox> {
    detections.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

    let mut keep: Vec<FaceBox> = Vec::new();
    for candidate in detections {
        if keep.iter().all(|k| iou(k, &candidate) <= iou_threshold) {
            keep.push(candidate);
        }
    }
    keep
}

/// Intersection-over-Union of two face boxes.
fn iou(a: &FaceBox, b: &FaceBox) -> f32 {
    let x1 = a.x.max(b.x);
    let y1 = a.y.max(b.y);
    let x2 = (a.x + a.width).min(b.x + b.width);
    let y2 = (a.y + a.height).min(b.y + b.height);

    let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union = a.width * a.height + b.width * b.height - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn face(x: f32, y: f32, w: f32, h: f32, score: f32) -> FaceBox {
        FaceBox { x, y, width: w, height: h, score }
    }

    #[test]
    fn test_iou_identical() {
        let a = face(0.0, 0.0, 100.0, 100.0, 1.0);
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_disjoint() {
        let a = face(0.0, 0.0, 10.0, 10.0, 1.0);
        let b = face(50.0, 50.0, 10.0, 10.0, 1.0);
        assert!(iou(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn test_iou_half_overlap() {
        let a = face(0.0, 0.0, 10.0, 10.0, 1.0);
        let b = face(5.0, 0.0, 10.0, 10.0, 1.0);
        assert!((iou(&a, &b) - 50.0 / 150.0).abs() < 1e-6);
    }

    #[test]
    fn test_nms_keeps_best_of_cluster() {
        let detections = vec![
            face(0.0, 0.0, 100.0, 100.0, 0.9),
            face(4.0, 4.0, 100.0, 100.0, 0.8),
            face(300.0, 300.0, 50.0, 50.0, 0.7),
        ];
        let kept = nms(detections, 0.4);
        assert_eq!(kept.len(), 2);
        assert!((kept[0].score - 0.9).abs() < 1e-6);
        assert!((kept[1].score - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_nms_empty() {
        assert!(nms(vec![], 0.4).is_empty());
    }

    #[test]
    fn test_letterbox_roundtrip() {
        let lb = Letterbox::fit(640, 480, DETECTOR_INPUT_SIZE);
        let (lx, ly) = (100.0 * lb.scale + lb.pad_x, 50.0 * lb.scale + lb.pad_y);
        let (ox, oy) = lb.to_original(lx, ly);
        assert!((ox - 100.0).abs() < 0.1);
        assert!((oy - 50.0).abs() < 0.1);
    }

    #[test]
    fn test_preprocess_shape_and_padding() {
        let image = RgbImage::from_pixel(64, 32, image::Rgb([255, 0, 128]));
        let lb = Letterbox::fit(64, 32, DETECTOR_INPUT_SIZE);
        let tensor = preprocess(&image, lb);
        assert_eq!(
            tensor.shape(),
            &[1, 3, DETECTOR_INPUT_SIZE, DETECTOR_INPUT_SIZE]
        );
        // Corner pixel lies in the padding band and normalizes to 0.0.
        assert_eq!(tensor[[0, 0, 0, 0]], 0.0);
    }

    #[test]
    fn test_decode_stride_skips_below_threshold() {
        let grid = DETECTOR_INPUT_SIZE / 32;
        let anchors = grid * grid * ANCHORS_PER_CELL;
        let mut scores = vec![0.0f32; anchors];
        scores[0] = 0.3; // below DETECTOR_SCORE_THRESHOLD
        let boxes = vec![1.0f32; anchors * 4];

        let lb = Letterbox::fit(320, 320, DETECTOR_INPUT_SIZE);
        let mut out = Vec::new();
        decode_stride(&scores, &boxes, 32, lb, DETECTOR_SCORE_THRESHOLD, &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn test_decode_stride_maps_back_to_image_space() {
        let grid = DETECTOR_INPUT_SIZE / 32;
        let anchors = grid * grid * ANCHORS_PER_CELL;
        let mut scores = vec![0.0f32; anchors];
        // Anchor at cell (1, 1): center (32, 32) in input space.
        let idx = (grid + 1) * ANCHORS_PER_CELL;
        scores[idx] = 0.9;
        let mut boxes = vec![0.0f32; anchors * 4];
        boxes[idx * 4..idx * 4 + 4].copy_from_slice(&[1.0, 1.0, 1.0, 1.0]);

        // Square input: scale 1.0, no padding.
        let lb = Letterbox::fit(320, 320, DETECTOR_INPUT_SIZE);
        let mut out = Vec::new();
        decode_stride(&scores, &boxes, 32, lb, DETECTOR_SCORE_THRESHOLD, &mut out);

        assert_eq!(out.len(), 1);
        let f = &out[0];
        assert!((f.x - 0.0).abs() < 1e-3);
        assert!((f.y - 0.0).abs() < 1e-3);
        assert!((f.width - 64.0).abs() < 1e-3);
        assert!((f.height - 64.0).abs() < 1e-3);
    }
}
