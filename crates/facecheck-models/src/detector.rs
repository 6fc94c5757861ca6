//! SCRFD face detector via ONNX Runtime.
//!
//! Letterboxes an RGB image into the 640×640 model input, decodes the three
//! stride levels (two anchors per cell, five landmarks per face) and applies
//! NMS.

use facecheck_core::FaceRegion;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;
const SCRFD_OUTPUTS: usize = 9;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0} — download det_10g.onnx from insightface buffalo_l")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Placement of the resized image inside the square model input.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: u32,
    pad_y: u32,
}

impl Letterbox {
    fn fit(width: u32, height: u32, size: usize) -> (Self, u32, u32) {
        let scale = (size as f32 / width as f32).min(size as f32 / height as f32);
        let new_w = ((width as f32 * scale).round() as u32).clamp(1, size as u32);
        let new_h = ((height as f32 * scale).round() as u32).clamp(1, size as u32);
        let letterbox = Self {
            scale,
            pad_x: (size as u32 - new_w) / 2,
            pad_y: (size as u32 - new_h) / 2,
        };
        (letterbox, new_w, new_h)
    }

    /// Map a point from model-input space back to image space.
    fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        (
            (x - self.pad_x as f32) / self.scale,
            (y - self.pad_y as f32) / self.scale,
        )
    }
}

/// Output tensor indices for one stride: (score, bbox, kps).
type StrideOutputs = (usize, usize, usize);

/// Standard SCRFD export order: scores 8/16/32, then bboxes, then keypoints.
const POSITIONAL_OUTPUTS: [StrideOutputs; 3] = [(0, 3, 6), (1, 4, 7), (2, 5, 8)];

/// SCRFD-based face detector.
pub struct FaceDetector {
    session: Session,
    stride_outputs: [StrideOutputs; 3],
}

impl FaceDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &Path) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = crate::open_session(model_path)?;
        let output_names: Vec<String> = session
            .outputs()
            .iter()
            .map(|o| o.name().to_string())
            .collect();

        tracing::info!(
            path = %model_path.display(),
            outputs = ?output_names,
            "loaded SCRFD model"
        );

        if output_names.len() < SCRFD_OUTPUTS {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model requires {SCRFD_OUTPUTS} outputs (3 strides × score/bbox/kps), got {}",
                output_names.len()
            )));
        }

        Ok(Self {
            session,
            stride_outputs: discover_stride_outputs(&output_names),
        })
    }

    /// Detect faces, highest confidence first.
    pub fn detect(&mut self, image: &RgbImage) -> Result<Vec<FaceRegion>, DetectorError> {
        if image.width() == 0 || image.height() == 0 {
            return Ok(Vec::new());
        }

        let (input, letterbox) = preprocess(image);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (slot, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx, kps_idx) = self.stride_outputs[slot];
            let extract = |idx: usize, what: &str| {
                outputs[idx]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data)
                    .map_err(|e| DetectorError::InferenceFailed(format!("{what} stride {stride}: {e}")))
            };
            let scores = extract(score_idx, "scores")?;
            let bboxes = extract(bbox_idx, "bboxes")?;
            let kps = extract(kps_idx, "kps")?;

            candidates.extend(decode_stride(scores, bboxes, kps, stride, &letterbox));
        }

        let faces = nms(candidates, SCRFD_NMS_THRESHOLD);
        tracing::debug!(faces = faces.len(), "SCRFD detection");
        Ok(faces)
    }
}

/// Letterbox an RGB image into a normalized NCHW tensor.
///
/// Padding is filled with the normalization mean, i.e. 0.0 after
/// normalization.
fn preprocess(image: &RgbImage) -> (Array4<f32>, Letterbox) {
    let (letterbox, new_w, new_h) = Letterbox::fit(image.width(), image.height(), SCRFD_INPUT_SIZE);
    let resized = imageops::resize(image, new_w, new_h, FilterType::Triangle);

    let mut tensor = Array4::<f32>::zeros((1, 3, SCRFD_INPUT_SIZE, SCRFD_INPUT_SIZE));
    for (x, y, pixel) in resized.enumerate_pixels() {
        let tx = (x + letterbox.pad_x) as usize;
        let ty = (y + letterbox.pad_y) as usize;
        for c in 0..3 {
            tensor[[0, c, ty, tx]] = (pixel[c] as f32 - SCRFD_MEAN) / SCRFD_STD;
        }
    }

    (tensor, letterbox)
}

/// Map output tensor names ("score_8", "bbox_16", "kps_32", ...) to stride
/// slots. Exports with generic numeric names use the positional layout.
fn discover_stride_outputs(names: &[String]) -> [StrideOutputs; 3] {
    let position = |prefix: &str, stride: usize| {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == target)
    };

    let mut named = POSITIONAL_OUTPUTS;
    for (slot, &stride) in SCRFD_STRIDES.iter().enumerate() {
        let found = (
            position("score", stride),
            position("bbox", stride),
            position("kps", stride),
        );
        match found {
            (Some(score), Some(bbox), Some(kps)) => named[slot] = (score, bbox, kps),
            _ => {
                tracing::info!(?names, "SCRFD: output names not recognized, using positional mapping");
                return POSITIONAL_OUTPUTS;
            }
        }
    }
    named
}

/// Decode one stride level into face candidates in image coordinates.
fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    kps: &[f32],
    stride: usize,
    letterbox: &Letterbox,
) -> Vec<FaceRegion> {
    let grid_w = SCRFD_INPUT_SIZE / stride;
    let grid_h = SCRFD_INPUT_SIZE / stride;
    let anchors = grid_w * grid_h * SCRFD_ANCHORS_PER_CELL;
    let step = stride as f32;

    let mut faces = Vec::new();
    for idx in 0..anchors.min(scores.len()) {
        let score = scores[idx];
        if score <= SCRFD_CONFIDENCE_THRESHOLD {
            continue;
        }
        let Some(offsets) = bboxes.get(idx * 4..idx * 4 + 4) else {
            continue;
        };

        let cell = idx / SCRFD_ANCHORS_PER_CELL;
        let anchor_x = (cell % grid_w) as f32 * step;
        let anchor_y = (cell / grid_w) as f32 * step;

        let (x1, y1) = letterbox.unmap(anchor_x - offsets[0] * step, anchor_y - offsets[1] * step);
        let (x2, y2) = letterbox.unmap(anchor_x + offsets[2] * step, anchor_y + offsets[3] * step);

        let landmarks = kps.get(idx * 10..idx * 10 + 10).map(|points| {
            std::array::from_fn(|i| {
                letterbox.unmap(anchor_x + points[i * 2] * step, anchor_y + points[i * 2 + 1] * step)
            })
        });

        faces.push(FaceRegion {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
            confidence: score,
            landmarks,
        });
    }
    faces
}

/// Greedy non-maximum suppression. Returns survivors sorted by confidence.
fn nms(mut candidates: Vec<FaceRegion>, iou_threshold: f32) -> Vec<FaceRegion> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<FaceRegion> = Vec::new();
    for candidate in candidates {
        if kept.iter().all(|k| iou(k, &candidate) <= iou_threshold) {
            kept.push(candidate);
        }
    }
    kept
}

/// Intersection-over-Union of two regions.
fn iou(a: &FaceRegion, b: &FaceRegion) -> f32 {
    let inter_w = ((a.x + a.width).min(b.x + b.width) - a.x.max(b.x)).max(0.0);
    let inter_h = ((a.y + a.height).min(b.y + b.height) - a.y.max(b.y)).max(0.0);
    let inter = inter_w * inter_h;
    let union = a.width * a.height + b.width * b.height - inter;
    if union > 0.0 { inter / union } else { 0.0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(x: f32, y: f32, w: f32, h: f32, confidence: f32) -> FaceRegion {
        FaceRegion { x, y, width: w, height: h, confidence, landmarks: None }
    }

    #[test]
    fn test_iou_identical() {
        let a = region(0.0, 0.0, 100.0, 100.0, 1.0);
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_partial() {
        let a = region(0.0, 0.0, 10.0, 10.0, 1.0);
        let b = region(5.0, 0.0, 10.0, 10.0, 1.0);
        assert!((iou(&a, &b) - 50.0 / 150.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_disjoint() {
        let a = region(0.0, 0.0, 10.0, 10.0, 1.0);
        let b = region(20.0, 20.0, 10.0, 10.0, 1.0);
        assert_eq!(iou(&a, &b), 0.0);
    }

    #[test]
    fn test_nms_suppresses_overlapping() {
        let kept = nms(
            vec![
                region(5.0, 5.0, 100.0, 100.0, 0.8),
                region(200.0, 200.0, 50.0, 50.0, 0.7),
                region(0.0, 0.0, 100.0, 100.0, 0.9),
            ],
            0.4,
        );
        let confidences: Vec<_> = kept.iter().map(|f| f.confidence).collect();
        assert_eq!(confidences, vec![0.9, 0.7]);
    }

    #[test]
    fn test_nms_empty() {
        assert!(nms(Vec::new(), 0.4).is_empty());
    }

    #[test]
    fn test_letterbox_landscape() {
        let (lb, w, h) = Letterbox::fit(320, 240, SCRFD_INPUT_SIZE);
        assert_eq!((w, h), (640, 480));
        assert_eq!((lb.pad_x, lb.pad_y), (0, 80));
        let (x, y) = lb.unmap(100.0 * lb.scale, 50.0 * lb.scale + 80.0);
        assert!((x - 100.0).abs() < 1e-3 && (y - 50.0).abs() < 1e-3);
    }

    #[test]
    fn test_preprocess_shape_and_padding() {
        let image = RgbImage::from_pixel(64, 32, image::Rgb([255, 0, 128]));
        let (tensor, lb) = preprocess(&image);
        assert_eq!(tensor.shape(), &[1, 3, SCRFD_INPUT_SIZE, SCRFD_INPUT_SIZE]);
        assert_eq!(lb.pad_y, 160);
        // Padding rows normalize to zero.
        assert_eq!(tensor[[0, 0, 0, 0]], 0.0);
        // Image rows keep their per-channel values.
        let r = tensor[[0, 0, 320, 320]];
        let g = tensor[[0, 1, 320, 320]];
        assert!((r - (255.0 - SCRFD_MEAN) / SCRFD_STD).abs() < 1e-3);
        assert!((g - (0.0 - SCRFD_MEAN) / SCRFD_STD).abs() < 1e-3);
    }

    #[test]
    fn test_decode_stride_single_anchor() {
        let stride = 32;
        let cells = (SCRFD_INPUT_SIZE / stride).pow(2) * SCRFD_ANCHORS_PER_CELL;
        let mut scores = vec![0.0; cells];
        let mut bboxes = vec![0.0; cells * 4];
        let kps = vec![0.0; cells * 10];
        // Anchor index 2 → cell 1 → grid (x=1, y=0) → anchor at (32, 0).
        scores[2] = 0.9;
        bboxes[8..12].copy_from_slice(&[0.5, 0.0, 0.5, 1.0]);
        let identity = Letterbox { scale: 1.0, pad_x: 0, pad_y: 0 };

        let faces = decode_stride(&scores, &bboxes, &kps, stride, &identity);
        assert_eq!(faces.len(), 1);
        let face = &faces[0];
        assert_eq!((face.x, face.y, face.width, face.height), (16.0, 0.0, 32.0, 32.0));
        assert_eq!(face.landmarks.unwrap()[0], (32.0, 0.0));
    }

    #[test]
    fn test_discover_outputs_named() {
        let names: Vec<String> = [
            "bbox_8", "kps_8", "score_8",
            "bbox_16", "kps_16", "score_16",
            "bbox_32", "kps_32", "score_32",
        ].iter().map(|s| s.to_string()).collect();
        assert_eq!(discover_stride_outputs(&names), [(2, 0, 1), (5, 3, 4), (8, 6, 7)]);
    }

    #[test]
    fn test_discover_outputs_positional_fallback() {
        let names: Vec<String> = (0..9).map(|i: usize| (i + 400).to_string()).collect();
        assert_eq!(discover_stride_outputs(&names), POSITIONAL_OUTPUTS);
    }
}
