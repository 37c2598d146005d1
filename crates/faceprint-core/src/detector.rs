//! SCRFD face detector via ONNX Runtime.
//!
//! The full image is stretched to the model's 640×640 input, the three
//! anchor-free stride heads are decoded, overlapping boxes are suppressed and
//! the survivors are mapped back to source-image coordinates.

use crate::types::{Detection, RasterImage};
use image::imageops::FilterType;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

// --- Named constants (no magic numbers) ---
const SCRFD_INPUT_SIZE: u32 = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

/// Minimum score for a raw anchor to survive decoding.
pub const DEFAULT_SCORE_THRESHOLD: f32 = 0.5;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Anything that can propose face boxes for an image.
///
/// Implementations are shared between requests and must not need `&mut`.
pub trait FaceDetection: Send + Sync {
    /// Detected faces in source-image coordinates, highest confidence first.
    fn detect(&self, image: &RasterImage) -> Result<Vec<Detection>, DetectorError>;
}

/// Model pixels per source pixel along each axis.
#[derive(Debug, Clone, Copy)]
struct InputScale {
    x: f32,
    y: f32,
}

/// Output tensor indices for one stride: (score_idx, bbox_idx).
type StrideOutputIndices = (usize, usize);

/// SCRFD-based face detector.
pub struct FaceDetector {
    session: Mutex<Session>,
    /// Per-stride output indices for strides [8, 16, 32].
    stride_indices: [StrideOutputIndices; 3],
    score_threshold: f32,
}

impl FaceDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &Path, intra_threads: usize) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(intra_threads)
            .map_err(ort::Error::from)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session
            .outputs()
            .iter()
            .map(|o| o.name().to_string())
            .collect();

        tracing::info!(
            path = %model_path.display(),
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?output_names,
            "loaded SCRFD model"
        );

        if output_names.len() < 6 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model needs score and bbox outputs for 3 strides, got {} outputs",
                output_names.len()
            )));
        }

        let stride_indices = discover_output_indices(&output_names);
        tracing::debug!(?stride_indices, "SCRFD output tensor mapping");

        Ok(Self {
            session: Mutex::new(session),
            stride_indices,
            score_threshold: DEFAULT_SCORE_THRESHOLD,
        })
    }

    /// Override the per-anchor score floor used while decoding.
    pub fn with_score_threshold(mut self, threshold: f32) -> Self {
        self.score_threshold = threshold;
        self
    }
}

impl FaceDetection for FaceDetector {
    fn detect(&self, image: &RasterImage) -> Result<Vec<Detection>, DetectorError> {
        let (input, scale) = preprocess(image);

        let mut session = self
            .session
            .lock()
            .map_err(|_| DetectorError::InferenceFailed("detector session poisoned".into()))?;
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (slot, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx) = self.stride_indices[slot];

            let (_, scores) = outputs[score_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("scores stride {stride}: {e}")))?;
            let (_, bboxes) = outputs[bbox_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("bboxes stride {stride}: {e}")))?;

            candidates.extend(decode_stride(scores, bboxes, stride, scale, self.score_threshold));
        }

        let detections = nms(candidates, SCRFD_NMS_THRESHOLD);
        tracing::debug!(
            count = detections.len(),
            best = ?detections.first().map(|d| d.confidence),
            "SCRFD detections"
        );
        Ok(detections)
    }
}

/// Stretch an RGB image to the SCRFD input square and normalize into NCHW.
fn preprocess(image: &RasterImage) -> (Array4<f32>, InputScale) {
    let size = SCRFD_INPUT_SIZE;
    let resized = image::imageops::resize(image.as_rgb(), size, size, FilterType::Triangle);

    let scale = InputScale {
        x: size as f32 / image.width() as f32,
        y: size as f32 / image.height() as f32,
    };

    let side = size as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, side, side));
    for (x, y, pixel) in resized.enumerate_pixels() {
        for channel in 0..3 {
            tensor[[0, channel, y as usize, x as usize]] =
                (pixel[channel] as f32 - SCRFD_MEAN) / SCRFD_STD;
        }
    }

    (tensor, scale)
}

/// Map tensor names to stride slots.
///
/// Exports that name their heads `score_8`, `bbox_16`, ... are matched by
/// name. Anything else uses the conventional order:
///   [0-2] = scores (strides 8, 16, 32)
///   [3-5] = bboxes (strides 8, 16, 32)
fn discover_output_indices(names: &[String]) -> [StrideOutputIndices; 3] {
    let find = |prefix: &str, stride: usize| {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == target)
    };

    let named: Option<Vec<StrideOutputIndices>> = SCRFD_STRIDES
        .iter()
        .map(|&stride| Some((find("score", stride)?, find("bbox", stride)?)))
        .collect();

    match named.as_deref() {
        Some(&[s8, s16, s32]) => {
            tracing::info!("SCRFD: using name-based output tensor mapping");
            [s8, s16, s32]
        }
        _ => {
            tracing::info!(
                ?names,
                "SCRFD: output names not recognized, using positional mapping [0-2]=scores, [3-5]=bboxes"
            );
            [(0, 3), (1, 4), (2, 5)]
        }
    }
}

/// Decode the anchors of one stride level into source-space boxes.
fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    stride: usize,
    scale: InputScale,
    threshold: f32,
) -> Vec<Detection> {
    let grid = SCRFD_INPUT_SIZE as usize / stride;
    let num_anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
    let step = stride as f32;

    let mut detections = Vec::new();
    for idx in 0..num_anchors {
        let score = scores.get(idx).copied().unwrap_or(0.0);
        if score < threshold {
            continue;
        }
        let Some(offsets) = bboxes.get(idx * 4..idx * 4 + 4) else {
            continue;
        };

        let cell = idx / SCRFD_ANCHORS_PER_CELL;
        let anchor_x = (cell % grid) as f32 * step;
        let anchor_y = (cell / grid) as f32 * step;

        // Offsets are distances from the anchor to each edge, in stride units.
        let left = (anchor_x - offsets[0] * step) / scale.x;
        let top = (anchor_y - offsets[1] * step) / scale.y;
        let right = (anchor_x + offsets[2] * step) / scale.x;
        let bottom = (anchor_y + offsets[3] * step) / scale.y;

        detections.push(Detection {
            x: left,
            y: top,
            width: right - left,
            height: bottom - top,
            confidence: score,
        });
    }

    detections
}

/// Greedy Non-Maximum Suppression. Output is sorted by confidence.
fn nms(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<Detection> = Vec::with_capacity(detections.len());
    for candidate in detections {
        if kept.iter().all(|k| k.iou(&candidate) <= iou_threshold) {
            kept.push(candidate);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn make_det(x: f32, y: f32, w: f32, h: f32, conf: f32) -> Detection {
        Detection { x, y, width: w, height: h, confidence: conf }
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_nms_suppresses_overlapping() {
        let detections = vec![
            make_det(5.0, 5.0, 100.0, 100.0, 0.8),
            make_det(0.0, 0.0, 100.0, 100.0, 0.9),
            make_det(200.0, 200.0, 50.0, 50.0, 0.7),
        ];
        let result = nms(detections, 0.4);
        assert_eq!(result.len(), 2);
        assert!((result[0].confidence - 0.9).abs() < 1e-6);
        assert!((result[1].confidence - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_nms_keeps_disjoint_sorted() {
        let detections = vec![
            make_det(0.0, 0.0, 10.0, 10.0, 0.6),
            make_det(50.0, 50.0, 10.0, 10.0, 0.8),
        ];
        let result = nms(detections, 0.4);
        assert_eq!(result.len(), 2);
        assert!(result[0].confidence > result[1].confidence);
    }

    #[test]
    fn test_nms_empty() {
        assert!(nms(vec![], 0.4).is_empty());
    }

    #[test]
    fn test_discover_named_outputs() {
        let indices = discover_output_indices(&names(&[
            "score_8", "score_16", "score_32", "bbox_8", "bbox_16", "bbox_32", "kps_8", "kps_16",
            "kps_32",
        ]));
        assert_eq!(indices, [(0, 3), (1, 4), (2, 5)]);
    }

    #[test]
    fn test_discover_shuffled_named_outputs() {
        let indices = discover_output_indices(&names(&[
            "bbox_8", "score_8", "bbox_16", "score_16", "bbox_32", "score_32",
        ]));
        assert_eq!(indices, [(1, 0), (3, 2), (5, 4)]);
    }

    #[test]
    fn test_discover_positional_fallback() {
        let generic: Vec<String> = (0..9).map(|i: usize| i.to_string()).collect();
        assert_eq!(discover_output_indices(&generic), [(0, 3), (1, 4), (2, 5)]);
    }

    #[test]
    fn test_discover_partial_names_fall_back() {
        let indices = discover_output_indices(&names(&[
            "score_8", "score_16", "other", "bbox_8", "bbox_16", "bbox_32",
        ]));
        assert_eq!(indices, [(0, 3), (1, 4), (2, 5)]);
    }

    #[test]
    fn test_decode_stride_maps_to_source_space() {
        // stride 32 → 20×20 grid, 800 anchors
        let grid = 20;
        let anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
        let mut scores = vec![0.0f32; anchors];
        let mut bboxes = vec![0.0f32; anchors * 4];

        // cell (col 2, row 1) → anchor centre (64, 32) in model space
        let idx = (grid + 2) * SCRFD_ANCHORS_PER_CELL;
        scores[idx] = 0.9;
        bboxes[idx * 4..idx * 4 + 4].copy_from_slice(&[1.0, 1.0, 1.0, 1.0]);

        // source is 320 wide, 1280 tall
        let scale = InputScale { x: 2.0, y: 0.5 };
        let dets = decode_stride(&scores, &bboxes, 32, scale, 0.5);

        assert_eq!(dets.len(), 1);
        let d = dets[0];
        assert!((d.x - 16.0).abs() < 1e-4, "x = {}", d.x);
        assert!((d.y - 0.0).abs() < 1e-4, "y = {}", d.y);
        assert!((d.width - 32.0).abs() < 1e-4);
        assert!((d.height - 128.0).abs() < 1e-4);
        assert!((d.confidence - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_decode_stride_respects_threshold() {
        let anchors = 20 * 20 * SCRFD_ANCHORS_PER_CELL;
        let scores = vec![0.3f32; anchors];
        let bboxes = vec![1.0f32; anchors * 4];
        let scale = InputScale { x: 1.0, y: 1.0 };
        assert!(decode_stride(&scores, &bboxes, 32, scale, 0.5).is_empty());
        assert_eq!(decode_stride(&scores, &bboxes, 32, scale, 0.25).len(), anchors);
    }

    #[test]
    fn test_decode_stride_short_bbox_tensor() {
        let anchors = 20 * 20 * SCRFD_ANCHORS_PER_CELL;
        let scores = vec![0.9f32; anchors];
        let bboxes = vec![1.0f32; 4];
        let scale = InputScale { x: 1.0, y: 1.0 };
        assert_eq!(decode_stride(&scores, &bboxes, 32, scale, 0.5).len(), 1);
    }

    #[test]
    fn test_preprocess_shape_and_scale() {
        let image = RasterImage::from_rgb(RgbImage::from_pixel(320, 160, Rgb([255, 127, 0])));
        let (tensor, scale) = preprocess(&image);

        assert_eq!(tensor.shape(), &[1, 3, 640, 640]);
        assert!((scale.x - 2.0).abs() < 1e-6);
        assert!((scale.y - 4.0).abs() < 1e-6);

        let expect = |v: f32| (v - SCRFD_MEAN) / SCRFD_STD;
        assert!((tensor[[0, 0, 10, 10]] - expect(255.0)).abs() < 1e-5);
        assert!((tensor[[0, 1, 10, 10]] - expect(127.0)).abs() < 1e-5);
        assert!((tensor[[0, 2, 10, 10]] - expect(0.0)).abs() < 1e-5);
    }
}
