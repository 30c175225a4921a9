//! Face localization: candidate boxes for the faces in an image.

use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::{Path, PathBuf};
use thiserror::Error;

const SCRFD_INPUT_SIZE: u32 = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [u32; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum LocalizerError {
    #[error("detector model not found: {0}")]
    ModelNotFound(PathBuf),
    #[error("detection failed: {0}")]
    InferenceFailed(String),
    #[error("empty image")]
    EmptyImage,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Source of face boxes, in source-image pixel coordinates.
pub trait FaceLocalizer {
    fn locate(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, LocalizerError>;
}

/// Treats the whole image as the face. For inputs that are already face crops.
#[derive(Debug, Default, Clone, Copy)]
pub struct FullFrameLocalizer;

impl FaceLocalizer for FullFrameLocalizer {
    fn locate(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, LocalizerError> {
        let (w, h) = image.dimensions();
        if w == 0 || h == 0 {
            return Ok(Vec::new());
        }
        Ok(vec![BoundingBox::new(0.0, 0.0, w as f32, h as f32)])
    }
}

/// Scale and padding applied when fitting an image into the square detector input.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Letterbox {
    scale: f32,
    pad_x: u32,
    pad_y: u32,
    new_w: u32,
    new_h: u32,
}

impl Letterbox {
    fn fit(width: u32, height: u32, target: u32) -> Self {
        let scale = (target as f32 / width as f32).min(target as f32 / height as f32);
        let new_w = ((width as f32 * scale).round() as u32).clamp(1, target);
        let new_h = ((height as f32 * scale).round() as u32).clamp(1, target);
        Self {
            scale,
            pad_x: (target - new_w) / 2,
            pad_y: (target - new_h) / 2,
            new_w,
            new_h,
        }
    }

    /// Detector-input coordinates back to source-image coordinates.
    fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        (
            (x - self.pad_x as f32) / self.scale,
            (y - self.pad_y as f32) / self.scale,
        )
    }
}

/// Output tensor positions for one stride: (scores, boxes).
type StrideOutputs = (usize, usize);

/// SCRFD detector over ONNX Runtime.
pub struct ScrfdLocalizer {
    session: Session,
    strides: [StrideOutputs; 3],
}

impl ScrfdLocalizer {
    pub fn load(model_path: &Path) -> Result<Self, LocalizerError> {
        if !model_path.is_file() {
            return Err(LocalizerError::ModelNotFound(model_path.to_path_buf()));
        }
        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        if names.len() < 6 {
            return Err(LocalizerError::InferenceFailed(format!(
                "detector needs score and box outputs for 3 strides, model has {} outputs",
                names.len()
            )));
        }
        let strides = discover_outputs(&names);
        tracing::info!(path = %model_path.display(), outputs = ?names, ?strides, "loaded face detector");
        Ok(Self { session, strides })
    }

    fn input_tensor(image: &RgbImage, letterbox: &Letterbox) -> Array4<f32> {
        let size = SCRFD_INPUT_SIZE as usize;
        let resized = imageops::resize(image, letterbox.new_w, letterbox.new_h, FilterType::Triangle);

        // Padding normalises to zero.
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
        for (x, y, pixel) in resized.enumerate_pixels() {
            let (tx, ty) = ((x + letterbox.pad_x) as usize, (y + letterbox.pad_y) as usize);
            for c in 0..3 {
                tensor[[0, c, ty, tx]] = (pixel[c] as f32 - SCRFD_MEAN) / SCRFD_STD;
            }
        }
        tensor
    }
}

impl FaceLocalizer for ScrfdLocalizer {
    fn locate(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, LocalizerError> {
        let (w, h) = image.dimensions();
        if w == 0 || h == 0 {
            return Err(LocalizerError::EmptyImage);
        }
        let letterbox = Letterbox::fit(w, h, SCRFD_INPUT_SIZE);
        let input = Self::input_tensor(image, &letterbox);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (&stride, &(score_idx, box_idx)) in SCRFD_STRIDES.iter().zip(self.strides.iter()) {
            let (_, scores) = outputs[score_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| LocalizerError::InferenceFailed(format!("scores at stride {stride}: {e}")))?;
            let (_, boxes) = outputs[box_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| LocalizerError::InferenceFailed(format!("boxes at stride {stride}: {e}")))?;
            candidates.extend(decode_stride(scores, boxes, stride, &letterbox, SCRFD_CONFIDENCE_THRESHOLD));
        }

        let faces = nms(candidates, SCRFD_NMS_THRESHOLD);
        tracing::debug!(faces = faces.len(), "faces located");
        Ok(faces)
    }
}

/// Map `score_<stride>` / `bbox_<stride>` outputs to stride slots, or assume
/// the usual positional order (scores 0..3, boxes 3..6) when unnamed.
fn discover_outputs(names: &[String]) -> [StrideOutputs; 3] {
    let find = |prefix: &str, stride: u32| names.iter().position(|n| *n == format!("{prefix}_{stride}"));
    let named: Option<Vec<StrideOutputs>> = SCRFD_STRIDES
        .iter()
        .map(|&s| Some((find("score", s)?, find("bbox", s)?)))
        .collect();

    match named.as_deref() {
        Some(&[a, b, c]) => [a, b, c],
        _ => [(0, 3), (1, 4), (2, 5)],
    }
}

/// Anchor-free decoding of one stride level; boxes are distances from the anchor
/// centre in stride units.
fn decode_stride(
    scores: &[f32],
    boxes: &[f32],
    stride: u32,
    letterbox: &Letterbox,
    threshold: f32,
) -> Vec<BoundingBox> {
    let grid_w = (SCRFD_INPUT_SIZE / stride) as usize;
    let grid_h = grid_w;
    let stride = stride as f32;

    (0..grid_w * grid_h * SCRFD_ANCHORS_PER_CELL)
        .filter_map(|idx| {
            let score = *scores.get(idx)?;
            if score <= threshold {
                return None;
            }
            let d = boxes.get(idx * 4..idx * 4 + 4)?;
            let cell = idx / SCRFD_ANCHORS_PER_CELL;
            let cx = (cell % grid_w) as f32 * stride;
            let cy = (cell / grid_w) as f32 * stride;

            let (x1, y1) = letterbox.unmap(cx - d[0] * stride, cy - d[1] * stride);
            let (x2, y2) = letterbox.unmap(cx + d[2] * stride, cy + d[3] * stride);
            Some(BoundingBox { x1, y1, x2, y2, confidence: score })
        })
        .collect()
}

/// Greedy non-maximum suppression; survivors come back by descending confidence.
fn nms(mut boxes: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    boxes.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut keep: Vec<BoundingBox> = Vec::with_capacity(boxes.len());
    for candidate in boxes {
        if keep.iter().all(|k| k.iou(&candidate) <= iou_threshold) {
            keep.push(candidate);
        }
    }
    keep
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn scored(x1: f32, y1: f32, x2: f32, y2: f32, confidence: f32) -> BoundingBox {
        BoundingBox { x1, y1, x2, y2, confidence }
    }

    fn names(xs: &[&str]) -> Vec<String> {
        xs.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_full_frame_covers_image() {
        let img = RgbImage::from_pixel(120, 90, Rgb([0, 0, 0]));
        let boxes = FullFrameLocalizer.locate(&img).unwrap();
        assert_eq!(boxes, vec![BoundingBox::new(0.0, 0.0, 120.0, 90.0)]);
    }

    #[test]
    fn test_full_frame_empty_image_has_no_face() {
        assert!(FullFrameLocalizer.locate(&RgbImage::new(0, 0)).unwrap().is_empty());
    }

    #[test]
    fn test_nms_keeps_strongest_of_overlap() {
        let boxes = vec![
            scored(5.0, 5.0, 105.0, 105.0, 0.8),
            scored(0.0, 0.0, 100.0, 100.0, 0.9),
            scored(200.0, 200.0, 250.0, 250.0, 0.7),
        ];
        let kept = nms(boxes, 0.4);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].confidence, 0.9);
        assert_eq!(kept[1].confidence, 0.7);
    }

    #[test]
    fn test_nms_empty() {
        assert!(nms(Vec::new(), 0.4).is_empty());
    }

    #[test]
    fn test_letterbox_landscape() {
        let lb = Letterbox::fit(320, 240, 640);
        assert_eq!((lb.new_w, lb.new_h), (640, 480));
        assert_eq!((lb.pad_x, lb.pad_y), (0, 80));
        let (x, y) = lb.unmap(100.0 * lb.scale, 50.0 * lb.scale + 80.0);
        assert!((x - 100.0).abs() < 1e-3 && (y - 50.0).abs() < 1e-3);
    }

    #[test]
    fn test_input_tensor_pads_with_zero() {
        let img = RgbImage::from_pixel(64, 32, Rgb([255, 255, 255]));
        let lb = Letterbox::fit(64, 32, SCRFD_INPUT_SIZE);
        let t = ScrfdLocalizer::input_tensor(&img, &lb);
        assert_eq!(t.shape(), &[1, 3, 640, 640]);
        assert_eq!(t[[0, 0, 0, 0]], 0.0);
        let expected = (255.0 - SCRFD_MEAN) / SCRFD_STD;
        assert!((t[[0, 1, 320, 320]] - expected).abs() < 1e-5);
    }

    #[test]
    fn test_decode_maps_to_source_coordinates() {
        let lb = Letterbox::fit(640, 640, 640);
        let grid = (640 / 32) as usize;
        let anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
        let mut scores = vec![0.0; anchors];
        let mut boxes = vec![0.0; anchors * 4];
        // Anchor 2 sits in cell 1: centre (32, 0).
        scores[2] = 0.95;
        boxes[8..12].copy_from_slice(&[0.5, 0.0, 1.0, 2.0]);

        let dets = decode_stride(&scores, &boxes, 32, &lb, 0.5);
        assert_eq!(dets, vec![scored(16.0, 0.0, 64.0, 64.0, 0.95)]);
    }

    #[test]
    fn test_discover_named_outputs() {
        let n = names(&["bbox_8", "score_8", "bbox_16", "score_16", "bbox_32", "score_32", "kps_8"]);
        assert_eq!(discover_outputs(&n), [(1, 0), (3, 2), (5, 4)]);
    }

    #[test]
    fn test_discover_positional_fallback() {
        let n = names(&["448", "471", "494", "451", "474", "497", "454", "477", "500"]);
        assert_eq!(discover_outputs(&n), [(0, 3), (1, 4), (2, 5)]);
    }

    #[test]
    fn test_missing_model() {
        let err = ScrfdLocalizer::load(Path::new("/nonexistent/det.onnx")).err().unwrap();
        assert!(matches!(err, LocalizerError::ModelNotFound(_)));
    }
}
