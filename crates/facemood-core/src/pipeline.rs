//! Two-stage inference: localize a face, then score the crop.

use crate::class_index::ClassIndex;
use crate::config::Settings;
use crate::localizer::{FaceLocalizer, LocalizerError};
use crate::network::{softmax, NetError, Scorer};
use crate::preprocess::Preprocess;
use crate::types::{BoundingBox, PredictionResult, UNKNOWN_LABEL};
use image::{imageops, RgbImage};
use ndarray::ArrayView1;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("localizer: {0}")]
    Localizer(#[from] LocalizerError),
    #[error("scorer: {0}")]
    Scorer(#[from] NetError),
    #[error("scorer produced {scores} scores for {classes} classes")]
    ClassMismatch { scores: usize, classes: usize },
}

/// Outcome of picking the face to classify.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FaceSelection {
    Detected(BoundingBox),
    NoFace,
    TooSmall { width: f32, height: f32 },
    EmptyCrop,
}

/// Largest box wins (first on ties), gated on `min_face` and clipped to the image.
pub fn select_face(boxes: &[BoundingBox], image_dims: (u32, u32), min_face: f32) -> FaceSelection {
    let mut best: Option<&BoundingBox> = None;
    for b in boxes {
        if best.map_or(true, |cur| b.area() > cur.area()) {
            best = Some(b);
        }
    }
    let Some(face) = best else {
        return FaceSelection::NoFace;
    };

    if face.width() < min_face || face.height() < min_face {
        return FaceSelection::TooSmall { width: face.width(), height: face.height() };
    }

    let (w, h) = (image_dims.0 as f32, image_dims.1 as f32);
    let clipped = BoundingBox {
        x1: face.x1.clamp(0.0, w).floor(),
        y1: face.y1.clamp(0.0, h).floor(),
        x2: face.x2.clamp(0.0, w).ceil(),
        y2: face.y2.clamp(0.0, h).ceil(),
        confidence: face.confidence,
    };
    if clipped.width() < 1.0 || clipped.height() < 1.0 {
        return FaceSelection::EmptyCrop;
    }
    FaceSelection::Detected(clipped)
}

/// Pixels inside an already clipped box.
pub fn crop(image: &RgbImage, face: &BoundingBox) -> RgbImage {
    imageops::crop_imm(
        image,
        face.x1 as u32,
        face.y1 as u32,
        face.width() as u32,
        face.height() as u32,
    )
    .to_image()
}

/// How probabilities become a label.
#[derive(Debug, Clone, PartialEq)]
pub enum DecisionPolicy {
    /// Most probable class.
    ArgMax,
    /// `positive_label` iff the positive class probability exceeds `cutoff`, else `other`.
    Threshold {
        positive_index: usize,
        positive_label: String,
        cutoff: f32,
    },
}

impl DecisionPolicy {
    pub fn threshold_from(settings: &Settings) -> Self {
        DecisionPolicy::Threshold {
            positive_index: settings.positive_index,
            positive_label: settings.positive_label.clone(),
            cutoff: settings.laugh_cutoff,
        }
    }

    pub fn decide(&self, probs: ArrayView1<f32>, class_index: &ClassIndex) -> PredictionResult {
        let probabilities = probs
            .iter()
            .enumerate()
            .map(|(i, &p)| (class_index.label(i).unwrap_or(UNKNOWN_LABEL).to_string(), p))
            .collect();

        match self {
            DecisionPolicy::ArgMax => {
                let (idx, p) = probs
                    .iter()
                    .copied()
                    .enumerate()
                    .fold((0, f32::NEG_INFINITY), |best, (i, p)| if p > best.1 { (i, p) } else { best });
                PredictionResult {
                    label: class_index.label(idx).unwrap_or(UNKNOWN_LABEL).to_string(),
                    probability: p.max(0.0),
                    probabilities,
                }
            }
            DecisionPolicy::Threshold { positive_index, positive_label, cutoff } => {
                let p = probs.get(*positive_index).copied().unwrap_or(0.0);
                let mut result = PredictionResult::other();
                if p > *cutoff {
                    result.label = positive_label.clone();
                }
                result.probability = p;
                result.probabilities = probabilities;
                result
            }
        }
    }
}

/// Localizer, normalisation and scorer wired together for one request.
pub struct InferencePipeline<'a> {
    pub localizer: &'a mut dyn FaceLocalizer,
    pub scorer: &'a mut dyn Scorer,
    pub preprocess: Preprocess,
    pub class_index: &'a ClassIndex,
    pub policy: &'a DecisionPolicy,
    pub min_face: f32,
}

impl InferencePipeline<'_> {
    /// Full pipeline. Every fault becomes the `error/-1.0` sentinel.
    pub fn classify(&mut self, image: &RgbImage) -> PredictionResult {
        match self.try_classify(image) {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(error = %e, "inference failed");
                PredictionResult::error()
            }
        }
    }

    pub fn try_classify(&mut self, image: &RgbImage) -> Result<PredictionResult, PipelineError> {
        let boxes = self.localizer.locate(image)?;
        match select_face(&boxes, image.dimensions(), self.min_face) {
            FaceSelection::Detected(face) => self.score(&crop(image, &face)),
            FaceSelection::NoFace => {
                tracing::debug!("no face detected");
                Ok(PredictionResult::other())
            }
            FaceSelection::TooSmall { width, height } => {
                tracing::debug!(width, height, min = self.min_face, "face too small");
                Ok(PredictionResult::other())
            }
            FaceSelection::EmptyCrop => {
                tracing::debug!("empty face crop");
                Ok(PredictionResult::other())
            }
        }
    }

    /// Score a face crop directly, skipping localization.
    pub fn score(&mut self, face: &RgbImage) -> Result<PredictionResult, PipelineError> {
        let input = self.preprocess.tensor(face);
        let scores = self.scorer.scores(input.view())?;
        if scores.len() != self.class_index.len() {
            return Err(PipelineError::ClassMismatch {
                scores: scores.len(),
                classes: self.class_index.len(),
            });
        }
        let probs = softmax(scores.view());
        Ok(self.policy.decide(probs.view(), self.class_index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ERROR_LABEL, OTHER_LABEL};
    use image::Rgb;
    use ndarray::{Array1, ArrayView3};

    struct FixedBoxes(Vec<BoundingBox>);

    impl FaceLocalizer for FixedBoxes {
        fn locate(&mut self, _: &RgbImage) -> Result<Vec<BoundingBox>, LocalizerError> {
            Ok(self.0.clone())
        }
    }

    struct BrokenLocalizer;

    impl FaceLocalizer for BrokenLocalizer {
        fn locate(&mut self, _: &RgbImage) -> Result<Vec<BoundingBox>, LocalizerError> {
            Err(LocalizerError::InferenceFailed("device lost".to_string()))
        }
    }

    /// Returns fixed logits and records the input size it saw.
    struct FixedScores {
        logits: Vec<f32>,
        calls: usize,
    }

    impl Scorer for FixedScores {
        fn scores(&mut self, _: ArrayView3<f32>) -> Result<Array1<f32>, NetError> {
            self.calls += 1;
            Ok(Array1::from(self.logits.clone()))
        }
    }

    fn laugh_index() -> ClassIndex {
        ClassIndex::new(vec!["other".into(), "laugh".into()]).unwrap()
    }

    fn threshold() -> DecisionPolicy {
        DecisionPolicy::Threshold { positive_index: 1, positive_label: "laugh".into(), cutoff: 0.43 }
    }

    fn run(boxes: Vec<BoundingBox>, logits: Vec<f32>, policy: &DecisionPolicy) -> (PredictionResult, usize) {
        let image = RgbImage::from_pixel(300, 200, Rgb([120, 90, 60]));
        let class_index = laugh_index();
        let mut localizer = FixedBoxes(boxes);
        let mut scorer = FixedScores { logits, calls: 0 };
        let result = InferencePipeline {
            localizer: &mut localizer,
            scorer: &mut scorer,
            preprocess: Preprocess::new(32),
            class_index: &class_index,
            policy,
            min_face: 80.0,
        }
        .classify(&image);
        (result, scorer.calls)
    }

    #[test]
    fn test_no_face_is_other() {
        let (result, calls) = run(vec![], vec![0.0, 5.0], &threshold());
        assert_eq!(result, PredictionResult::other());
        assert_eq!(calls, 0);
    }

    #[test]
    fn test_small_face_is_other() {
        let (result, calls) = run(vec![BoundingBox::new(10.0, 10.0, 50.0, 50.0)], vec![0.0, 5.0], &threshold());
        assert_eq!(result.label, OTHER_LABEL);
        assert_eq!(result.probability, 0.0);
        assert_eq!(calls, 0);
    }

    #[test]
    fn test_confident_positive_passes_cutoff() {
        // softmax([0, ln(0.91/0.09)]) ≈ [0.09, 0.91]
        let logit = (0.91f32 / 0.09).ln();
        let (result, _) = run(vec![BoundingBox::new(0.0, 0.0, 150.0, 150.0)], vec![0.0, logit], &threshold());
        assert_eq!(result.label, "laugh");
        assert!((result.probability - 0.91).abs() < 1e-4);
        assert!((result.probabilities["laugh"] - 0.91).abs() < 1e-4);
    }

    #[test]
    fn test_below_cutoff_is_other_with_probability() {
        let (result, _) = run(vec![BoundingBox::new(0.0, 0.0, 150.0, 150.0)], vec![0.0, -1.0], &threshold());
        assert_eq!(result.label, OTHER_LABEL);
        assert!(result.probability > 0.0 && result.probability < 0.43);
    }

    #[test]
    fn test_localizer_fault_is_error_sentinel() {
        let image = RgbImage::from_pixel(100, 100, Rgb([0, 0, 0]));
        let class_index = laugh_index();
        let mut scorer = FixedScores { logits: vec![0.0, 0.0], calls: 0 };
        let result = InferencePipeline {
            localizer: &mut BrokenLocalizer,
            scorer: &mut scorer,
            preprocess: Preprocess::new(32),
            class_index: &class_index,
            policy: &DecisionPolicy::ArgMax,
            min_face: 80.0,
        }
        .classify(&image);
        assert_eq!(result.label, ERROR_LABEL);
        assert_eq!(result.probability, -1.0);
        assert!(result.is_error());
    }

    #[test]
    fn test_class_mismatch_is_error_sentinel() {
        let (result, _) = run(vec![BoundingBox::new(0.0, 0.0, 150.0, 150.0)], vec![0.0, 1.0, 2.0], &threshold());
        assert!(result.is_error());
    }

    #[test]
    fn test_largest_box_selected_first_on_tie() {
        let boxes = [
            BoundingBox::new(0.0, 0.0, 100.0, 100.0),
            BoundingBox::new(10.0, 10.0, 200.0, 200.0),
            BoundingBox::new(50.0, 0.0, 240.0, 190.0),
        ];
        assert_eq!(select_face(&boxes, (400, 400), 80.0), FaceSelection::Detected(boxes[1]));
    }

    #[test]
    fn test_gate_uses_width_or_height() {
        let tall_thin = [BoundingBox::new(0.0, 0.0, 60.0, 300.0)];
        assert_eq!(
            select_face(&tall_thin, (400, 400), 80.0),
            FaceSelection::TooSmall { width: 60.0, height: 300.0 }
        );
    }

    #[test]
    fn test_box_outside_image_is_empty_crop() {
        let outside = [BoundingBox::new(500.0, 500.0, 700.0, 700.0)];
        assert_eq!(select_face(&outside, (400, 300), 80.0), FaceSelection::EmptyCrop);
    }

    #[test]
    fn test_box_clipped_to_image() {
        let overhang = [BoundingBox::new(-20.0, 250.0, 150.0, 400.0)];
        match select_face(&overhang, (400, 300), 80.0) {
            FaceSelection::Detected(b) => {
                assert_eq!((b.x1, b.y1, b.x2, b.y2), (0.0, 250.0, 150.0, 300.0));
                assert_eq!(crop(&RgbImage::new(400, 300), &b).dimensions(), (150, 50));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_argmax_single_class() {
        let index = ClassIndex::new(vec!["happy".into()]).unwrap();
        let probs = softmax(Array1::from(vec![3.0]).view());
        let result = DecisionPolicy::ArgMax.decide(probs.view(), &index);
        assert_eq!(result.label, "happy");
        assert!((result.probability - 1.0).abs() < 1e-6);
        assert!((result.probabilities.values().sum::<f32>() - 1.0).abs() < 1e-6);
    }
}
