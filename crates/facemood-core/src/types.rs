use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Label used when no face is classified.
pub const OTHER_LABEL: &str = "other";
/// Label used when the pipeline faults.
pub const ERROR_LABEL: &str = "error";
/// Label used when the arg-max index has no entry in the class index.
pub const UNKNOWN_LABEL: &str = "unknown";

/// Face bounding box in source image pixel coordinates, corner form.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub confidence: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2, confidence: 1.0 }
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    /// Area in square pixels; degenerate boxes report zero.
    pub fn area(&self) -> f32 {
        self.width().max(0.0) * self.height().max(0.0)
    }

    /// Intersection-over-Union with another box.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x1.max(other.x1);
        let y1 = self.y1.max(other.y1);
        let x2 = self.x2.min(other.x2);
        let y2 = self.y2.min(other.y2);

        let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union = self.area() + other.area() - inter;

        if union > 0.0 {
            inter / union
        } else {
            0.0
        }
    }
}

/// One labeled training image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub path: PathBuf,
    pub label: usize,
}

/// Outcome of classifying one image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResult {
    pub label: String,
    /// Score of `label`, or of the positive class under a threshold policy.
    pub probability: f32,
    /// Full distribution over labels; empty for sentinel results.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub probabilities: BTreeMap<String, f32>,
}

impl PredictionResult {
    /// `other/0.0`: nothing worth classifying was found.
    pub fn other() -> Self {
        Self {
            label: OTHER_LABEL.to_string(),
            probability: 0.0,
            probabilities: BTreeMap::new(),
        }
    }

    /// `error/-1.0`: the pipeline faulted.
    pub fn error() -> Self {
        Self {
            label: ERROR_LABEL.to_string(),
            probability: -1.0,
            probabilities: BTreeMap::new(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.label == ERROR_LABEL && self.probability < 0.0
    }
}

/// Training lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrainPhase {
    #[default]
    Idle,
    Preparing,
    Training,
    Done,
    Error,
}

/// Running record of the most recent training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingStatus {
    pub running: bool,
    pub phase: TrainPhase,
    pub epoch: usize,
    pub total_epochs: usize,
    pub train_loss: f32,
    pub val_loss: f32,
    pub best_val_loss: Option<f32>,
    pub message: String,
    pub architecture: String,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TrainingStatus {
    pub fn idle(architecture: &str) -> Self {
        Self {
            running: false,
            phase: TrainPhase::Idle,
            epoch: 0,
            total_epochs: 0,
            train_loss: 0.0,
            val_loss: 0.0,
            best_val_loss: None,
            message: "idle".to_string(),
            architecture: architecture.to_string(),
            finished_at: None,
        }
    }
}
