//! Immutable settings snapshot, loaded from TOML and `FACEMOOD_*` overrides.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

pub const DEFAULT_LABELS: [&str; 7] = [
    "angry", "disgust", "fear", "happy", "sad", "surprise", "neutral",
];

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("unknown architecture: {0} (expected cbam_resnet or mobile_vit)")]
    UnknownArchitecture(String),
    #[error("invalid setting {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
    #[error("cannot read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("toml: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Supported classifier structures. The identifier is persisted in checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Architecture {
    /// Channel + spatial attention gates feeding a linear head.
    CbamResnet,
    /// Two-layer perceptron head; the lightweight variant.
    MobileVit,
}

impl Architecture {
    pub const ALL: [Architecture; 2] = [Architecture::CbamResnet, Architecture::MobileVit];

    pub fn id(&self) -> &'static str {
        match self {
            Architecture::CbamResnet => "cbam_resnet",
            Architecture::MobileVit => "mobile_vit",
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for Architecture {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Architecture::ALL
            .into_iter()
            .find(|a| a.id() == s.trim())
            .ok_or_else(|| ConfigError::UnknownArchitecture(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub architecture: Architecture,
    /// Root of the labeled folder tree.
    pub data_dir: PathBuf,
    /// Holds `class_index.json` and `checkpoints/`.
    pub models_dir: PathBuf,
    /// Side length of the square network input.
    pub image_size: u32,
    pub batch_size: usize,
    pub learning_rate: f32,
    pub weight_decay: f32,
    pub epochs: usize,
    pub validation_fraction: f64,
    pub seed: u64,
    /// Faces narrower or shorter than this are not classified.
    pub min_face_px: f32,
    /// Positive-class probability above which the threshold policy fires.
    pub laugh_cutoff: f32,
    pub positive_index: usize,
    pub positive_label: String,
    pub default_labels: Vec<String>,
    /// SCRFD face detection model.
    pub detector_model: PathBuf,
    /// Optional exported emotion network used instead of the trainable model.
    pub onnx_emotion_model: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            architecture: Architecture::CbamResnet,
            data_dir: PathBuf::from("data/uploads"),
            models_dir: PathBuf::from("models"),
            image_size: 224,
            batch_size: 32,
            learning_rate: 5e-4,
            weight_decay: 1e-4,
            epochs: 15,
            validation_fraction: 0.2,
            seed: 42,
            min_face_px: 80.0,
            laugh_cutoff: 0.43,
            positive_index: 1,
            positive_label: "laugh".to_string(),
            default_labels: DEFAULT_LABELS.iter().map(|s| s.to_string()).collect(),
            detector_model: PathBuf::from("models/det_10g.onnx"),
            onnx_emotion_model: None,
        }
    }
}

impl Settings {
    /// Load settings: defaults, then the TOML file (if given), then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let base = match path {
            Some(p) => {
                let text = std::fs::read_to_string(p).map_err(|source| ConfigError::Read {
                    path: p.to_path_buf(),
                    source,
                })?;
                toml::from_str::<Settings>(&text)?
            }
            None => Settings::default(),
        };
        let settings = base.with_env_overrides()?;
        settings.validate()?;
        Ok(settings)
    }

    fn with_env_overrides(mut self) -> Result<Self, ConfigError> {
        if let Ok(v) = std::env::var("FACEMOOD_ARCH") {
            self.architecture = v.parse()?;
        }
        if let Ok(v) = std::env::var("FACEMOOD_DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("FACEMOOD_MODELS_DIR") {
            self.models_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("FACEMOOD_DETECTOR_MODEL") {
            self.detector_model = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("FACEMOOD_ONNX_EMOTION_MODEL") {
            self.onnx_emotion_model = Some(PathBuf::from(v));
        }
        self.epochs = env_parse("FACEMOOD_EPOCHS", self.epochs);
        self.batch_size = env_parse("FACEMOOD_BATCH_SIZE", self.batch_size);
        self.learning_rate = env_parse("FACEMOOD_LEARNING_RATE", self.learning_rate);
        self.image_size = env_parse("FACEMOOD_IMAGE_SIZE", self.image_size);
        self.min_face_px = env_parse("FACEMOOD_MIN_FACE_PX", self.min_face_px);
        self.laugh_cutoff = env_parse("FACEMOOD_LAUGH_CUTOFF", self.laugh_cutoff);
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(invalid("batch_size", "must be > 0"));
        }
        if self.epochs == 0 {
            return Err(invalid("epochs", "must be > 0"));
        }
        if self.learning_rate.is_nan() || self.learning_rate <= 0.0 {
            return Err(invalid("learning_rate", "must be > 0"));
        }
        if !(0.0..1.0).contains(&self.validation_fraction) {
            return Err(invalid("validation_fraction", "must be in [0, 1)"));
        }
        if self.image_size < 8 {
            return Err(invalid("image_size", "must be at least 8"));
        }
        if self.default_labels.is_empty() {
            return Err(invalid("default_labels", "must not be empty"));
        }
        Ok(())
    }

    pub fn with_architecture(&self, architecture: Architecture) -> Self {
        Self { architecture, ..self.clone() }
    }

    pub fn with_epochs(&self, epochs: usize) -> Self {
        Self { epochs, ..self.clone() }
    }

    pub fn with_learning_rate(&self, learning_rate: f32) -> Self {
        Self { learning_rate, ..self.clone() }
    }

    pub fn class_index_path(&self) -> PathBuf {
        self.models_dir.join("class_index.json")
    }

    pub fn checkpoints_dir(&self) -> PathBuf {
        self.models_dir.join("checkpoints")
    }
}

fn invalid(key: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid { key, reason: reason.to_string() }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
