//! facemood-core: face emotion classifier lifecycle.
//!
//! Trains small attention and perceptron heads over labeled face folders,
//! keeps `last`/`best` checkpoints, and classifies images by localizing the
//! most prominent face and scoring its crop.

pub mod checkpoint;
pub mod class_index;
pub mod config;
pub mod dataset;
mod fsutil;
pub mod localizer;
pub mod manager;
pub mod network;
pub mod onnx_scorer;
pub mod pipeline;
pub mod preprocess;
pub mod training;
pub mod types;

pub use class_index::{ClassIndex, ClassIndexRegistry};
pub use config::{Architecture, Settings};
pub use localizer::{FaceLocalizer, FullFrameLocalizer, ScrfdLocalizer};
pub use manager::{LoadOutcome, ModelManager};
pub use pipeline::DecisionPolicy;
pub use training::{EpochReport, StatusBoard, TrainingSummary};
pub use types::{BoundingBox, PredictionResult, TrainPhase, TrainingStatus};
