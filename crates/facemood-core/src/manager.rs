//! Owns the live model and mediates load, train and predict.

use crate::checkpoint::{CheckpointError, CheckpointStore, Slot};
use crate::class_index::{ClassIndex, ClassIndexRegistry};
use crate::config::{Architecture, Settings};
use crate::localizer::{FaceLocalizer, FullFrameLocalizer};
use crate::network::{self, EmotionNet, NetError, PretrainedPrior, SeededPrior};
use crate::pipeline::{DecisionPolicy, InferencePipeline};
use crate::preprocess::Preprocess;
use crate::training::{StatusBoard, TrainError, TrainingLoop, TrainingSummary};
use crate::types::{PredictionResult, TrainingStatus};
use image::RgbImage;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("checkpoint architecture {found} does not match configured {expected}")]
    ArchitectureMismatch { expected: String, found: String },
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error(transparent)]
    Net(#[from] NetError),
    #[error(transparent)]
    Train(#[from] TrainError),
}

/// How the live model was obtained.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadOutcome {
    Restored { slot: Slot, epoch: usize },
    Fresh,
    /// Even a fresh model could not be built; predictions return the error sentinel.
    Unavailable,
}

/// Owner of the live model, its class index and the persisted state behind them.
///
/// Not shared between threads; the CLI engine thread owns one and serializes requests.
pub struct ModelManager {
    settings: Arc<Settings>,
    store: CheckpointStore,
    registry: ClassIndexRegistry,
    prior: Box<dyn PretrainedPrior + Send>,
    model: Option<Box<dyn EmotionNet>>,
    class_index: ClassIndex,
    status: StatusBoard,
}

impl ModelManager {
    /// Manager over `settings` with the built-in seeded prior. No model is loaded yet.
    pub fn new(settings: Arc<Settings>) -> Self {
        let prior = SeededPrior::new(settings.seed);
        Self::with_prior(settings, Box::new(prior))
    }

    /// Manager with a custom initial-weight provider for fresh models.
    pub fn with_prior(settings: Arc<Settings>, prior: Box<dyn PretrainedPrior + Send>) -> Self {
        let store = CheckpointStore::new(settings.checkpoints_dir());
        let registry = ClassIndexRegistry::new(settings.class_index_path(), settings.default_labels.clone());
        let class_index = registry.load();
        let status = StatusBoard::new(TrainingStatus::idle(settings.architecture.id()));
        Self {
            settings,
            store,
            registry,
            prior,
            model: None,
            class_index,
            status,
        }
    }

    pub fn settings(&self) -> &Arc<Settings> {
        &self.settings
    }

    pub fn architecture(&self) -> Architecture {
        self.settings.architecture
    }

    pub fn class_index(&self) -> &ClassIndex {
        &self.class_index
    }

    pub fn is_loaded(&self) -> bool {
        self.model.is_some()
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    /// Install the newest compatible checkpoint, or a fresh model from the prior.
    ///
    /// Never fails: unreadable or mismatched checkpoints are logged and skipped.
    pub fn load_or_init(&mut self, prefer_best: bool) -> LoadOutcome {
        let slots: &[Slot] = if prefer_best { &[Slot::Best, Slot::Last] } else { &[Slot::Last] };
        for &slot in slots {
            match self.restore(slot) {
                Ok(Some((model, class_index, epoch))) => {
                    tracing::info!(slot = %slot, epoch, arch = %self.architecture(), "restored checkpoint");
                    self.model = Some(model);
                    self.class_index = class_index;
                    return LoadOutcome::Restored { slot, epoch };
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(slot = %slot, error = %e, "checkpoint rejected"),
            }
        }

        let class_index = self.registry.load();
        match network::build(self.architecture(), class_index.len(), self.prior.as_ref()) {
            Ok(model) => {
                tracing::info!(arch = %self.architecture(), classes = class_index.len(), "initialised fresh model");
                self.model = Some(model);
                self.class_index = class_index;
                LoadOutcome::Fresh
            }
            Err(e) => {
                tracing::error!(error = %e, "could not build model");
                self.model = None;
                LoadOutcome::Unavailable
            }
        }
    }

    fn restore(&self, slot: Slot) -> Result<Option<(Box<dyn EmotionNet>, ClassIndex, usize)>, ManagerError> {
        let Some(checkpoint) = self.store.load(slot)? else {
            return Ok(None);
        };
        let meta = checkpoint.meta;
        let expected = self.architecture().id();
        if meta.architecture != expected {
            return Err(ManagerError::ArchitectureMismatch {
                expected: expected.to_string(),
                found: meta.architecture,
            });
        }
        let mut model = network::build(self.architecture(), meta.class_index.len(), self.prior.as_ref())?;
        model.load_bytes(checkpoint.weights)?;
        Ok(Some((model, meta.class_index, meta.epoch)))
    }

    /// Switch architectures. The only path by which the live model's structure changes.
    pub fn set_architecture(&mut self, architecture: Architecture) -> Option<LoadOutcome> {
        if architecture == self.architecture() {
            return None;
        }
        tracing::info!(from = %self.architecture(), to = %architecture, "switching architecture");
        self.settings = Arc::new(self.settings.with_architecture(architecture));
        self.sync_status_architecture();
        Some(self.load_or_init(true))
    }

    /// Replace the settings snapshot. Paths and architecture changes reload the model.
    pub fn set_settings(&mut self, settings: Arc<Settings>) {
        let reload = settings.architecture != self.settings.architecture
            || settings.models_dir != self.settings.models_dir
            || settings.default_labels != self.settings.default_labels;
        if settings.models_dir != self.settings.models_dir || settings.default_labels != self.settings.default_labels {
            self.store = CheckpointStore::new(settings.checkpoints_dir());
            self.registry = ClassIndexRegistry::new(settings.class_index_path(), settings.default_labels.clone());
            if self.model.is_none() {
                self.class_index = self.registry.load();
            }
        }
        self.settings = settings;
        self.sync_status_architecture();
        if reload && self.model.is_some() {
            self.load_or_init(true);
        }
    }

    fn sync_status_architecture(&self) {
        let id = self.architecture().id();
        self.status.update(|s| {
            if !s.running {
                s.architecture = id.to_string();
            }
        });
    }

    fn ensure_loaded(&mut self) {
        if self.model.is_none() {
            self.load_or_init(true);
        }
    }

    /// Localize, gate, crop and score `image`.
    pub fn predict(
        &mut self,
        localizer: &mut dyn FaceLocalizer,
        image: &RgbImage,
        policy: &DecisionPolicy,
    ) -> PredictionResult {
        self.ensure_loaded();
        let Some(model) = self.model.as_mut() else {
            return PredictionResult::error();
        };
        InferencePipeline {
            localizer,
            scorer: model.as_scorer(),
            preprocess: Preprocess::from_settings(&self.settings),
            class_index: &self.class_index,
            policy,
            min_face: self.settings.min_face_px,
        }
        .classify(image)
    }

    /// Score an image that is already a face crop.
    pub fn predict_crop(&mut self, face: &RgbImage, policy: &DecisionPolicy) -> PredictionResult {
        self.ensure_loaded();
        let Some(model) = self.model.as_mut() else {
            return PredictionResult::error();
        };
        let mut whole = FullFrameLocalizer;
        let mut pipeline = InferencePipeline {
            localizer: &mut whole,
            scorer: model.as_scorer(),
            preprocess: Preprocess::from_settings(&self.settings),
            class_index: &self.class_index,
            policy,
            min_face: 0.0,
        };
        pipeline.score(face).unwrap_or_else(|e| {
            tracing::error!(error = %e, "inference failed");
            PredictionResult::error()
        })
    }

    /// Train on the current settings snapshot, then reload the best checkpoint.
    ///
    /// On failure the live model is left as it was.
    pub fn train(&mut self) -> Result<TrainingSummary, ManagerError> {
        let snapshot = Arc::clone(&self.settings);
        let summary = TrainingLoop::new(
            snapshot,
            &self.store,
            &self.registry,
            self.prior.as_ref(),
            self.status.clone(),
        )
        .run()?;

        match self.load_or_init(true) {
            LoadOutcome::Restored { slot, epoch } => {
                tracing::info!(slot = %slot, epoch, "live model replaced by trained weights");
            }
            outcome => tracing::warn!(?outcome, "trained checkpoint could not be reloaded"),
        }
        Ok(summary)
    }

    /// Copy of the current status record.
    pub fn status(&self) -> TrainingStatus {
        self.status.snapshot()
    }

    /// Handle for reading status from other threads.
    pub fn status_board(&self) -> StatusBoard {
        self.status.clone()
    }
}
