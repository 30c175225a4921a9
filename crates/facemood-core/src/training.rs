//! Epoch loop: prepare the dataset, train, validate, checkpoint.
//!
//! Heads train on [`TrainBackend`] with AdamW and cross-entropy; validation and
//! checkpointing use the inner inference module.

use crate::checkpoint::{Checkpoint, CheckpointError, CheckpointMeta, CheckpointStore, Slot};
use crate::class_index::{ClassIndex, ClassIndexError, ClassIndexRegistry};
use crate::config::{Architecture, Settings};
use crate::dataset::{self, DatasetError};
use crate::network::{self, CbamHead, EmotionHead, InferBackend, MlpHead, NetError, PretrainedPrior, TrainBackend};
use crate::preprocess::{augment, Preprocess};
use crate::types::{Sample, TrainPhase, TrainingStatus};
use burn::backend::ndarray::NdArrayDevice;
use burn::module::AutodiffModule;
use burn::optim::{AdamWConfig, GradientsParams, Optimizer};
use burn::tensor::ElementConversion;
use chrono::Utc;
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrainError {
    #[error("a training run is already in progress")]
    AlreadyRunning,
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error("class index: {0}")]
    ClassIndex(#[from] ClassIndexError),
    #[error("checkpoint: {0}")]
    Checkpoint(#[from] CheckpointError),
    #[error("network: {0}")]
    Net(#[from] NetError),
    #[error("training diverged at epoch {epoch}: {what} is not finite")]
    Diverged { epoch: usize, what: &'static str },
}

/// Shared, thread-safe view of the current [`TrainingStatus`].
#[derive(Debug, Clone)]
pub struct StatusBoard(Arc<RwLock<TrainingStatus>>);

impl StatusBoard {
    pub fn new(initial: TrainingStatus) -> Self {
        Self(Arc::new(RwLock::new(initial)))
    }

    pub fn snapshot(&self) -> TrainingStatus {
        self.0.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn update(&self, f: impl FnOnce(&mut TrainingStatus)) {
        let mut guard = self.0.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard);
    }

    /// Mark a run as started; fails if one is already marked running.
    fn begin(&self, architecture: &str, total_epochs: usize) -> Result<(), TrainError> {
        let mut guard = self.0.write().unwrap_or_else(PoisonError::into_inner);
        if guard.running {
            return Err(TrainError::AlreadyRunning);
        }
        *guard = TrainingStatus {
            running: true,
            phase: TrainPhase::Preparing,
            total_epochs,
            message: "preparing".to_string(),
            ..TrainingStatus::idle(architecture)
        };
        Ok(())
    }
}

/// What a successful run produced.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingSummary {
    pub class_index: ClassIndex,
    pub train_samples: usize,
    pub val_samples: usize,
    pub epochs: usize,
    pub best_epoch: usize,
    pub best_val_loss: f32,
    pub final_train_loss: f32,
    pub final_val_loss: f32,
}

/// One finished epoch, as seen by an epoch observer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochReport {
    pub epoch: usize,
    pub train_loss: f32,
    pub val_loss: f32,
    pub best_val_loss: f32,
    /// `last` was copied over `best` this epoch.
    pub promoted: bool,
}

/// One training run over a fixed settings snapshot.
pub struct TrainingLoop<'a> {
    settings: Arc<Settings>,
    store: &'a CheckpointStore,
    registry: &'a ClassIndexRegistry,
    prior: &'a dyn PretrainedPrior,
    status: StatusBoard,
    on_epoch: Option<Box<dyn Fn(&EpochReport) + 'a>>,
}

impl<'a> TrainingLoop<'a> {
    pub fn new(
        settings: Arc<Settings>,
        store: &'a CheckpointStore,
        registry: &'a ClassIndexRegistry,
        prior: &'a dyn PretrainedPrior,
        status: StatusBoard,
    ) -> Self {
        Self { settings, store, registry, prior, status, on_epoch: None }
    }

    /// Call `observer` after each epoch's checkpoint and status update.
    pub fn on_epoch(mut self, observer: impl Fn(&EpochReport) + 'a) -> Self {
        self.on_epoch = Some(Box::new(observer));
        self
    }

    /// Run to completion. The status board ends in `Done` or `Error` either way.
    ///
    /// The class index file is only replaced once every epoch has succeeded.
    pub fn run(&self) -> Result<TrainingSummary, TrainError> {
        let arch = self.settings.architecture;
        self.status.begin(arch.id(), self.settings.epochs)?;
        tracing::info!(arch = %arch, epochs = self.settings.epochs, "training started");

        let outcome = self
            .prepare()
            .and_then(|prepared| self.train(prepared))
            .and_then(|summary| {
                self.registry.save(&summary.class_index)?;
                Ok(summary)
            });

        match outcome {
            Ok(summary) => {
                self.status.update(|s| {
                    s.running = false;
                    s.phase = TrainPhase::Done;
                    s.message = "done".to_string();
                    s.finished_at = Some(Utc::now());
                });
                tracing::info!(
                    best_epoch = summary.best_epoch,
                    best_val_loss = summary.best_val_loss,
                    "training finished"
                );
                Ok(summary)
            }
            Err(e) => {
                tracing::error!(error = %e, "training failed");
                self.status.update(|s| {
                    s.running = false;
                    s.phase = TrainPhase::Error;
                    s.message = e.to_string();
                });
                Err(e)
            }
        }
    }

    fn prepare(&self) -> Result<Prepared, TrainError> {
        let data_dir = &self.settings.data_dir;
        let labels = dataset::scan_labels(data_dir)?;
        let class_index = if labels.is_empty() {
            tracing::warn!(root = %data_dir.display(), "no label folders; using default labels");
            self.registry.default_index()
        } else {
            ClassIndex::from_labels(labels)?
        };

        let samples = dataset::enumerate(data_dir, &class_index)?;
        let (train, val) = dataset::split(&samples, self.settings.validation_fraction, self.settings.seed);
        tracing::info!(
            classes = class_index.len(),
            train = train.len(),
            validation = val.len(),
            "dataset prepared"
        );
        Ok(Prepared { class_index, train, val })
    }

    fn train(&self, prepared: Prepared) -> Result<TrainingSummary, TrainError> {
        let device = NdArrayDevice::default();
        let num_classes = prepared.class_index.len();
        match self.settings.architecture {
            Architecture::CbamResnet => {
                let head = CbamHead::<TrainBackend>::new(num_classes, self.prior, &device)?;
                self.fit(head, prepared, &device)
            }
            Architecture::MobileVit => {
                let head = MlpHead::<TrainBackend>::new(num_classes, self.prior, &device)?;
                self.fit(head, prepared, &device)
            }
        }
    }

    fn fit<M>(&self, mut model: M, prepared: Prepared, device: &NdArrayDevice) -> Result<TrainingSummary, TrainError>
    where
        M: AutodiffModule<TrainBackend> + EmotionHead<TrainBackend>,
        M::InnerModule: EmotionHead<InferBackend>,
    {
        let settings = &self.settings;
        let Prepared { class_index, train, val } = prepared;
        let num_classes = class_index.len();
        let preprocess = Preprocess::from_settings(settings);
        let batch_size = settings.batch_size.max(1);
        let mut optimizer = AdamWConfig::new()
            .with_beta_1(0.9)
            .with_beta_2(0.999)
            .with_epsilon(1e-8)
            .with_weight_decay(settings.weight_decay)
            .init::<TrainBackend, M>();

        self.status.update(|s| {
            s.phase = TrainPhase::Training;
            s.message = "training".to_string();
        });

        let mut best_val_loss = f32::INFINITY;
        let mut best_epoch = 0;
        let mut train_loss = 0.0;
        let mut val_loss = 0.0;
        let mut order = train.clone();

        for epoch in 1..=settings.epochs {
            let mut rng = StdRng::seed_from_u64(settings.seed.wrapping_add(epoch as u64));
            order.shuffle(&mut rng);

            let mut loss_sum = 0.0f64;
            for batch in order.chunks(batch_size) {
                let features = stem_batch(batch, &preprocess, Some(&mut rng))?;
                let labels: Vec<usize> = batch.iter().map(|s| s.label).collect();
                let loss = model.forward_loss(
                    network::features_tensor(&features, device),
                    network::targets_tensor(&labels, num_classes, device)?,
                );
                let batch_loss = loss.clone().into_scalar().elem::<f32>();
                let grads = GradientsParams::from_grads(loss.backward(), &model);
                model = optimizer.step(settings.learning_rate as f64, model, grads);
                // The loss is a batch mean; weight it by the batch's sample count.
                loss_sum += batch_loss as f64 * batch.len() as f64;
            }
            train_loss = (loss_sum / order.len().max(1) as f64) as f32;

            let trained = model.valid();
            val_loss = evaluate(&trained, &val, &preprocess, batch_size, num_classes, device)?;
            ensure_finite(epoch, train_loss, val_loss, &trained)?;

            self.store.save(
                &Checkpoint {
                    meta: CheckpointMeta {
                        architecture: settings.architecture.id().to_string(),
                        class_index: class_index.clone(),
                        epoch,
                        train_loss,
                        val_loss,
                    },
                    weights: network::record_bytes::<InferBackend, _>(trained)?,
                },
                Slot::Last,
            )?;
            let promoted = val_loss < best_val_loss;
            if promoted {
                self.store.promote_to_best()?;
                best_val_loss = val_loss;
                best_epoch = epoch;
            }

            self.status.update(|s| {
                s.epoch = epoch;
                s.train_loss = train_loss;
                s.val_loss = val_loss;
                s.best_val_loss = Some(best_val_loss);
            });
            tracing::info!(epoch, total = settings.epochs, train_loss, val_loss, best_val_loss, "epoch complete");
            if let Some(observer) = &self.on_epoch {
                observer(&EpochReport { epoch, train_loss, val_loss, best_val_loss, promoted });
            }
        }

        Ok(TrainingSummary {
            class_index,
            train_samples: train.len(),
            val_samples: val.len(),
            epochs: settings.epochs,
            best_epoch,
            best_val_loss,
            final_train_loss: train_loss,
            final_val_loss: val_loss,
        })
    }
}

struct Prepared {
    class_index: ClassIndex,
    train: Vec<Sample>,
    val: Vec<Sample>,
}

/// Decode, optionally augment, normalise and run the stem over `batch`.
fn stem_batch(
    batch: &[Sample],
    preprocess: &Preprocess,
    mut rng: Option<&mut StdRng>,
) -> Result<Vec<Array2<f32>>, NetError> {
    batch
        .iter()
        .map(|sample| {
            let mut image = dataset::load_sample(&sample.path, preprocess.size());
            if let Some(rng) = rng.as_deref_mut() {
                image = augment(image, rng);
            }
            network::stem(preprocess.tensor(&image).view())
        })
        .collect()
}

/// Sample-weighted mean cross-entropy without updating weights; 0.0 when empty.
fn evaluate<M: EmotionHead<InferBackend>>(
    model: &M,
    samples: &[Sample],
    preprocess: &Preprocess,
    batch_size: usize,
    num_classes: usize,
    device: &NdArrayDevice,
) -> Result<f32, NetError> {
    let mut sum = 0.0f64;
    for batch in samples.chunks(batch_size.max(1)) {
        let features = stem_batch(batch, preprocess, None)?;
        let labels: Vec<usize> = batch.iter().map(|s| s.label).collect();
        let loss = model.forward_loss(
            network::features_tensor(&features, device),
            network::targets_tensor(&labels, num_classes, device)?,
        );
        sum += loss.into_scalar().elem::<f32>() as f64 * batch.len() as f64;
    }
    Ok((sum / samples.len().max(1) as f64) as f32)
}

fn ensure_finite<M: EmotionHead<InferBackend>>(
    epoch: usize,
    train_loss: f32,
    val_loss: f32,
    model: &M,
) -> Result<(), TrainError> {
    let what = if !train_loss.is_finite() {
        "training loss"
    } else if !val_loss.is_finite() {
        "validation loss"
    } else if !model.parameters_finite() {
        "weights"
    } else {
        return Ok(());
    };
    Err(TrainError::Diverged { epoch, what })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::SeededPrior;
    use image::{Rgb, RgbImage};
    use std::cell::RefCell;
    use std::path::Path;

    fn write_dataset(root: &Path, labels: &[(&str, [u8; 3])], per_label: usize) {
        for (label, colour) in labels {
            let dir = root.join(label);
            std::fs::create_dir_all(&dir).unwrap();
            for i in 0..per_label {
                let mut img = RgbImage::from_pixel(16, 16, Rgb(*colour));
                img.put_pixel(i as u32 % 16, 3, Rgb([255, 255, 255]));
                img.save(dir.join(format!("{i:02}.png"))).unwrap();
            }
        }
    }

    fn settings(root: &Path, epochs: usize) -> Settings {
        Settings {
            data_dir: root.join("data"),
            models_dir: root.join("models"),
            image_size: 16,
            batch_size: 4,
            epochs,
            learning_rate: 1e-2,
            ..Settings::default()
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        settings: Arc<Settings>,
        store: CheckpointStore,
        registry: ClassIndexRegistry,
        status: StatusBoard,
    }

    fn fixture_with(labels: &[(&str, [u8; 3])], tweak: impl FnOnce(&mut Settings)) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings(dir.path(), 2);
        tweak(&mut settings);
        write_dataset(&settings.data_dir, labels, 6);
        Fixture {
            store: CheckpointStore::new(settings.checkpoints_dir()),
            registry: ClassIndexRegistry::new(settings.class_index_path(), settings.default_labels.clone()),
            status: StatusBoard::new(TrainingStatus::idle(settings.architecture.id())),
            settings: Arc::new(settings),
            _dir: dir,
        }
    }

    fn fixture(epochs: usize, labels: &[(&str, [u8; 3])]) -> Fixture {
        fixture_with(labels, |s| s.epochs = epochs)
    }

    fn run(f: &Fixture) -> Result<TrainingSummary, TrainError> {
        let prior = SeededPrior::default();
        let outcome = TrainingLoop::new(f.settings.clone(), &f.store, &f.registry, &prior, f.status.clone()).run();
        outcome
    }

    /// Run while collecting every epoch report and the status epoch seen alongside it.
    fn run_observed(f: &Fixture) -> (Result<TrainingSummary, TrainError>, Vec<(EpochReport, usize)>) {
        let prior = SeededPrior::default();
        let seen = RefCell::new(Vec::new());
        let board = f.status.clone();
        let outcome = TrainingLoop::new(f.settings.clone(), &f.store, &f.registry, &prior, f.status.clone())
            .on_epoch(|report| seen.borrow_mut().push((*report, board.snapshot().epoch)))
            .run();
        (outcome, seen.into_inner())
    }

    #[test]
    fn test_run_writes_checkpoints_and_class_index() {
        let f = fixture(2, &[("laugh", [200, 40, 40]), ("other", [40, 40, 200])]);
        let summary = run(&f).unwrap();

        assert_eq!(summary.class_index.labels(), &["laugh".to_string(), "other".to_string()][..]);
        assert_eq!(summary.train_samples + summary.val_samples, 12);
        assert_eq!(f.registry.load(), summary.class_index);

        let last = f.store.load(Slot::Last).unwrap().unwrap();
        assert_eq!(last.meta.epoch, 2);
        assert_eq!(last.meta.class_index, summary.class_index);
        let best = f.store.load(Slot::Best).unwrap().unwrap();
        assert_eq!(best.meta.epoch, summary.best_epoch);
        assert_eq!(best.meta.val_loss, summary.best_val_loss);

        let status = f.status.snapshot();
        assert!(!status.running);
        assert_eq!(status.phase, TrainPhase::Done);
        assert_eq!(status.message, "done");
        assert_eq!(status.epoch, 2);
        assert!(status.finished_at.is_some());
    }

    #[test]
    fn test_epochs_advance_by_one_and_best_never_increases() {
        let f = fixture(4, &[("a", [250, 250, 250]), ("b", [5, 5, 5])]);
        let (outcome, seen) = run_observed(&f);
        outcome.unwrap();

        let epochs: Vec<usize> = seen.iter().map(|(r, _)| r.epoch).collect();
        assert_eq!(epochs, vec![1, 2, 3, 4]);

        let mut prev_best = f32::INFINITY;
        for (report, status_epoch) in &seen {
            assert_eq!(*status_epoch, report.epoch);
            assert!(report.best_val_loss <= prev_best);
            assert_eq!(report.promoted, report.val_loss < prev_best);
            prev_best = report.best_val_loss;
        }
        assert!(seen[0].0.promoted);
        assert_eq!(f.store.load(Slot::Last).unwrap().unwrap().meta.epoch, 4);
    }

    #[test]
    fn test_equal_validation_loss_keeps_first_best() {
        let f = fixture_with(&[("a", [250, 250, 250]), ("b", [5, 5, 5])], |s| {
            s.epochs = 3;
            s.validation_fraction = 0.0;
        });
        let (outcome, seen) = run_observed(&f);
        let summary = outcome.unwrap();

        assert_eq!(summary.val_samples, 0);
        assert!(seen.iter().all(|(r, _)| r.val_loss == 0.0));
        let promoted: Vec<bool> = seen.iter().map(|(r, _)| r.promoted).collect();
        assert_eq!(promoted, vec![true, false, false]);

        assert_eq!(summary.best_epoch, 1);
        assert_eq!(f.store.load(Slot::Best).unwrap().unwrap().meta.epoch, 1);
        assert_eq!(f.store.load(Slot::Last).unwrap().unwrap().meta.epoch, 3);
    }

    #[test]
    fn test_divergence_is_an_error_and_writes_nothing() {
        let f = fixture_with(&[("a", [250, 250, 250]), ("b", [5, 5, 5])], |s| {
            s.learning_rate = 1e38;
            s.batch_size = 2;
        });
        let err = run(&f).unwrap_err();
        assert!(matches!(err, TrainError::Diverged { epoch: 1, .. }), "{err}");

        assert!(!f.store.exists(Slot::Last));
        assert!(!f.store.exists(Slot::Best));
        assert!(!f.settings.class_index_path().exists());
        let status = f.status.snapshot();
        assert_eq!(status.phase, TrainPhase::Error);
        assert!(!status.running);
        assert!(status.message.contains("not finite"));
    }

    #[test]
    fn test_empty_dataset_fails_without_checkpoint() {
        let f = fixture(2, &[]);
        let err = run(&f).unwrap_err();
        assert!(matches!(err, TrainError::Dataset(DatasetError::EmptyDataset(_))));
        assert!(!f.store.exists(Slot::Last));
        assert!(!f.store.exists(Slot::Best));

        let status = f.status.snapshot();
        assert_eq!(status.phase, TrainPhase::Error);
        assert!(!status.running);
        assert!(status.message.contains("no images"));
    }

    #[test]
    fn test_empty_label_folder_keeps_class_index_file() {
        let f = fixture(1, &[]);
        std::fs::create_dir_all(f.settings.data_dir.join("laugh")).unwrap();
        let previous = ClassIndex::from_labels(["happy", "sad"]).unwrap();
        f.registry.save(&previous).unwrap();

        assert!(run(&f).is_err());
        assert_eq!(f.registry.load(), previous);
    }

    #[test]
    fn test_refuses_concurrent_run() {
        let f = fixture(1, &[("a", [1, 2, 3])]);
        f.status.update(|s| s.running = true);
        assert!(matches!(run(&f), Err(TrainError::AlreadyRunning)));
        assert!(!f.store.exists(Slot::Last));
    }

    #[test]
    fn test_evaluate_empty_is_zero() {
        let device = NdArrayDevice::default();
        let head = MlpHead::<InferBackend>::new(2, &SeededPrior::default(), &device).unwrap();
        assert_eq!(evaluate(&head, &[], &Preprocess::new(16), 4, 2, &device).unwrap(), 0.0);
    }
}
