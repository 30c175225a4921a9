use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use facemood_core::onnx_scorer::OnnxScorer;
use facemood_core::pipeline::InferencePipeline;
use facemood_core::preprocess::Preprocess;
use facemood_core::{
    dataset, Architecture, ClassIndexRegistry, DecisionPolicy, FaceLocalizer, FullFrameLocalizer, ModelManager,
    PredictionResult, ScrfdLocalizer, Settings,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod engine;

#[derive(Parser)]
#[command(name = "facemood", about = "Face emotion classifier: train, predict and manage datasets")]
struct Cli {
    /// TOML settings file; FACEMOOD_* variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Classify the most prominent face in an image
    Predict {
        image: PathBuf,
        /// Binary laugh/other decision instead of the most probable emotion
        #[arg(long)]
        laugh: bool,
        /// Treat the whole image as the face
        #[arg(long)]
        no_detect: bool,
        /// Score with an exported ONNX emotion model instead of the trained checkpoint
        #[arg(long)]
        onnx: Option<PathBuf>,
    },
    /// Train on the labeled folders and keep the best checkpoint
    Train {
        #[arg(long)]
        epochs: Option<usize>,
        #[arg(long)]
        lr: Option<f32>,
        /// cbam_resnet or mobile_vit
        #[arg(long)]
        arch: Option<Architecture>,
    },
    /// Show the training status record and checkpoint slots
    Status,
    /// Count images per label folder
    Labels,
    /// Create a label folder
    AddLabel { name: String },
    /// Copy images into a label folder
    Import {
        label: String,
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref()).context("loading settings")?;

    match cli.command {
        Commands::Predict { image, laugh, no_detect, onnx } => {
            let policy = if laugh {
                DecisionPolicy::threshold_from(&settings)
            } else {
                DecisionPolicy::ArgMax
            };
            let onnx = onnx.or_else(|| settings.onnx_emotion_model.clone());
            let result = predict(Arc::new(settings), &image, policy, no_detect, onnx.as_deref()).await;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Train { epochs, lr, arch } => {
            let mut snapshot = settings.clone();
            if let Some(epochs) = epochs {
                snapshot = snapshot.with_epochs(epochs);
            }
            if let Some(lr) = lr {
                snapshot = snapshot.with_learning_rate(lr);
            }
            if let Some(arch) = arch {
                snapshot = snapshot.with_architecture(arch);
            }
            snapshot.validate()?;
            train(Arc::new(settings), Arc::new(snapshot)).await?;
        }
        Commands::Status => {
            let manager = ModelManager::new(Arc::new(settings));
            let store = manager.store();
            let report = serde_json::json!({
                "status": manager.status(),
                "checkpoints": {
                    "last": store.exists(facemood_core::checkpoint::Slot::Last),
                    "best": store.exists(facemood_core::checkpoint::Slot::Best),
                },
                "classes": manager.class_index().labels(),
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Labels => {
            let counts = dataset::label_counts(&settings.data_dir)?;
            if counts.len() < 2 {
                tracing::warn!(labels = counts.len(), "training needs at least two labels to be useful");
            }
            println!("{}", serde_json::to_string_pretty(&counts)?);
        }
        Commands::AddLabel { name } => {
            let dir = dataset::add_label(&settings.data_dir, &name)?;
            println!("{}", dir.display());
        }
        Commands::Import { label, files } => {
            for file in &files {
                let dest = dataset::import_image(&settings.data_dir, &label, file)
                    .with_context(|| format!("importing {}", file.display()))?;
                println!("{}", dest.display());
            }
        }
    }

    Ok(())
}

/// Classify one image file. Every failure, including missing model files, ends in the error sentinel.
async fn predict(
    settings: Arc<Settings>,
    path: &Path,
    policy: DecisionPolicy,
    no_detect: bool,
    onnx: Option<&Path>,
) -> PredictionResult {
    let image = match image::open(path) {
        Ok(img) => img.to_rgb8(),
        Err(e) => {
            tracing::error!(path = %path.display(), error = %e, "could not decode image");
            return PredictionResult::error();
        }
    };

    let mut localizer: Box<dyn FaceLocalizer + Send> = if no_detect {
        Box::new(FullFrameLocalizer)
    } else {
        match ScrfdLocalizer::load(&settings.detector_model) {
            Ok(detector) => Box::new(detector),
            Err(e) => {
                tracing::error!(path = %settings.detector_model.display(), error = %e, "could not load face detector");
                return PredictionResult::error();
            }
        }
    };

    if let Some(model) = onnx {
        let mut scorer = match OnnxScorer::load(model) {
            Ok(scorer) => scorer,
            Err(e) => {
                tracing::error!(path = %model.display(), error = %e, "could not load ONNX emotion model");
                return PredictionResult::error();
            }
        };
        let class_index =
            ClassIndexRegistry::new(settings.class_index_path(), settings.default_labels.clone()).load();
        return InferencePipeline {
            localizer: localizer.as_mut(),
            scorer: &mut scorer,
            preprocess: Preprocess::from_settings(&settings),
            class_index: &class_index,
            policy: &policy,
            min_face: settings.min_face_px,
        }
        .classify(&image);
    }

    let outcome = match engine::spawn_engine(settings, localizer) {
        Ok(engine) => engine.predict(image, policy).await,
        Err(e) => Err(e),
    };
    outcome.unwrap_or_else(|e| {
        tracing::error!(error = %e, "prediction engine failed");
        PredictionResult::error()
    })
}

async fn train(settings: Arc<Settings>, snapshot: Arc<Settings>) -> Result<()> {
    let engine = engine::spawn_engine(settings.clone(), Box::new(FullFrameLocalizer))?;
    if snapshot.architecture != settings.architecture {
        engine.set_architecture(snapshot.architecture).await?;
    }
    let run = engine.train(snapshot);
    tokio::pin!(run);

    let mut ticker = tokio::time::interval(Duration::from_millis(500));
    let mut reported = 0;
    let outcome = loop {
        tokio::select! {
            outcome = &mut run => break outcome,
            _ = ticker.tick() => {
                let status = engine.status();
                if status.epoch > reported {
                    reported = status.epoch;
                    println!(
                        "epoch {}/{}  train_loss={:.4}  val_loss={:.4}",
                        status.epoch, status.total_epochs, status.train_loss, status.val_loss
                    );
                }
            }
        }
    };

    println!("{}", serde_json::to_string_pretty(&engine.status())?);
    let summary = outcome?;
    tracing::info!(
        best_epoch = summary.best_epoch,
        best_val_loss = summary.best_val_loss,
        classes = summary.class_index.len(),
        "training complete"
    );
    Ok(())
}
