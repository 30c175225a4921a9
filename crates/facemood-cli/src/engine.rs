use facemood_core::manager::ManagerError;
use facemood_core::{
    Architecture, DecisionPolicy, FaceLocalizer, LoadOutcome, ModelManager, PredictionResult, Settings,
    StatusBoard, TrainingStatus, TrainingSummary,
};
use image::RgbImage;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Manager(#[from] ManagerError),
    #[error("failed to start engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Messages sent to the engine thread.
enum EngineRequest {
    Predict {
        image: RgbImage,
        policy: DecisionPolicy,
        reply: oneshot::Sender<PredictionResult>,
    },
    Train {
        settings: Arc<Settings>,
        reply: oneshot::Sender<Result<TrainingSummary, ManagerError>>,
    },
    SetArchitecture {
        architecture: Architecture,
        reply: oneshot::Sender<Option<LoadOutcome>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    status: StatusBoard,
}

impl EngineHandle {
    pub async fn predict(&self, image: RgbImage, policy: DecisionPolicy) -> Result<PredictionResult, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineRequest::Predict { image, policy, reply }).await?;
        rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    /// Train with `settings`; requests queued behind it wait for the run to finish.
    pub async fn train(&self, settings: Arc<Settings>) -> Result<TrainingSummary, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineRequest::Train { settings, reply }).await?;
        Ok(rx.await.map_err(|_| EngineError::ChannelClosed)??)
    }

    pub async fn set_architecture(&self, architecture: Architecture) -> Result<Option<LoadOutcome>, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineRequest::SetArchitecture { architecture, reply }).await?;
        rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    /// Readable at any time, including mid-training.
    pub fn status(&self) -> TrainingStatus {
        self.status.snapshot()
    }

    async fn send(&self, request: EngineRequest) -> Result<(), EngineError> {
        self.tx.send(request).await.map_err(|_| EngineError::ChannelClosed)
    }
}

/// Spawn the engine on a dedicated OS thread that owns the model and localizer.
pub fn spawn_engine(
    settings: Arc<Settings>,
    mut localizer: Box<dyn FaceLocalizer + Send>,
) -> Result<EngineHandle, EngineError> {
    let mut manager = ModelManager::new(settings);
    let status = manager.status_board();
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("facemood-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Predict { image, policy, reply } => {
                        let result = manager.predict(localizer.as_mut(), &image, &policy);
                        let _ = reply.send(result);
                    }
                    EngineRequest::Train { settings, reply } => {
                        manager.set_settings(settings);
                        let _ = reply.send(manager.train());
                    }
                    EngineRequest::SetArchitecture { architecture, reply } => {
                        let _ = reply.send(manager.set_architecture(architecture));
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx, status })
}
