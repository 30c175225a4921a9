//! Inference-only scorer over an exported ONNX emotion network.

use crate::network::{NetError, Scorer};
use ndarray::{Array1, ArrayView3, Axis};
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

/// Runs a `1×3×S×S → 1×K` ONNX model. Scores are passed through as raw logits.
pub struct OnnxScorer {
    session: Session,
}

impl OnnxScorer {
    pub fn load(model_path: &Path) -> Result<Self, NetError> {
        if !model_path.is_file() {
            return Err(NetError::ModelNotFound(model_path.to_path_buf()));
        }
        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            inputs = ?session.inputs().iter().map(|i| i.name()).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded emotion model"
        );
        Ok(Self { session })
    }
}

impl Scorer for OnnxScorer {
    fn scores(&mut self, input: ArrayView3<f32>) -> Result<Array1<f32>, NetError> {
        let batch = input.insert_axis(Axis(0));
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(batch)?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| NetError::InferenceFailed(format!("emotion scores: {e}")))?;
        if raw.is_empty() {
            return Err(NetError::InferenceFailed("model returned no scores".to_string()));
        }
        Ok(Array1::from(raw.to_vec()))
    }
}
