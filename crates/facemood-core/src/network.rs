//! Emotion scoring networks.
//!
//! Both architectures share a frozen feature stem: per-cell colour means plus
//! luma gradient energy on an 8×8 grid. Only the heads are trained; they are
//! `burn` modules, trained on [`TrainBackend`] and served on [`InferBackend`].
//!
//! - `cbam_resnet`: channel attention (avg + max pooled, shared linear gate) and
//!   spatial attention (per-cell mean/max over channels) refine the stem output
//!   before a linear classifier.
//! - `mobile_vit`: a two-layer perceptron over the flattened stem output.

use crate::config::Architecture;
use burn::backend::ndarray::NdArrayDevice;
use burn::backend::{Autodiff, NdArray};
use burn::module::{Module, Param};
use burn::nn::loss::CrossEntropyLossConfig;
use burn::nn::{Linear, LinearConfig};
use burn::record::{FullPrecisionSettings, NamedMpkBytesRecorder, Recorder};
use burn::tensor::activation::{relu, sigmoid};
use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor, TensorData};
use ndarray::{s, Array1, Array2, ArrayView1, ArrayView3, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;

pub const GRID: usize = 8;
pub const STEM_CHANNELS: usize = 5;
pub const CELLS: usize = GRID * GRID;
pub const FEATURE_LEN: usize = STEM_CHANNELS * CELLS;
const MLP_HIDDEN: usize = 64;

/// CPU backend used for inference and validation.
pub type InferBackend = NdArray<f32>;
/// [`InferBackend`] with gradient tracking, used for training steps.
pub type TrainBackend = Autodiff<InferBackend>;

/// Full precision so a saved record reloads bit-for-bit.
type WeightRecorder = NamedMpkBytesRecorder<FullPrecisionSettings>;

#[derive(Error, Debug)]
pub enum NetError {
    #[error("network needs at least one class")]
    NoClasses,
    #[error("input must be 3×H×W with H, W >= 8; got {0:?}")]
    InputShape(Vec<usize>),
    #[error("target {target} out of range for {classes} classes")]
    TargetOutOfRange { target: usize, classes: usize },
    #[error("weight record: {0}")]
    Record(String),
    #[error("weights hold {found} parameters, expected {expected}")]
    WeightsMismatch { expected: usize, found: usize },
    #[error("weights contain non-finite values")]
    NonFinite,
    #[error("tensor data: {0}")]
    Data(String),
    #[error("model file not found: {0}")]
    ModelNotFound(std::path::PathBuf),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Maps a normalised `3 × S × S` tensor to one raw score per class.
pub trait Scorer {
    fn scores(&mut self, input: ArrayView3<f32>) -> Result<Array1<f32>, NetError>;
}

/// The live, checkpointable model held by the manager.
pub trait EmotionNet: Scorer + Send {
    fn architecture(&self) -> Architecture;

    fn num_classes(&self) -> usize;

    fn as_scorer(&mut self) -> &mut dyn Scorer;

    /// Weights as a full-precision named MessagePack record.
    fn to_bytes(&self) -> Result<Vec<u8>, NetError>;

    /// Replace all weights from a record of the same architecture and class count.
    /// On error the current weights are kept.
    fn load_bytes(&mut self, bytes: Vec<u8>) -> Result<(), NetError>;
}

/// A trainable head over stem features `[N, STEM_CHANNELS, CELLS]`.
pub trait EmotionHead<B: Backend>: Module<B> {
    /// Raw class scores `[N, K]`.
    fn forward(&self, features: Tensor<B, 3>) -> Tensor<B, 2>;

    /// Mean cross-entropy over the batch.
    fn forward_loss(&self, features: Tensor<B, 3>, targets: Tensor<B, 1, Int>) -> Tensor<B, 1> {
        let logits = self.forward(features);
        CrossEntropyLossConfig::new()
            .init(&logits.device())
            .forward(logits, targets)
    }

    fn parameters_finite(&self) -> bool;
}

/// Initial values of one linear layer. `weight` is row-major `[d_input, d_output]`.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearInit {
    pub weight: Vec<f32>,
    pub bias: Vec<f32>,
}

/// Provider of initial weights for a freshly constructed head.
pub trait PretrainedPrior {
    fn linear(&self, arch: Architecture, layer: &str, d_input: usize, d_output: usize) -> LinearInit;
}

/// Deterministic initialisation: attention gates start neutral, other layers
/// draw from `U(-1/√fan_in, 1/√fan_in)`.
#[derive(Debug, Clone, Copy)]
pub struct SeededPrior {
    seed: u64,
}

impl SeededPrior {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }
}

impl Default for SeededPrior {
    fn default() -> Self {
        Self::new(42)
    }
}

impl PretrainedPrior for SeededPrior {
    fn linear(&self, arch: Architecture, layer: &str, d_input: usize, d_output: usize) -> LinearInit {
        if layer.ends_with("_gate") {
            return LinearInit {
                weight: vec![0.0; d_input * d_output],
                bias: vec![0.0; d_output],
            };
        }
        let salt = format!("{}/{layer}", arch.id())
            .bytes()
            .fold(0u64, |h, b| h.wrapping_mul(31).wrapping_add(b as u64));
        let mut rng = StdRng::seed_from_u64(self.seed ^ salt);
        let bound = 1.0 / (d_input as f32).sqrt();
        LinearInit {
            weight: (0..d_input * d_output).map(|_| rng.gen_range(-bound..bound)).collect(),
            bias: (0..d_output).map(|_| rng.gen_range(-bound..bound)).collect(),
        }
    }
}

fn linear<B: Backend>(
    prior: &dyn PretrainedPrior,
    arch: Architecture,
    layer: &str,
    d_input: usize,
    d_output: usize,
    device: &B::Device,
) -> Result<Linear<B>, NetError> {
    let init = prior.linear(arch, layer, d_input, d_output);
    if init.weight.len() != d_input * d_output || init.bias.len() != d_output {
        return Err(NetError::WeightsMismatch {
            expected: d_input * d_output + d_output,
            found: init.weight.len() + init.bias.len(),
        });
    }
    let mut fc = LinearConfig::new(d_input, d_output).init(device);
    fc.weight = Param::from_tensor(Tensor::from_data(TensorData::new(init.weight, [d_input, d_output]), device));
    fc.bias = Some(Param::from_tensor(Tensor::from_data(TensorData::new(init.bias, [d_output]), device)));
    Ok(fc)
}

fn finite<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> bool {
    tensor
        .into_data()
        .to_vec::<f32>()
        .map(|values| values.iter().all(|v| v.is_finite()))
        .unwrap_or(false)
}

fn linear_finite<B: Backend>(fc: &Linear<B>) -> bool {
    finite(fc.weight.val()) && fc.bias.as_ref().map_or(true, |b| finite(b.val()))
}

#[derive(Module, Debug)]
pub struct CbamHead<B: Backend> {
    channel_gate: Linear<B>,
    spatial_gate: Linear<B>,
    fc: Linear<B>,
}

impl<B: Backend> CbamHead<B> {
    pub fn new(num_classes: usize, prior: &dyn PretrainedPrior, device: &B::Device) -> Result<Self, NetError> {
        if num_classes == 0 {
            return Err(NetError::NoClasses);
        }
        let arch = Architecture::CbamResnet;
        Ok(Self {
            channel_gate: linear(prior, arch, "channel_gate", STEM_CHANNELS, STEM_CHANNELS, device)?,
            spatial_gate: linear(prior, arch, "spatial_gate", 2, 1, device)?,
            fc: linear(prior, arch, "fc", FEATURE_LEN, num_classes, device)?,
        })
    }
}

impl<B: Backend> EmotionHead<B> for CbamHead<B> {
    fn forward(&self, features: Tensor<B, 3>) -> Tensor<B, 2> {
        let [n, channels, cells] = features.dims();

        // Channel attention over avg + max pooled descriptors.
        let pooled = (features.clone().mean_dim(2) + features.clone().max_dim(2)).reshape([n, channels]);
        let channel = sigmoid(self.channel_gate.forward(pooled)).reshape([n, channels, 1]);

        // Spatial attention from per-cell channel statistics.
        let stats = Tensor::cat(vec![features.clone().mean_dim(1), features.clone().max_dim(1)], 1);
        let spatial = sigmoid(self.spatial_gate.forward(stats.swap_dims(1, 2))).swap_dims(1, 2);

        let refined = features * channel * spatial;
        self.fc.forward(refined.reshape([n, channels * cells]))
    }

    fn parameters_finite(&self) -> bool {
        linear_finite(&self.channel_gate) && linear_finite(&self.spatial_gate) && linear_finite(&self.fc)
    }
}

#[derive(Module, Debug)]
pub struct MlpHead<B: Backend> {
    fc1: Linear<B>,
    fc2: Linear<B>,
}

impl<B: Backend> MlpHead<B> {
    pub fn new(num_classes: usize, prior: &dyn PretrainedPrior, device: &B::Device) -> Result<Self, NetError> {
        if num_classes == 0 {
            return Err(NetError::NoClasses);
        }
        let arch = Architecture::MobileVit;
        Ok(Self {
            fc1: linear(prior, arch, "fc1", FEATURE_LEN, MLP_HIDDEN, device)?,
            fc2: linear(prior, arch, "fc2", MLP_HIDDEN, num_classes, device)?,
        })
    }
}

impl<B: Backend> EmotionHead<B> for MlpHead<B> {
    fn forward(&self, features: Tensor<B, 3>) -> Tensor<B, 2> {
        let [n, channels, cells] = features.dims();
        let x = self.fc1.forward(features.reshape([n, channels * cells]));
        self.fc2.forward(relu(x))
    }

    fn parameters_finite(&self) -> bool {
        linear_finite(&self.fc1) && linear_finite(&self.fc2)
    }
}

/// Encode a module's weights with the checkpoint recorder.
pub fn record_bytes<B: Backend, M: Module<B>>(module: M) -> Result<Vec<u8>, NetError> {
    <WeightRecorder as Recorder<B>>::record(&WeightRecorder::default(), module.into_record(), ())
        .map_err(|e| NetError::Record(format!("{e:?}")))
}

/// Decode [`record_bytes`] output into `module`.
pub fn load_record_bytes<B: Backend, M: Module<B>>(
    module: M,
    bytes: Vec<u8>,
    device: &B::Device,
) -> Result<M, NetError> {
    let record: M::Record = <WeightRecorder as Recorder<B>>::load(&WeightRecorder::default(), bytes, device)
        .map_err(|e| NetError::Record(format!("{e:?}")))?;
    Ok(module.load_record(record))
}

/// Stack stem outputs into a `[N, STEM_CHANNELS, CELLS]` tensor.
pub fn features_tensor<B: Backend>(batch: &[Array2<f32>], device: &B::Device) -> Tensor<B, 3> {
    let values: Vec<f32> = batch.iter().flat_map(|f| f.iter().copied()).collect();
    Tensor::from_data(TensorData::new(values, [batch.len(), STEM_CHANNELS, CELLS]), device)
}

pub fn targets_tensor<B: Backend>(
    labels: &[usize],
    num_classes: usize,
    device: &B::Device,
) -> Result<Tensor<B, 1, Int>, NetError> {
    if let Some(&target) = labels.iter().find(|&&l| l >= num_classes) {
        return Err(NetError::TargetOutOfRange { target, classes: num_classes });
    }
    let values: Vec<i64> = labels.iter().map(|&l| l as i64).collect();
    Ok(Tensor::from_data(TensorData::new(values, [labels.len()]), device))
}

pub fn tensor_values<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Result<Vec<f32>, NetError> {
    tensor
        .into_data()
        .to_vec::<f32>()
        .map_err(|e| NetError::Data(format!("{e:?}")))
}

struct Net<M> {
    head: M,
    architecture: Architecture,
    num_classes: usize,
    device: NdArrayDevice,
}

impl<M: EmotionHead<InferBackend>> Scorer for Net<M> {
    fn scores(&mut self, input: ArrayView3<f32>) -> Result<Array1<f32>, NetError> {
        let features = features_tensor::<InferBackend>(&[stem(input)?], &self.device);
        Ok(Array1::from(tensor_values(self.head.forward(features))?))
    }
}

impl<M: EmotionHead<InferBackend>> EmotionNet for Net<M> {
    fn architecture(&self) -> Architecture {
        self.architecture
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn as_scorer(&mut self) -> &mut dyn Scorer {
        self
    }

    fn to_bytes(&self) -> Result<Vec<u8>, NetError> {
        record_bytes::<InferBackend, M>(self.head.clone())
    }

    fn load_bytes(&mut self, bytes: Vec<u8>) -> Result<(), NetError> {
        let expected = self.head.num_params();
        let loaded = load_record_bytes::<InferBackend, M>(self.head.clone(), bytes, &self.device)?;
        let found = loaded.num_params();
        if found != expected {
            return Err(NetError::WeightsMismatch { expected, found });
        }
        if !loaded.parameters_finite() {
            return Err(NetError::NonFinite);
        }
        self.head = loaded;
        Ok(())
    }
}

/// Construct an inference network of `arch` with weights from `prior`.
pub fn build(
    arch: Architecture,
    num_classes: usize,
    prior: &dyn PretrainedPrior,
) -> Result<Box<dyn EmotionNet>, NetError> {
    if num_classes == 0 {
        return Err(NetError::NoClasses);
    }
    let device = NdArrayDevice::default();
    tracing::debug!(arch = %arch, num_classes, "constructed network");
    Ok(match arch {
        Architecture::CbamResnet => Box::new(Net {
            head: CbamHead::<InferBackend>::new(num_classes, prior, &device)?,
            architecture: arch,
            num_classes,
            device,
        }),
        Architecture::MobileVit => Box::new(Net {
            head: MlpHead::<InferBackend>::new(num_classes, prior, &device)?,
            architecture: arch,
            num_classes,
            device,
        }),
    })
}

/// Numerically stable softmax.
pub fn softmax(scores: ArrayView1<f32>) -> Array1<f32> {
    let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exp = scores.mapv(|v| (v - max).exp());
    let sum = exp.sum();
    if sum > 0.0 && sum.is_finite() {
        exp / sum
    } else {
        Array1::from_elem(scores.len(), 1.0 / scores.len().max(1) as f32)
    }
}

/// Frozen stem: `(STEM_CHANNELS, GRID*GRID)` cell features.
pub fn stem(input: ArrayView3<f32>) -> Result<Array2<f32>, NetError> {
    let (c, h, w) = input.dim();
    if c != 3 || h < GRID || w < GRID {
        return Err(NetError::InputShape(input.shape().to_vec()));
    }

    let luma = input.sum_axis(Axis(0)) / 3.0;
    let mut grad_x = Array2::<f32>::zeros((h, w));
    let mut grad_y = Array2::<f32>::zeros((h, w));
    for y in 0..h {
        for x in 0..w {
            if x + 1 < w {
                grad_x[[y, x]] = (luma[[y, x + 1]] - luma[[y, x]]).abs();
            }
            if y + 1 < h {
                grad_y[[y, x]] = (luma[[y + 1, x]] - luma[[y, x]]).abs();
            }
        }
    }

    let mut features = Array2::<f32>::zeros((STEM_CHANNELS, CELLS));
    for gy in 0..GRID {
        let (y0, y1) = (gy * h / GRID, (gy + 1) * h / GRID);
        for gx in 0..GRID {
            let (x0, x1) = (gx * w / GRID, (gx + 1) * w / GRID);
            let cell = gy * GRID + gx;
            for ch in 0..3 {
                features[[ch, cell]] = input.slice(s![ch, y0..y1, x0..x1]).mean().unwrap_or(0.0);
            }
            features[[3, cell]] = grad_x.slice(s![y0..y1, x0..x1]).mean().unwrap_or(0.0);
            features[[4, cell]] = grad_y.slice(s![y0..y1, x0..x1]).mean().unwrap_or(0.0);
        }
    }
    Ok(features)
}
