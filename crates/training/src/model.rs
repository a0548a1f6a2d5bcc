use std::{
    collections::HashMap,
    path::Path,
    sync::atomic::{AtomicBool, Ordering},
};

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{linear, ops, Linear, Module, VarBuilder, VarMap};

use crate::TrainingError;

/// Per-call flags forwarded to the backbone. Models without a class token
/// simply ignore them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwardOptions {
    pub random_cls_token_position: bool,
    pub random_token_rank: bool,
}

/// A classifier the epoch loops can drive.
pub trait ImageClassifier {
    /// Maps `[batch, ...]` samples to `[batch, classes]` logits.
    fn forward(&self, xs: &Tensor, options: &ForwardOptions) -> candle_core::Result<Tensor>;

    fn set_training(&self, training: bool);

    fn is_training(&self) -> bool;

    /// Trainable parameters in a stable (name-sorted) order.
    fn named_parameters(&self) -> Vec<(String, Var)>;

    fn num_parameters(&self) -> usize {
        self.named_parameters()
            .iter()
            .map(|(_, var)| var.as_tensor().elem_count())
            .sum()
    }
}

#[derive(Debug, Clone)]
pub struct MlpConfig {
    pub input_dim: usize,
    pub hidden_dim: usize,
    pub num_classes: usize,
    pub dropout: f32,
    pub dtype: DType,
    pub device: Device,
}

/// Flatten → linear → GELU → dropout → linear.
pub struct MlpClassifier {
    config: MlpConfig,
    varmap: VarMap,
    fc1: Linear,
    fc2: Linear,
    training: AtomicBool,
}

impl MlpClassifier {
    pub fn new(config: MlpConfig) -> Result<Self, TrainingError> {
        if config.input_dim == 0 || config.hidden_dim == 0 || config.num_classes == 0 {
            return Err(TrainingError::initialization(
                "classifier dimensions must be greater than zero",
            ));
        }
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, config.dtype, &config.device);
        let fc1 = linear(config.input_dim, config.hidden_dim, vb.pp("fc1"))
            .map_err(to_init_error)?;
        let fc2 = linear(config.hidden_dim, config.num_classes, vb.pp("head"))
            .map_err(to_init_error)?;
        Ok(Self {
            config,
            varmap,
            fc1,
            fc2,
            training: AtomicBool::new(true),
        })
    }

    pub fn config(&self) -> &MlpConfig {
        &self.config
    }

    pub fn load_weights(&mut self, path: impl AsRef<Path>) -> Result<(), TrainingError> {
        let path = path.as_ref();
        self.varmap.load(path).map_err(|err| {
            TrainingError::initialization(format!(
                "failed to load weights from {}: {err}",
                path.display()
            ))
        })
    }

    pub fn save_weights(&self, path: impl AsRef<Path>) -> Result<(), TrainingError> {
        let path = path.as_ref();
        self.varmap.save(path).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to save weights to {}: {err}",
                path.display()
            ))
        })
    }
}

impl ImageClassifier for MlpClassifier {
    fn forward(&self, xs: &Tensor, _options: &ForwardOptions) -> candle_core::Result<Tensor> {
        // Float inputs pick the compute dtype, so autocast runs the layers in
        // bf16/f16 while the parameters stay in their storage dtype.
        let dtype = if xs.dtype().is_float() {
            xs.dtype()
        } else {
            self.config.dtype
        };
        let xs = xs.flatten_from(1)?.to_dtype(dtype)?;
        let hidden = cast_linear(&self.fc1, dtype)?.forward(&xs)?.gelu_erf()?;
        let hidden = if self.is_training() && self.config.dropout > 0.0 {
            ops::dropout(&hidden, self.config.dropout)?
        } else {
            hidden
        };
        cast_linear(&self.fc2, dtype)?.forward(&hidden)
    }

    fn set_training(&self, training: bool) {
        self.training.store(training, Ordering::Relaxed);
    }

    fn is_training(&self) -> bool {
        self.training.load(Ordering::Relaxed)
    }

    fn named_parameters(&self) -> Vec<(String, Var)> {
        let data = match self.varmap.data().lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut params: Vec<(String, Var)> = data
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        params.sort_by(|a, b| a.0.cmp(&b.0));
        params
    }
}

/// Name → tensor snapshot of a classifier's parameters.
pub fn parameter_tensors(model: &dyn ImageClassifier) -> HashMap<String, Tensor> {
    model
        .named_parameters()
        .into_iter()
        .map(|(name, var)| (name, var.as_tensor().clone()))
        .collect()
}

/// Differentiable cast of a layer's weights; gradients flow back to the
/// stored parameters.
fn cast_linear(layer: &Linear, dtype: DType) -> candle_core::Result<Linear> {
    if layer.weight().dtype() == dtype {
        return Ok(layer.clone());
    }
    let bias = layer.bias().map(|b| b.to_dtype(dtype)).transpose()?;
    Ok(Linear::new(layer.weight().to_dtype(dtype)?, bias))
}

fn to_init_error(err: candle_core::Error) -> TrainingError {
    TrainingError::initialization(format!("failed to build classifier: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny() -> MlpClassifier {
        MlpClassifier::new(MlpConfig {
            input_dim: 12,
            hidden_dim: 8,
            num_classes: 5,
            dropout: 0.5,
            dtype: DType::F32,
            device: Device::Cpu,
        })
        .unwrap()
    }

    #[test]
    fn forward_flattens_images_to_logits() {
        let model = tiny();
        let xs = Tensor::zeros((2, 3, 2, 2), DType::F32, &Device::Cpu).unwrap();
        let logits = model.forward(&xs, &ForwardOptions::default()).unwrap();
        assert_eq!(logits.dims(), &[2, 5]);
    }

    #[test]
    fn reduced_precision_inputs_run_in_that_dtype() {
        let model = tiny();
        model.set_training(false);
        let xs = Tensor::ones((2, 12), DType::BF16, &Device::Cpu).unwrap();
        let logits = model.forward(&xs, &ForwardOptions::default()).unwrap();
        assert_eq!(logits.dtype(), DType::BF16);

        let loss = logits.to_dtype(DType::F32).unwrap().sum_all().unwrap();
        let grads = loss.backward().unwrap();
        for (name, var) in model.named_parameters() {
            let grad = grads
                .get(var.as_tensor())
                .unwrap_or_else(|| panic!("no gradient for {name}"));
            assert_eq!(grad.dtype(), DType::F32);
        }
    }

    #[test]
    fn parameters_are_sorted_and_counted() {
        let model = tiny();
        let names: Vec<String> = model
            .named_parameters()
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(names, vec!["fc1.bias", "fc1.weight", "head.bias", "head.weight"]);
        assert_eq!(model.num_parameters(), 12 * 8 + 8 + 8 * 5 + 5);
    }

    #[test]
    fn eval_mode_is_deterministic() {
        let model = tiny();
        model.set_training(false);
        let xs = Tensor::ones((4, 12), DType::F32, &Device::Cpu).unwrap();
        let a = model.forward(&xs, &ForwardOptions::default()).unwrap();
        let b = model.forward(&xs, &ForwardOptions::default()).unwrap();
        assert_eq!(a.to_vec2::<f32>().unwrap(), b.to_vec2::<f32>().unwrap());
    }

    #[test]
    fn weights_round_trip_through_safetensors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights.safetensors");
        let model = tiny();
        model.save_weights(&path).unwrap();

        let mut other = tiny();
        other.load_weights(&path).unwrap();
        let original = parameter_tensors(&model);
        for (name, tensor) in parameter_tensors(&other) {
            let expected = original[&name].flatten_all().unwrap().to_vec1::<f32>().unwrap();
            assert_eq!(tensor.flatten_all().unwrap().to_vec1::<f32>().unwrap(), expected);
        }
    }
}
