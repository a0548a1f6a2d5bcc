use std::collections::HashMap;

pub mod scaler;

pub use scaler::{Autocast, GradientScaler, GradientScalerState, LossScaleConfig, StepOutcome};

use candle_core::{backprop::GradStore, DType, Tensor, Var};
use serde::{Deserialize, Serialize};

use crate::{config, TrainingError};

const EPS: f64 = 1e-12;

/// What the epoch loop needs from an optimizer.
pub trait Optimizer {
    /// Clears gradient state carried between steps.
    fn zero_grad(&mut self);

    /// Applies one update from `grads`, consuming the entries it uses.
    fn step(&mut self, grads: &mut GradStore) -> Result<(), TrainingError>;

    fn learning_rate(&self) -> f64;

    fn set_learning_rate(&mut self, lr: f64);

    /// Whether the update needs a graph through the gradients themselves.
    fn is_second_order(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone)]
pub enum OptimizerConfig {
    AdamW(AdamWConfig),
}

#[derive(Debug, Clone, Copy)]
pub struct AdamWConfig {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub weight_decay: f64,
}

impl From<&config::OptimizerConfig> for OptimizerConfig {
    fn from(value: &config::OptimizerConfig) -> Self {
        match value.algorithm {
            config::OptimizerType::AdamW => OptimizerConfig::AdamW(AdamWConfig {
                learning_rate: value.learning_rate as f64,
                beta1: value.beta1 as f64,
                beta2: value.beta2 as f64,
                epsilon: value.epsilon as f64,
                weight_decay: value.weight_decay as f64,
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrainerOptimizerOptions {
    pub use_master_weights: bool,
    /// Parameters whose name contains any of these are not decayed.
    pub weight_decay_exclude: Vec<String>,
    /// Skip weight decay for rank-1 parameters (biases, norms).
    pub no_decay_for_vectors: bool,
}

impl Default for TrainerOptimizerOptions {
    fn default() -> Self {
        Self {
            use_master_weights: true,
            weight_decay_exclude: vec![],
            no_decay_for_vectors: true,
        }
    }
}

/// AdamW with optional fp32 master copies of reduced-precision weights.
#[derive(Debug)]
pub struct TrainerOptimizer {
    config: OptimizerConfig,
    params: Vec<ParameterSlot>,
    step: usize,
}

#[derive(Debug)]
struct ParameterSlot {
    name: String,
    param: Var,
    dtype: DType,
    master: Option<Var>,
    first_moment: Tensor,
    second_moment: Tensor,
    apply_weight_decay: bool,
}

impl TrainerOptimizer {
    pub fn new(
        named_parameters: Vec<(String, Var)>,
        config: OptimizerConfig,
        options: TrainerOptimizerOptions,
    ) -> Result<Self, TrainingError> {
        if named_parameters.is_empty() {
            return Err(TrainingError::initialization(
                "optimizer requires at least one parameter",
            ));
        }

        let mut params = Vec::with_capacity(named_parameters.len());
        for (name, var) in named_parameters {
            let tensor = var.as_tensor();
            if !tensor.dtype().is_float() {
                return Err(TrainingError::initialization(format!(
                    "optimizer received non-floating parameter '{}'",
                    name
                )));
            }
            let device = tensor.device();
            let shape = tensor.dims().to_vec();
            let dtype = tensor.dtype();

            let first_moment =
                Tensor::zeros(shape.as_slice(), DType::F32, device).map_err(to_runtime_error)?;
            let second_moment =
                Tensor::zeros(shape.as_slice(), DType::F32, device).map_err(to_runtime_error)?;

            let apply_weight_decay = !(options.no_decay_for_vectors && shape.len() <= 1)
                && should_apply_weight_decay(&name, &options.weight_decay_exclude);

            let master = if options.use_master_weights && dtype != DType::F32 {
                let fp32 = tensor.to_dtype(DType::F32).map_err(to_runtime_error)?;
                Some(Var::from_tensor(&fp32).map_err(to_runtime_error)?)
            } else {
                None
            };

            params.push(ParameterSlot {
                name,
                param: var,
                dtype,
                master,
                first_moment,
                second_moment,
                apply_weight_decay,
            });
        }

        Ok(Self {
            config,
            params,
            step: 0,
        })
    }

    pub fn steps_taken(&self) -> usize {
        self.step
    }

    pub fn parameters(&self) -> Vec<Var> {
        self.params.iter().map(|slot| slot.param.clone()).collect()
    }

    fn step_adamw(
        &mut self,
        cfg: AdamWConfig,
        processed: Vec<(usize, Tensor)>,
    ) -> Result<(), TrainingError> {
        let bias_correction1 = 1.0 - cfg.beta1.powi(self.step as i32);
        let bias_correction2 = 1.0 - cfg.beta2.powi(self.step as i32);
        let scale_m = if bias_correction1.abs() < EPS {
            1.0
        } else {
            1.0 / bias_correction1
        };
        let scale_v = if bias_correction2.abs() < EPS {
            1.0
        } else {
            1.0 / bias_correction2
        };

        for (index, grad) in processed {
            let slot = &mut self.params[index];

            let new_m = (slot
                .first_moment
                .affine(cfg.beta1, 0.0)
                .map_err(to_runtime_error)?
                + grad.affine(1.0 - cfg.beta1, 0.0).map_err(to_runtime_error)?)
            .map_err(to_runtime_error)?;
            let new_v = (slot
                .second_moment
                .affine(cfg.beta2, 0.0)
                .map_err(to_runtime_error)?
                + grad
                    .sqr()
                    .and_then(|g| g.affine(1.0 - cfg.beta2, 0.0))
                    .map_err(to_runtime_error)?)
            .map_err(to_runtime_error)?;

            let m_hat = new_m.affine(scale_m, 0.0).map_err(to_runtime_error)?;
            let denom = new_v
                .affine(scale_v, 0.0)
                .and_then(|v| v.sqrt())
                .and_then(|v| v.affine(1.0, cfg.epsilon))
                .map_err(to_runtime_error)?;
            let update = m_hat
                .div(&denom)
                .and_then(|u| u.affine(cfg.learning_rate, 0.0))
                .map_err(to_runtime_error)?;

            let base = match slot.master.as_ref() {
                Some(master) => master.as_tensor().clone(),
                None => slot
                    .param
                    .as_tensor()
                    .to_dtype(DType::F32)
                    .map_err(to_runtime_error)?,
            };

            let decayed = if slot.apply_weight_decay && cfg.weight_decay != 0.0 {
                base.affine(1.0 - cfg.learning_rate * cfg.weight_decay, 0.0)
                    .map_err(to_runtime_error)?
            } else {
                base
            };

            let next = decayed.sub(&update).map_err(to_runtime_error)?;
            if let Some(master) = slot.master.as_ref() {
                master.set(&next).map_err(to_runtime_error)?;
            }
            let cast = if slot.dtype == DType::F32 {
                next
            } else {
                next.to_dtype(slot.dtype).map_err(to_runtime_error)?
            };
            slot.param.set(&cast).map_err(to_runtime_error)?;

            slot.first_moment = new_m;
            slot.second_moment = new_v;
        }

        Ok(())
    }

    pub fn state(&self) -> Result<OptimizerState, TrainingError> {
        let mut parameters = Vec::with_capacity(self.params.len());
        for slot in &self.params {
            let shape = slot.param.as_tensor().dims().to_vec();
            let numel = numel(&shape);
            let master = match &slot.master {
                Some(master) => Some(flatten_to_vec(master.as_tensor(), numel)?),
                None => None,
            };
            parameters.push(ParameterState {
                name: slot.name.clone(),
                first_moment: flatten_to_vec(&slot.first_moment, numel)?,
                second_moment: flatten_to_vec(&slot.second_moment, numel)?,
                shape,
                master,
            });
        }

        Ok(OptimizerState {
            step: self.step,
            learning_rate: self.learning_rate(),
            parameters,
        })
    }

    pub fn load_state(&mut self, state: OptimizerState) -> Result<(), TrainingError> {
        self.step = state.step;
        self.set_learning_rate(state.learning_rate);
        let mut by_name: HashMap<_, _> = state
            .parameters
            .into_iter()
            .map(|param| (param.name.clone(), param))
            .collect();

        for slot in &mut self.params {
            let state = by_name.remove(&slot.name).ok_or_else(|| {
                TrainingError::runtime(format!("optimizer state missing parameter '{}'", slot.name))
            })?;

            let dims = slot.param.as_tensor().dims().to_vec();
            let expected = numel(&dims);
            if dims != state.shape {
                return Err(TrainingError::runtime(format!(
                    "optimizer state shape mismatch for '{}'",
                    slot.name
                )));
            }
            if expected != state.first_moment.len()
                || expected != state.second_moment.len()
                || state.master.as_ref().is_some_and(|m| m.len() != expected)
            {
                return Err(TrainingError::runtime(format!(
                    "optimizer state size mismatch for '{}'",
                    slot.name
                )));
            }

            let device = slot.param.as_tensor().device().clone();
            slot.first_moment = Tensor::from_vec(state.first_moment, dims.as_slice(), &device)
                .map_err(to_runtime_error)?;
            slot.second_moment = Tensor::from_vec(state.second_moment, dims.as_slice(), &device)
                .map_err(to_runtime_error)?;

            match (&mut slot.master, state.master) {
                (Some(master), Some(values)) => {
                    let tensor = Tensor::from_vec(values, dims.as_slice(), &device)
                        .map_err(to_runtime_error)?;
                    master.set(&tensor).map_err(to_runtime_error)?;
                    let cast = tensor.to_dtype(slot.dtype).map_err(to_runtime_error)?;
                    slot.param.set(&cast).map_err(to_runtime_error)?;
                }
                (None, None) => {}
                (Some(_), None) => {
                    return Err(TrainingError::runtime(format!(
                        "optimizer state missing master weights for '{}'",
                        slot.name
                    )))
                }
                (None, Some(_)) => {
                    return Err(TrainingError::runtime(format!(
                        "optimizer state contains master weights for '{}' but optimizer is not using them",
                        slot.name
                    )))
                }
            }
        }

        if !by_name.is_empty() {
            return Err(TrainingError::runtime(
                "optimizer state has extra parameters not present in the model",
            ));
        }

        Ok(())
    }
}

impl Optimizer for TrainerOptimizer {
    /// Gradients live in the `GradStore` each backward pass returns, so
    /// there is nothing accumulated here to clear.
    fn zero_grad(&mut self) {}

    fn step(&mut self, grads: &mut GradStore) -> Result<(), TrainingError> {
        let mut processed = Vec::new();
        for (idx, slot) in self.params.iter().enumerate() {
            let Some(grad) = grads.remove(slot.param.as_tensor()) else {
                continue;
            };
            let grad = grad.to_dtype(DType::F32).map_err(to_runtime_error)?;
            processed.push((idx, grad));
        }

        if processed.is_empty() {
            return Ok(());
        }

        self.step += 1;
        match self.config {
            OptimizerConfig::AdamW(cfg) => self.step_adamw(cfg, processed),
        }
    }

    fn learning_rate(&self) -> f64 {
        match self.config {
            OptimizerConfig::AdamW(cfg) => cfg.learning_rate,
        }
    }

    fn set_learning_rate(&mut self, lr: f64) {
        match &mut self.config {
            OptimizerConfig::AdamW(cfg) => cfg.learning_rate = lr,
        }
    }
}

/// Rescales the gradients of `parameters` so their global L2 norm is at most
/// `max_norm` and returns the norm measured before clipping. A missing or
/// non-positive `max_norm` only measures.
pub fn clip_grad_norm(
    grads: &mut GradStore,
    parameters: &[Var],
    max_norm: Option<f64>,
) -> Result<f64, TrainingError> {
    let mut total_sq = 0.0f64;
    for var in parameters {
        if let Some(grad) = grads.get(var.as_tensor()) {
            let norm = tensor_l2_norm(grad)?;
            total_sq += norm * norm;
        }
    }
    let total = total_sq.sqrt();

    let Some(max_norm) = max_norm.filter(|m| *m > 0.0) else {
        return Ok(total);
    };
    if total.is_finite() && total > max_norm {
        let scale = max_norm / (total + EPS);
        for var in parameters {
            if let Some(grad) = grads.remove(var.as_tensor()) {
                let clipped = grad.affine(scale, 0.0).map_err(to_runtime_error)?;
                grads.insert(var.as_tensor(), clipped);
            }
        }
    }
    Ok(total)
}

fn should_apply_weight_decay(name: &str, exclusions: &[String]) -> bool {
    !exclusions
        .iter()
        .any(|pattern| !pattern.is_empty() && name.contains(pattern.as_str()))
}

fn tensor_l2_norm(tensor: &Tensor) -> Result<f64, TrainingError> {
    let value = tensor
        .to_dtype(DType::F32)
        .and_then(|t| t.sqr())
        .and_then(|t| t.sum_all())
        .and_then(|t| t.to_vec0::<f32>())
        .map_err(to_runtime_error)?;
    Ok((value as f64).sqrt())
}

fn flatten_to_vec(tensor: &Tensor, expected: usize) -> Result<Vec<f32>, TrainingError> {
    let flat = tensor
        .flatten_all()
        .and_then(|t| t.to_dtype(DType::F32))
        .and_then(|t| t.to_vec1::<f32>())
        .map_err(to_runtime_error)?;
    if flat.len() != expected {
        return Err(TrainingError::runtime(
            "unexpected element count during serialization",
        ));
    }
    Ok(flat)
}

fn numel(shape: &[usize]) -> usize {
    shape.iter().product()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerState {
    pub step: usize,
    pub learning_rate: f64,
    pub parameters: Vec<ParameterState>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterState {
    pub name: String,
    pub shape: Vec<usize>,
    pub first_moment: Vec<f32>,
    pub second_moment: Vec<f32>,
    pub master: Option<Vec<f32>>,
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}
