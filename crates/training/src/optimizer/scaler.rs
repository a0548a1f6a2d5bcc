use candle_core::{DType, Tensor, Var};
use serde::{Deserialize, Serialize};

use super::{clip_grad_norm, Optimizer};
use crate::{
    config::Precision,
    model::{ForwardOptions, ImageClassifier},
    TrainingError,
};

#[derive(Debug, Clone)]
pub struct LossScaleConfig {
    pub initial_scale: f32,
    pub growth_factor: f32,
    pub backoff_factor: f32,
    pub growth_interval: usize,
    pub min_scale: f32,
    pub max_scale: f32,
}

impl Default for LossScaleConfig {
    fn default() -> Self {
        Self {
            initial_scale: 2f32.powi(15),
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 200,
            min_scale: 1.0,
            max_scale: 2f32.powi(24),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GradientScalerState {
    pub loss_scale: f32,
    pub stable_steps: usize,
}

/// Result of one combined backward + update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepOutcome {
    /// Global gradient norm after unscaling, before clipping.
    pub grad_norm: f64,
    /// The update was dropped because scaled gradients overflowed.
    pub overflowed: bool,
}

#[derive(Debug, Clone)]
pub struct GradientScaler {
    state: ScalerState,
}

#[derive(Debug, Clone)]
enum ScalerState {
    Disabled,
    Enabled(EnabledState),
}

#[derive(Debug, Clone)]
struct EnabledState {
    loss_scale: f32,
    stable_steps: usize,
    config: LossScaleConfig,
}

impl GradientScaler {
    pub fn new(precision: Precision) -> Self {
        Self::with_config(LossScaleConfig::default(), precision)
    }

    pub fn with_config(config: LossScaleConfig, precision: Precision) -> Self {
        let enabled = matches!(
            precision,
            Precision::Fp16 | Precision::Bf16 | Precision::Mixed
        );
        if !enabled {
            return Self {
                state: ScalerState::Disabled,
            };
        }

        let cfg = sanitize_config(config);
        Self {
            state: ScalerState::Enabled(EnabledState {
                loss_scale: cfg.initial_scale,
                stable_steps: 0,
                config: cfg,
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self.state, ScalerState::Enabled(_))
    }

    pub fn loss_scale(&self) -> f32 {
        match &self.state {
            ScalerState::Disabled => 1.0,
            ScalerState::Enabled(state) => state.loss_scale,
        }
    }

    pub fn scale(&self, tensor: &Tensor) -> Result<Tensor, TrainingError> {
        match &self.state {
            ScalerState::Disabled => Ok(tensor.clone()),
            ScalerState::Enabled(state) => tensor
                .affine(state.loss_scale as f64, 0.0)
                .map_err(to_runtime_error),
        }
    }

    pub fn unscale(&self, tensor: &Tensor) -> Result<Tensor, TrainingError> {
        match &self.state {
            ScalerState::Disabled => Ok(tensor.clone()),
            ScalerState::Enabled(state) => {
                let scale = 1.0 / state.loss_scale;
                tensor.affine(scale as f64, 0.0).map_err(to_runtime_error)
            }
        }
    }

    pub fn has_overflow<I>(&self, tensors: I) -> Result<bool, TrainingError>
    where
        I: IntoIterator,
        I::Item: AsRef<Tensor>,
    {
        match &self.state {
            ScalerState::Disabled => Ok(false),
            ScalerState::Enabled(_) => {
                for tensor in tensors {
                    if contains_non_finite(tensor.as_ref())? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
        }
    }

    pub fn update(&mut self, found_inf: bool) {
        if let ScalerState::Enabled(state) = &mut self.state {
            if found_inf {
                state.loss_scale =
                    (state.loss_scale * state.config.backoff_factor).max(state.config.min_scale);
                state.stable_steps = 0;
            } else {
                state.stable_steps += 1;
                if state.stable_steps >= state.config.growth_interval {
                    state.loss_scale =
                        (state.loss_scale * state.config.growth_factor).min(state.config.max_scale);
                    state.stable_steps = 0;
                }
            }
        }
    }

    /// Scale, backward, unscale, overflow check, clip and step as one unit.
    /// On overflow the optimizer is left untouched and the scale backs off.
    pub fn backward_step<O>(
        &mut self,
        loss: &Tensor,
        optimizer: &mut O,
        parameters: &[Var],
        clip_grad: Option<f64>,
    ) -> Result<StepOutcome, TrainingError>
    where
        O: Optimizer + ?Sized,
    {
        if optimizer.is_second_order() {
            return Err(TrainingError::initialization(
                "second-order optimizers are not supported: gradients cannot be differentiated again",
            ));
        }

        let scaled = self.scale(loss)?;
        let mut grads = scaled.backward().map_err(to_runtime_error)?;

        if self.is_enabled() {
            for var in parameters {
                if let Some(grad) = grads.remove(var.as_tensor()) {
                    grads.insert(var.as_tensor(), self.unscale(&grad)?);
                }
            }
        }

        let found_inf = self.has_overflow(
            parameters
                .iter()
                .filter_map(|var| grads.get(var.as_tensor()).cloned()),
        )?;
        if found_inf {
            self.update(true);
            return Ok(StepOutcome {
                grad_norm: f64::INFINITY,
                overflowed: true,
            });
        }

        let grad_norm = clip_grad_norm(&mut grads, parameters, clip_grad)?;
        optimizer.step(&mut grads)?;
        self.update(false);
        Ok(StepOutcome {
            grad_norm,
            overflowed: false,
        })
    }

    pub fn state(&self) -> Option<GradientScalerState> {
        match &self.state {
            ScalerState::Disabled => None,
            ScalerState::Enabled(state) => Some(GradientScalerState {
                loss_scale: state.loss_scale,
                stable_steps: state.stable_steps,
            }),
        }
    }

    pub fn load_state(&mut self, saved: GradientScalerState) {
        if let ScalerState::Enabled(state) = &mut self.state {
            state.loss_scale = saved
                .loss_scale
                .clamp(state.config.min_scale, state.config.max_scale);
            state.stable_steps = saved.stable_steps;
        }
    }
}

/// Runs the forward pass in the reduced compute dtype and hands f32 logits
/// back to the loss.
#[derive(Debug, Clone, Copy)]
pub struct Autocast {
    dtype: DType,
}

impl Autocast {
    pub fn new(precision: Precision) -> Self {
        Self {
            dtype: precision.compute_dtype(),
        }
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn is_enabled(&self) -> bool {
        self.dtype != DType::F32
    }

    pub fn forward(
        &self,
        model: &dyn ImageClassifier,
        xs: &Tensor,
        options: &ForwardOptions,
    ) -> Result<Tensor, TrainingError> {
        let xs = xs.to_dtype(self.dtype).map_err(to_runtime_error)?;
        model
            .forward(&xs, options)
            .and_then(|out| out.to_dtype(DType::F32))
            .map_err(to_runtime_error)
    }
}

fn contains_non_finite(tensor: &Tensor) -> Result<bool, TrainingError> {
    if tensor.elem_count() == 0 {
        return Ok(false);
    }
    let sum = tensor
        .to_dtype(DType::F32)
        .and_then(|t| t.sqr())
        .and_then(|t| t.sum_all())
        .and_then(|t| t.to_vec0::<f32>())
        .map_err(to_runtime_error)?;
    Ok(!sum.is_finite())
}

fn sanitize_config(mut config: LossScaleConfig) -> LossScaleConfig {
    if config.growth_factor < 1.0 {
        config.growth_factor = 1.0;
    }
    if !(0.0..1.0).contains(&config.backoff_factor) {
        config.backoff_factor = 0.5;
    }
    if config.growth_interval == 0 {
        config.growth_interval = 1;
    }
    if config.min_scale <= 0.0 {
        config.min_scale = 1.0;
    }
    if config.max_scale < config.min_scale {
        config.max_scale = config.min_scale;
    }
    config.initial_scale = config
        .initial_scale
        .clamp(config.min_scale, config.max_scale);
    config
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}
