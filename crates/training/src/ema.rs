use std::collections::HashMap;

use candle_core::{DType, Tensor, Var};

use crate::{model::ImageClassifier, TrainingError};

/// Exponential moving average of a model's parameters, kept in f32.
pub struct ModelEma {
    decay: f64,
    shadow: HashMap<String, Tensor>,
    updates: u64,
}

impl ModelEma {
    pub fn new(model: &dyn ImageClassifier, decay: f64) -> Result<Self, TrainingError> {
        if !(0.0 < decay && decay < 1.0) {
            return Err(TrainingError::initialization(
                "model EMA decay must be in (0, 1)",
            ));
        }
        let mut shadow = HashMap::new();
        for (name, var) in model.named_parameters() {
            let copy = var
                .as_tensor()
                .to_dtype(DType::F32)
                .and_then(|t| t.copy())
                .map_err(to_runtime_error)?;
            shadow.insert(name, copy);
        }
        Ok(Self {
            decay,
            shadow,
            updates: 0,
        })
    }

    pub fn decay(&self) -> f64 {
        self.decay
    }

    pub fn num_updates(&self) -> u64 {
        self.updates
    }

    pub fn shadow(&self) -> &HashMap<String, Tensor> {
        &self.shadow
    }

    /// `shadow = decay * shadow + (1 - decay) * param` for every tracked
    /// parameter.
    pub fn update(&mut self, params: &[(String, Var)]) -> Result<(), TrainingError> {
        for (name, var) in params {
            let Some(current) = self.shadow.get_mut(name) else {
                return Err(TrainingError::runtime(format!(
                    "parameter '{}' is not tracked by the EMA model",
                    name
                )));
            };
            let live = var
                .as_tensor()
                .detach()
                .to_dtype(DType::F32)
                .map_err(to_runtime_error)?;
            let blended = (current.affine(self.decay, 0.0).map_err(to_runtime_error)?
                + live.affine(1.0 - self.decay, 0.0).map_err(to_runtime_error)?)
            .map_err(to_runtime_error)?;
            *current = blended;
        }
        self.updates += 1;
        Ok(())
    }

    /// Swaps the shadow weights into `params`, runs `f`, then restores the
    /// live weights even when `f` fails.
    pub fn with_shadow_weights<T>(
        &self,
        params: &[(String, Var)],
        f: impl FnOnce() -> Result<T, TrainingError>,
    ) -> Result<T, TrainingError> {
        let mut saved = Vec::with_capacity(params.len());
        for (name, var) in params {
            let shadow = self.shadow.get(name).ok_or_else(|| {
                TrainingError::runtime(format!(
                    "parameter '{}' is not tracked by the EMA model",
                    name
                ))
            })?;
            saved.push(var.as_tensor().copy().map_err(to_runtime_error)?);
            let shadow = shadow.to_dtype(var.dtype()).map_err(to_runtime_error)?;
            var.set(&shadow).map_err(to_runtime_error)?;
        }

        let result = f();

        for ((_, var), live) in params.iter().zip(saved) {
            var.set(&live).map_err(to_runtime_error)?;
        }
        result
    }

    /// Replaces the shadow weights, e.g. when resuming from a checkpoint.
    pub fn load_shadow(&mut self, tensors: HashMap<String, Tensor>) -> Result<(), TrainingError> {
        for name in self.shadow.keys() {
            if !tensors.contains_key(name) {
                return Err(TrainingError::initialization(format!(
                    "EMA state is missing parameter '{}'",
                    name
                )));
            }
        }
        self.shadow = tensors
            .into_iter()
            .map(|(name, tensor)| Ok((name, tensor.to_dtype(DType::F32)?)))
            .collect::<candle_core::Result<_>>()
            .map_err(to_runtime_error)?;
        Ok(())
    }
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}
