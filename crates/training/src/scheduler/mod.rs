use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

use crate::{config, TrainingError};

/// Learning-rate policy stepped once per epoch.
pub trait LRScheduler: Send {
    /// Learning rate to use for `epoch`, remembered as the current rate.
    fn step(&mut self, epoch: usize) -> f64;

    fn learning_rate(&self) -> f64;

    fn state(&self) -> SchedulerState;

    fn load_state(&mut self, state: SchedulerState);
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SchedulerState {
    pub last_epoch: Option<usize>,
    pub learning_rate: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DecayShape {
    Constant,
    Cosine,
    Polynomial { power: f64 },
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub base_lr: f64,
    pub min_lr: f64,
    pub warmup_epochs: usize,
    pub total_epochs: usize,
    pub shape: DecayShape,
}

impl SchedulerConfig {
    pub fn from_training_config(
        cfg: &config::SchedulerConfig,
        base_lr: f64,
        total_epochs: usize,
    ) -> Result<Self, TrainingError> {
        if total_epochs == 0 {
            return Err(TrainingError::initialization(
                "scheduler requires at least one epoch",
            ));
        }
        let shape = match cfg.strategy {
            config::LearningRateSchedule::Constant => DecayShape::Constant,
            config::LearningRateSchedule::Cosine => DecayShape::Cosine,
            config::LearningRateSchedule::Polynomial => {
                let power = cfg.power.unwrap_or(1.0) as f64;
                DecayShape::Polynomial {
                    power: if power <= 0.0 { 1.0 } else { power },
                }
            }
        };
        Ok(Self {
            base_lr,
            min_lr: cfg.min_lr.unwrap_or(0.0) as f64,
            warmup_epochs: cfg.warmup_epochs.unwrap_or(0).min(total_epochs),
            total_epochs,
            shape,
        })
    }

    pub fn build(self) -> Result<Box<dyn LRScheduler>, TrainingError> {
        Ok(Box::new(EpochScheduler::new(self)?))
    }
}

/// Linear warmup followed by a constant, cosine or polynomial decay
/// towards `min_lr` at the final epoch.
#[derive(Debug, Clone)]
pub struct EpochScheduler {
    config: SchedulerConfig,
    last_epoch: Option<usize>,
    current_lr: f64,
}

impl EpochScheduler {
    pub fn new(config: SchedulerConfig) -> Result<Self, TrainingError> {
        if config.base_lr <= 0.0 {
            return Err(TrainingError::initialization(
                "scheduler requires base learning rate > 0",
            ));
        }
        if config.min_lr < 0.0 || config.min_lr > config.base_lr {
            return Err(TrainingError::initialization(
                "scheduler min_lr must be in [0, base_lr]",
            ));
        }
        let current_lr = config.base_lr;
        Ok(Self {
            config,
            last_epoch: None,
            current_lr,
        })
    }

    pub fn lr_at(&self, epoch: usize) -> f64 {
        let cfg = &self.config;
        if cfg.warmup_epochs > 0 && epoch < cfg.warmup_epochs {
            let progress = (epoch + 1) as f64 / cfg.warmup_epochs as f64;
            return cfg.base_lr * progress;
        }
        if cfg.total_epochs <= cfg.warmup_epochs {
            return cfg.base_lr;
        }

        let span = (cfg.total_epochs - cfg.warmup_epochs).max(1) as f64;
        let progress = (epoch.saturating_sub(cfg.warmup_epochs) as f64 / span).clamp(0.0, 1.0);
        let factor = match cfg.shape {
            DecayShape::Constant => return cfg.base_lr,
            DecayShape::Cosine => 0.5 * (1.0 + f64::cos(PI * progress)),
            DecayShape::Polynomial { power } => (1.0 - progress).max(0.0).powf(power),
        };
        cfg.min_lr + (cfg.base_lr - cfg.min_lr) * factor
    }
}

impl LRScheduler for EpochScheduler {
    fn step(&mut self, epoch: usize) -> f64 {
        self.current_lr = self.lr_at(epoch);
        self.last_epoch = Some(epoch);
        self.current_lr
    }

    fn learning_rate(&self) -> f64 {
        self.current_lr
    }

    fn state(&self) -> SchedulerState {
        SchedulerState {
            last_epoch: self.last_epoch,
            learning_rate: self.current_lr,
        }
    }

    fn load_state(&mut self, state: SchedulerState) {
        self.last_epoch = state.last_epoch;
        self.current_lr = state.learning_rate;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler(shape: DecayShape, warmup: usize) -> EpochScheduler {
        EpochScheduler::new(SchedulerConfig {
            base_lr: 1.0,
            min_lr: 0.1,
            warmup_epochs: warmup,
            total_epochs: 10,
            shape,
        })
        .unwrap()
    }

    #[test]
    fn warmup_ramps_linearly() {
        let mut sched = scheduler(DecayShape::Cosine, 4);
        assert!((sched.step(0) - 0.25).abs() < 1e-12);
        assert!((sched.step(3) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn cosine_reaches_min_lr_at_the_end() {
        let sched = scheduler(DecayShape::Cosine, 0);
        assert!((sched.lr_at(0) - 1.0).abs() < 1e-12);
        assert!((sched.lr_at(5) - 0.55).abs() < 1e-12);
        assert!((sched.lr_at(10) - 0.1).abs() < 1e-12);
    }

    #[test]
    fn polynomial_and_constant_shapes() {
        let poly = scheduler(DecayShape::Polynomial { power: 2.0 }, 0);
        assert!((poly.lr_at(5) - (0.1 + 0.9 * 0.25)).abs() < 1e-12);
        let constant = scheduler(DecayShape::Constant, 2);
        assert!((constant.lr_at(9) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn state_survives_round_trip() {
        let mut sched = scheduler(DecayShape::Cosine, 0);
        sched.step(3);
        let state = sched.state();
        let mut other = scheduler(DecayShape::Cosine, 0);
        other.load_state(state);
        assert_eq!(other.learning_rate(), sched.learning_rate());
        assert_eq!(other.state().last_epoch, Some(3));
    }

    #[test]
    fn builds_from_config_section() {
        let section = config::SchedulerConfig {
            strategy: config::LearningRateSchedule::Polynomial,
            warmup_epochs: Some(50),
            min_lr: None,
            power: None,
        };
        let cfg = SchedulerConfig::from_training_config(&section, 0.5, 20).unwrap();
        assert_eq!(cfg.warmup_epochs, 20);
        assert_eq!(cfg.shape, DecayShape::Polynomial { power: 1.0 });
        assert!(cfg.build().is_ok());
    }
}
