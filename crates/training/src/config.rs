use candle_core::DType;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub model: ModelSettings,
    pub data: DataConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub augmentation: AugmentationConfig,
    #[serde(default)]
    pub distillation: DistillationConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl TrainingConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: TrainingConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(TrainingError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.apply_base_path(base_dir);
        config.validate()?;

        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        Self::from_path(path)
    }

    pub fn validate(&self) -> Result<(), TrainingError> {
        let mut errors = Vec::new();

        if self.model.num_classes == 0 {
            errors.push("model.num_classes must be greater than 0".to_string());
        }

        if self.model.hidden_size == 0 {
            errors.push("model.hidden_size must be greater than 0".to_string());
        }

        if !(0.0..1.0).contains(&self.model.dropout) {
            errors.push("model.dropout must be in [0, 1)".to_string());
        }

        if self.data.batch_size == 0 {
            errors.push("data.batch_size must be greater than 0".to_string());
        }

        if self.augmentation.is_mixing() && self.data.batch_size % 2 != 0 {
            errors.push("data.batch_size must be even when mixup or cutmix is enabled".to_string());
        }

        if self.augmentation.is_mixing() && !self.data.drop_last {
            errors.push(
                "data.drop_last must be true when mixup or cutmix is enabled".to_string(),
            );
        }

        if self.optimizer.learning_rate <= 0.0 {
            errors.push("optimizer.learning_rate must be greater than 0".to_string());
        }

        if self.optimizer.weight_decay < 0.0 {
            errors.push("optimizer.weight_decay must be >= 0".to_string());
        }

        if !(0.0 < self.optimizer.beta1 && self.optimizer.beta1 < 1.0) {
            errors.push("optimizer.beta1 must be in (0, 1)".to_string());
        }

        if !(0.0 < self.optimizer.beta2 && self.optimizer.beta2 < 1.0) {
            errors.push("optimizer.beta2 must be in (0, 1)".to_string());
        }

        if let Some(max_norm) = self.optimizer.clip_grad {
            if max_norm <= 0.0 {
                errors.push("optimizer.clip_grad must be greater than 0 when set".to_string());
            }
        }

        if let Some(min_lr) = self.scheduler.min_lr {
            if min_lr < 0.0 {
                errors.push("scheduler.min_lr must be >= 0".to_string());
            }
            if min_lr > self.optimizer.learning_rate {
                errors.push("scheduler.min_lr cannot exceed optimizer.learning_rate".to_string());
            }
        }

        if let Some(warmup) = self.scheduler.warmup_epochs {
            if warmup > self.runtime.epochs {
                errors.push("scheduler.warmup_epochs cannot exceed runtime.epochs".to_string());
            }
        }

        let aug = &self.augmentation;
        if aug.mixup_alpha < 0.0 || aug.cutmix_alpha < 0.0 {
            errors.push("augmentation mixup_alpha/cutmix_alpha must be >= 0".to_string());
        }
        if !(0.0..=1.0).contains(&aug.mixup_prob) {
            errors.push("augmentation.mixup_prob must be in [0, 1]".to_string());
        }
        if !(0.0..=1.0).contains(&aug.mixup_switch_prob) {
            errors.push("augmentation.mixup_switch_prob must be in [0, 1]".to_string());
        }
        if !(0.0..1.0).contains(&aug.label_smoothing) {
            errors.push("augmentation.label_smoothing must be in [0, 1)".to_string());
        }

        let distill = &self.distillation;
        if distill.kind != DistillationKind::None {
            if distill.teacher_weights.is_none() {
                errors.push(
                    "distillation.teacher_weights is required when distillation is enabled"
                        .to_string(),
                );
            }
            if !(0.0..=1.0).contains(&distill.alpha) {
                errors.push("distillation.alpha must be in [0, 1]".to_string());
            }
            if distill.tau <= 0.0 {
                errors.push("distillation.tau must be greater than 0".to_string());
            }
        }

        if self.runtime.epochs == 0 {
            errors.push("runtime.epochs must be greater than 0".to_string());
        }

        if self.runtime.print_freq == 0 {
            errors.push("runtime.print_freq must be greater than 0".to_string());
        }

        if self.runtime.output_dir.as_os_str().is_empty() {
            errors.push("runtime.output_dir must not be empty".to_string());
        }

        if let Some(decay) = self.runtime.model_ema_decay {
            if !(0.0 < decay && decay < 1.0) {
                errors.push("runtime.model_ema_decay must be in (0, 1)".to_string());
            }
        }

        if let Some(checkpoint) = &self.runtime.checkpoint {
            if checkpoint.every_n_epochs == 0 {
                errors.push("runtime.checkpoint.every_n_epochs must be greater than 0".to_string());
            }
            if let Some(0) = checkpoint.max_keep {
                errors.push("runtime.checkpoint.max_keep must be greater than 0".to_string());
            }
        }

        if !errors.is_empty() {
            return Err(TrainingError::validation(errors));
        }

        Ok(())
    }

    /// Where the evaluation histogram is written; defaults to
    /// `<output_dir>/acc_histogram.png`.
    pub fn histogram_path(&self) -> PathBuf {
        self.runtime
            .histogram_path
            .clone()
            .unwrap_or_else(|| self.runtime.output_dir.join(DEFAULT_HISTOGRAM_FILENAME))
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.runtime.output_dir.join("checkpoints")
    }

    fn apply_base_path(&mut self, base: &Path) {
        self.data.apply_base_path(base);
        self.distillation.apply_base_path(base);
        self.runtime.apply_base_path(base);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    pub num_classes: usize,
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,
    #[serde(default)]
    pub dropout: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    pub train_data: PathBuf,
    #[serde(default)]
    pub validation_data: Option<PathBuf>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_true")]
    pub shuffle: bool,
    #[serde(default = "default_true")]
    pub drop_last: bool,
}

impl DataConfig {
    fn apply_base_path(&mut self, base: &Path) {
        absolutize_in_place(&mut self.train_data, base);
        if let Some(path) = self.validation_data.as_mut() {
            absolutize_in_place(path, base);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default)]
    pub algorithm: OptimizerType,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f32,
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f32,
    #[serde(default = "default_beta1")]
    pub beta1: f32,
    #[serde(default = "default_beta2")]
    pub beta2: f32,
    #[serde(default = "default_adam_eps")]
    pub epsilon: f32,
    /// Global gradient-norm ceiling; `None` disables clipping.
    #[serde(default)]
    pub clip_grad: Option<f32>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            algorithm: OptimizerType::default(),
            learning_rate: default_learning_rate(),
            weight_decay: default_weight_decay(),
            beta1: default_beta1(),
            beta2: default_beta2(),
            epsilon: default_adam_eps(),
            clip_grad: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerType {
    #[default]
    AdamW,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub strategy: LearningRateSchedule,
    #[serde(default)]
    pub warmup_epochs: Option<usize>,
    #[serde(default)]
    pub min_lr: Option<f32>,
    #[serde(default)]
    pub power: Option<f32>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LearningRateSchedule {
    Constant,
    #[default]
    Cosine,
    Polynomial,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AugmentationConfig {
    #[serde(default)]
    pub mixup_alpha: f32,
    #[serde(default)]
    pub cutmix_alpha: f32,
    #[serde(default = "default_mixup_prob")]
    pub mixup_prob: f32,
    #[serde(default = "default_mixup_switch_prob")]
    pub mixup_switch_prob: f32,
    #[serde(default = "default_label_smoothing")]
    pub label_smoothing: f32,
}

impl AugmentationConfig {
    pub fn is_mixing(&self) -> bool {
        self.mixup_alpha > 0.0 || self.cutmix_alpha > 0.0
    }
}

impl Default for AugmentationConfig {
    fn default() -> Self {
        Self {
            mixup_alpha: 0.0,
            cutmix_alpha: 0.0,
            mixup_prob: default_mixup_prob(),
            mixup_switch_prob: default_mixup_switch_prob(),
            label_smoothing: default_label_smoothing(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistillationConfig {
    #[serde(default)]
    pub kind: DistillationKind,
    #[serde(default = "default_distillation_alpha")]
    pub alpha: f32,
    #[serde(default = "default_distillation_tau")]
    pub tau: f32,
    #[serde(default)]
    pub teacher_weights: Option<PathBuf>,
    /// Hidden width of the teacher; defaults to the student's.
    #[serde(default)]
    pub teacher_hidden_size: Option<usize>,
}

impl DistillationConfig {
    fn apply_base_path(&mut self, base: &Path) {
        if let Some(path) = self.teacher_weights.as_mut() {
            absolutize_in_place(path, base);
        }
    }
}

impl Default for DistillationConfig {
    fn default() -> Self {
        Self {
            kind: DistillationKind::None,
            alpha: default_distillation_alpha(),
            tau: default_distillation_tau(),
            teacher_weights: None,
            teacher_hidden_size: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DistillationKind {
    #[default]
    None,
    Soft,
    Hard,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default)]
    pub precision: Precision,
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    #[serde(default = "default_print_freq")]
    pub print_freq: usize,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default)]
    pub histogram_path: Option<PathBuf>,
    #[serde(default)]
    pub cosub: bool,
    #[serde(default)]
    pub bce_loss: bool,
    #[serde(default)]
    pub nan_to_num: bool,
    #[serde(default)]
    pub continue_on_non_finite: bool,
    #[serde(default = "default_true")]
    pub use_loss_scaler: bool,
    #[serde(default)]
    pub model_ema_decay: Option<f64>,
    #[serde(default)]
    pub random_cls_token_position: bool,
    #[serde(default)]
    pub random_token_rank: bool,
    #[serde(default)]
    pub checkpoint: Option<CheckpointConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            seed: default_seed(),
            precision: Precision::default(),
            epochs: default_epochs(),
            print_freq: default_print_freq(),
            output_dir: default_output_dir(),
            histogram_path: None,
            cosub: false,
            bce_loss: false,
            nan_to_num: false,
            continue_on_non_finite: false,
            use_loss_scaler: true,
            model_ema_decay: None,
            random_cls_token_position: false,
            random_token_rank: false,
            checkpoint: None,
            logging: LoggingConfig::default(),
        }
    }
}

impl RuntimeConfig {
    fn apply_base_path(&mut self, base: &Path) {
        absolutize_in_place(&mut self.output_dir, base);
        if let Some(path) = self.histogram_path.as_mut() {
            absolutize_in_place(path, base);
        }
        if let Some(dir) = self.logging.tensorboard.as_mut() {
            absolutize_in_place(dir, base);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    #[serde(default = "default_checkpoint_every")]
    pub every_n_epochs: usize,
    #[serde(default)]
    pub max_keep: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub tensorboard: Option<PathBuf>,
    #[serde(default = "default_tensorboard_flush")]
    pub tensorboard_flush_every_n: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            tensorboard: None,
            tensorboard_flush_every_n: default_tensorboard_flush(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    #[default]
    Fp32,
    Fp16,
    Bf16,
    Mixed,
}

impl Precision {
    /// Dtype the forward pass runs in.
    pub fn compute_dtype(self) -> DType {
        match self {
            Precision::Fp32 => DType::F32,
            Precision::Fp16 => DType::F16,
            Precision::Bf16 | Precision::Mixed => DType::BF16,
        }
    }
}

fn absolutize_in_place(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

const DEFAULT_HISTOGRAM_FILENAME: &str = "acc_histogram.png";

fn default_hidden_size() -> usize {
    256
}

fn default_batch_size() -> usize {
    64
}

fn default_true() -> bool {
    true
}

fn default_learning_rate() -> f32 {
    5e-4
}

fn default_weight_decay() -> f32 {
    0.05
}

fn default_beta1() -> f32 {
    0.9
}

fn default_beta2() -> f32 {
    0.999
}

fn default_adam_eps() -> f32 {
    1e-8
}

fn default_mixup_prob() -> f32 {
    1.0
}

fn default_mixup_switch_prob() -> f32 {
    0.5
}

fn default_label_smoothing() -> f32 {
    0.1
}

fn default_distillation_alpha() -> f32 {
    0.5
}

fn default_distillation_tau() -> f32 {
    1.0
}

fn default_seed() -> u64 {
    0
}

fn default_epochs() -> usize {
    300
}

fn default_print_freq() -> usize {
    10
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}

fn default_checkpoint_every() -> usize {
    1
}

fn default_tensorboard_flush() -> usize {
    16
}

#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    ConfigFormat(String),
    #[error("invalid configuration: {}", .0.join("; "))]
    Validation(Vec<String>),
    #[error("trainer initialization failed: {0}")]
    Initialization(String),
    #[error("training failed: {0}")]
    Runtime(String),
    #[error("failed to render chart: {0}")]
    Render(String),
    #[error("loss is {value}, stopping training (epoch {epoch}, iteration {iteration})")]
    NonFiniteLoss {
        value: f64,
        epoch: usize,
        iteration: usize,
    },
}

impl TrainingError {
    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(messages)
    }

    pub fn is_non_finite_loss(&self) -> bool {
        matches!(self, Self::NonFiniteLoss { .. })
    }
}

impl From<toml::de::Error> for TrainingError {
    fn from(value: toml::de::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<serde_json::Error> for TrainingError {
    fn from(value: serde_json::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}
