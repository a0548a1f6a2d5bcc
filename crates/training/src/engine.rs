use std::{collections::BTreeMap, path::Path};

use candle_core::{Device, Tensor, Var};
use tracing::{error, info, warn};

use crate::{
    config::{Precision, TrainingConfig},
    data::DataBatch,
    ema::ModelEma,
    histogram::{render_histogram, TopKHistogram},
    loss::{
        accuracy, binarize_targets, nan_to_num, scalar_value, BinaryCrossEntropyLoss, CosubLoss,
        Criterion, CrossEntropyLoss,
    },
    metrics::{MeterFormat, MetricLogger, ProcessGroup, ProgressLogger, SmoothedValue},
    mixup::Mixup,
    model::{ForwardOptions, ImageClassifier},
    optimizer::{clip_grad_norm, Autocast, GradientScaler, Optimizer},
    TrainingError,
};

/// What to do when a batch produces a NaN or infinite loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NonFinitePolicy {
    /// Return [`TrainingError::NonFiniteLoss`] to the caller.
    #[default]
    Abort,
    /// Drop the batch and move on.
    Skip,
}

/// Per-epoch knobs of the training pass.
#[derive(Debug, Clone)]
pub struct TrainStepConfig {
    pub epoch: usize,
    pub precision: Precision,
    pub clip_grad: Option<f64>,
    pub cosub: bool,
    pub bce_loss: bool,
    pub nan_to_num: bool,
    pub non_finite: NonFinitePolicy,
    pub forward: ForwardOptions,
    pub print_freq: usize,
}

impl TrainStepConfig {
    pub fn from_config(config: &TrainingConfig, epoch: usize) -> Self {
        let runtime = &config.runtime;
        Self {
            epoch,
            precision: runtime.precision,
            clip_grad: config.optimizer.clip_grad.map(f64::from),
            cosub: runtime.cosub,
            bce_loss: runtime.bce_loss,
            nan_to_num: runtime.nan_to_num,
            non_finite: if runtime.continue_on_non_finite {
                NonFinitePolicy::Skip
            } else {
                NonFinitePolicy::Abort
            },
            forward: ForwardOptions {
                random_cls_token_position: runtime.random_cls_token_position,
                random_token_rank: runtime.random_token_rank,
            },
            print_freq: runtime.print_freq,
        }
    }
}

impl Default for TrainStepConfig {
    fn default() -> Self {
        Self {
            epoch: 0,
            precision: Precision::Fp32,
            clip_grad: None,
            cosub: false,
            bce_loss: false,
            nan_to_num: false,
            non_finite: NonFinitePolicy::Abort,
            forward: ForwardOptions::default(),
            print_freq: 10,
        }
    }
}

/// Epoch averages plus bookkeeping about dropped batches.
#[derive(Debug, Clone, Default)]
pub struct EpochStats {
    pub averages: BTreeMap<String, f64>,
    /// Batches that reached the optimizer.
    pub steps: usize,
    /// Batches dropped for a non-finite loss.
    pub skipped: usize,
    /// Batches whose scaled gradients overflowed.
    pub overflowed: usize,
}

impl EpochStats {
    pub fn get(&self, name: &str) -> Option<f64> {
        self.averages.get(name).copied()
    }
}

/// One pass over `batches`: forward, loss, validity check, backward and
/// update for every batch, then metric averages merged across `group`.
#[allow(clippy::too_many_arguments)]
pub fn train_one_epoch<I, O>(
    model: &dyn ImageClassifier,
    criterion: &dyn Criterion,
    batches: I,
    optimizer: &mut O,
    device: &Device,
    config: &TrainStepConfig,
    mut scaler: Option<&mut GradientScaler>,
    mut ema: Option<&mut ModelEma>,
    mut mixup: Option<&mut Mixup>,
    group: &dyn ProcessGroup,
) -> Result<EpochStats, TrainingError>
where
    I: IntoIterator<Item = Result<DataBatch, TrainingError>>,
    O: Optimizer + ?Sized,
{
    if optimizer.is_second_order() {
        return Err(TrainingError::initialization(
            "second-order optimizers are not supported: gradients cannot be differentiated again",
        ));
    }

    model.set_training(true);
    let named_parameters = model.named_parameters();
    let parameters: Vec<Var> = named_parameters.iter().map(|(_, var)| var.clone()).collect();
    let autocast = Autocast::new(config.precision);
    let cosub = config
        .cosub
        .then(|| CosubLoss::new(Box::new(BinaryCrossEntropyLoss)));

    let mut metrics = MetricLogger::default();
    metrics.add_meter("lr", SmoothedValue::new(1, MeterFormat::Value { precision: 6 }));

    let batches = batches.into_iter();
    let mut progress = ProgressLogger::new(
        format!("Epoch: [{}]", config.epoch),
        config.print_freq,
        batches.size_hint().1,
    );
    let mut stats = EpochStats::default();

    for (iteration, batch) in batches.enumerate() {
        progress.batch_loaded();
        let mut batch = batch?.to_device(device)?;
        if let Some(mixup) = mixup.as_deref_mut() {
            batch = mixup.apply(&batch)?;
        }

        let samples = if config.cosub {
            Tensor::cat(&[&batch.samples, &batch.samples], 0).map_err(to_runtime_error)?
        } else {
            batch.samples.clone()
        };

        let outputs = autocast.forward(model, &samples, &config.forward)?;
        let targets = if config.bce_loss {
            let classes = outputs.dims().get(1).copied().unwrap_or(0);
            binarize_targets(&batch.targets, classes)?
        } else {
            batch.targets.clone()
        };

        let mut loss = match &cosub {
            Some(cosub) => cosub.loss(&samples, &outputs, &targets)?,
            None => criterion.loss(&samples, &outputs, &targets)?,
        };
        if config.nan_to_num {
            loss = nan_to_num(&loss)?;
        }

        let loss_value = scalar_value(&loss)? as f64;
        if !loss_value.is_finite() {
            match config.non_finite {
                NonFinitePolicy::Skip => {
                    warn!(
                        epoch = config.epoch,
                        iteration, "Loss is {}, skipping batch", loss_value
                    );
                    optimizer.zero_grad();
                    stats.skipped += 1;
                    progress.step_done(iteration, &metrics);
                    continue;
                }
                NonFinitePolicy::Abort => {
                    error!(
                        epoch = config.epoch,
                        iteration, "Loss is {}, stopping training", loss_value
                    );
                    return Err(TrainingError::NonFiniteLoss {
                        value: loss_value,
                        epoch: config.epoch,
                        iteration,
                    });
                }
            }
        }

        optimizer.zero_grad();
        match scaler.as_deref_mut() {
            Some(scaler) => {
                let outcome =
                    scaler.backward_step(&loss, optimizer, &parameters, config.clip_grad)?;
                if outcome.overflowed {
                    stats.overflowed += 1;
                } else {
                    stats.steps += 1;
                }
            }
            None => {
                let mut grads = loss.backward().map_err(to_runtime_error)?;
                clip_grad_norm(&mut grads, &parameters, config.clip_grad)?;
                optimizer.step(&mut grads)?;
                stats.steps += 1;
            }
        }

        device.synchronize().map_err(to_runtime_error)?;
        if let Some(ema) = ema.as_deref_mut() {
            ema.update(&named_parameters)?;
        }

        metrics.update("loss", loss_value);
        metrics.update("lr", optimizer.learning_rate());
        progress.step_done(iteration, &metrics);
    }
    progress.finish();

    metrics.synchronize(group)?;
    info!("Averaged stats: {}", metrics);
    if stats.skipped > 0 {
        warn!(
            epoch = config.epoch,
            skipped = stats.skipped,
            "batches dropped for non-finite loss"
        );
    }

    stats.averages = metrics.global_averages();
    Ok(stats)
}

/// Evaluation averages together with the raw top-5 probability mass.
#[derive(Debug, Clone)]
pub struct EvaluationReport {
    pub stats: BTreeMap<String, f64>,
    pub histogram: TopKHistogram,
}

impl EvaluationReport {
    pub fn acc1(&self) -> f64 {
        self.stats.get("acc1").copied().unwrap_or(0.0)
    }

    pub fn acc5(&self) -> f64 {
        self.stats.get("acc5").copied().unwrap_or(0.0)
    }

    pub fn loss(&self) -> f64 {
        self.stats.get("loss").copied().unwrap_or(f64::NAN)
    }
}

/// Runs the model in eval mode over `batches`, tracking cross-entropy,
/// top-1/top-5 accuracy and the top-5 probability histogram.
pub fn evaluate<I>(
    model: &dyn ImageClassifier,
    batches: I,
    device: &Device,
    precision: Precision,
    group: &dyn ProcessGroup,
) -> Result<EvaluationReport, TrainingError>
where
    I: IntoIterator<Item = Result<DataBatch, TrainingError>>,
{
    let criterion = CrossEntropyLoss::new();
    let autocast = Autocast::new(precision);
    let was_training = model.is_training();
    model.set_training(false);

    let mut metrics = MetricLogger::default();
    let mut histogram = TopKHistogram::new();
    let batches = batches.into_iter();
    let mut progress = ProgressLogger::new("Test:", 10, batches.size_hint().1);

    let result = (|| {
        for (iteration, batch) in batches.enumerate() {
            progress.batch_loaded();
            let batch = batch?.to_device(device)?;
            let outputs = autocast
                .forward(model, &batch.samples, &ForwardOptions::default())?
                .detach();
            let loss = criterion.compute(&outputs, &batch.targets)?;
            histogram.accumulate(&outputs)?;
            let acc = accuracy(&outputs, &batch.targets, &[1, 5])?;

            let batch_size = batch.batch_size() as u64;
            metrics.update("loss", scalar_value(&loss)? as f64);
            metrics.update_n("acc1", acc[0], batch_size);
            metrics.update_n("acc5", acc[1], batch_size);
            progress.step_done(iteration, &metrics);
        }
        progress.finish();
        Ok::<(), TrainingError>(())
    })();
    model.set_training(was_training);
    result?;

    metrics.synchronize(group)?;
    histogram.synchronize(group)?;

    let stats = metrics.global_averages();
    info!(
        "* Acc@1 {:.3} Acc@5 {:.3} loss {:.3}",
        stats.get("acc1").copied().unwrap_or(0.0),
        stats.get("acc5").copied().unwrap_or(0.0),
        stats.get("loss").copied().unwrap_or(f64::NAN)
    );
    Ok(EvaluationReport { stats, histogram })
}

/// [`evaluate`] followed by writing the normalized histogram to
/// `histogram_path` on the main process.
pub fn evaluate_and_render<I>(
    model: &dyn ImageClassifier,
    batches: I,
    device: &Device,
    precision: Precision,
    group: &dyn ProcessGroup,
    histogram_path: &Path,
) -> Result<EvaluationReport, TrainingError>
where
    I: IntoIterator<Item = Result<DataBatch, TrainingError>>,
{
    let report = evaluate(model, batches, device, precision, group)?;
    if group.is_main_process() {
        let distribution = report.histogram.normalized().ok_or_else(|| {
            TrainingError::runtime("cannot render a histogram for an empty validation set")
        })?;
        render_histogram(&distribution, histogram_path)?;
        info!(path = %histogram_path.display(), "wrote top-5 histogram");
    }
    Ok(report)
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::AugmentationConfig,
        metrics::SingleProcess,
        model::{MlpClassifier, MlpConfig},
        optimizer::{
            AdamWConfig, LossScaleConfig, OptimizerConfig, TrainerOptimizer,
            TrainerOptimizerOptions,
        },
    };
    use candle_core::{backprop::GradStore, DType};

    const FEATURES: usize = 6;
    const CLASSES: usize = 4;

    #[derive(Default)]
    struct CountingOptimizer {
        steps: usize,
        zero_grads: usize,
        second_order: bool,
    }

    impl Optimizer for CountingOptimizer {
        fn zero_grad(&mut self) {
            self.zero_grads += 1;
        }

        fn step(&mut self, _grads: &mut GradStore) -> Result<(), TrainingError> {
            self.steps += 1;
            Ok(())
        }

        fn learning_rate(&self) -> f64 {
            1e-3
        }

        fn set_learning_rate(&mut self, _lr: f64) {}

        fn is_second_order(&self) -> bool {
            self.second_order
        }
    }

    fn model() -> MlpClassifier {
        MlpClassifier::new(MlpConfig {
            input_dim: FEATURES,
            hidden_dim: 8,
            num_classes: CLASSES,
            dropout: 0.0,
            dtype: DType::F32,
            device: Device::Cpu,
        })
        .unwrap()
    }

    fn batch(value: f32, size: usize) -> Result<DataBatch, TrainingError> {
        let samples = Tensor::full(value, (size, FEATURES), &Device::Cpu).unwrap();
        let labels: Vec<u32> = (0..size as u32).map(|i| i % CLASSES as u32).collect();
        let targets = Tensor::from_vec(labels, (size,), &Device::Cpu).unwrap();
        Ok(DataBatch::new(samples, targets))
    }

    fn run(
        batches: Vec<Result<DataBatch, TrainingError>>,
        optimizer: &mut CountingOptimizer,
        config: &TrainStepConfig,
    ) -> Result<EpochStats, TrainingError> {
        let model = model();
        train_one_epoch(
            &model,
            &CrossEntropyLoss::new(),
            batches,
            optimizer,
            &Device::Cpu,
            config,
            None,
            None,
            None,
            &SingleProcess,
        )
    }

    #[test]
    fn finite_batches_step_exactly_once_each() {
        let mut optimizer = CountingOptimizer::default();
        let stats = run(
            vec![batch(0.5, 4), batch(-0.5, 4), batch(1.0, 4)],
            &mut optimizer,
            &TrainStepConfig::default(),
        )
        .unwrap();
        assert_eq!(optimizer.steps, 3);
        assert_eq!(stats.steps, 3);
        assert_eq!(stats.skipped, 0);
        assert!(stats.get("loss").unwrap().is_finite());
        assert_eq!(stats.get("lr"), Some(1e-3));
    }

    #[test]
    fn skip_policy_zeroes_and_continues() {
        let mut optimizer = CountingOptimizer::default();
        let config = TrainStepConfig {
            non_finite: NonFinitePolicy::Skip,
            ..TrainStepConfig::default()
        };
        let stats = run(
            vec![batch(0.5, 4), batch(f32::NAN, 4), batch(1.0, 4)],
            &mut optimizer,
            &config,
        )
        .unwrap();
        assert_eq!(optimizer.steps, 2);
        assert_eq!(optimizer.zero_grads, 3);
        assert_eq!(stats.skipped, 1);
        assert!(stats.get("loss").unwrap().is_finite());
    }

    #[test]
    fn abort_policy_reports_without_stepping() {
        let mut optimizer = CountingOptimizer::default();
        let err = run(
            vec![batch(0.5, 4), batch(f32::NAN, 4), batch(1.0, 4)],
            &mut optimizer,
            &TrainStepConfig {
                epoch: 7,
                ..TrainStepConfig::default()
            },
        )
        .unwrap_err();
        assert!(err.is_non_finite_loss());
        match err {
            TrainingError::NonFiniteLoss {
                epoch, iteration, ..
            } => {
                assert_eq!(epoch, 7);
                assert_eq!(iteration, 1);
            }
            other => panic!("unexpected error {other}"),
        }
        assert_eq!(optimizer.steps, 1);
    }

    #[test]
    fn nan_to_num_keeps_training_going() {
        let mut optimizer = CountingOptimizer::default();
        let config = TrainStepConfig {
            nan_to_num: true,
            ..TrainStepConfig::default()
        };
        let stats = run(vec![batch(f32::NAN, 4)], &mut optimizer, &config).unwrap();
        assert_eq!(optimizer.steps, 1);
        assert_eq!(stats.get("loss"), Some(0.0));
    }

    #[test]
    fn second_order_optimizer_is_rejected_up_front() {
        let mut optimizer = CountingOptimizer {
            second_order: true,
            ..CountingOptimizer::default()
        };
        assert!(run(vec![batch(0.5, 4)], &mut optimizer, &TrainStepConfig::default()).is_err());
        assert_eq!(optimizer.steps, 0);
    }

    #[test]
    fn cosub_with_mixup_scaler_and_ema_trains_real_parameters() {
        let model = model();
        let mut optimizer = TrainerOptimizer::new(
            model.named_parameters(),
            OptimizerConfig::AdamW(AdamWConfig {
                learning_rate: 1e-2,
                beta1: 0.9,
                beta2: 0.999,
                epsilon: 1e-8,
                weight_decay: 0.0,
            }),
            TrainerOptimizerOptions::default(),
        )
        .unwrap();
        let mut scaler = GradientScaler::new(Precision::Fp32);
        let mut ema = ModelEma::new(&model, 0.9).unwrap();
        let mut mixup = Mixup::new(
            &AugmentationConfig {
                mixup_alpha: 0.8,
                ..AugmentationConfig::default()
            },
            CLASSES,
            3,
        )
        .unwrap();
        let before = crate::model::parameter_tensors(&model)["head.weight"]
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();

        let config = TrainStepConfig {
            cosub: true,
            clip_grad: Some(1.0),
            ..TrainStepConfig::default()
        };
        let stats = train_one_epoch(
            &model,
            &CrossEntropyLoss::new(),
            vec![batch(0.5, 4), batch(-1.0, 4)],
            &mut optimizer,
            &Device::Cpu,
            &config,
            Some(&mut scaler),
            Some(&mut ema),
            Some(&mut mixup),
            &SingleProcess,
        )
        .unwrap();

        assert_eq!(stats.steps, 2);
        assert_eq!(ema.num_updates(), 2);
        let after = crate::model::parameter_tensors(&model)["head.weight"]
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn bce_loss_binarizes_mixed_targets_and_steps() {
        let model = model();
        let mut optimizer = CountingOptimizer::default();
        let mut mixup = Mixup::new(
            &AugmentationConfig {
                mixup_alpha: 0.8,
                label_smoothing: 0.1,
                ..AugmentationConfig::default()
            },
            CLASSES,
            9,
        )
        .unwrap();
        let config = TrainStepConfig {
            bce_loss: true,
            ..TrainStepConfig::default()
        };
        let stats = train_one_epoch(
            &model,
            &BinaryCrossEntropyLoss,
            vec![batch(0.5, 4), batch(-0.5, 4)],
            &mut optimizer,
            &Device::Cpu,
            &config,
            None,
            None,
            Some(&mut mixup),
            &SingleProcess,
        )
        .unwrap();
        assert_eq!(optimizer.steps, 2);
        assert_eq!(stats.steps, 2);
        let loss = stats.get("loss").unwrap();
        assert!(loss.is_finite() && loss > 0.0);
    }

    /// Logits are the inputs scaled per feature by one trainable vector.
    struct FeatureScale {
        weight: Var,
    }

    impl ImageClassifier for FeatureScale {
        fn forward(&self, xs: &Tensor, _options: &ForwardOptions) -> candle_core::Result<Tensor> {
            xs.to_dtype(DType::F32)?.broadcast_mul(self.weight.as_tensor())
        }

        fn set_training(&self, _training: bool) {}

        fn is_training(&self) -> bool {
            true
        }

        fn named_parameters(&self) -> Vec<(String, Var)> {
            vec![("weight".to_string(), self.weight.clone())]
        }
    }

    #[test]
    fn overflowing_scaled_gradients_skip_the_step_and_back_off() {
        let model = FeatureScale {
            weight: Var::ones(FEATURES, DType::F32, &Device::Cpu).unwrap(),
        };
        let mut optimizer = CountingOptimizer::default();
        let mut scaler = GradientScaler::with_config(
            LossScaleConfig {
                initial_scale: f32::MAX,
                max_scale: f32::MAX,
                ..LossScaleConfig::default()
            },
            Precision::Bf16,
        );
        let config = TrainStepConfig {
            precision: Precision::Bf16,
            ..TrainStepConfig::default()
        };
        // Equal logits keep the loss at ln(6) while the scaled gradients
        // blow past f32::MAX.
        let stats = train_one_epoch(
            &model,
            &CrossEntropyLoss::new(),
            vec![batch(1e10, 4), batch(1e10, 4)],
            &mut optimizer,
            &Device::Cpu,
            &config,
            Some(&mut scaler),
            None,
            None,
            &SingleProcess,
        )
        .unwrap();

        assert_eq!(stats.overflowed, 2);
        assert_eq!(stats.steps, 0);
        assert_eq!(optimizer.steps, 0);
        assert!(scaler.loss_scale() < f32::MAX);
        let loss = stats.get("loss").unwrap();
        assert!((loss - (FEATURES as f64).ln()).abs() < 1e-3);
    }

    #[test]
    fn evaluation_histogram_is_normalized_and_rendered() {
        let model = model();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("eval").join("acc_histogram.png");
        let report = evaluate_and_render(
            &model,
            vec![batch(0.3, 5), batch(-0.2, 3)],
            &Device::Cpu,
            Precision::Fp32,
            &SingleProcess,
            &path,
        )
        .unwrap();

        let pdf = report.histogram.normalized().unwrap();
        assert!((pdf.iter().sum::<f64>() - 1.0).abs() < 1e-9);
        assert_eq!(report.histogram.samples(), 8);
        // Only four classes, so every label is inside the top five.
        assert_eq!(report.acc5(), 100.0);
        assert!(report.loss().is_finite());
        assert!(path.exists());
        assert!(model.is_training());
    }

    #[test]
    fn empty_validation_set_cannot_be_rendered() {
        let model = model();
        let dir = tempfile::tempdir().unwrap();
        let result = evaluate_and_render(
            &model,
            Vec::new(),
            &Device::Cpu,
            Precision::Fp32,
            &SingleProcess,
            &dir.path().join("h.png"),
        );
        assert!(result.is_err());
    }
}
