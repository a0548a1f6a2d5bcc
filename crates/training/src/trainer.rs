use std::{collections::BTreeMap, path::Path, time::Instant};

use candle_core::{
    utils::{cuda_is_available, metal_is_available},
    DType, Device,
};
use tracing::{debug, info, warn};

use crate::{
    checkpoint::{self, CheckpointDescriptor, LoadOutcome, SaveRequest},
    config::DistillationKind,
    data::{BlockingDataLoader, TensorDataLoader},
    ema::ModelEma,
    engine::{
        evaluate, evaluate_and_render, train_one_epoch, EpochStats, EvaluationReport,
        TrainStepConfig,
    },
    logging::{peak_memory_mb, EpochRecord, Logger, LoggingSettings},
    loss::{
        BinaryCrossEntropyLoss, Criterion, CrossEntropyLoss, DistillationLoss,
        SoftTargetCrossEntropy,
    },
    metrics::{format_duration, SingleProcess},
    mixup::Mixup,
    model::{ImageClassifier, MlpClassifier, MlpConfig},
    optimizer::{
        GradientScaler, Optimizer, OptimizerConfig, TrainerOptimizer, TrainerOptimizerOptions,
    },
    scheduler::{LRScheduler, SchedulerConfig},
    TrainingConfig, TrainingError,
};

/// Owns everything one run needs and drives it epoch by epoch.
pub struct Trainer {
    config: TrainingConfig,
    device: Device,
    model: MlpClassifier,
    criterion: Box<dyn Criterion>,
    train_loader: BlockingDataLoader<TensorDataLoader>,
    val_loader: Option<BlockingDataLoader<TensorDataLoader>>,
    optimizer: TrainerOptimizer,
    scheduler: Box<dyn LRScheduler>,
    scaler: Option<GradientScaler>,
    ema: Option<ModelEma>,
    mixup: Option<Mixup>,
    logger: Logger,
    group: SingleProcess,
    start_epoch: usize,
    best_acc1: f64,
}

impl Trainer {
    pub fn new(config: TrainingConfig) -> Result<Self, TrainingError> {
        config.validate()?;

        let device = select_device();
        if let Err(err) = device.set_seed(config.runtime.seed) {
            debug!("device RNG not seeded: {err}");
        }

        let data = &config.data;
        let train_loader = TensorDataLoader::from_safetensors(
            &data.train_data,
            data.batch_size,
            data.shuffle,
            data.drop_last,
            config.runtime.seed,
        )?;
        let val_loader = match data.validation_data.as_ref() {
            Some(path) => Some(BlockingDataLoader::new(TensorDataLoader::from_safetensors(
                path,
                data.batch_size,
                false,
                false,
                config.runtime.seed,
            )?)),
            None => None,
        };
        let input_dim: usize = train_loader.sample_shape().iter().product();
        info!(
            samples = train_loader.num_samples(),
            batches = train_loader.num_batches(),
            input_dim,
            "training data ready"
        );
        let train_loader = BlockingDataLoader::new(train_loader);

        let model = MlpClassifier::new(MlpConfig {
            input_dim,
            hidden_dim: config.model.hidden_size,
            num_classes: config.model.num_classes,
            dropout: config.model.dropout,
            dtype: DType::F32,
            device: device.clone(),
        })?;
        info!("number of params: {}", model.num_parameters());

        let criterion = build_criterion(&config, &device, input_dim)?;

        let optimizer = TrainerOptimizer::new(
            model.named_parameters(),
            OptimizerConfig::from(&config.optimizer),
            TrainerOptimizerOptions::default(),
        )?;
        let scheduler = SchedulerConfig::from_training_config(
            &config.scheduler,
            config.optimizer.learning_rate as f64,
            config.runtime.epochs,
        )?
        .build()?;

        let scaler = config
            .runtime
            .use_loss_scaler
            .then(|| GradientScaler::new(config.runtime.precision));
        let ema = config
            .runtime
            .model_ema_decay
            .map(|decay| ModelEma::new(&model, decay))
            .transpose()?;
        let mixup = if config.augmentation.is_mixing() {
            Some(Mixup::new(
                &config.augmentation,
                config.model.num_classes,
                config.runtime.seed,
            )?)
        } else {
            None
        };

        let logger = Logger::new(LoggingSettings::from_config(&config.runtime))?;

        Ok(Self {
            config,
            device,
            model,
            criterion,
            train_loader,
            val_loader,
            optimizer,
            scheduler,
            scaler,
            ema,
            mixup,
            logger,
            group: SingleProcess,
            start_epoch: 0,
            best_acc1: 0.0,
        })
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn model(&self) -> &MlpClassifier {
        &self.model
    }

    /// Epoch the next call to [`Trainer::train_with_shutdown`] starts at.
    pub fn start_epoch(&self) -> usize {
        self.start_epoch
    }

    pub fn best_acc1(&self) -> f64 {
        self.best_acc1
    }

    pub fn resume_from_latest(&mut self) -> Result<Option<CheckpointDescriptor>, TrainingError> {
        let Some(descriptor) = checkpoint::latest_checkpoint(&self.config.checkpoint_dir())? else {
            return Ok(None);
        };
        info!(
            dir = %descriptor.directory.display(),
            epoch = descriptor.manifest.epoch,
            "resuming from checkpoint"
        );
        let outcome = checkpoint::load_checkpoint(&descriptor.directory)?;
        self.apply_checkpoint(outcome)?;
        Ok(Some(descriptor))
    }

    pub fn resume_from_path(&mut self, directory: &Path) -> Result<CheckpointDescriptor, TrainingError> {
        let outcome = checkpoint::load_checkpoint(directory)?;
        let manifest = outcome.manifest.clone();
        self.apply_checkpoint(outcome)?;
        Ok(CheckpointDescriptor {
            directory: directory.to_path_buf(),
            manifest,
        })
    }

    /// Evaluates the current weights on the validation set and renders the
    /// top-5 histogram.
    pub fn evaluate(&mut self) -> Result<EvaluationReport, TrainingError> {
        let histogram_path = self.config.histogram_path();
        let Some(loader) = self.val_loader.as_mut() else {
            return Err(TrainingError::runtime(
                "evaluation requires data.validation_data",
            ));
        };
        loader.inner_mut().set_epoch(0);
        evaluate_and_render(
            &self.model,
            &mut *loader,
            &self.device,
            self.config.runtime.precision,
            &self.group,
            &histogram_path,
        )
    }

    pub fn train(&mut self) -> Result<(), TrainingError> {
        self.train_with_shutdown(|| false)
    }

    /// Runs the remaining epochs; `should_stop` is polled between epochs.
    pub fn train_with_shutdown<F>(&mut self, mut should_stop: F) -> Result<(), TrainingError>
    where
        F: FnMut() -> bool,
    {
        let epochs = self.config.runtime.epochs;
        info!(
            "start training for {} epochs on {:?}",
            epochs.saturating_sub(self.start_epoch),
            self.device
        );
        let started = Instant::now();

        for epoch in self.start_epoch..epochs {
            if should_stop() {
                warn!(epoch, "stop requested; ending training early");
                break;
            }

            let lr = self.scheduler.step(epoch);
            self.optimizer.set_learning_rate(lr);
            self.train_loader.inner_mut().set_epoch(epoch);

            let step_config = TrainStepConfig::from_config(&self.config, epoch);
            let train_stats = train_one_epoch(
                &self.model,
                self.criterion.as_ref(),
                &mut self.train_loader,
                &mut self.optimizer,
                &self.device,
                &step_config,
                self.scaler.as_mut(),
                self.ema.as_mut(),
                self.mixup.as_mut(),
                &self.group,
            )?;

            let test = self.evaluate_epoch()?;
            if let Some(acc1) = test.get("acc1").copied() {
                self.best_acc1 = self.best_acc1.max(acc1);
                info!("max accuracy: {:.2}%", self.best_acc1);
            }

            self.log_epoch(epoch, &train_stats, test)?;
            self.maybe_checkpoint(epoch)?;
            self.start_epoch = epoch + 1;
        }

        self.logger.flush();
        info!("training time {}", format_duration(started.elapsed()));
        Ok(())
    }

    fn evaluate_epoch(&mut self) -> Result<BTreeMap<String, f64>, TrainingError> {
        if self.val_loader.is_none() {
            return Ok(Default::default());
        }
        let mut stats = self.evaluate()?.stats;

        if let (Some(ema), Some(loader)) = (self.ema.as_ref(), self.val_loader.as_mut()) {
            loader.inner_mut().set_epoch(0);
            let params = self.model.named_parameters();
            let model = &self.model;
            let device = &self.device;
            let precision = self.config.runtime.precision;
            let group = &self.group;
            let report = ema.with_shadow_weights(&params, || {
                evaluate(model, &mut *loader, device, precision, group)
            })?;
            for (key, value) in report.stats {
                stats.insert(format!("ema_{key}"), value);
            }
        }
        Ok(stats)
    }

    fn log_epoch(
        &mut self,
        epoch: usize,
        train: &EpochStats,
        test: BTreeMap<String, f64>,
    ) -> Result<(), TrainingError> {
        let record = EpochRecord {
            epoch,
            train: train.averages.clone(),
            test,
            n_parameters: self.model.num_parameters(),
            max_mem_gpu: peak_memory_mb(),
        };
        self.logger.log_epoch(&record)
    }

    fn maybe_checkpoint(&mut self, epoch: usize) -> Result<(), TrainingError> {
        let Some(settings) = self.config.runtime.checkpoint.as_ref() else {
            return Ok(());
        };
        let is_last = epoch + 1 == self.config.runtime.epochs;
        if !is_last && (epoch + 1) % settings.every_n_epochs.max(1) != 0 {
            return Ok(());
        }

        let base_dir = self.config.checkpoint_dir();
        checkpoint::save_checkpoint(SaveRequest {
            base_dir: &base_dir,
            config: &self.config,
            model: &self.model,
            model_ema: self.ema.as_ref(),
            optimizer: &self.optimizer,
            scheduler: Some(self.scheduler.as_ref()),
            scaler: self.scaler.as_ref(),
            epoch,
            best_acc1: self.best_acc1,
            max_keep: settings.max_keep,
        })?;
        Ok(())
    }

    fn apply_checkpoint(&mut self, outcome: LoadOutcome) -> Result<(), TrainingError> {
        let LoadOutcome {
            manifest,
            optimizer_state,
            scheduler_state,
            scaler_state,
            model_weights_path,
            ema_weights_path,
        } = outcome;

        checkpoint::apply_weights(&self.model.named_parameters(), &model_weights_path)?;
        self.optimizer.load_state(optimizer_state)?;

        if let Some(state) = scheduler_state {
            self.scheduler.load_state(state);
            self.optimizer
                .set_learning_rate(self.scheduler.learning_rate());
        }

        match (self.scaler.as_mut(), scaler_state) {
            (Some(scaler), Some(state)) => scaler.load_state(state),
            (None, Some(_)) => warn!("checkpoint carries loss-scaler state but scaling is disabled"),
            _ => {}
        }

        match (self.ema.as_mut(), ema_weights_path) {
            (Some(ema), Some(path)) => {
                ema.load_shadow(checkpoint::load_tensors(&path, &self.device)?)?;
            }
            (Some(_), None) => warn!("checkpoint has no EMA weights; EMA restarts from the model"),
            _ => {}
        }

        self.start_epoch = manifest.epoch + 1;
        self.best_acc1 = manifest.best_acc1;
        Ok(())
    }
}

fn select_device() -> Device {
    if cuda_is_available() {
        match Device::cuda_if_available(0) {
            Ok(device) => {
                info!("device: using CUDA GPU #0");
                return device;
            }
            Err(err) => warn!("cuda reported available but initialization failed: {err}"),
        }
    }
    if metal_is_available() {
        match Device::new_metal(0) {
            Ok(device) => {
                info!("device: using Metal GPU #0");
                return device;
            }
            Err(err) => warn!("failed to initialize metal device, falling back to CPU: {err}"),
        }
    }
    info!("device: using CPU");
    Device::Cpu
}

/// Soft-target CE under mixing, label-smoothed CE otherwise, BCE when
/// requested; wrapped for distillation when a teacher is configured.
fn build_criterion(
    config: &TrainingConfig,
    device: &Device,
    input_dim: usize,
) -> Result<Box<dyn Criterion>, TrainingError> {
    let aug = &config.augmentation;
    let base: Box<dyn Criterion> = if config.runtime.bce_loss {
        Box::new(BinaryCrossEntropyLoss)
    } else if aug.is_mixing() {
        Box::new(SoftTargetCrossEntropy)
    } else if aug.label_smoothing > 0.0 {
        Box::new(CrossEntropyLoss::new().with_label_smoothing(aug.label_smoothing)?)
    } else {
        Box::new(CrossEntropyLoss::new())
    };

    let distill = &config.distillation;
    if distill.kind == DistillationKind::None {
        return Ok(Box::new(DistillationLoss::plain(base)));
    }

    let weights = distill.teacher_weights.as_ref().ok_or_else(|| {
        TrainingError::initialization("distillation requires distillation.teacher_weights")
    })?;
    let mut teacher = MlpClassifier::new(MlpConfig {
        input_dim,
        hidden_dim: distill.teacher_hidden_size.unwrap_or(config.model.hidden_size),
        num_classes: config.model.num_classes,
        dropout: 0.0,
        dtype: DType::F32,
        device: device.clone(),
    })?;
    teacher.load_weights(weights)?;
    info!(weights = %weights.display(), kind = ?distill.kind, "loaded distillation teacher");

    Ok(Box::new(DistillationLoss::new(
        base,
        Box::new(teacher),
        distill.kind,
        distill.alpha as f64,
        distill.tau as f64,
    )?))
}
