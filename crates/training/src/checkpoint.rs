use std::{
    collections::HashMap,
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use candle_core::{safetensors::load as load_safetensors, Device, Tensor, Var};
use hex::encode as hex_encode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::{
    ema::ModelEma,
    model::ImageClassifier,
    optimizer::{GradientScaler, GradientScalerState, OptimizerState, TrainerOptimizer},
    scheduler::{LRScheduler, SchedulerState},
    TrainingConfig, TrainingError,
};

pub const CHECKPOINT_VERSION: u32 = 1;
const MODEL_FILENAME: &str = "model.safetensors";
const EMA_FILENAME: &str = "model_ema.safetensors";
const OPTIMIZER_FILENAME: &str = "optimizer.json";
const SCHEDULER_FILENAME: &str = "scheduler.json";
const SCALER_FILENAME: &str = "scaler.json";
const MANIFEST_FILENAME: &str = "manifest.json";
const DIR_PREFIX: &str = "epoch_";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub filename: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub version: u32,
    pub created_unix_timestamp: u64,
    pub config_sha256: String,
    /// Last completed epoch.
    pub epoch: usize,
    pub best_acc1: f64,
    pub model: FileRecord,
    pub model_ema: Option<FileRecord>,
    pub optimizer: FileRecord,
    pub scheduler: Option<FileRecord>,
    pub scaler: Option<FileRecord>,
}

pub struct SaveRequest<'a> {
    pub base_dir: &'a Path,
    pub config: &'a TrainingConfig,
    pub model: &'a dyn ImageClassifier,
    pub model_ema: Option<&'a ModelEma>,
    pub optimizer: &'a TrainerOptimizer,
    pub scheduler: Option<&'a dyn LRScheduler>,
    pub scaler: Option<&'a GradientScaler>,
    pub epoch: usize,
    pub best_acc1: f64,
    pub max_keep: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct CheckpointDescriptor {
    pub directory: PathBuf,
    pub manifest: CheckpointManifest,
}

pub struct LoadOutcome {
    pub manifest: CheckpointManifest,
    pub optimizer_state: OptimizerState,
    pub scheduler_state: Option<SchedulerState>,
    pub scaler_state: Option<GradientScalerState>,
    pub model_weights_path: PathBuf,
    pub ema_weights_path: Option<PathBuf>,
}

pub fn save_checkpoint(request: SaveRequest<'_>) -> Result<CheckpointDescriptor, TrainingError> {
    fs::create_dir_all(request.base_dir).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to create checkpoint directory {}: {err}",
            request.base_dir.display()
        ))
    })?;

    let checkpoint_dir = request
        .base_dir
        .join(format!("{DIR_PREFIX}{:06}", request.epoch));
    if checkpoint_dir.exists() {
        fs::remove_dir_all(&checkpoint_dir).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to remove existing checkpoint directory {}: {err}",
                checkpoint_dir.display()
            ))
        })?;
    }
    fs::create_dir(&checkpoint_dir).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to create checkpoint directory {}: {err}",
            checkpoint_dir.display()
        ))
    })?;

    let model_path = checkpoint_dir.join(MODEL_FILENAME);
    let live: HashMap<String, Tensor> = request
        .model
        .named_parameters()
        .into_iter()
        .map(|(name, var)| (name, var.as_tensor().clone()))
        .collect();
    save_tensors(&live, &model_path)?;
    let model_record = file_record(&model_path)?;

    let ema_record = match request.model_ema {
        Some(ema) => {
            let path = checkpoint_dir.join(EMA_FILENAME);
            save_tensors(ema.shadow(), &path)?;
            Some(file_record(&path)?)
        }
        None => None,
    };

    let optimizer_path = checkpoint_dir.join(OPTIMIZER_FILENAME);
    write_json(&optimizer_path, &request.optimizer.state()?)?;
    let optimizer_record = file_record(&optimizer_path)?;

    let scheduler_record = match request.scheduler {
        Some(scheduler) => {
            let path = checkpoint_dir.join(SCHEDULER_FILENAME);
            write_json(&path, &scheduler.state())?;
            Some(file_record(&path)?)
        }
        None => None,
    };

    let scaler_record = match request.scaler.and_then(GradientScaler::state) {
        Some(state) => {
            let path = checkpoint_dir.join(SCALER_FILENAME);
            write_json(&path, &state)?;
            Some(file_record(&path)?)
        }
        None => None,
    };

    let manifest = CheckpointManifest {
        version: CHECKPOINT_VERSION,
        created_unix_timestamp: unix_timestamp(),
        config_sha256: fingerprint_config(request.config)?,
        epoch: request.epoch,
        best_acc1: request.best_acc1,
        model: model_record,
        model_ema: ema_record,
        optimizer: optimizer_record,
        scheduler: scheduler_record,
        scaler: scaler_record,
    };
    write_json(&checkpoint_dir.join(MANIFEST_FILENAME), &manifest)?;
    info!(epoch = request.epoch, dir = %checkpoint_dir.display(), "saved checkpoint");

    prune_checkpoints(request.base_dir, request.max_keep)?;

    Ok(CheckpointDescriptor {
        directory: checkpoint_dir,
        manifest,
    })
}

pub fn latest_checkpoint(base_dir: &Path) -> Result<Option<CheckpointDescriptor>, TrainingError> {
    let entries = checkpoint_directories(base_dir)?;
    let Some(path) = entries.into_iter().max() else {
        return Ok(None);
    };
    let manifest = load_manifest(&path)?;
    Ok(Some(CheckpointDescriptor {
        directory: path,
        manifest,
    }))
}

/// Reads and checksum-verifies every file of the checkpoint in `directory`.
pub fn load_checkpoint(directory: &Path) -> Result<LoadOutcome, TrainingError> {
    let manifest = load_manifest(directory)?;
    ensure_version_supported(manifest.version)?;

    let model_path = directory.join(&manifest.model.filename);
    validate_file(&model_path, &manifest.model.sha256)?;

    let ema_weights_path = match manifest.model_ema.as_ref() {
        Some(record) => {
            let path = directory.join(&record.filename);
            validate_file(&path, &record.sha256)?;
            Some(path)
        }
        None => None,
    };

    let optimizer_path = directory.join(&manifest.optimizer.filename);
    validate_file(&optimizer_path, &manifest.optimizer.sha256)?;
    let optimizer_state: OptimizerState = read_json(&optimizer_path)?;

    let scheduler_state = match manifest.scheduler.as_ref() {
        Some(record) => {
            let path = directory.join(&record.filename);
            validate_file(&path, &record.sha256)?;
            Some(read_json::<SchedulerState>(&path)?)
        }
        None => None,
    };

    let scaler_state = match manifest.scaler.as_ref() {
        Some(record) => {
            let path = directory.join(&record.filename);
            validate_file(&path, &record.sha256)?;
            Some(read_json::<GradientScalerState>(&path)?)
        }
        None => None,
    };

    Ok(LoadOutcome {
        manifest,
        optimizer_state,
        scheduler_state,
        scaler_state,
        model_weights_path: model_path,
        ema_weights_path,
    })
}

/// Reads a safetensors file into a name → tensor map on `device`.
pub fn load_tensors(path: &Path, device: &Device) -> Result<HashMap<String, Tensor>, TrainingError> {
    load_safetensors(path, device).map_err(|err| {
        TrainingError::runtime(format!("failed to read {}: {err}", path.display()))
    })
}

/// Copies the tensors stored at `weights_path` into `parameters`, which must
/// match the file name for name.
pub fn apply_weights(parameters: &[(String, Var)], weights_path: &Path) -> Result<(), TrainingError> {
    let Some((_, first)) = parameters.first() else {
        return Err(TrainingError::runtime("model contains no parameters"));
    };
    let device = first.as_tensor().device().clone();
    let mut by_name = load_tensors(weights_path, &device)?;

    for (name, var) in parameters {
        let tensor = by_name.remove(name).ok_or_else(|| {
            TrainingError::runtime(format!("checkpoint missing parameter {name}"))
        })?;
        let tensor = tensor
            .to_dtype(var.as_tensor().dtype())
            .map_err(to_runtime_error)?;
        var.set(&tensor).map_err(to_runtime_error)?;
    }

    if !by_name.is_empty() {
        let mut extra: Vec<_> = by_name.into_keys().collect();
        extra.sort();
        return Err(TrainingError::runtime(format!(
            "checkpoint contains unused parameters: {}",
            extra.join(", ")
        )));
    }
    Ok(())
}

fn save_tensors(tensors: &HashMap<String, Tensor>, path: &Path) -> Result<(), TrainingError> {
    if tensors.is_empty() {
        return Err(TrainingError::runtime(
            "model contains no parameters to checkpoint",
        ));
    }
    candle_core::safetensors::save(tensors, path).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to serialize weights to {}: {err}",
            path.display()
        ))
    })
}

fn fingerprint_config(config: &TrainingConfig) -> Result<String, TrainingError> {
    let json = serde_json::to_vec(config)?;
    Ok(hex_encode(Sha256::digest(json)))
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn file_record(path: &Path) -> Result<FileRecord, TrainingError> {
    let sha256 = sha256_file(path)?;
    let bytes = path
        .metadata()
        .map_err(|err| {
            TrainingError::runtime(format!(
                "failed to stat checkpoint file {}: {err}",
                path.display()
            ))
        })?
        .len();
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            TrainingError::runtime(format!(
                "checkpoint file name is not valid UTF-8: {}",
                path.display()
            ))
        })?
        .to_string();
    Ok(FileRecord {
        filename,
        sha256,
        bytes,
    })
}

fn checkpoint_directories(base: &Path) -> Result<Vec<PathBuf>, TrainingError> {
    let mut dirs = Vec::new();
    if !base.exists() {
        return Ok(dirs);
    }
    for entry in fs::read_dir(base)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if entry.file_name().to_string_lossy().starts_with(DIR_PREFIX) {
            dirs.push(entry.path());
        }
    }
    Ok(dirs)
}

fn prune_checkpoints(base: &Path, max_keep: Option<usize>) -> Result<(), TrainingError> {
    let Some(max_keep) = max_keep else {
        return Ok(());
    };
    let mut dirs = checkpoint_directories(base)?;
    if dirs.len() <= max_keep {
        return Ok(());
    }
    // Zero-padded epoch numbers sort chronologically.
    dirs.sort();
    let excess = dirs.len() - max_keep;
    for dir in dirs.into_iter().take(excess) {
        fs::remove_dir_all(&dir).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to prune checkpoint {}: {err}",
                dir.display()
            ))
        })?;
        debug!(dir = %dir.display(), "pruned checkpoint");
    }
    Ok(())
}

fn load_manifest(directory: &Path) -> Result<CheckpointManifest, TrainingError> {
    let manifest_path = directory.join(MANIFEST_FILENAME);
    if !manifest_path.is_file() {
        return Err(TrainingError::runtime(format!(
            "checkpoint manifest not found at {}",
            manifest_path.display()
        )));
    }
    read_json(&manifest_path)
}

fn ensure_version_supported(version: u32) -> Result<(), TrainingError> {
    if version != CHECKPOINT_VERSION {
        return Err(TrainingError::runtime(format!(
            "unsupported checkpoint version {} (expected {})",
            version, CHECKPOINT_VERSION
        )));
    }
    Ok(())
}

fn validate_file(path: &Path, expected_sha: &str) -> Result<(), TrainingError> {
    if sha256_file(path)? != expected_sha {
        return Err(TrainingError::runtime(format!(
            "checkpoint file {} failed checksum validation",
            path.display()
        )));
    }
    Ok(())
}

fn sha256_file(path: &Path) -> Result<String, TrainingError> {
    let mut file = File::open(path).map_err(|err| {
        TrainingError::runtime(format!("failed to open {}: {err}", path.display()))
    })?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 1024 * 1024];
    loop {
        let read = file.read(&mut buffer).map_err(|err| {
            TrainingError::runtime(format!("failed to read {}: {err}", path.display()))
        })?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex_encode(hasher.finalize()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), TrainingError> {
    let mut data = serde_json::to_vec_pretty(value)?;
    data.push(b'\n');
    let mut file = File::create(path).map_err(|err| {
        TrainingError::runtime(format!("failed to create {}: {err}", path.display()))
    })?;
    file.write_all(&data)
        .map_err(|err| TrainingError::runtime(format!("failed to write {}: {err}", path.display())))
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, TrainingError> {
    let file = File::open(path).map_err(|err| {
        TrainingError::runtime(format!("failed to open {}: {err}", path.display()))
    })?;
    serde_json::from_reader(file).map_err(|err| {
        TrainingError::runtime(format!("failed to parse JSON {}: {err}", path.display()))
    })
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::Precision,
        model::{parameter_tensors, MlpClassifier, MlpConfig},
        optimizer::{OptimizerConfig, TrainerOptimizerOptions},
        scheduler::{DecayShape, EpochScheduler, SchedulerConfig},
    };
    use candle_core::DType;

    const CONFIG: &str = r#"
        [model]
        num_classes = 3

        [data]
        train_data = "train.safetensors"
    "#;

    fn model() -> MlpClassifier {
        MlpClassifier::new(MlpConfig {
            input_dim: 4,
            hidden_dim: 5,
            num_classes: 3,
            dropout: 0.0,
            dtype: DType::F32,
            device: Device::Cpu,
        })
        .unwrap()
    }

    fn save(
        dir: &Path,
        model: &MlpClassifier,
        ema: Option<&ModelEma>,
        epoch: usize,
        max_keep: Option<usize>,
    ) -> CheckpointDescriptor {
        let config: TrainingConfig = toml::from_str(CONFIG).unwrap();
        let optimizer = TrainerOptimizer::new(
            model.named_parameters(),
            OptimizerConfig::from(&config.optimizer),
            TrainerOptimizerOptions::default(),
        )
        .unwrap();
        let scheduler = EpochScheduler::new(SchedulerConfig {
            base_lr: 1e-3,
            min_lr: 0.0,
            warmup_epochs: 0,
            total_epochs: 10,
            shape: DecayShape::Cosine,
        })
        .unwrap();
        let scaler = GradientScaler::new(Precision::Bf16);
        save_checkpoint(SaveRequest {
            base_dir: dir,
            config: &config,
            model,
            model_ema: ema,
            optimizer: &optimizer,
            scheduler: Some(&scheduler),
            scaler: Some(&scaler),
            epoch,
            best_acc1: 42.0,
            max_keep,
        })
        .unwrap()
    }

    #[test]
    fn round_trip_restores_weights_and_state() {
        let dir = tempfile::tempdir().unwrap();
        let source = model();
        let ema = ModelEma::new(&source, 0.99).unwrap();
        let saved = save(dir.path(), &source, Some(&ema), 3, None);

        let latest = latest_checkpoint(dir.path()).unwrap().unwrap();
        assert_eq!(latest.directory, saved.directory);
        assert_eq!(latest.manifest.epoch, 3);

        let outcome = load_checkpoint(&latest.directory).unwrap();
        assert!(outcome.scaler_state.is_some());
        assert!(outcome.scheduler_state.is_some());
        assert!(outcome.ema_weights_path.is_some());
        assert_eq!(outcome.manifest.best_acc1, 42.0);

        let target = model();
        apply_weights(&target.named_parameters(), &outcome.model_weights_path).unwrap();
        let expected = parameter_tensors(&source);
        for (name, tensor) in parameter_tensors(&target) {
            assert_eq!(
                tensor.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
                expected[&name].flatten_all().unwrap().to_vec1::<f32>().unwrap()
            );
        }
    }

    #[test]
    fn prunes_oldest_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let model = model();
        for epoch in 0..4 {
            save(dir.path(), &model, None, epoch, Some(2));
        }
        let mut remaining: Vec<_> = checkpoint_directories(dir.path())
            .unwrap()
            .into_iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        remaining.sort();
        assert_eq!(remaining, vec!["epoch_000002", "epoch_000003"]);
    }

    #[test]
    fn tampered_files_fail_validation() {
        let dir = tempfile::tempdir().unwrap();
        let saved = save(dir.path(), &model(), None, 0, None);
        fs::write(saved.directory.join(OPTIMIZER_FILENAME), b"{}").unwrap();
        assert!(load_checkpoint(&saved.directory).is_err());
    }
}
