use std::{collections::HashMap, fs, path::Path};

use anyhow::Result;
use candle_core::{Device, Tensor};
use tempfile::tempdir;
use training::{
    checkpoint::latest_checkpoint, data::{IMAGES_KEY, LABELS_KEY}, logging::EPOCH_LOG_FILENAME,
    Trainer, TrainingConfig,
};

const SAMPLES: usize = 12;
const CLASSES: u32 = 3;

/// Class `c` images are filled with `c` plus a little per-sample jitter.
fn write_dataset(path: &Path) -> Result<()> {
    let mut images = Vec::with_capacity(SAMPLES * 4);
    let mut labels = Vec::with_capacity(SAMPLES);
    for i in 0..SAMPLES {
        let label = i as u32 % CLASSES;
        labels.push(label);
        for j in 0..4 {
            images.push(label as f32 + 0.01 * (i * 4 + j) as f32);
        }
    }
    let mut tensors = HashMap::new();
    tensors.insert(
        IMAGES_KEY.to_string(),
        Tensor::from_vec(images, (SAMPLES, 1, 2, 2), &Device::Cpu)?,
    );
    tensors.insert(
        LABELS_KEY.to_string(),
        Tensor::from_vec(labels, (SAMPLES,), &Device::Cpu)?,
    );
    candle_core::safetensors::save(&tensors, path)?;
    Ok(())
}

fn write_config(dir: &Path, epochs: usize) -> Result<TrainingConfig> {
    write_dataset(&dir.join("data.safetensors"))?;
    let config_path = dir.join("train.toml");
    fs::write(
        &config_path,
        format!(
            r#"
[model]
num_classes = {CLASSES}
hidden_size = 8

[data]
train_data = "data.safetensors"
validation_data = "data.safetensors"
batch_size = 4

[optimizer]
learning_rate = 0.01
clip_grad = 1.0

[scheduler]
strategy = "cosine"
warmup_epochs = 1

[runtime]
epochs = {epochs}
print_freq = 1
output_dir = "run"
model_ema_decay = 0.9

[runtime.checkpoint]
every_n_epochs = 1
max_keep = 2
"#
        ),
    )?;
    Ok(TrainingConfig::load(&config_path)?)
}

#[test]
fn trains_evaluates_and_logs_every_epoch() -> Result<()> {
    let dir = tempdir()?;
    let config = write_config(dir.path(), 3)?;
    let output_dir = config.runtime.output_dir.clone();
    let histogram_path = config.histogram_path();

    let mut trainer = Trainer::new(config)?;
    trainer.train()?;

    let log = fs::read_to_string(output_dir.join(EPOCH_LOG_FILENAME))?;
    let records: Vec<serde_json::Value> = log
        .lines()
        .map(serde_json::from_str)
        .collect::<Result<_, _>>()?;
    assert_eq!(records.len(), 3);
    for (epoch, record) in records.iter().enumerate() {
        assert_eq!(record["epoch"], epoch);
        assert!(record["train_loss"].as_f64().is_some());
        assert!(record["train_lr"].as_f64().is_some());
        assert!(record["test_acc1"].as_f64().is_some());
        assert!(record["test_ema_acc1"].as_f64().is_some());
        assert!(record["n_parameters"].as_u64().unwrap() > 0);
        assert!(record.get("max_mem_gpu").is_some());
    }

    assert!(histogram_path.exists());
    assert!(fs::metadata(&histogram_path)?.len() > 0);

    let checkpoints = output_dir.join("checkpoints");
    let latest = latest_checkpoint(&checkpoints)?.expect("checkpoint written");
    assert_eq!(latest.manifest.epoch, 2);
    assert_eq!(fs::read_dir(&checkpoints)?.count(), 2);
    Ok(())
}

#[test]
fn resume_continues_after_the_last_saved_epoch() -> Result<()> {
    let dir = tempdir()?;
    let config = write_config(dir.path(), 2)?;
    Trainer::new(config.clone())?.train()?;

    let mut extended = config;
    extended.runtime.epochs = 3;
    let mut trainer = Trainer::new(extended)?;
    let descriptor = trainer.resume_from_latest()?.expect("checkpoint present");
    assert_eq!(descriptor.manifest.epoch, 1);
    assert_eq!(trainer.start_epoch(), 2);
    trainer.train()?;

    let log = fs::read_to_string(trainer.config().runtime.output_dir.join(EPOCH_LOG_FILENAME))?;
    assert_eq!(log.lines().count(), 3);
    Ok(())
}

#[test]
fn evaluation_renders_histogram_without_training() -> Result<()> {
    let dir = tempdir()?;
    let mut config = write_config(dir.path(), 1)?;
    let custom = dir.path().join("plots").join("top5.png");
    config.runtime.histogram_path = Some(custom.clone());

    let mut trainer = Trainer::new(config)?;
    let report = trainer.evaluate()?;
    assert_eq!(report.histogram.samples(), SAMPLES);
    assert!((0.0..=100.0).contains(&report.acc1()));
    assert!(report.acc5() >= report.acc1());
    assert!(custom.exists());
    Ok(())
}
