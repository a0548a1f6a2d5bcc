use std::{
    collections::BTreeMap,
    fs::{self, File, OpenOptions},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::BytesMut;
use crc32fast::Hasher as Crc32;
use prost::Message;
use serde_json::{Map, Value};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::{config::RuntimeConfig, TrainingError};

/// File name of the JSON-lines epoch log inside the output directory.
pub const EPOCH_LOG_FILENAME: &str = "log.txt";

/// Installs the global `fmt` subscriber, honouring `RUST_LOG` and falling
/// back to `info`. Safe to call more than once.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init();
}

#[derive(Clone, Debug)]
pub struct LoggingSettings {
    pub tensorboard_dir: Option<PathBuf>,
    pub tensorboard_flush_every_n: usize,
    pub epoch_log: Option<PathBuf>,
}

impl LoggingSettings {
    pub fn from_config(runtime: &RuntimeConfig) -> Self {
        Self {
            tensorboard_dir: runtime.logging.tensorboard.clone(),
            tensorboard_flush_every_n: runtime.logging.tensorboard_flush_every_n.max(1),
            epoch_log: Some(runtime.output_dir.join(EPOCH_LOG_FILENAME)),
        }
    }
}

/// Everything recorded about one finished epoch.
#[derive(Debug, Clone, Default)]
pub struct EpochRecord {
    pub epoch: usize,
    pub train: BTreeMap<String, f64>,
    pub test: BTreeMap<String, f64>,
    pub n_parameters: usize,
    /// Peak resident memory of the process in MiB.
    pub max_mem_gpu: f64,
}

impl EpochRecord {
    /// Flat JSON object with `train_*` and `test_*` keys.
    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        for (key, value) in &self.train {
            map.insert(format!("train_{key}"), json_number(*value));
        }
        for (key, value) in &self.test {
            map.insert(format!("test_{key}"), json_number(*value));
        }
        map.insert("epoch".to_string(), Value::from(self.epoch));
        map.insert("n_parameters".to_string(), Value::from(self.n_parameters));
        map.insert("max_mem_gpu".to_string(), json_number(self.max_mem_gpu));
        Value::Object(map)
    }
}

pub struct Logger {
    tensorboard: Option<TensorBoardWriter>,
    epoch_log: Option<EpochLogWriter>,
}

impl Logger {
    pub fn new(settings: LoggingSettings) -> Result<Self, TrainingError> {
        let tensorboard = match settings.tensorboard_dir.as_ref() {
            Some(dir) => Some(TensorBoardWriter::create(
                dir,
                settings.tensorboard_flush_every_n,
            )?),
            None => None,
        };
        let epoch_log = match settings.epoch_log.as_ref() {
            Some(path) => Some(EpochLogWriter::open(path)?),
            None => None,
        };
        Ok(Self {
            tensorboard,
            epoch_log,
        })
    }

    /// Appends one line to the epoch log and mirrors the scalars to
    /// TensorBoard under `train/`, `test/` and `system/`.
    pub fn log_epoch(&mut self, record: &EpochRecord) -> Result<(), TrainingError> {
        if let Some(log) = self.epoch_log.as_mut() {
            log.append(&record.to_json())?;
        }

        if let Some(writer) = self.tensorboard.as_mut() {
            let step = record.epoch as i64;
            for (key, value) in &record.train {
                writer.write_scalar(&format!("train/{key}"), step, *value)?;
            }
            for (key, value) in &record.test {
                writer.write_scalar(&format!("test/{key}"), step, *value)?;
            }
            writer.write_scalar("system/max_mem_mb", step, record.max_mem_gpu)?;
            writer.flush()?;
        }
        Ok(())
    }

    pub fn flush(&mut self) {
        if let Some(writer) = self.tensorboard.as_mut() {
            let _ = writer.flush();
        }
    }
}

struct EpochLogWriter {
    path: PathBuf,
    file: File,
}

impl EpochLogWriter {
    fn open(path: &Path) -> Result<Self, TrainingError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|err| {
                TrainingError::runtime(format!(
                    "failed to open epoch log {}: {err}",
                    path.display()
                ))
            })?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    fn append(&mut self, record: &Value) -> Result<(), TrainingError> {
        writeln!(self.file, "{}", record).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to append to epoch log {}: {err}",
                self.path.display()
            ))
        })
    }
}

struct TensorBoardWriter {
    writer: BufWriter<File>,
    flush_every: usize,
    pending: usize,
}

impl TensorBoardWriter {
    fn create(dir: &Path, flush_every: usize) -> Result<Self, TrainingError> {
        fs::create_dir_all(dir).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create tensorboard directory {}: {err}",
                dir.display()
            ))
        })?;
        let filename = format!(
            "events.out.tfevents.{}.{}",
            current_unix_timestamp(),
            hostname()
        );
        let path = dir.join(filename);
        let file = File::create(&path).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create tensorboard file {}: {err}",
                path.display()
            ))
        })?;
        let mut writer = Self {
            writer: BufWriter::new(file),
            flush_every: flush_every.max(1),
            pending: 0,
        };
        writer.write_event(&Event {
            wall_time: current_wall_time(),
            step: 0,
            file_version: Some("brain.Event:2".to_string()),
            summary: None,
        })?;
        Ok(writer)
    }

    fn write_scalar(&mut self, tag: &str, step: i64, value: f64) -> Result<(), TrainingError> {
        let event = Event {
            wall_time: current_wall_time(),
            step,
            file_version: None,
            summary: Some(Summary {
                value: vec![summary::Value {
                    tag: tag.to_string(),
                    simple_value: Some(value as f32),
                }],
            }),
        };
        self.write_event(&event)
    }

    fn write_event(&mut self, event: &Event) -> Result<(), TrainingError> {
        let mut buffer = BytesMut::with_capacity(128);
        event.encode(&mut buffer).map_err(|err| {
            TrainingError::runtime(format!("failed to encode tensorboard event: {err}"))
        })?;
        let data = buffer.freeze();

        let len_bytes = (data.len() as u64).to_le_bytes();
        let len_crc_bytes = masked_crc32(&len_bytes).to_le_bytes();
        let data_crc_bytes = masked_crc32(data.as_ref()).to_le_bytes();

        self.writer
            .write_all(&len_bytes)
            .and_then(|_| self.writer.write_all(&len_crc_bytes))
            .and_then(|_| self.writer.write_all(&data))
            .and_then(|_| self.writer.write_all(&data_crc_bytes))
            .map_err(|err| {
                TrainingError::runtime(format!("failed to write tensorboard event: {err}"))
            })?;

        self.pending += 1;
        if self.pending >= self.flush_every {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TrainingError> {
        self.writer.flush().map_err(|err| {
            TrainingError::runtime(format!("failed to flush tensorboard file: {err}"))
        })?;
        self.pending = 0;
        Ok(())
    }
}

impl Drop for TensorBoardWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

/// Peak resident set size of this process in MiB, read from
/// `/proc/self/status`. Returns 0.0 where that file does not exist.
pub fn peak_memory_mb() -> f64 {
    fs::read_to_string("/proc/self/status")
        .ok()
        .and_then(|status| parse_peak_rss_kb(&status))
        .map(|kb| kb as f64 / 1024.0)
        .unwrap_or(0.0)
}

fn parse_peak_rss_kb(status: &str) -> Option<u64> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("VmHWM:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kb| kb.parse().ok())
}

/// NaN and infinities have no JSON spelling; they are written as null.
fn json_number(value: f64) -> Value {
    serde_json::Number::from_f64(value)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

fn masked_crc32(data: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(data);
    let crc = hasher.finalize();
    ((crc >> 15) | (crc << 17)).wrapping_add(0xa282_ead8)
}

fn current_unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn current_wall_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_secs_f64())
        .unwrap_or(0.0)
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}

#[derive(Clone, PartialEq, Message)]
struct Event {
    #[prost(double, tag = "1")]
    wall_time: f64,
    #[prost(int64, tag = "2")]
    step: i64,
    #[prost(string, optional, tag = "3")]
    file_version: Option<String>,
    #[prost(message, optional, tag = "5")]
    summary: Option<Summary>,
}

#[derive(Clone, PartialEq, Message)]
struct Summary {
    #[prost(message, repeated, tag = "1")]
    value: Vec<summary::Value>,
}

mod summary {
    use prost::Message;

    #[derive(Clone, PartialEq, Message)]
    pub struct Value {
        #[prost(string, tag = "7")]
        pub tag: String,
        #[prost(float, optional, tag = "2")]
        pub simple_value: Option<f32>,
    }
}
