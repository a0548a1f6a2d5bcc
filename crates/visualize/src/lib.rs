//! Loss and memory curves from the JSON-lines epoch log written by the
//! training binary.

use std::{
    fs::{self, File},
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
};

use plotters::prelude::*;
use serde::{Deserialize, Deserializer};
use thiserror::Error;
use tracing::{debug, info};

/// Default name of the rendered figure inside the output directory.
pub const DEFAULT_FILE_NAME: &str = "loss_and_memory.png";

#[derive(Debug, Error)]
pub enum VisualizeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed log record on line {line}: {source}")]
    Parse {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("render error: {0}")]
    Render(String),
}

/// One line of the epoch log. Every other key is ignored.
#[derive(Debug, Deserialize)]
struct LogRecord {
    epoch: usize,
    #[serde(deserialize_with = "nullable_f64")]
    test_loss: f64,
    #[serde(deserialize_with = "nullable_f64")]
    max_mem_gpu: f64,
}

/// Parallel per-epoch sequences, in file order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogSeries {
    pub epochs: Vec<usize>,
    pub losses: Vec<f64>,
    pub max_gpu_mem: Vec<f64>,
}

impl LogSeries {
    pub fn len(&self) -> usize {
        self.epochs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.epochs.is_empty()
    }

    fn push(&mut self, record: LogRecord) {
        self.epochs.push(record.epoch);
        self.losses.push(record.test_loss);
        self.max_gpu_mem.push(record.max_mem_gpu);
    }
}

/// Reads every non-blank line of `path` as a log record.
pub fn read_log(path: &Path) -> Result<LogSeries, VisualizeError> {
    let reader = BufReader::new(File::open(path)?);
    let mut series = LogSeries::default();
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: LogRecord = serde_json::from_str(&line).map_err(|source| {
            VisualizeError::Parse {
                line: index + 1,
                source,
            }
        })?;
        series.push(record);
    }
    debug!(records = series.len(), path = %path.display(), "read epoch log");
    Ok(series)
}

/// Draws loss and peak memory against epoch side by side and writes the
/// PNG to `output_dir/file_name`, creating `output_dir` first.
pub fn render_curves(
    series: &LogSeries,
    output_dir: &Path,
    file_name: &str,
) -> Result<PathBuf, VisualizeError> {
    fs::create_dir_all(output_dir)?;
    let path = output_dir.join(file_name);

    {
        let root = BitMapBackend::new(&path, (1200, 480)).into_drawing_area();
        root.fill(&WHITE).map_err(render_error)?;
        let panels = root.split_evenly((1, 2));
        draw_panel(&panels[0], "Loss", "Loss", &series.epochs, &series.losses)?;
        draw_panel(
            &panels[1],
            "Max GPU memory",
            "Memory (MB)",
            &series.epochs,
            &series.max_gpu_mem,
        )?;
        root.present().map_err(render_error)?;
    }

    info!(path = %path.display(), epochs = series.len(), "wrote training curves");
    Ok(path)
}

fn draw_panel(
    area: &DrawingArea<BitMapBackend<'_>, plotters::coord::Shift>,
    caption: &str,
    y_desc: &str,
    epochs: &[usize],
    values: &[f64],
) -> Result<(), VisualizeError> {
    let x_min = epochs.iter().copied().min().unwrap_or(0) as f64;
    let x_max = (epochs.iter().copied().max().unwrap_or(0) as f64).max(x_min + 1.0);
    let (y_min, y_max) = value_range(values);

    let mut chart = ChartBuilder::on(area)
        .margin(12)
        .caption(caption, ("sans-serif", 22))
        .x_label_area_size(40)
        .y_label_area_size(60)
        .build_cartesian_2d(x_min..x_max, y_min..y_max)
        .map_err(render_error)?;

    chart
        .configure_mesh()
        .x_desc("Epoch")
        .y_desc(y_desc)
        .draw()
        .map_err(render_error)?;

    for segment in finite_segments(epochs, values) {
        chart
            .draw_series(LineSeries::new(segment, &RED))
            .map_err(render_error)?;
    }
    Ok(())
}

/// Runs of consecutive finite points; a non-finite value ends a run, so the
/// curve shows a gap there instead of bridging it.
fn finite_segments(epochs: &[usize], values: &[f64]) -> Vec<Vec<(f64, f64)>> {
    let mut segments = Vec::new();
    let mut current = Vec::new();
    for (epoch, value) in epochs.iter().zip(values) {
        if value.is_finite() {
            current.push((*epoch as f64, *value));
        } else if !current.is_empty() {
            segments.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        segments.push(current);
    }
    segments
}

fn value_range(values: &[f64]) -> (f64, f64) {
    let finite = values.iter().copied().filter(|v| v.is_finite());
    let (lo, hi) = finite.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
        (lo.min(v), hi.max(v))
    });
    if !lo.is_finite() {
        return (0.0, 1.0);
    }
    let pad = ((hi - lo) * 0.05).max(1e-6);
    (lo - pad, hi + pad)
}

fn nullable_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NAN))
}

fn render_error<E: std::fmt::Display>(err: E) -> VisualizeError {
    VisualizeError::Render(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_values_become_nan() {
        let record: LogRecord =
            serde_json::from_str(r#"{"epoch": 3, "test_loss": null, "max_mem_gpu": 12.5}"#)
                .unwrap();
        assert_eq!(record.epoch, 3);
        assert!(record.test_loss.is_nan());
        assert_eq!(record.max_mem_gpu, 12.5);
    }

    #[test]
    fn missing_fields_are_rejected() {
        assert!(serde_json::from_str::<LogRecord>(r#"{"epoch": 0, "test_loss": 1.0}"#).is_err());
    }

    #[test]
    fn non_finite_values_split_the_curve() {
        let segments = finite_segments(&[0, 1, 2, 3, 4], &[1.0, 0.5, f64::NAN, 0.4, 0.3]);
        assert_eq!(
            segments,
            vec![vec![(0.0, 1.0), (1.0, 0.5)], vec![(3.0, 0.4), (4.0, 0.3)]]
        );
        assert!(finite_segments(&[0], &[f64::INFINITY]).is_empty());
    }

    #[test]
    fn range_ignores_non_finite_values() {
        let (lo, hi) = value_range(&[1.0, f64::NAN, 3.0]);
        assert!(lo < 1.0 && hi > 3.0);
        assert_eq!(value_range(&[f64::NAN]), (0.0, 1.0));
    }
}
