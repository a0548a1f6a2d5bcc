use std::{
    collections::{BTreeMap, VecDeque},
    fmt,
    time::{Duration, Instant},
};

use tracing::info;

use crate::TrainingError;

/// Cross-process reduction used to merge metric state at epoch end.
/// Spawning and wiring the processes is left to the launcher.
pub trait ProcessGroup {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Sums `values` element-wise across every process, in place.
    fn all_reduce_sum(&self, values: &mut [f64]) -> Result<(), TrainingError>;

    fn is_main_process(&self) -> bool {
        self.rank() == 0
    }
}

/// The trivial group of a single process; reductions are identities.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleProcess;

impl ProcessGroup for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn all_reduce_sum(&self, _values: &mut [f64]) -> Result<(), TrainingError> {
        Ok(())
    }
}

/// How a meter renders itself in progress lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeterFormat {
    /// `median (global_avg)`
    MedianAndGlobal { precision: usize },
    /// Latest value only.
    Value { precision: usize },
}

impl Default for MeterFormat {
    fn default() -> Self {
        MeterFormat::MedianAndGlobal { precision: 4 }
    }
}

/// Tracks a series of values and exposes smoothed values over a window
/// alongside the global series average.
#[derive(Debug, Clone)]
pub struct SmoothedValue {
    window: VecDeque<f64>,
    window_size: usize,
    total: f64,
    count: u64,
    format: MeterFormat,
}

impl Default for SmoothedValue {
    fn default() -> Self {
        Self::new(20, MeterFormat::default())
    }
}

impl SmoothedValue {
    pub fn new(window_size: usize, format: MeterFormat) -> Self {
        let window_size = window_size.max(1);
        Self {
            window: VecDeque::with_capacity(window_size),
            window_size,
            total: 0.0,
            count: 0,
            format,
        }
    }

    /// Records `value` observed over `n` samples.
    pub fn update(&mut self, value: f64, n: u64) {
        if self.window.len() == self.window_size {
            self.window.pop_front();
        }
        self.window.push_back(value);
        self.count += n;
        self.total += value * n as f64;
    }

    /// Merges `count` and `total` across processes. The window stays local.
    pub fn synchronize(&mut self, group: &dyn ProcessGroup) -> Result<(), TrainingError> {
        if group.world_size() <= 1 {
            return Ok(());
        }
        let mut state = [self.count as f64, self.total];
        group.all_reduce_sum(&mut state)?;
        self.count = state[0].round() as u64;
        self.total = state[1];
        Ok(())
    }

    pub fn median(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let mut sorted: Vec<f64> = self.window.iter().copied().collect();
        sorted.sort_by(|a, b| a.total_cmp(b));
        // Lower median for even windows.
        sorted[(sorted.len() - 1) / 2]
    }

    pub fn avg(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        self.window.iter().sum::<f64>() / self.window.len() as f64
    }

    pub fn global_avg(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.total / self.count as f64
    }

    pub fn max(&self) -> f64 {
        self.window
            .iter()
            .copied()
            .fold(f64::NEG_INFINITY, f64::max)
    }

    pub fn value(&self) -> f64 {
        self.window.back().copied().unwrap_or(0.0)
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn total(&self) -> f64 {
        self.total
    }
}

impl fmt::Display for SmoothedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.format {
            MeterFormat::MedianAndGlobal { precision } => write!(
                f,
                "{:.p$} ({:.p$})",
                self.median(),
                self.global_avg(),
                p = precision
            ),
            MeterFormat::Value { precision } => write!(f, "{:.p$}", self.value(), p = precision),
        }
    }
}

/// Named meters in insertion order.
#[derive(Debug, Clone)]
pub struct MetricLogger {
    meters: Vec<(String, SmoothedValue)>,
    delimiter: &'static str,
}

impl Default for MetricLogger {
    fn default() -> Self {
        Self::new("  ")
    }
}

impl MetricLogger {
    pub fn new(delimiter: &'static str) -> Self {
        Self {
            meters: Vec::new(),
            delimiter,
        }
    }

    /// Installs a meter with custom window/format, replacing any existing
    /// meter of the same name.
    pub fn add_meter(&mut self, name: impl Into<String>, meter: SmoothedValue) {
        let name = name.into();
        match self.meters.iter_mut().find(|(existing, _)| *existing == name) {
            Some((_, slot)) => *slot = meter,
            None => self.meters.push((name, meter)),
        }
    }

    pub fn update(&mut self, name: &str, value: f64) {
        self.update_n(name, value, 1);
    }

    /// Records `value` weighted by `n` samples, creating a default meter on
    /// first use.
    pub fn update_n(&mut self, name: &str, value: f64, n: u64) {
        match self.meters.iter_mut().find(|(existing, _)| existing == name) {
            Some((_, meter)) => meter.update(value, n),
            None => {
                let mut meter = SmoothedValue::default();
                meter.update(value, n);
                self.meters.push((name.to_string(), meter));
            }
        }
    }

    pub fn meter(&self, name: &str) -> Option<&SmoothedValue> {
        self.meters
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, meter)| meter)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.meters.iter().map(|(name, _)| name.as_str())
    }

    pub fn synchronize(&mut self, group: &dyn ProcessGroup) -> Result<(), TrainingError> {
        for (_, meter) in &mut self.meters {
            meter.synchronize(group)?;
        }
        Ok(())
    }

    pub fn global_averages(&self) -> BTreeMap<String, f64> {
        self.meters
            .iter()
            .map(|(name, meter)| (name.clone(), meter.global_avg()))
            .collect()
    }
}

impl fmt::Display for MetricLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, (name, meter)) in self.meters.iter().enumerate() {
            if idx > 0 {
                f.write_str(self.delimiter)?;
            }
            write!(f, "{name}: {meter}")?;
        }
        Ok(())
    }
}

/// Periodic progress lines for one pass over a loader.
pub struct ProgressLogger {
    header: String,
    print_freq: usize,
    total: Option<usize>,
    start: Instant,
    last: Instant,
    data_ready: Option<Instant>,
    iter_time: SmoothedValue,
    data_time: SmoothedValue,
}

impl ProgressLogger {
    pub fn new(header: impl Into<String>, print_freq: usize, total: Option<usize>) -> Self {
        let now = Instant::now();
        Self {
            header: header.into(),
            print_freq: print_freq.max(1),
            total,
            start: now,
            last: now,
            data_ready: None,
            iter_time: SmoothedValue::new(20, MeterFormat::Value { precision: 4 }),
            data_time: SmoothedValue::new(20, MeterFormat::Value { precision: 4 }),
        }
    }

    /// Marks the moment the batch for the current iteration arrived.
    pub fn batch_loaded(&mut self) {
        let now = Instant::now();
        self.data_time
            .update(now.duration_since(self.last).as_secs_f64(), 1);
        self.data_ready = Some(now);
    }

    /// Closes iteration `index` and emits a line every `print_freq`
    /// iterations and on the last one.
    pub fn step_done(&mut self, index: usize, meters: &MetricLogger) {
        let now = Instant::now();
        if self.data_ready.take().is_none() {
            self.data_time.update(0.0, 1);
        }
        self.iter_time
            .update(now.duration_since(self.last).as_secs_f64(), 1);
        self.last = now;

        let is_last = self.total.is_some_and(|total| index + 1 == total);
        if index % self.print_freq != 0 && !is_last {
            return;
        }

        let position = match self.total {
            Some(total) => {
                let width = total.to_string().len();
                format!("[{index:>width$}/{total}]")
            }
            None => format!("[{index}]"),
        };
        let eta = self.total.map(|total| {
            let remaining = total.saturating_sub(index + 1) as f64;
            format_duration(Duration::from_secs_f64(
                (self.iter_time.global_avg() * remaining).max(0.0),
            ))
        });
        info!(
            "{} {}  eta: {}  {}  time: {}  data: {}",
            self.header,
            position,
            eta.as_deref().unwrap_or("-"),
            meters,
            self.iter_time,
            self.data_time
        );
    }

    pub fn finish(&self) -> Duration {
        let elapsed = self.start.elapsed();
        let per_iter = if self.iter_time.count() > 0 {
            elapsed.as_secs_f64() / self.iter_time.count() as f64
        } else {
            0.0
        };
        info!(
            "{} Total time: {} ({:.4} s / it)",
            self.header,
            format_duration(elapsed),
            per_iter
        );
        elapsed
    }
}

/// `h:mm:ss` rendering of a duration, truncated to whole seconds.
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    format!("{}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}
