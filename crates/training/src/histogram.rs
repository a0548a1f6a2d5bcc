use std::{fs, path::Path};

use candle_core::{DType, Tensor, D};
use plotters::prelude::*;

use crate::{metrics::ProcessGroup, TrainingError};

/// Number of ranks tracked by the evaluation histogram.
pub const TOP_K: usize = 5;

/// Softmax mass of the five most probable classes, summed over every
/// evaluated sample. Each sample's top-5 probabilities are sorted
/// ascending before being added, so the last slot holds top-1 mass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TopKHistogram {
    mass: [f64; TOP_K],
    samples: usize,
}

impl TopKHistogram {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a `[batch, classes]` block of logits. With fewer than five
    /// classes the missing ranks contribute zero, at the low end.
    pub fn accumulate(&mut self, logits: &Tensor) -> Result<(), TrainingError> {
        if logits.rank() != 2 {
            return Err(TrainingError::runtime(format!(
                "histogram expects [batch, classes] logits, got {:?}",
                logits.dims()
            )));
        }
        let probs = logits
            .to_dtype(DType::F32)
            .and_then(|t| candle_nn::ops::softmax(&t, D::Minus1))
            .and_then(|t| t.to_vec2::<f32>())
            .map_err(to_runtime_error)?;

        for mut row in probs {
            row.sort_by(|a, b| b.total_cmp(a));
            row.truncate(TOP_K);
            row.reverse();
            let offset = TOP_K - row.len();
            for (slot, p) in self.mass[offset..].iter_mut().zip(row) {
                *slot += p as f64;
            }
            self.samples += 1;
        }
        Ok(())
    }

    pub fn merge(&mut self, other: &TopKHistogram) {
        for (slot, value) in self.mass.iter_mut().zip(other.mass) {
            *slot += value;
        }
        self.samples += other.samples;
    }

    pub fn synchronize(&mut self, group: &dyn ProcessGroup) -> Result<(), TrainingError> {
        if group.world_size() <= 1 {
            return Ok(());
        }
        let mut state = [0.0; TOP_K + 1];
        state[..TOP_K].copy_from_slice(&self.mass);
        state[TOP_K] = self.samples as f64;
        group.all_reduce_sum(&mut state)?;
        self.mass.copy_from_slice(&state[..TOP_K]);
        self.samples = state[TOP_K].round() as usize;
        Ok(())
    }

    pub fn mass(&self) -> &[f64; TOP_K] {
        &self.mass
    }

    pub fn samples(&self) -> usize {
        self.samples
    }

    /// The accumulated mass scaled to sum to one; `None` before any sample.
    pub fn normalized(&self) -> Option<[f64; TOP_K]> {
        let total: f64 = self.mass.iter().sum();
        if self.samples == 0 || total <= 0.0 || !total.is_finite() {
            return None;
        }
        Some(self.mass.map(|m| m / total))
    }
}

/// Draws `distribution` as a bar chart over ranks 1..=5 and writes a PNG
/// to `path`, creating missing parent directories.
pub fn render_histogram(distribution: &[f64; TOP_K], path: &Path) -> Result<(), TrainingError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let y_max = distribution
        .iter()
        .copied()
        .fold(0.0f64, f64::max)
        .max(f64::EPSILON)
        * 1.1;

    let root = BitMapBackend::new(path, (640, 480)).into_drawing_area();
    root.fill(&WHITE).map_err(render_error)?;
    {
        let mut chart = ChartBuilder::on(&root)
            .margin(12)
            .caption("Top 5 distribution", ("sans-serif", 22))
            .x_label_area_size(40)
            .y_label_area_size(56)
            .build_cartesian_2d(0.5f64..(TOP_K as f64 + 0.5), 0f64..y_max)
            .map_err(render_error)?;

        chart
            .configure_mesh()
            .x_labels(TOP_K)
            .x_label_formatter(&|x| format!("{:.0}", x))
            .x_desc("Top")
            .y_desc("Probability")
            .disable_x_mesh()
            .draw()
            .map_err(render_error)?;

        chart
            .draw_series(distribution.iter().enumerate().map(|(idx, p)| {
                let x = (idx + 1) as f64;
                Rectangle::new([(x - 0.4, 0.0), (x + 0.4, *p)], BLUE.mix(0.6).filled())
            }))
            .map_err(render_error)?;
    }
    root.present().map_err(render_error)?;
    Ok(())
}

fn render_error<E: std::fmt::Display>(err: E) -> TrainingError {
    TrainingError::Render(err.to_string())
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn logits(rows: Vec<Vec<f32>>) -> Tensor {
        let cols = rows[0].len();
        let n = rows.len();
        let flat: Vec<f32> = rows.into_iter().flatten().collect();
        Tensor::from_vec(flat, (n, cols), &Device::Cpu).unwrap()
    }

    #[test]
    fn slots_are_sorted_ascending() {
        let mut hist = TopKHistogram::new();
        hist.accumulate(&logits(vec![vec![5.0, 1.0, 0.0, 3.0, 2.0, 4.0, -1.0]]))
            .unwrap();
        let mass = hist.mass();
        assert!(mass.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(hist.samples(), 1);
    }

    #[test]
    fn normalized_is_a_probability_vector() {
        let mut hist = TopKHistogram::new();
        hist.accumulate(&logits(vec![
            vec![0.3, 2.0, -1.0, 0.0, 1.5, 0.2],
            vec![4.0, 0.0, 0.0, 0.0, 0.0, 0.0],
        ]))
        .unwrap();
        hist.accumulate(&logits(vec![vec![1.0; 6]])).unwrap();
        let pdf = hist.normalized().unwrap();
        assert_eq!(pdf.len(), TOP_K);
        assert!((pdf.iter().sum::<f64>() - 1.0).abs() < 1e-9);
        assert!(pdf.iter().all(|p| *p >= 0.0));
    }

    #[test]
    fn fewer_classes_pad_the_low_ranks() {
        let mut hist = TopKHistogram::new();
        hist.accumulate(&logits(vec![vec![0.0, 0.0]])).unwrap();
        let mass = hist.mass();
        assert_eq!(&mass[..3], &[0.0, 0.0, 0.0]);
        assert!((mass[3] - 0.5).abs() < 1e-6);
        assert!((mass[4] - 0.5).abs() < 1e-6);
    }

    /// Two ranks that both saw the same data.
    struct MirroredPair;

    impl ProcessGroup for MirroredPair {
        fn rank(&self) -> usize {
            0
        }

        fn world_size(&self) -> usize {
            2
        }

        fn all_reduce_sum(&self, values: &mut [f64]) -> Result<(), TrainingError> {
            values.iter_mut().for_each(|v| *v *= 2.0);
            Ok(())
        }
    }

    #[test]
    fn synchronize_sums_mass_and_samples_across_ranks() {
        let mut hist = TopKHistogram::new();
        hist.accumulate(&logits(vec![
            vec![2.0, 1.0, 0.0, -1.0, 0.5, 3.0],
            vec![0.0; 6],
        ]))
        .unwrap();
        let local = hist.clone();
        let pdf = local.normalized().unwrap();

        hist.synchronize(&MirroredPair).unwrap();
        assert_eq!(hist.samples(), 4);
        for (synced, single) in hist.mass().iter().zip(local.mass()) {
            assert!((synced - 2.0 * single).abs() < 1e-12);
        }
        assert_eq!(hist.normalized().unwrap(), pdf);
    }

    #[test]
    fn empty_histogram_has_no_distribution() {
        assert!(TopKHistogram::new().normalized().is_none());
    }

    #[test]
    fn render_creates_missing_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("out").join("acc_histogram.png");
        render_histogram(&[0.05, 0.05, 0.1, 0.2, 0.6], &path).unwrap();
        assert!(path.exists());
        assert!(std::fs::metadata(&path).unwrap().len() > 0);
    }
}
