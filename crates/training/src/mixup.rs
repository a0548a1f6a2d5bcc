use candle_core::{DType, Tensor};
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::{Beta, Distribution};

use crate::{config::AugmentationConfig, data::DataBatch, loss::one_hot, TrainingError};

/// Which blend was applied to the last batch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MixKind {
    None,
    Mixup,
    CutMix,
}

/// Batch-level mixup / cutmix. Every sample is paired with its mirror in
/// the flipped batch and targets become smoothed, blended one-hot rows.
pub struct Mixup {
    mixup_alpha: f32,
    cutmix_alpha: f32,
    prob: f32,
    switch_prob: f32,
    label_smoothing: f32,
    num_classes: usize,
    rng: StdRng,
    last: (MixKind, f64),
}

impl Mixup {
    pub fn new(config: &AugmentationConfig, num_classes: usize, seed: u64) -> Result<Self, TrainingError> {
        if num_classes == 0 {
            return Err(TrainingError::initialization(
                "mixup requires at least one class",
            ));
        }
        if config.mixup_alpha < 0.0 || config.cutmix_alpha < 0.0 {
            return Err(TrainingError::initialization(
                "mixup and cutmix alpha must be non-negative",
            ));
        }
        Ok(Self {
            mixup_alpha: config.mixup_alpha,
            cutmix_alpha: config.cutmix_alpha,
            prob: config.mixup_prob,
            switch_prob: config.mixup_switch_prob,
            label_smoothing: config.label_smoothing,
            num_classes,
            rng: StdRng::seed_from_u64(seed),
            last: (MixKind::None, 1.0),
        })
    }

    /// Blend kind and effective λ used for the most recent batch.
    pub fn last_mix(&self) -> (MixKind, f64) {
        self.last
    }

    pub fn apply(&mut self, batch: &DataBatch) -> Result<DataBatch, TrainingError> {
        let size = batch.batch_size();
        if size == 0 || size % 2 != 0 {
            return Err(TrainingError::runtime(format!(
                "mixup requires an even batch size, got {}",
                size
            )));
        }
        if batch.targets.rank() != 1 {
            return Err(TrainingError::runtime(
                "mixup expects class-index targets",
            ));
        }

        // index_select only accepts contiguous storage.
        let source = batch.samples.contiguous().map_err(to_runtime_error)?;
        let labels = batch.targets.contiguous().map_err(to_runtime_error)?;

        let (kind, lam) = self.sample_params()?;
        let flip = flip_index(size, source.device())?;
        let flipped = source.index_select(&flip, 0).map_err(to_runtime_error)?;

        let (samples, lam) = match kind {
            MixKind::None => (source, 1.0),
            MixKind::Mixup => {
                let mixed = (source.affine(lam, 0.0).map_err(to_runtime_error)?
                    + flipped.affine(1.0 - lam, 0.0).map_err(to_runtime_error)?)
                .map_err(to_runtime_error)?;
                (mixed, lam)
            }
            MixKind::CutMix => self.cutmix(&source, &flipped, lam)?,
        };

        let targets = self.mix_targets(&labels, &flip, lam)?;
        self.last = (kind, lam);
        Ok(DataBatch::new(samples, targets))
    }

    fn sample_params(&mut self) -> Result<(MixKind, f64), TrainingError> {
        if self.rng.gen::<f32>() >= self.prob {
            return Ok((MixKind::None, 1.0));
        }
        let (kind, alpha) = match (self.mixup_alpha > 0.0, self.cutmix_alpha > 0.0) {
            (true, true) => {
                if self.rng.gen::<f32>() < self.switch_prob {
                    (MixKind::CutMix, self.cutmix_alpha)
                } else {
                    (MixKind::Mixup, self.mixup_alpha)
                }
            }
            (true, false) => (MixKind::Mixup, self.mixup_alpha),
            (false, true) => (MixKind::CutMix, self.cutmix_alpha),
            (false, false) => return Ok((MixKind::None, 1.0)),
        };
        let beta = Beta::new(alpha as f64, alpha as f64).map_err(|err| {
            TrainingError::runtime(format!("invalid mixing alpha {alpha}: {err}"))
        })?;
        Ok((kind, beta.sample(&mut self.rng)))
    }

    /// Pastes a random box from the flipped batch; λ is corrected to the
    /// share of pixels that were kept.
    fn cutmix(
        &mut self,
        samples: &Tensor,
        flipped: &Tensor,
        lam: f64,
    ) -> Result<(Tensor, f64), TrainingError> {
        let dims = samples.dims();
        if dims.len() != 4 {
            return Err(TrainingError::runtime(format!(
                "cutmix expects [batch, channels, height, width] samples, got {:?}",
                dims
            )));
        }
        let (height, width) = (dims[2], dims[3]);
        let ratio = (1.0 - lam).max(0.0).sqrt();
        let cut_h = (height as f64 * ratio) as usize;
        let cut_w = (width as f64 * ratio) as usize;
        let cy = self.rng.gen_range(0..height);
        let cx = self.rng.gen_range(0..width);
        let y0 = cy.saturating_sub(cut_h / 2);
        let y1 = (cy + cut_h / 2).min(height);
        let x0 = cx.saturating_sub(cut_w / 2);
        let x1 = (cx + cut_w / 2).min(width);

        let mut mask = vec![0f32; height * width];
        for y in y0..y1 {
            for x in x0..x1 {
                mask[y * width + x] = 1.0;
            }
        }
        let area = ((y1 - y0) * (x1 - x0)) as f64;
        let lam = 1.0 - area / (height * width) as f64;

        let mask = Tensor::from_vec(mask, (1, 1, height, width), samples.device())
            .and_then(|m| m.to_dtype(samples.dtype()))
            .map_err(to_runtime_error)?;
        let keep = mask.affine(-1.0, 1.0).map_err(to_runtime_error)?;
        let mixed = (samples.broadcast_mul(&keep).map_err(to_runtime_error)?
            + flipped.broadcast_mul(&mask).map_err(to_runtime_error)?)
        .map_err(to_runtime_error)?;
        Ok((mixed, lam))
    }

    fn mix_targets(&self, targets: &Tensor, flip: &Tensor, lam: f64) -> Result<Tensor, TrainingError> {
        let off = self.label_smoothing as f64 / self.num_classes as f64;
        let on = 1.0 - self.label_smoothing as f64 + off;
        let direct = one_hot(targets, self.num_classes, on, off)?;
        let partner = targets
            .index_select(flip, 0)
            .map_err(to_runtime_error)
            .and_then(|t| one_hot(&t, self.num_classes, on, off))?;
        let mixed = (direct.affine(lam, 0.0).map_err(to_runtime_error)?
            + partner.affine(1.0 - lam, 0.0).map_err(to_runtime_error)?)
        .map_err(to_runtime_error)?;
        mixed.to_dtype(DType::F32).map_err(to_runtime_error)
    }
}

fn flip_index(size: usize, device: &candle_core::Device) -> Result<Tensor, TrainingError> {
    let order: Vec<u32> = (0..size as u32).rev().collect();
    Tensor::from_vec(order, (size,), device).map_err(to_runtime_error)
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn config(mixup: f32, cutmix: f32, prob: f32) -> AugmentationConfig {
        AugmentationConfig {
            mixup_alpha: mixup,
            cutmix_alpha: cutmix,
            mixup_prob: prob,
            mixup_switch_prob: 0.5,
            label_smoothing: 0.0,
        }
    }

    /// Two samples: one all zeros, one all ones.
    fn two_tone_batch() -> DataBatch {
        let mut pixels = vec![0f32; 16];
        pixels.extend(vec![1f32; 16]);
        let samples = Tensor::from_vec(pixels, (2, 1, 4, 4), &Device::Cpu).unwrap();
        let targets = Tensor::from_vec(vec![0u32, 1], (2,), &Device::Cpu).unwrap();
        DataBatch::new(samples, targets)
    }

    fn sample_mean(batch: &DataBatch, index: usize) -> f64 {
        batch
            .samples
            .get(index)
            .unwrap()
            .mean_all()
            .unwrap()
            .to_vec0::<f32>()
            .unwrap() as f64
    }

    #[test]
    fn odd_batches_are_rejected() {
        let mut mixup = Mixup::new(&config(0.8, 0.0, 1.0), 3, 0).unwrap();
        let samples = Tensor::zeros((3, 2), DType::F32, &Device::Cpu).unwrap();
        let targets = Tensor::zeros((3,), DType::U32, &Device::Cpu).unwrap();
        assert!(mixup.apply(&DataBatch::new(samples, targets)).is_err());
    }

    #[test]
    fn zero_probability_only_smooths_targets() {
        let mut cfg = config(0.8, 1.0, 0.0);
        cfg.label_smoothing = 0.1;
        let mut mixup = Mixup::new(&cfg, 2, 0).unwrap();
        let out = mixup.apply(&two_tone_batch()).unwrap();
        assert_eq!(mixup.last_mix().0, MixKind::None);
        let rows = out.targets.to_vec2::<f32>().unwrap();
        assert!((rows[0][0] - 0.95).abs() < 1e-6);
        assert!((rows[0][1] - 0.05).abs() < 1e-6);
        assert_eq!(sample_mean(&out, 1), 1.0);
    }

    #[test]
    fn mixup_blends_samples_and_targets_with_same_lambda() {
        let mut mixup = Mixup::new(&config(1.0, 0.0, 1.0), 2, 11).unwrap();
        let out = mixup.apply(&two_tone_batch()).unwrap();
        let (kind, lam) = mixup.last_mix();
        assert_eq!(kind, MixKind::Mixup);
        assert!((sample_mean(&out, 0) - (1.0 - lam)).abs() < 1e-5);

        let rows = out.targets.to_vec2::<f32>().unwrap();
        assert!((rows[0][0] as f64 - lam).abs() < 1e-5);
        for row in rows {
            assert!((row.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn cutmix_lambda_matches_pasted_area() {
        let mut mixup = Mixup::new(&config(0.0, 1.0, 1.0), 2, 5).unwrap();
        for _ in 0..8 {
            let out = mixup.apply(&two_tone_batch()).unwrap();
            let (kind, lam) = mixup.last_mix();
            assert_eq!(kind, MixKind::CutMix);
            // Sample 0 is zeros, so its mean is exactly the pasted share.
            assert!((sample_mean(&out, 0) - (1.0 - lam)).abs() < 1e-6);
        }
    }

    #[test]
    fn broadcast_and_transposed_batches_are_mixed() {
        let mut mixup = Mixup::new(&config(1.0, 0.0, 1.0), 2, 4).unwrap();
        let filled = Tensor::full(0.25f32, (2, 1, 4, 4), &Device::Cpu).unwrap();
        let targets = Tensor::from_vec(vec![1u32, 0], (2,), &Device::Cpu).unwrap();
        let out = mixup.apply(&DataBatch::new(filled, targets.clone())).unwrap();
        assert!((sample_mean(&out, 1) - 0.25).abs() < 1e-6);

        let transposed = Tensor::arange(0f32, 8.0, &Device::Cpu)
            .unwrap()
            .reshape((4, 2))
            .unwrap()
            .t()
            .unwrap();
        assert!(!transposed.is_contiguous());
        let out = mixup.apply(&DataBatch::new(transposed, targets)).unwrap();
        assert_eq!(out.samples.dims(), &[2, 4]);
        assert_eq!(out.targets.dims(), &[2, 2]);
    }
}
