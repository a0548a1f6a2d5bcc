use candle_core::{DType, Tensor, D};
use candle_nn::ops;

use crate::{
    config::DistillationKind,
    model::{ForwardOptions, ImageClassifier},
    TrainingError,
};

/// Weights of the four co-training terms: direct loss on each half, then
/// each half against the other's detached sigmoid.
pub const COSUB_WEIGHTS: [f64; 4] = [0.25, 0.25, 0.25, 0.25];

/// A scalar training objective. `inputs` are the (possibly mixed) samples
/// fed to the model; most criteria ignore them.
pub trait Criterion {
    fn loss(&self, inputs: &Tensor, outputs: &Tensor, targets: &Tensor)
        -> Result<Tensor, TrainingError>;
}

/// Cross entropy over hard class indices with optional label smoothing.
/// Dense `[batch, classes]` targets are accepted as well and treated as
/// soft labels.
#[derive(Debug, Clone, Default)]
pub struct CrossEntropyLoss {
    label_smoothing: f32,
}

impl CrossEntropyLoss {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_label_smoothing(mut self, smoothing: f32) -> Result<Self, TrainingError> {
        if !(0.0..1.0).contains(&smoothing) {
            return Err(TrainingError::initialization(
                "label smoothing must be in [0, 1) for cross entropy",
            ));
        }
        self.label_smoothing = smoothing;
        Ok(self)
    }

    pub fn compute(&self, logits: &Tensor, targets: &Tensor) -> Result<Tensor, TrainingError> {
        let (batch, classes) = logits_shape(logits)?;
        if targets.rank() == 2 {
            return soft_target_cross_entropy(logits, targets);
        }
        if targets.dims() != [batch] {
            return Err(TrainingError::runtime(format!(
                "cross entropy expects targets of shape [{}], got {:?}",
                batch,
                targets.dims()
            )));
        }

        let logits = logits.to_dtype(DType::F32).map_err(to_runtime_error)?;
        let log_probs = ops::log_softmax(&logits, D::Minus1).map_err(to_runtime_error)?;
        let target_indices = targets
            .to_dtype(DType::U32)
            .map_err(to_runtime_error)?
            .unsqueeze(1)
            .map_err(to_runtime_error)?;
        let nll = log_probs
            .gather(&target_indices, 1)
            .map_err(to_runtime_error)?
            .squeeze(1)
            .map_err(to_runtime_error)?
            .neg()
            .map_err(to_runtime_error)?;

        let per_sample = if self.label_smoothing > 0.0 && classes > 1 {
            let smoothing = self.label_smoothing as f64;
            let uniform = log_probs
                .mean(1)
                .map_err(to_runtime_error)?
                .neg()
                .map_err(to_runtime_error)?;
            let smoothed = nll
                .affine(1.0 - smoothing, 0.0)
                .map_err(to_runtime_error)?;
            let uniform_term = uniform.affine(smoothing, 0.0).map_err(to_runtime_error)?;
            (smoothed + uniform_term).map_err(to_runtime_error)?
        } else {
            nll
        };

        per_sample.mean_all().map_err(to_runtime_error)
    }
}

impl Criterion for CrossEntropyLoss {
    fn loss(
        &self,
        _inputs: &Tensor,
        outputs: &Tensor,
        targets: &Tensor,
    ) -> Result<Tensor, TrainingError> {
        self.compute(outputs, targets)
    }
}

/// Cross entropy against dense target distributions, as produced by mixup.
#[derive(Debug, Clone, Copy, Default)]
pub struct SoftTargetCrossEntropy;

impl Criterion for SoftTargetCrossEntropy {
    fn loss(
        &self,
        _inputs: &Tensor,
        outputs: &Tensor,
        targets: &Tensor,
    ) -> Result<Tensor, TrainingError> {
        if targets.rank() != 2 {
            return Err(TrainingError::runtime(
                "soft-target cross entropy requires [batch, classes] targets",
            ));
        }
        soft_target_cross_entropy(outputs, targets)
    }
}

/// Binary cross entropy on logits, averaged over every element. Hard labels
/// are expanded to one-hot rows first.
#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryCrossEntropyLoss;

impl BinaryCrossEntropyLoss {
    pub fn compute(&self, logits: &Tensor, targets: &Tensor) -> Result<Tensor, TrainingError> {
        let (_, classes) = logits_shape(logits)?;
        let targets = dense_targets(targets, classes)?;
        let logits = logits.to_dtype(DType::F32).map_err(to_runtime_error)?;
        if targets.dims() != logits.dims() {
            return Err(TrainingError::runtime(format!(
                "binary cross entropy shape mismatch: logits {:?} vs targets {:?}",
                logits.dims(),
                targets.dims()
            )));
        }

        // max(x, 0) - x * t + log(1 + exp(-|x|))
        let positive = logits.relu().map_err(to_runtime_error)?;
        let cross = (&logits * &targets).map_err(to_runtime_error)?;
        let softplus = logits
            .abs()
            .and_then(|t| t.neg())
            .and_then(|t| t.exp())
            .and_then(|t| t.affine(1.0, 1.0))
            .and_then(|t| t.log())
            .map_err(to_runtime_error)?;
        let per_element = (positive - cross)
            .and_then(|t| t + softplus)
            .map_err(to_runtime_error)?;
        per_element.mean_all().map_err(to_runtime_error)
    }
}

impl Criterion for BinaryCrossEntropyLoss {
    fn loss(
        &self,
        _inputs: &Tensor,
        outputs: &Tensor,
        targets: &Tensor,
    ) -> Result<Tensor, TrainingError> {
        self.compute(outputs, targets)
    }
}

/// Wraps a base criterion with knowledge distillation from a frozen teacher.
pub struct DistillationLoss {
    base: Box<dyn Criterion>,
    teacher: Option<Box<dyn ImageClassifier>>,
    kind: DistillationKind,
    alpha: f64,
    tau: f64,
}

impl DistillationLoss {
    /// A pass-through wrapper that only evaluates `base`.
    pub fn plain(base: Box<dyn Criterion>) -> Self {
        Self {
            base,
            teacher: None,
            kind: DistillationKind::None,
            alpha: 0.0,
            tau: 1.0,
        }
    }

    pub fn new(
        base: Box<dyn Criterion>,
        teacher: Box<dyn ImageClassifier>,
        kind: DistillationKind,
        alpha: f64,
        tau: f64,
    ) -> Result<Self, TrainingError> {
        if kind == DistillationKind::None {
            return Ok(Self::plain(base));
        }
        if !(0.0..=1.0).contains(&alpha) {
            return Err(TrainingError::initialization(
                "distillation alpha must be in [0, 1]",
            ));
        }
        if tau <= 0.0 {
            return Err(TrainingError::initialization(
                "distillation tau must be greater than zero",
            ));
        }
        teacher.set_training(false);
        Ok(Self {
            base,
            teacher: Some(teacher),
            kind,
            alpha,
            tau,
        })
    }

    fn distillation_term(
        &self,
        teacher: &dyn ImageClassifier,
        inputs: &Tensor,
        outputs: &Tensor,
    ) -> Result<Tensor, TrainingError> {
        let teacher_outputs = teacher
            .forward(inputs, &ForwardOptions::default())
            .and_then(|t| t.to_dtype(DType::F32))
            .map_err(to_runtime_error)?
            .detach();
        let outputs = outputs.to_dtype(DType::F32).map_err(to_runtime_error)?;

        match self.kind {
            DistillationKind::None => Err(TrainingError::runtime(
                "distillation term requested without a distillation kind",
            )),
            DistillationKind::Soft => {
                let t = self.tau;
                let student = outputs
                    .affine(1.0 / t, 0.0)
                    .and_then(|s| ops::log_softmax(&s, D::Minus1))
                    .map_err(to_runtime_error)?;
                let target = teacher_outputs
                    .affine(1.0 / t, 0.0)
                    .and_then(|s| ops::log_softmax(&s, D::Minus1))
                    .map_err(to_runtime_error)?;
                // KL(teacher || student) with log-space targets, summed.
                let kl = (&target - &student)
                    .and_then(|diff| target.exp()?.mul(&diff))
                    .and_then(|t| t.sum_all())
                    .map_err(to_runtime_error)?;
                let scale = t * t / outputs.elem_count() as f64;
                kl.affine(scale, 0.0).map_err(to_runtime_error)
            }
            DistillationKind::Hard => {
                let teacher_labels = teacher_outputs.argmax(D::Minus1).map_err(to_runtime_error)?;
                CrossEntropyLoss::new().compute(&outputs, &teacher_labels)
            }
        }
    }
}

impl Criterion for DistillationLoss {
    fn loss(
        &self,
        inputs: &Tensor,
        outputs: &Tensor,
        targets: &Tensor,
    ) -> Result<Tensor, TrainingError> {
        let base_loss = self.base.loss(inputs, outputs, targets)?;
        let Some(teacher) = self.teacher.as_deref() else {
            return Ok(base_loss);
        };
        let distill = self.distillation_term(teacher, inputs, outputs)?;
        let base_part = base_loss
            .affine(1.0 - self.alpha, 0.0)
            .map_err(to_runtime_error)?;
        let distill_part = distill.affine(self.alpha, 0.0).map_err(to_runtime_error)?;
        (base_part + distill_part).map_err(to_runtime_error)
    }
}

/// Co-training objective over a duplicated batch: the weighted sum of the
/// four [`CosubTerms`].
pub struct CosubLoss {
    base: Box<dyn Criterion>,
}

impl CosubLoss {
    pub fn new(base: Box<dyn Criterion>) -> Self {
        Self { base }
    }

    pub fn terms(
        &self,
        inputs: &Tensor,
        outputs: &Tensor,
        targets: &Tensor,
    ) -> Result<CosubTerms, TrainingError> {
        CosubTerms::compute(self.base.as_ref(), inputs, outputs, targets)
    }
}

impl Criterion for CosubLoss {
    fn loss(
        &self,
        inputs: &Tensor,
        outputs: &Tensor,
        targets: &Tensor,
    ) -> Result<Tensor, TrainingError> {
        self.terms(inputs, outputs, targets)?.total()
    }
}

/// The four unweighted co-training terms for a duplicated batch.
#[derive(Debug, Clone)]
pub struct CosubTerms {
    pub terms: [Tensor; 4],
}

impl CosubTerms {
    /// Splits `outputs` into two halves along the batch dimension and
    /// evaluates each half against `targets` and against the other half's
    /// detached sigmoid.
    pub fn compute(
        criterion: &dyn Criterion,
        inputs: &Tensor,
        outputs: &Tensor,
        targets: &Tensor,
    ) -> Result<Self, TrainingError> {
        let rows = outputs.dims().first().copied().unwrap_or(0);
        if rows == 0 || rows % 2 != 0 {
            return Err(TrainingError::runtime(format!(
                "co-training expects an even, non-empty batch of outputs, got {} rows",
                rows
            )));
        }
        let half = rows / 2;
        let first = outputs.narrow(0, 0, half).map_err(to_runtime_error)?;
        let second = outputs.narrow(0, half, half).map_err(to_runtime_error)?;
        let first_target = ops::sigmoid(&first.detach()).map_err(to_runtime_error)?;
        let second_target = ops::sigmoid(&second.detach()).map_err(to_runtime_error)?;

        Ok(Self {
            terms: [
                criterion.loss(inputs, &first, targets)?,
                criterion.loss(inputs, &second, targets)?,
                criterion.loss(inputs, &first, &second_target)?,
                criterion.loss(inputs, &second, &first_target)?,
            ],
        })
    }

    pub fn total(&self) -> Result<Tensor, TrainingError> {
        let mut total: Option<Tensor> = None;
        for (term, weight) in self.terms.iter().zip(COSUB_WEIGHTS) {
            let weighted = term.affine(weight, 0.0).map_err(to_runtime_error)?;
            total = Some(match total {
                Some(acc) => (acc + weighted).map_err(to_runtime_error)?,
                None => weighted,
            });
        }
        total.ok_or_else(|| TrainingError::runtime("co-training produced no terms"))
    }
}

/// Top-k accuracy in percent for each `k`. Soft targets are reduced to their
/// arg-max class.
pub fn accuracy(outputs: &Tensor, targets: &Tensor, topk: &[usize]) -> Result<Vec<f64>, TrainingError> {
    let (batch, _) = logits_shape(outputs)?;
    let labels = hard_labels(targets)?;
    if labels.len() != batch {
        return Err(TrainingError::runtime(format!(
            "accuracy expects {} labels, got {}",
            batch,
            labels.len()
        )));
    }
    let scores = outputs
        .to_dtype(DType::F32)
        .and_then(|t| t.to_vec2::<f32>())
        .map_err(to_runtime_error)?;

    let mut correct = vec![0usize; topk.len()];
    for (row, label) in scores.iter().zip(&labels) {
        let Some(&target_score) = row.get(*label as usize) else {
            return Err(TrainingError::runtime(format!(
                "label {} out of range for {} classes",
                label,
                row.len()
            )));
        };
        // Ties are resolved in favour of the lower class index.
        let rank = row
            .iter()
            .enumerate()
            .filter(|(idx, score)| {
                **score > target_score || (**score == target_score && *idx < *label as usize)
            })
            .count();
        for (slot, k) in correct.iter_mut().zip(topk) {
            if rank < *k {
                *slot += 1;
            }
        }
    }

    Ok(correct
        .into_iter()
        .map(|c| c as f64 * 100.0 / batch.max(1) as f64)
        .collect())
}

/// Replaces a non-finite scalar loss with a finite sentinel: NaN becomes
/// 0, infinities become the largest finite value of matching sign.
pub fn nan_to_num(loss: &Tensor) -> Result<Tensor, TrainingError> {
    let value = scalar_value(loss)?;
    if value.is_finite() {
        return Ok(loss.clone());
    }
    let replacement = if value.is_nan() {
        0.0
    } else if value.is_sign_positive() {
        f32::MAX
    } else {
        f32::MIN
    };
    Tensor::new(replacement, loss.device())
        .and_then(|t| t.to_dtype(loss.dtype()))
        .map_err(to_runtime_error)
}

/// Sets every positive target to 1 and everything else to 0.
pub fn binarize_targets(targets: &Tensor, num_classes: usize) -> Result<Tensor, TrainingError> {
    dense_targets(targets, num_classes)?
        .gt(0.0)
        .and_then(|t| t.to_dtype(DType::F32))
        .map_err(to_runtime_error)
}

/// Expands `[batch]` class indices into `[batch, classes]` rows holding
/// `on` at the label and `off` elsewhere.
pub fn one_hot(
    targets: &Tensor,
    num_classes: usize,
    on: f64,
    off: f64,
) -> Result<Tensor, TrainingError> {
    let device = targets.device();
    let classes = Tensor::arange(0u32, num_classes as u32, device)
        .and_then(|t| t.unsqueeze(0))
        .map_err(to_runtime_error)?;
    targets
        .to_dtype(DType::U32)
        .and_then(|t| t.unsqueeze(1))
        .and_then(|t| t.broadcast_eq(&classes))
        .and_then(|mask| mask.to_dtype(DType::F32))
        .and_then(|mask| mask.affine(on - off, off))
        .map_err(to_runtime_error)
}

/// `[batch, classes]` f32 targets, expanding class indices when needed.
pub fn dense_targets(targets: &Tensor, num_classes: usize) -> Result<Tensor, TrainingError> {
    match targets.rank() {
        1 => one_hot(targets, num_classes, 1.0, 0.0),
        2 => targets.to_dtype(DType::F32).map_err(to_runtime_error),
        rank => Err(TrainingError::runtime(format!(
            "targets must be rank 1 or 2, got rank {}",
            rank
        ))),
    }
}

pub fn scalar_value(loss: &Tensor) -> Result<f32, TrainingError> {
    loss.to_dtype(DType::F32)
        .and_then(|t| t.to_vec0::<f32>())
        .map_err(to_runtime_error)
}

fn soft_target_cross_entropy(logits: &Tensor, targets: &Tensor) -> Result<Tensor, TrainingError> {
    let logits = logits.to_dtype(DType::F32).map_err(to_runtime_error)?;
    let targets = targets.to_dtype(DType::F32).map_err(to_runtime_error)?;
    if logits.dims() != targets.dims() {
        return Err(TrainingError::runtime(format!(
            "soft targets {:?} do not match logits {:?}",
            targets.dims(),
            logits.dims()
        )));
    }
    let log_probs = ops::log_softmax(&logits, D::Minus1).map_err(to_runtime_error)?;
    (&targets * &log_probs)
        .and_then(|t| t.neg())
        .and_then(|t| t.sum(D::Minus1))
        .and_then(|t| t.mean_all())
        .map_err(to_runtime_error)
}

fn hard_labels(targets: &Tensor) -> Result<Vec<u32>, TrainingError> {
    let labels = match targets.rank() {
        1 => targets.to_dtype(DType::U32),
        2 => targets.argmax(D::Minus1),
        rank => {
            return Err(TrainingError::runtime(format!(
                "targets must be rank 1 or 2, got rank {}",
                rank
            )))
        }
    };
    labels
        .and_then(|t| t.to_vec1::<u32>())
        .map_err(to_runtime_error)
}

fn logits_shape(logits: &Tensor) -> Result<(usize, usize), TrainingError> {
    match logits.dims() {
        [batch, classes] if *batch > 0 && *classes > 0 => Ok((*batch, *classes)),
        dims => Err(TrainingError::runtime(format!(
            "expected non-empty [batch, classes] logits, got {:?}",
            dims
        ))),
    }
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn logits(rows: &[[f32; 3]]) -> Tensor {
        let flat: Vec<f32> = rows.iter().flatten().copied().collect();
        Tensor::from_vec(flat, (rows.len(), 3), &Device::Cpu).unwrap()
    }

    fn labels(values: &[u32]) -> Tensor {
        Tensor::from_slice(values, (values.len(),), &Device::Cpu).unwrap()
    }

    fn approx(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-5
    }

    #[test]
    fn cross_entropy_matches_manual_value() {
        let out = logits(&[[0.0, 0.0, 0.0]]);
        let loss = CrossEntropyLoss::new().compute(&out, &labels(&[1])).unwrap();
        assert!(approx(scalar_value(&loss).unwrap(), 3f32.ln()));
    }

    #[test]
    fn hard_and_one_hot_targets_agree() {
        let out = logits(&[[2.0, -1.0, 0.5], [0.1, 0.2, 3.0]]);
        let hard = labels(&[0, 2]);
        let soft = one_hot(&hard, 3, 1.0, 0.0).unwrap();
        let a = CrossEntropyLoss::new().compute(&out, &hard).unwrap();
        let b = SoftTargetCrossEntropy.loss(&out, &out, &soft).unwrap();
        assert!(approx(scalar_value(&a).unwrap(), scalar_value(&b).unwrap()));
    }

    #[test]
    fn label_smoothing_raises_confident_loss() {
        let out = logits(&[[10.0, 0.0, 0.0]]);
        let target = labels(&[0]);
        let plain = CrossEntropyLoss::new().compute(&out, &target).unwrap();
        let smooth = CrossEntropyLoss::new()
            .with_label_smoothing(0.1)
            .unwrap()
            .compute(&out, &target)
            .unwrap();
        assert!(scalar_value(&smooth).unwrap() > scalar_value(&plain).unwrap());
        assert!(CrossEntropyLoss::new().with_label_smoothing(1.0).is_err());
    }

    #[test]
    fn binary_cross_entropy_of_zero_logits_is_ln2() {
        let out = logits(&[[0.0, 0.0, 0.0]]);
        let loss = BinaryCrossEntropyLoss.compute(&out, &labels(&[2])).unwrap();
        assert!(approx(scalar_value(&loss).unwrap(), 2f32.ln()));
    }

    #[test]
    fn binary_cross_entropy_is_stable_for_large_logits() {
        let out = logits(&[[80.0, -80.0, 0.0]]);
        let target = Tensor::from_vec(vec![1f32, 0.0, 0.5], (1, 3), &Device::Cpu).unwrap();
        let value = scalar_value(&BinaryCrossEntropyLoss.compute(&out, &target).unwrap()).unwrap();
        assert!(value.is_finite());
        assert!(approx(value, 2f32.ln() / 3.0));
    }

    #[test]
    fn cosub_total_is_weighted_sum_of_terms() {
        let out = logits(&[
            [1.0, -2.0, 0.5],
            [0.3, 0.3, -1.0],
            [-0.5, 2.0, 1.5],
            [0.0, 1.0, -3.0],
        ]);
        let targets = one_hot(&labels(&[0, 2]), 3, 1.0, 0.0).unwrap();
        let terms = CosubTerms::compute(&BinaryCrossEntropyLoss, &out, &out, &targets).unwrap();
        let values: Vec<f32> = terms
            .terms
            .iter()
            .map(|t| scalar_value(t).unwrap())
            .collect();
        let expected: f32 = values
            .iter()
            .zip(COSUB_WEIGHTS)
            .map(|(v, w)| v * w as f32)
            .sum();
        assert!(approx(scalar_value(&terms.total().unwrap()).unwrap(), expected));
        assert!(approx(COSUB_WEIGHTS.iter().sum::<f64>() as f32, 1.0));
    }

    #[test]
    fn cosub_rejects_odd_batches() {
        let out = logits(&[[1.0, 0.0, 0.0]]);
        let targets = labels(&[0]);
        assert!(CosubTerms::compute(&BinaryCrossEntropyLoss, &out, &out, &targets).is_err());
    }

    #[test]
    fn accuracy_counts_top1_and_top2() {
        let out = logits(&[[3.0, 2.0, 1.0], [1.0, 2.0, 3.0], [2.0, 3.0, 1.0]]);
        let acc = accuracy(&out, &labels(&[0, 1, 2]), &[1, 2]).unwrap();
        assert!((acc[0] - 100.0 / 3.0).abs() < 1e-9);
        assert!((acc[1] - 200.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn nan_to_num_maps_non_finite_to_sentinels() {
        let nan = Tensor::new(f32::NAN, &Device::Cpu).unwrap();
        let inf = Tensor::new(f32::INFINITY, &Device::Cpu).unwrap();
        let fine = Tensor::new(1.5f32, &Device::Cpu).unwrap();
        assert_eq!(scalar_value(&nan_to_num(&nan).unwrap()).unwrap(), 0.0);
        assert_eq!(scalar_value(&nan_to_num(&inf).unwrap()).unwrap(), f32::MAX);
        assert_eq!(scalar_value(&nan_to_num(&fine).unwrap()).unwrap(), 1.5);
    }

    #[test]
    fn binarize_marks_every_positive_target() {
        let soft = Tensor::from_vec(vec![0.7f32, 0.3, 0.0], (1, 3), &Device::Cpu).unwrap();
        let bin = binarize_targets(&soft, 3).unwrap();
        assert_eq!(bin.to_vec2::<f32>().unwrap(), vec![vec![1.0, 1.0, 0.0]]);
    }

    #[test]
    fn soft_distillation_of_identical_teacher_is_zero() {
        struct Echo;
        impl ImageClassifier for Echo {
            fn forward(&self, xs: &Tensor, _: &ForwardOptions) -> candle_core::Result<Tensor> {
                Ok(xs.clone())
            }
            fn set_training(&self, _: bool) {}
            fn is_training(&self) -> bool {
                false
            }
            fn named_parameters(&self) -> Vec<(String, candle_core::Var)> {
                Vec::new()
            }
        }

        let out = logits(&[[1.0, 2.0, 0.5]]);
        let target = labels(&[1]);
        let criterion = DistillationLoss::new(
            Box::new(CrossEntropyLoss::new()),
            Box::new(Echo),
            DistillationKind::Soft,
            0.5,
            2.0,
        )
        .unwrap();
        let combined = scalar_value(&criterion.loss(&out, &out, &target).unwrap()).unwrap();
        let base = scalar_value(&CrossEntropyLoss::new().compute(&out, &target).unwrap()).unwrap();
        assert!(approx(combined, 0.5 * base));
    }
}
