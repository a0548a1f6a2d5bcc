use std::path::Path;

use candle_core::{DType, Device, Tensor};
use futures::future::{self, BoxFuture};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use crate::TrainingError;

/// Result alias for data pipeline fallible operations.
pub type Result<T> = std::result::Result<T, TrainingError>;

/// Key of the image tensor inside a dataset file.
pub const IMAGES_KEY: &str = "images";
/// Key of the label tensor inside a dataset file.
pub const LABELS_KEY: &str = "labels";

/// One mini-batch as handed to the train/eval loops.
#[derive(Debug, Clone)]
pub struct DataBatch {
    /// `[batch, channels, height, width]` (or any `[batch, ...]`) float tensor.
    pub samples: Tensor,
    /// `[batch]` class indices, or `[batch, classes]` soft targets after mixing.
    pub targets: Tensor,
}

impl DataBatch {
    pub fn new(samples: Tensor, targets: Tensor) -> Self {
        Self { samples, targets }
    }

    pub fn batch_size(&self) -> usize {
        self.samples.dims().first().copied().unwrap_or(0)
    }

    /// Moves both tensors onto `device`; a no-op when they already live there.
    pub fn to_device(&self, device: &Device) -> Result<Self> {
        Ok(Self {
            samples: self
                .samples
                .to_device(device)
                .map_err(to_runtime_error)?,
            targets: self
                .targets
                .to_device(device)
                .map_err(to_runtime_error)?,
        })
    }
}

/// Asynchronous-compatible loader abstraction.
pub trait DataLoader: Send {
    fn next_batch(&mut self) -> BoxFuture<'_, Result<Option<DataBatch>>>;

    /// Number of batches one pass will yield, when known.
    fn len_hint(&self) -> Option<usize> {
        None
    }
}

/// Blocking adapter around an async-friendly loader.
pub struct BlockingDataLoader<L>
where
    L: DataLoader,
{
    inner: L,
}

impl<L> BlockingDataLoader<L>
where
    L: DataLoader,
{
    pub fn new(inner: L) -> Self {
        Self { inner }
    }

    pub fn next_batch(&mut self) -> Result<Option<DataBatch>> {
        futures::executor::block_on(self.inner.next_batch())
    }

    pub fn inner_mut(&mut self) -> &mut L {
        &mut self.inner
    }

    pub fn into_inner(self) -> L {
        self.inner
    }
}

impl<L> Iterator for BlockingDataLoader<L>
where
    L: DataLoader,
{
    type Item = Result<DataBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_batch().transpose()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        match self.inner.len_hint() {
            Some(len) => (0, Some(len)),
            None => (0, None),
        }
    }
}

/// In-memory dataset of images and integer labels, batched with optional
/// seeded per-epoch shuffling.
pub struct TensorDataLoader {
    images: Tensor,
    labels: Tensor,
    batch_size: usize,
    shuffle: bool,
    drop_last: bool,
    seed: u64,
    order: Vec<u32>,
    cursor: usize,
}

impl TensorDataLoader {
    pub fn new(
        images: Tensor,
        labels: Tensor,
        batch_size: usize,
        shuffle: bool,
        drop_last: bool,
        seed: u64,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(TrainingError::initialization(
                "batch size must be greater than zero",
            ));
        }
        let num_images = images.dims().first().copied().unwrap_or(0);
        let label_dims = labels.dims();
        if label_dims.len() != 1 {
            return Err(TrainingError::initialization(format!(
                "labels must be a rank-1 tensor, got shape {:?}",
                label_dims
            )));
        }
        if label_dims[0] != num_images {
            return Err(TrainingError::initialization(format!(
                "dataset has {} images but {} labels",
                num_images, label_dims[0]
            )));
        }
        if num_images == 0 {
            return Err(TrainingError::initialization("dataset is empty"));
        }

        let images = images.to_dtype(DType::F32).map_err(to_runtime_error)?;
        let labels = labels.to_dtype(DType::U32).map_err(to_runtime_error)?;

        let mut loader = Self {
            images,
            labels,
            batch_size,
            shuffle,
            drop_last,
            seed,
            order: (0..num_images as u32).collect(),
            cursor: 0,
        };
        loader.set_epoch(0);
        Ok(loader)
    }

    /// Reads `images` and `labels` tensors from a safetensors file.
    pub fn from_safetensors(
        path: impl AsRef<Path>,
        batch_size: usize,
        shuffle: bool,
        drop_last: bool,
        seed: u64,
    ) -> Result<Self> {
        let path = path.as_ref();
        let mut tensors = candle_core::safetensors::load(path, &Device::Cpu).map_err(|err| {
            TrainingError::initialization(format!(
                "failed to read dataset {}: {err}",
                path.display()
            ))
        })?;
        let images = tensors.remove(IMAGES_KEY).ok_or_else(|| {
            TrainingError::initialization(format!(
                "dataset {} has no '{}' tensor",
                path.display(),
                IMAGES_KEY
            ))
        })?;
        let labels = tensors.remove(LABELS_KEY).ok_or_else(|| {
            TrainingError::initialization(format!(
                "dataset {} has no '{}' tensor",
                path.display(),
                LABELS_KEY
            ))
        })?;
        Self::new(images, labels, batch_size, shuffle, drop_last, seed)
    }

    /// Rewinds to the start of the dataset and reshuffles with a seed
    /// derived from `epoch`.
    pub fn set_epoch(&mut self, epoch: usize) {
        self.cursor = 0;
        self.order.sort_unstable();
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch as u64));
            self.order.shuffle(&mut rng);
        }
    }

    pub fn num_samples(&self) -> usize {
        self.order.len()
    }

    /// Per-sample shape, without the batch dimension.
    pub fn sample_shape(&self) -> &[usize] {
        &self.images.dims()[1..]
    }

    pub fn num_batches(&self) -> usize {
        let n = self.order.len();
        if self.drop_last {
            n / self.batch_size
        } else {
            n.div_ceil(self.batch_size)
        }
    }

    fn take_batch(&mut self) -> Result<Option<DataBatch>> {
        let remaining = self.order.len().saturating_sub(self.cursor);
        if remaining == 0 || (self.drop_last && remaining < self.batch_size) {
            return Ok(None);
        }
        let len = remaining.min(self.batch_size);
        let indices = &self.order[self.cursor..self.cursor + len];
        self.cursor += len;

        let index = Tensor::from_slice(indices, (len,), self.images.device())
            .map_err(to_runtime_error)?;
        let samples = self
            .images
            .index_select(&index, 0)
            .map_err(to_runtime_error)?;
        let targets = self
            .labels
            .index_select(&index, 0)
            .map_err(to_runtime_error)?;
        Ok(Some(DataBatch { samples, targets }))
    }
}

impl DataLoader for TensorDataLoader {
    fn next_batch(&mut self) -> BoxFuture<'_, Result<Option<DataBatch>>> {
        Box::pin(future::ready(self.take_batch()))
    }

    fn len_hint(&self) -> Option<usize> {
        Some(self.num_batches())
    }
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toy_loader(n: usize, batch: usize, shuffle: bool, drop_last: bool) -> TensorDataLoader {
        let images: Vec<f32> = (0..n * 4).map(|v| v as f32).collect();
        let images = Tensor::from_vec(images, (n, 1, 2, 2), &Device::Cpu).unwrap();
        let labels: Vec<u32> = (0..n as u32).collect();
        let labels = Tensor::from_vec(labels, (n,), &Device::Cpu).unwrap();
        TensorDataLoader::new(images, labels, batch, shuffle, drop_last, 7).unwrap()
    }

    fn collect_labels(loader: TensorDataLoader) -> Vec<Vec<u32>> {
        BlockingDataLoader::new(loader)
            .map(|batch| batch.unwrap().targets.to_vec1::<u32>().unwrap())
            .collect()
    }

    #[test]
    fn sequential_batches_keep_order() {
        let batches = collect_labels(toy_loader(5, 2, false, false));
        assert_eq!(batches, vec![vec![0, 1], vec![2, 3], vec![4]]);
    }

    #[test]
    fn drop_last_discards_partial_batch() {
        let loader = toy_loader(5, 2, false, true);
        assert_eq!(loader.num_batches(), 2);
        let batches = collect_labels(loader);
        assert_eq!(batches.len(), 2);
    }

    #[test]
    fn shuffle_is_a_permutation_and_seeded_per_epoch() {
        let mut loader = toy_loader(8, 8, true, false);
        let first = loader.take_batch().unwrap().unwrap();
        let mut labels = first.targets.to_vec1::<u32>().unwrap();

        loader.set_epoch(0);
        let again = loader.take_batch().unwrap().unwrap();
        assert_eq!(again.targets.to_vec1::<u32>().unwrap(), labels);

        labels.sort_unstable();
        assert_eq!(labels, (0..8).collect::<Vec<u32>>());
    }

    #[test]
    fn samples_follow_their_labels() {
        let mut loader = toy_loader(4, 4, true, false);
        let batch = loader.take_batch().unwrap().unwrap();
        let labels = batch.targets.to_vec1::<u32>().unwrap();
        let firsts = batch
            .samples
            .flatten_from(1)
            .unwrap()
            .narrow(1, 0, 1)
            .unwrap()
            .squeeze(1)
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        for (label, first) in labels.iter().zip(firsts) {
            assert_eq!(first, (*label * 4) as f32);
        }
    }

    #[test]
    fn mismatched_lengths_are_rejected() {
        let images = Tensor::zeros((3, 2), DType::F32, &Device::Cpu).unwrap();
        let labels = Tensor::zeros((2,), DType::U32, &Device::Cpu).unwrap();
        assert!(TensorDataLoader::new(images, labels, 1, false, false, 0).is_err());
    }
}
