//! Triplet dataset and DataLoader
//!
//! Provides batching of `(x, s, y)` triplets with support for:
//! - Seeded shuffling per epoch
//! - Dropping the last incomplete batch
//! - Train/validation splitting

use candle_core::{Device, Tensor};
use ndarray::{Array1, ArrayD, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::error::{FairFlowError, Result};

/// Aligned batch of inputs, sensitive labels and task labels
#[derive(Debug, Clone)]
pub struct Batch {
    /// `[B, ...]` f32 inputs
    pub x: Tensor,
    /// `[B]` u32 sensitive labels
    pub s: Tensor,
    /// `[B]` u32 task labels
    pub y: Tensor,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.x.dims().first().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-memory `(x, s, y)` dataset
#[derive(Debug, Clone)]
pub struct TripletDataset {
    x: ArrayD<f32>,
    s: Array1<u32>,
    y: Array1<u32>,
}

impl TripletDataset {
    /// `x` has the sample axis first; `s` and `y` hold one label per sample
    pub fn new(x: ArrayD<f32>, s: Array1<u32>, y: Array1<u32>) -> Result<Self> {
        if x.ndim() < 2 {
            return Err(FairFlowError::shape(format!(
                "inputs need a sample axis and at least one feature axis, got {:?}",
                x.shape()
            )));
        }
        let n = x.shape()[0];
        if s.len() != n || y.len() != n {
            return Err(FairFlowError::shape(format!(
                "{n} inputs but {} sensitive and {} task labels",
                s.len(),
                y.len()
            )));
        }
        Ok(Self { x, s, y })
    }

    pub fn len(&self) -> usize {
        self.s.len()
    }

    pub fn is_empty(&self) -> bool {
        self.s.is_empty()
    }

    /// Per-sample input shape
    pub fn sample_shape(&self) -> Vec<usize> {
        self.x.shape()[1..].to_vec()
    }

    pub fn x(&self) -> &ArrayD<f32> {
        &self.x
    }

    pub fn s(&self) -> &Array1<u32> {
        &self.s
    }

    pub fn y(&self) -> &Array1<u32> {
        &self.y
    }

    /// Samples at `indices`, in that order
    pub fn subset(&self, indices: &[usize]) -> Self {
        Self {
            x: self.x.select(Axis(0), indices),
            s: self.s.select(Axis(0), indices),
            y: self.y.select(Axis(0), indices),
        }
    }

    /// Shuffle with `seed`, then split off the last `fraction` of samples
    pub fn split_at_fraction(&self, fraction: f64, seed: u64) -> Result<(Self, Self)> {
        if !(0.0..1.0).contains(&fraction) {
            return Err(FairFlowError::config(format!("split fraction must be in [0, 1), got {fraction}")));
        }
        let mut indices: Vec<usize> = (0..self.len()).collect();
        indices.shuffle(&mut StdRng::seed_from_u64(seed));
        let held_out = ((self.len() as f64) * fraction).round() as usize;
        let cut = self.len() - held_out;
        Ok((self.subset(&indices[..cut]), self.subset(&indices[cut..])))
    }

    /// Tensor batch of the samples at `indices`
    pub fn batch(&self, indices: &[usize], device: &Device) -> Result<Batch> {
        let part = self.subset(indices);
        let mut shape = part.x.shape().to_vec();
        shape[0] = indices.len();
        let x: Vec<f32> = part.x.iter().copied().collect();
        Ok(Batch {
            x: Tensor::from_vec(x, shape, device)?,
            s: Tensor::from_vec(part.s.to_vec(), indices.len(), device)?,
            y: Tensor::from_vec(part.y.to_vec(), indices.len(), device)?,
        })
    }
}

/// DataLoader for iterating over batched triplets
pub struct DataLoader {
    /// Full dataset
    dataset: TripletDataset,
    /// Batch size
    batch_size: usize,
    /// Whether to shuffle data each epoch
    shuffle: bool,
    /// Whether to drop the last incomplete batch
    drop_last: bool,
    /// Current indices for iteration
    indices: Vec<usize>,
    /// Current position in iteration
    current_idx: usize,
    rng: StdRng,
}

impl DataLoader {
    /// Create a new DataLoader
    ///
    /// # Arguments
    ///
    /// * `dataset` - Triplets to iterate over
    /// * `batch_size` - Number of samples per batch
    /// * `shuffle` - Whether to shuffle data each epoch
    /// * `drop_last` - Whether to drop incomplete final batch
    /// * `seed` - Seed of the shuffling RNG
    pub fn new(dataset: TripletDataset, batch_size: usize, shuffle: bool, drop_last: bool, seed: u64) -> Self {
        let indices: Vec<usize> = (0..dataset.len()).collect();
        let mut loader = Self {
            dataset,
            batch_size: batch_size.max(1),
            shuffle,
            drop_last,
            indices,
            current_idx: 0,
            rng: StdRng::seed_from_u64(seed),
        };

        if shuffle {
            loader.indices.shuffle(&mut loader.rng);
        }

        loader
    }

    /// Get the number of batches per epoch
    pub fn num_batches(&self) -> usize {
        let num_samples = self.dataset.len();
        if self.drop_last {
            num_samples / self.batch_size
        } else {
            (num_samples + self.batch_size - 1) / self.batch_size
        }
    }

    /// Get total number of samples
    pub fn num_samples(&self) -> usize {
        self.dataset.len()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn dataset(&self) -> &TripletDataset {
        &self.dataset
    }

    /// Reset for new epoch
    pub fn reset(&mut self) {
        self.current_idx = 0;
        if self.shuffle {
            self.indices.shuffle(&mut self.rng);
        }
    }

    /// Get next batch
    ///
    /// Returns `None` when the epoch is complete
    pub fn next_batch(&mut self, device: &Device) -> Result<Option<Batch>> {
        let num_samples = self.indices.len();
        let start = self.current_idx;
        if start >= num_samples {
            return Ok(None);
        }

        let end = (start + self.batch_size).min(num_samples);
        if self.drop_last && end - start < self.batch_size {
            return Ok(None);
        }

        self.current_idx = end;
        let batch = self.dataset.batch(&self.indices[start..end], device)?;
        Ok(Some(batch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array2, IxDyn};

    fn dataset(n: usize) -> TripletDataset {
        let x = Array2::from_shape_fn((n, 2), |(i, j)| (i * 2 + j) as f32).into_dyn();
        let s = Array1::from_iter((0..n).map(|i| (i % 2) as u32));
        let y = Array1::from_iter((0..n).map(|i| (i % 3 == 0) as u32));
        TripletDataset::new(x, s, y).unwrap()
    }

    #[test]
    fn test_dataloader_basic() {
        let mut loader = DataLoader::new(dataset(10), 3, false, false, 0);
        assert_eq!(loader.num_batches(), 4); // ceil(10/3) = 4
        assert_eq!(loader.num_samples(), 10);

        let mut sizes = Vec::new();
        while let Some(batch) = loader.next_batch(&Device::Cpu).unwrap() {
            assert_eq!(batch.s.dims(), &[batch.len()]);
            sizes.push(batch.len());
        }
        assert_eq!(sizes, vec![3, 3, 3, 1]);
    }

    #[test]
    fn test_dataloader_drop_last() {
        let mut loader = DataLoader::new(dataset(10), 3, false, true, 0);
        assert_eq!(loader.num_batches(), 3); // floor(10/3) = 3

        let mut count = 0;
        while let Some(batch) = loader.next_batch(&Device::Cpu).unwrap() {
            assert_eq!(batch.len(), 3);
            count += 1;
        }
        assert_eq!(count, 3);
    }

    #[test]
    fn test_batches_keep_triplets_aligned() {
        let mut loader = DataLoader::new(dataset(12), 5, true, false, 9);
        while let Some(batch) = loader.next_batch(&Device::Cpu).unwrap() {
            let x = batch.x.to_vec2::<f32>().unwrap();
            let s = batch.s.to_vec1::<u32>().unwrap();
            for (row, label) in x.iter().zip(&s) {
                let index = (row[0] / 2.0) as usize;
                assert_eq!(*label, (index % 2) as u32);
            }
        }
    }

    #[test]
    fn test_shuffle_is_seeded() {
        let order = |seed| {
            let mut loader = DataLoader::new(dataset(20), 20, true, false, seed);
            loader.next_batch(&Device::Cpu).unwrap().unwrap().s.to_vec1::<u32>().unwrap()
        };
        assert_eq!(order(4), order(4));
    }

    #[test]
    fn test_reset_restarts_epoch() {
        let mut loader = DataLoader::new(dataset(4), 4, false, false, 0);
        assert!(loader.next_batch(&Device::Cpu).unwrap().is_some());
        assert!(loader.next_batch(&Device::Cpu).unwrap().is_none());
        loader.reset();
        assert!(loader.next_batch(&Device::Cpu).unwrap().is_some());
    }

    #[test]
    fn test_split_at_fraction() {
        let (train, val) = dataset(10).split_at_fraction(0.3, 1).unwrap();
        assert_eq!((train.len(), val.len()), (7, 3));
        assert_eq!(train.sample_shape(), vec![2]);
        assert!(dataset(10).split_at_fraction(1.0, 1).is_err());
    }

    #[test]
    fn test_misaligned_labels_rejected() {
        let x = ArrayD::<f32>::zeros(IxDyn(&[3, 2]));
        let s = Array1::from_vec(vec![0u32, 1]);
        let y = Array1::from_vec(vec![0u32, 1, 1]);
        assert!(TripletDataset::new(x, s, y).is_err());
    }
}
