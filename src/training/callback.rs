//! Metric callbacks run on the dataset splits
//!
//! The trainer calls a [`MetricCallback`] periodically (when `super_val` is
//! set) and once more after the best checkpoint has been reloaded.

use std::path::PathBuf;

use candle_core::{DType, Device, Tensor};
use tracing::info;

use super::context::TrainingContext;
use crate::data::{DataLoader, TripletDataset};
use crate::error::Result;
use crate::model::PartitionedFlow;

/// Train, validation and optional test data of one run
#[derive(Debug, Clone, Copy)]
pub struct DatasetSplits<'a> {
    pub train: &'a TripletDataset,
    pub validation: &'a TripletDataset,
    pub test: Option<&'a TripletDataset>,
}

impl<'a> DatasetSplits<'a> {
    /// Named splits in a fixed order
    pub fn named(&self) -> Vec<(&'static str, &'a TripletDataset)> {
        let mut splits = vec![("train", self.train), ("validation", self.validation)];
        if let Some(test) = self.test {
            splits.push(("test", test));
        }
        splits
    }
}

/// Downstream evaluation hook
pub trait MetricCallback {
    fn evaluate(&mut self, ctx: &TrainingContext, flow: &PartitionedFlow, splits: &DatasetSplits) -> Result<()>;
}

/// Callback that does nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCallback;

impl MetricCallback for NoopCallback {
    fn evaluate(&mut self, _ctx: &TrainingContext, _flow: &PartitionedFlow, _splits: &DatasetSplits) -> Result<()> {
        Ok(())
    }
}

/// Encode a whole dataset in order, returning `[N, latent_dim]`
pub fn encode_dataset(
    flow: &PartitionedFlow,
    dataset: &TripletDataset,
    batch_size: usize,
    device: &Device,
) -> Result<Tensor> {
    let mut loader = DataLoader::new(dataset.clone(), batch_size, false, false, 0);
    let mut parts = Vec::with_capacity(loader.num_batches());
    while let Some(batch) = loader.next_batch(device)? {
        parts.push(flow.encode(&batch.x)?);
    }
    Ok(Tensor::cat(&parts, 0)?)
}

fn mean_std(t: &Tensor) -> Result<(f64, f64)> {
    let t = t.to_dtype(DType::F64)?;
    let mean = t.mean_all()?.to_scalar::<f64>()?;
    let var = t.affine(1.0, -mean)?.sqr()?.mean_all()?.to_scalar::<f64>()?;
    Ok((mean, var.sqrt()))
}

/// Latent statistics of one split
#[derive(Debug, Clone, PartialEq)]
pub struct SplitStats {
    pub split: String,
    pub samples: usize,
    pub zy_mean: f64,
    pub zy_std: f64,
    pub zs_mean: f64,
    pub zs_std: f64,
}

/// Logs per-segment latent statistics and optionally dumps zy encodings
#[derive(Debug, Clone, Default)]
pub struct LatentReport {
    /// Directory for `zy_<split>.csv`; nothing is written when unset
    pub output_dir: Option<PathBuf>,
    /// Statistics from the most recent call
    pub last: Vec<SplitStats>,
    /// Number of completed calls
    pub calls: usize,
}

impl LatentReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_output_dir<P: Into<PathBuf>>(dir: P) -> Self {
        Self {
            output_dir: Some(dir.into()),
            ..Self::default()
        }
    }

    fn write_zy(&self, name: &str, zy: &Tensor, dataset: &TripletDataset) -> Result<()> {
        let Some(dir) = &self.output_dir else {
            return Ok(());
        };
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("zy_{name}.csv"));
        let rows = zy.to_dtype(DType::F32)?.to_vec2::<f32>()?;

        let mut writer = csv::Writer::from_path(&path)?;
        let width = rows.first().map_or(0, Vec::len);
        let mut header: Vec<String> = (0..width).map(|i| format!("zy_{i}")).collect();
        header.push("s".into());
        header.push("y".into());
        writer.write_record(&header)?;

        for (i, row) in rows.iter().enumerate() {
            let mut fields: Vec<String> = row.iter().map(|v| v.to_string()).collect();
            fields.push(dataset.s()[i].to_string());
            fields.push(dataset.y()[i].to_string());
            writer.write_record(&fields)?;
        }
        writer.flush()?;
        info!("Wrote {} zy encodings to {}", rows.len(), path.display());
        Ok(())
    }
}

impl MetricCallback for LatentReport {
    fn evaluate(&mut self, ctx: &TrainingContext, flow: &PartitionedFlow, splits: &DatasetSplits) -> Result<()> {
        let batch_size = ctx.config.test_batch_size();
        let mut stats = Vec::new();

        for (name, dataset) in splits.named() {
            if dataset.is_empty() {
                continue;
            }
            let z = encode_dataset(flow, dataset, batch_size, &ctx.device)?;
            let split = flow.split(&z)?;
            let (zy_mean, zy_std) = mean_std(&split.zy)?;
            let (zs_mean, zs_std) = mean_std(&split.zs)?;
            info!(
                "[LATENT] {}: n={} zy mean={:.4} std={:.4} | zs mean={:.4} std={:.4}",
                name,
                dataset.len(),
                zy_mean,
                zy_std,
                zs_mean,
                zs_std
            );
            self.write_zy(name, &split.zy, dataset)?;
            stats.push(SplitStats {
                split: name.to_string(),
                samples: dataset.len(),
                zy_mean,
                zy_std,
                zs_mean,
                zs_std,
            });
        }

        self.last = stats;
        self.calls += 1;
        Ok(())
    }
}
