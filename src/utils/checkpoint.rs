//! Checkpoint save/load utilities
//!
//! A checkpoint is one bincode record holding the configuration snapshot,
//! the flow and discriminator parameters and the training position. Writes
//! go to a temporary file in the target directory which is then renamed over
//! the destination, so a failed write never replaces a good checkpoint.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use candle_core::Device;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::error::{FairFlowError, Result};
use crate::model::{DiscriminatorEnsemble, PartitionedFlow, TensorRecord};
use crate::training::TrainingContext;
use crate::utils::config::Config;

/// Serialized training state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Configuration the model was built from
    pub config: Config,
    /// Per-sample input shape
    pub input_shape: Vec<usize>,
    /// Architecture hash of `config`
    pub config_hash: String,
    /// Last completed epoch
    pub epoch: usize,
    /// Iterations run so far
    pub itr: usize,
    /// Best validation loss seen so far
    pub best_val_loss: Option<f64>,
    /// Optional version/commit tag
    pub version_tag: Option<String>,
    /// RFC 3339 creation time
    pub timestamp: String,
    /// Flow parameters by name
    pub flow: BTreeMap<String, TensorRecord>,
    /// Parameters of each discriminator
    pub discriminators: Vec<BTreeMap<String, TensorRecord>>,
}

impl Checkpoint {
    /// Snapshot the current training state
    pub fn capture(
        ctx: &TrainingContext,
        flow: &PartitionedFlow,
        ensemble: &DiscriminatorEnsemble,
        epoch: usize,
        itr: usize,
        best_val_loss: Option<f64>,
    ) -> Result<Self> {
        let input_shape = flow.input_shape().to_vec();
        Ok(Self {
            config_hash: ctx.config.architecture_hash(&input_shape)?,
            config: ctx.config.clone(),
            input_shape,
            epoch,
            itr,
            best_val_loss,
            version_tag: ctx.version_tag.clone(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            flow: flow.export()?,
            discriminators: ensemble.export()?,
        })
    }

    /// Write atomically to `path`
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir)?;

        let bytes = bincode::serialize(self)?;
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| e.error)?;

        tracing::info!("Saved checkpoint (epoch {}) to {}", self.epoch, path.display());
        Ok(())
    }

    /// Read a checkpoint; a missing file is an error
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        Ok(bincode::deserialize(&bytes)?)
    }

    /// Fail if `config` and `input_shape` describe a different architecture
    pub fn check_compatible(&self, config: &Config, input_shape: &[usize]) -> Result<()> {
        fn check<T: PartialEq + std::fmt::Debug>(field: &str, stored: T, current: T) -> Result<()> {
            if stored == current {
                Ok(())
            } else {
                Err(FairFlowError::CheckpointMismatch {
                    field: field.to_string(),
                    stored: format!("{stored:?}"),
                    current: format!("{current:?}"),
                })
            }
        }

        let (stored, current) = (&self.config, config);
        check("input_shape", self.input_shape.as_slice(), input_shape)?;
        check("levels", stored.flow.levels, current.flow.levels)?;
        check("level_depth", stored.flow.level_depth, current.flow.level_depth)?;
        check("coupling_channels", stored.flow.coupling_channels, current.flow.coupling_channels)?;
        check("coupling_depth", stored.flow.coupling_depth, current.flow.coupling_depth)?;
        check("scaling", stored.flow.scaling, current.flow.scaling)?;
        check("permutation", stored.flow.permutation, current.flow.permutation)?;
        check("actnorm", stored.flow.actnorm, current.flow.actnorm)?;
        check("batch_norm", stored.flow.batch_norm, current.flow.batch_norm)?;
        check("zs_frac", stored.flow.zs_frac, current.flow.zs_frac)?;
        check("zy_frac", stored.flow.zy_frac(), current.flow.zy_frac())?;
        check("num_discs", stored.adversary.num_discs, current.adversary.num_discs)?;
        check("disc_hidden_dims", &stored.adversary.hidden_dims, &current.adversary.hidden_dims)?;
        check("s_dim", stored.data.s_dim, current.data.s_dim)?;
        check(
            "architecture",
            self.config_hash.as_str(),
            current.architecture_hash(input_shape)?.as_str(),
        )
    }

    /// Load the stored parameters into existing models built from `config`
    pub fn restore(&self, config: &Config, flow: &PartitionedFlow, ensemble: &DiscriminatorEnsemble) -> Result<()> {
        self.check_compatible(config, flow.input_shape())?;
        flow.import(&self.flow)?;
        ensemble.import(&self.discriminators)?;
        Ok(())
    }

    /// Rebuild both models from the stored configuration
    pub fn build(&self, device: &Device) -> Result<(PartitionedFlow, DiscriminatorEnsemble)> {
        let flow = PartitionedFlow::new(&self.config, &self.input_shape, device)?;
        let ensemble = DiscriminatorEnsemble::for_flow(&self.config, &flow, device)?;
        self.restore(&self.config, &flow, &ensemble)?;
        Ok((flow, ensemble))
    }
}

/// Prefer `best.ckpt` over `last.ckpt` inside a run directory
pub fn find_checkpoint<P: AsRef<Path>>(path: P) -> Option<PathBuf> {
    let path = path.as_ref();
    if path.is_file() {
        return Some(path.to_path_buf());
    }
    ["best.ckpt", "last.ckpt"]
        .iter()
        .map(|name| path.join(name))
        .find(|candidate| candidate.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Tensor;
    use tempfile::tempdir;

    fn config() -> Config {
        let mut config = Config::default();
        config.flow.level_depth = 2;
        config.flow.coupling_channels = 8;
        config.flow.zs_frac = 0.5;
        config.adversary.hidden_dims = vec![4];
        config
    }

    fn models(config: &Config) -> (PartitionedFlow, DiscriminatorEnsemble) {
        let flow = PartitionedFlow::new(config, &[2], &Device::Cpu).unwrap();
        let ensemble = DiscriminatorEnsemble::for_flow(config, &flow, &Device::Cpu).unwrap();
        (flow, ensemble)
    }

    fn fixed_input() -> Tensor {
        Tensor::new(&[[0.3f32, -1.2], [1.7, 0.4], [-0.5, 0.9]], &Device::Cpu).unwrap()
    }

    #[test]
    fn test_save_load_restore() {
        let dir = tempdir().unwrap();
        let ctx = TrainingContext::new(config(), dir.path()).unwrap();
        let (flow, ensemble) = models(&ctx.config);
        flow.forward(&fixed_input()).unwrap();

        let ckpt = Checkpoint::capture(&ctx, &flow, &ensemble, 4, 40, Some(1.25)).unwrap();
        ckpt.save(ctx.best_checkpoint_path()).unwrap();

        let loaded = Checkpoint::load(ctx.best_checkpoint_path()).unwrap();
        assert_eq!(loaded.epoch, 4);
        assert_eq!(loaded.itr, 40);
        assert_eq!(loaded.best_val_loss, Some(1.25));
        assert_eq!(loaded.config, ctx.config);

        let (mut restored, restored_ensemble) = loaded.build(&Device::Cpu).unwrap();
        restored.set_training(false);
        let mut flow = flow;
        flow.set_training(false);
        assert_eq!(
            flow.encode(&fixed_input()).unwrap().to_vec2::<f32>().unwrap(),
            restored.encode(&fixed_input()).unwrap().to_vec2::<f32>().unwrap()
        );
        assert_eq!(ensemble.export().unwrap(), restored_ensemble.export().unwrap());
    }

    #[test]
    fn test_mismatched_hyperparameters_rejected() {
        let dir = tempdir().unwrap();
        let ctx = TrainingContext::new(config(), dir.path()).unwrap();
        let (flow, ensemble) = models(&ctx.config);
        let ckpt = Checkpoint::capture(&ctx, &flow, &ensemble, 1, 1, None).unwrap();

        let mut other = config();
        other.flow.coupling_channels = 16;
        let err = ckpt.check_compatible(&other, &[2]).unwrap_err();
        assert!(matches!(
            err,
            FairFlowError::CheckpointMismatch { ref field, .. } if field == "coupling_channels"
        ));

        assert!(ckpt.check_compatible(&config(), &[3]).is_err());

        let mut lr_only = config();
        lr_only.training.lr = 1e-2;
        assert!(ckpt.check_compatible(&lr_only, &[2]).is_ok());

        let mut normed = config();
        normed.flow.batch_norm = true;
        let err = ckpt.check_compatible(&normed, &[2]).unwrap_err();
        assert!(matches!(
            err,
            FairFlowError::CheckpointMismatch { ref field, .. } if field == "batch_norm"
        ));

        // dequantization noise does not change the parameter layout
        let mut noisy = config();
        noisy.flow.input_noise = true;
        assert!(ckpt.check_compatible(&noisy, &[2]).is_ok());
    }

    #[test]
    fn test_missing_file_is_error() {
        let dir = tempdir().unwrap();
        assert!(Checkpoint::load(dir.path().join("nope.ckpt")).is_err());
    }

    #[test]
    fn test_overwrite_leaves_no_temp_files() {
        let dir = tempdir().unwrap();
        let ctx = TrainingContext::new(config(), dir.path()).unwrap();
        let (flow, ensemble) = models(&ctx.config);
        for epoch in 0..3 {
            Checkpoint::capture(&ctx, &flow, &ensemble, epoch, 0, None)
                .unwrap()
                .save(ctx.last_checkpoint_path())
                .unwrap();
        }
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(Checkpoint::load(ctx.last_checkpoint_path()).unwrap().epoch, 2);
    }

    #[test]
    fn test_find_checkpoint() {
        let dir = tempdir().unwrap();
        assert!(find_checkpoint(dir.path()).is_none());
        std::fs::write(dir.path().join("last.ckpt"), b"x").unwrap();
        assert_eq!(find_checkpoint(dir.path()), Some(dir.path().join("last.ckpt")));
        std::fs::write(dir.path().join("best.ckpt"), b"x").unwrap();
        assert_eq!(find_checkpoint(dir.path()), Some(dir.path().join("best.ckpt")));
    }
}
