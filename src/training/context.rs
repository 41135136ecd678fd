//! Explicit training context passed to every component

use std::path::{Path, PathBuf};

use candle_core::Device;

use crate::error::Result;
use crate::utils::config::Config;

/// Configuration, device and output location of one run
#[derive(Debug, Clone)]
pub struct TrainingContext {
    pub config: Config,
    pub device: Device,
    pub save_dir: PathBuf,
    pub version_tag: Option<String>,
}

impl TrainingContext {
    /// Validate `config` and create `save_dir`
    pub fn new<P: AsRef<Path>>(config: Config, save_dir: P) -> Result<Self> {
        config.validate()?;
        let save_dir = save_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&save_dir)?;
        let version_tag = config
            .training
            .version_tag
            .clone()
            .or_else(|| Some(env!("CARGO_PKG_VERSION").to_string()));
        Ok(Self {
            config,
            device: Device::Cpu,
            save_dir,
            version_tag,
        })
    }

    /// Run directory `<training.save_dir>/<UTC timestamp>`
    pub fn timestamped(config: Config) -> Result<Self> {
        let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%.3f").to_string();
        let dir = Path::new(&config.training.save_dir).join(stamp);
        Self::new(config, dir)
    }

    pub fn best_checkpoint_path(&self) -> PathBuf {
        self.save_dir.join("best.ckpt")
    }

    pub fn last_checkpoint_path(&self) -> PathBuf {
        self.save_dir.join("last.ckpt")
    }

    pub fn history_path(&self) -> PathBuf {
        self.save_dir.join("history.csv")
    }
}
