//! Configuration management
//!
//! Provides unified configuration for the whole flow training pipeline:
//! data batching, flow architecture, adversary and training loop.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;

use crate::error::{FairFlowError, Result};

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data configuration
    pub data: DataConfig,
    /// Flow architecture configuration
    pub flow: FlowConfig,
    /// Discriminator ensemble configuration
    pub adversary: AdversaryConfig,
    /// Training loop configuration
    pub training: TrainingConfig,
}

/// Data-related configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// Training batch size
    pub batch_size: usize,
    /// Validation batch size (defaults to `batch_size`)
    pub test_batch_size: Option<usize>,
    /// Number of sensitive classes; 1 means binary
    pub s_dim: usize,
    /// Number of task classes; 1 means binary
    pub y_dim: usize,
    /// Fraction of the data held out for validation
    pub val_fraction: f64,
    /// Column holding the sensitive attribute in CSV data
    pub s_column: String,
    /// Column holding the task label in CSV data
    pub y_column: String,
    /// Z-score normalize CSV features
    pub normalize: bool,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            batch_size: 128,
            test_batch_size: None,
            s_dim: 1,
            y_dim: 1,
            val_fraction: 0.2,
            s_column: "s".to_string(),
            y_column: "y".to_string(),
            normalize: true,
        }
    }
}

/// How coupling layers turn the subnet output into a scale
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scaling {
    /// Shift only, volume preserving
    Additive,
    /// `exp` of a tanh-clamped log scale
    Exp,
    /// `sigmoid(raw + 2)`
    #[serde(alias = "add2_sigmoid")]
    Sigmoid,
    /// `sigmoid(raw) + 0.5`, the identity at a zero subnet output
    #[serde(rename = "sigmoid0.5")]
    SigmoidHalf,
}

/// Channel permutation between coupling layers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermutationKind {
    /// No permutation; couplings alternate which half conditions
    None,
    /// Flip channel order
    Reverse,
    /// Fixed seeded shuffle
    Random,
    /// Learned invertible 1x1 convolution, seeded like `Random`
    InvConv1x1,
}

/// Base density of the latent space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BaseDensityKind {
    Normal,
    Logistic,
    Uniform,
}

/// Channels factored out of the flow after a level
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactorSplit {
    /// Zero-based level index
    pub level: usize,
    /// Fraction of the level's channels leaving the flow
    pub fraction: f64,
}

/// Flow architecture configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    /// Number of levels
    pub levels: usize,
    /// Coupling steps per level
    pub level_depth: usize,
    /// Hidden width of coupling subnets
    pub coupling_channels: usize,
    /// Hidden layers of coupling subnets
    pub coupling_depth: usize,
    /// Coupling scale function
    pub scaling: Scaling,
    /// Permutation between couplings
    pub permutation: PermutationKind,
    /// Insert ActNorm before each coupling
    pub actnorm: bool,
    /// Insert moving batch norm before each coupling
    pub batch_norm: bool,
    /// Share of the batch statistics in training-mode batch norm; 0 uses the batch alone
    pub bn_lag: f64,
    /// Multi-scale factor-out schedule
    pub factor_splits: Vec<FactorSplit>,
    /// Base density
    pub base_density: BaseDensityKind,
    /// Std of the normal base density
    pub base_density_std: f64,
    /// Fraction of the latent assigned to the sensitive segment
    pub zs_frac: f64,
    /// Fraction of the latent assigned to the fair segment (defaults to `1 - zs_frac`)
    pub zy_frac: Option<f64>,
    /// Add dequantization noise during training
    pub input_noise: bool,
    /// Width of the uniform dequantization noise
    pub noise_scale: f64,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            levels: 1,
            level_depth: 3,
            coupling_channels: 64,
            coupling_depth: 1,
            scaling: Scaling::SigmoidHalf,
            permutation: PermutationKind::Reverse,
            actnorm: true,
            batch_norm: false,
            bn_lag: 0.0,
            factor_splits: Vec::new(),
            base_density: BaseDensityKind::Normal,
            base_density_std: 1.0,
            zs_frac: 0.02,
            zy_frac: None,
            input_noise: false,
            noise_scale: 1.0 / 256.0,
        }
    }
}

impl FlowConfig {
    /// Effective fair fraction
    pub fn zy_frac(&self) -> f64 {
        self.zy_frac.unwrap_or(1.0 - self.zs_frac)
    }

    /// Factor-out fraction configured for a level, if any
    pub fn factor_fraction(&self, level: usize) -> Option<f64> {
        self.factor_splits
            .iter()
            .find(|split| split.level == level)
            .map(|split| split.fraction)
    }
}

/// What the discriminators see
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscriminatorInput {
    /// The zy segment sliced out of the latent
    Split,
    /// The full latent with every non-zy segment zeroed
    Masked,
    /// The input reconstructed from the zy-only latent
    Reconstruction,
}

/// Discriminator ensemble configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdversaryConfig {
    /// Ensemble size
    pub num_discs: usize,
    /// Hidden layer widths of each discriminator
    pub hidden_dims: Vec<usize>,
    /// Discriminator learning rate
    pub lr: f64,
    /// Discriminator weight decay
    pub weight_decay: f64,
    /// Discriminator input mode
    pub input: DiscriminatorInput,
    /// Per-epoch reinitialization probability of each member
    pub reset_prob: f64,
    /// Gradient reversal scale
    pub grl_lambda: f64,
}

impl Default for AdversaryConfig {
    fn default() -> Self {
        Self {
            num_discs: 1,
            hidden_dims: vec![32],
            lr: 3e-4,
            weight_decay: 0.0,
            input: DiscriminatorInput::Split,
            reset_prob: 0.0,
            grl_lambda: 1.0,
        }
    }
}

/// Training loop configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Epoch budget
    pub epochs: usize,
    /// Flow learning rate
    pub lr: f64,
    /// Flow weight decay
    pub weight_decay: f64,
    /// Weight of the likelihood term
    pub nll_weight: f64,
    /// Target weight of the adversarial term
    pub pred_s_weight: f64,
    /// Weight of the zy-only reconstruction penalty
    pub recon_stability_weight: f64,
    /// Detach the latent before the zy-only reconstruction
    pub recon_detach: bool,
    /// Iterations over which the adversarial weight ramps up
    pub warmup_steps: usize,
    /// Validations without improvement before stopping (0 disables)
    pub early_stopping: usize,
    /// Validate every N epochs
    pub val_freq: usize,
    /// Run the metric callback periodically during training
    pub super_val: bool,
    /// Metric callback frequency in epochs
    pub super_val_freq: usize,
    /// Global gradient-norm clip
    pub grad_clip: Option<f64>,
    /// Debug-log the loss breakdown every N iterations
    pub log_freq: usize,
    /// Show a progress bar per epoch
    pub progress: bool,
    /// Random seed
    pub seed: u64,
    /// Root directory for experiment outputs
    pub save_dir: String,
    /// Checkpoint to resume from
    pub resume: Option<String>,
    /// Version tag stored in checkpoints
    pub version_tag: Option<String>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: 250,
            lr: 3e-4,
            weight_decay: 0.0,
            nll_weight: 1e-2,
            pred_s_weight: 1.0,
            recon_stability_weight: 0.0,
            recon_detach: false,
            warmup_steps: 0,
            early_stopping: 30,
            val_freq: 5,
            super_val: false,
            super_val_freq: 0,
            grad_clip: None,
            log_freq: 50,
            progress: true,
            seed: 42,
            save_dir: "experiments".to_string(),
            resume: None,
            version_tag: None,
        }
    }
}

/// Flow fields that shape its parameters and latent partition
///
/// Training-time settings such as dequantization noise and the base density
/// are left out, so changing them keeps checkpoints loadable.
#[derive(Serialize)]
struct FlowLayout<'a> {
    levels: usize,
    level_depth: usize,
    coupling_channels: usize,
    coupling_depth: usize,
    scaling: Scaling,
    permutation: PermutationKind,
    actnorm: bool,
    batch_norm: bool,
    factor_splits: &'a [FactorSplit],
    zs_frac: f64,
    zy_frac: f64,
}

impl<'a> From<&'a FlowConfig> for FlowLayout<'a> {
    fn from(flow: &'a FlowConfig) -> Self {
        Self {
            levels: flow.levels,
            level_depth: flow.level_depth,
            coupling_channels: flow.coupling_channels,
            coupling_depth: flow.coupling_depth,
            scaling: flow.scaling,
            permutation: flow.permutation,
            actnorm: flow.actnorm,
            batch_norm: flow.batch_norm,
            factor_splits: &flow.factor_splits,
            zs_frac: flow.zs_frac,
            zy_frac: flow.zy_frac(),
        }
    }
}

/// Fields that define the parameter layout of a checkpoint
#[derive(Serialize)]
struct ArchitectureKey<'a> {
    input_shape: &'a [usize],
    s_dim: usize,
    flow: FlowLayout<'a>,
    num_discs: usize,
    hidden_dims: &'a [usize],
    input: DiscriminatorInput,
    /// Random permutations and 1x1 mixings are drawn from the seed
    permutation_seed: Option<u64>,
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_toml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Save configuration to TOML file
    pub fn save_toml<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Load configuration from JSON file
    pub fn from_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Save configuration to JSON file
    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Load by extension: `.toml` as TOML, anything else as JSON
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if is_toml(path) {
            Self::from_toml(path)
        } else {
            Self::from_json(path)
        }
    }

    /// Save by extension: `.toml` as TOML, anything else as JSON
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if is_toml(path) {
            self.save_toml(path)
        } else {
            self.save_json(path)
        }
    }

    /// Effective validation batch size
    pub fn test_batch_size(&self) -> usize {
        self.data.test_batch_size.unwrap_or(self.data.batch_size)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let data = &self.data;
        if data.batch_size == 0 || data.test_batch_size == Some(0) {
            return Err(FairFlowError::config("batch size must be > 0"));
        }
        if data.s_dim == 0 || data.y_dim == 0 {
            return Err(FairFlowError::config("s_dim and y_dim must be >= 1"));
        }
        if !(0.0..1.0).contains(&data.val_fraction) {
            return Err(FairFlowError::config("val_fraction must be in [0, 1)"));
        }

        let flow = &self.flow;
        if flow.levels == 0 || flow.level_depth == 0 {
            return Err(FairFlowError::config("levels and level_depth must be >= 1"));
        }
        if flow.coupling_channels == 0 {
            return Err(FairFlowError::config("coupling_channels must be >= 1"));
        }
        check_unit_interval("zs_frac", flow.zs_frac)?;
        check_unit_interval("bn_lag", flow.bn_lag)?;
        check_unit_interval("zy_frac", flow.zy_frac())?;
        if flow.zs_frac + flow.zy_frac() > 1.0 + 1e-9 {
            return Err(FairFlowError::config(format!(
                "zs_frac + zy_frac must be <= 1, got {}",
                flow.zs_frac + flow.zy_frac()
            )));
        }
        if !(flow.base_density_std > 0.0) {
            return Err(FairFlowError::config("base_density_std must be > 0"));
        }
        if flow.input_noise && !(flow.noise_scale > 0.0) {
            return Err(FairFlowError::config("noise_scale must be > 0 with input_noise"));
        }
        for split in &flow.factor_splits {
            if split.level + 1 >= flow.levels {
                return Err(FairFlowError::config(format!(
                    "factor split at level {} must precede the last level ({} levels)",
                    split.level, flow.levels
                )));
            }
            if !(split.fraction > 0.0 && split.fraction < 1.0) {
                return Err(FairFlowError::config(format!(
                    "factor split fraction must be in (0, 1), got {}",
                    split.fraction
                )));
            }
        }

        let adv = &self.adversary;
        if adv.num_discs == 0 {
            return Err(FairFlowError::config("num_discs must be >= 1"));
        }
        if !(adv.lr > 0.0) {
            return Err(FairFlowError::config("discriminator lr must be > 0"));
        }
        check_unit_interval("reset_prob", adv.reset_prob)?;
        if adv.grl_lambda < 0.0 {
            return Err(FairFlowError::config("grl_lambda must be >= 0"));
        }

        let training = &self.training;
        if training.epochs == 0 {
            return Err(FairFlowError::config("number of epochs must be > 0"));
        }
        if training.val_freq == 0 {
            return Err(FairFlowError::config("val_freq must be > 0"));
        }
        if !(training.lr > 0.0) {
            return Err(FairFlowError::config("flow lr must be > 0"));
        }
        if training.super_val && training.super_val_freq == 0 {
            return Err(FairFlowError::config("super_val requires super_val_freq > 0"));
        }
        if let Some(clip) = training.grad_clip {
            if !(clip > 0.0) {
                return Err(FairFlowError::config("grad_clip must be > 0"));
            }
        }
        Ok(())
    }

    /// SHA-256 over the fields that define the parameter layout
    pub fn architecture_hash(&self, input_shape: &[usize]) -> Result<String> {
        let key = ArchitectureKey {
            input_shape,
            s_dim: self.data.s_dim,
            flow: FlowLayout::from(&self.flow),
            num_discs: self.adversary.num_discs,
            hidden_dims: &self.adversary.hidden_dims,
            input: self.adversary.input,
            permutation_seed: matches!(
                self.flow.permutation,
                PermutationKind::Random | PermutationKind::InvConv1x1
            )
            .then_some(self.training.seed),
        };
        let canonical = serde_json::to_string(&key)?;
        Ok(hex::encode(Sha256::digest(canonical.as_bytes())))
    }
}

fn check_unit_interval(name: &str, value: f64) -> Result<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(FairFlowError::config(format!("{name} must be in [0, 1], got {value}")))
    }
}

fn is_toml(path: &Path) -> bool {
    path.extension().map_or(false, |ext| ext == "toml")
}

/// Load the configuration at `path`, writing the defaults there first if it is missing
pub fn ensure_config_exists<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    if path.exists() {
        Config::load(path)
    } else {
        let config = Config::default();
        config.save(path)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.flow.level_depth, 3);
        assert_eq!(config.adversary.num_discs, 1);
        assert_eq!(config.training.val_freq, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_toml_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = Config::default();
        config.flow.factor_splits.push(FactorSplit { level: 0, fraction: 0.5 });
        config.flow.levels = 2;
        config.flow.zy_frac = Some(0.4);
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(config, loaded);
    }

    #[test]
    fn test_config_json_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");

        let config = Config::default();
        config.save(&path).unwrap();
        let loaded = Config::load(&path).unwrap();
        assert_eq!(config, loaded);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str("[flow]\nlevels = 2\n").unwrap();
        assert_eq!(config.flow.levels, 2);
        assert_eq!(config.flow.level_depth, 3);
        assert_eq!(config.training.epochs, 250);
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        config.flow.zs_frac = 1.5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.flow.zs_frac = 0.6;
        config.flow.zy_frac = Some(0.6);
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.flow.bn_lag = 1.5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.adversary.num_discs = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.flow.factor_splits.push(FactorSplit { level: 0, fraction: 0.5 });
        assert!(config.validate().is_err(), "single-level flow cannot factor out");
    }

    #[test]
    fn test_architecture_hash() {
        let config = Config::default();
        let a = config.architecture_hash(&[2]).unwrap();
        assert_eq!(a.len(), 64);
        assert_eq!(a, config.architecture_hash(&[2]).unwrap());

        let mut other = config.clone();
        other.training.lr = 1e-3;
        assert_eq!(a, other.architecture_hash(&[2]).unwrap());

        other.training.seed = 1;
        assert_eq!(a, other.architecture_hash(&[2]).unwrap());
        other.flow.permutation = PermutationKind::Random;
        let random = other.architecture_hash(&[2]).unwrap();
        other.training.seed = 2;
        assert_ne!(random, other.architecture_hash(&[2]).unwrap());

        other.flow.coupling_channels = 8;
        assert_ne!(a, other.architecture_hash(&[2]).unwrap());
        assert_ne!(a, config.architecture_hash(&[3]).unwrap());

        let mut mixed = config.clone();
        mixed.flow.permutation = PermutationKind::InvConv1x1;
        let mixed_hash = mixed.architecture_hash(&[2]).unwrap();
        mixed.training.seed = 7;
        assert_ne!(mixed_hash, mixed.architecture_hash(&[2]).unwrap());

        let mut normed = config.clone();
        normed.flow.batch_norm = true;
        assert_ne!(a, normed.architecture_hash(&[2]).unwrap());
    }

    #[test]
    fn test_architecture_hash_ignores_training_time_flow_settings() {
        let config = Config::default();
        let a = config.architecture_hash(&[2]).unwrap();

        let mut other = config.clone();
        other.flow.input_noise = true;
        other.flow.noise_scale = 0.1;
        other.flow.base_density = BaseDensityKind::Logistic;
        other.flow.base_density_std = 2.0;
        other.flow.bn_lag = 0.5;
        assert_eq!(a, other.architecture_hash(&[2]).unwrap());
    }

    #[test]
    fn test_scaling_names() {
        let flow: FlowConfig = toml::from_str("scaling = \"sigmoid0.5\"").unwrap();
        assert_eq!(flow.scaling, Scaling::SigmoidHalf);
        let flow: FlowConfig = toml::from_str("scaling = \"add2_sigmoid\"").unwrap();
        assert_eq!(flow.scaling, Scaling::Sigmoid);
        let flow: FlowConfig = toml::from_str("permutation = \"inv_conv1x1\"").unwrap();
        assert_eq!(flow.permutation, PermutationKind::InvConv1x1);
        assert_eq!(FlowConfig::default().scaling, Scaling::SigmoidHalf);
    }

    #[test]
    fn test_ensure_config_exists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fresh.toml");
        let created = ensure_config_exists(&path).unwrap();
        assert!(path.exists());
        assert_eq!(created, ensure_config_exists(&path).unwrap());
    }
}
