//! fairflow command line
//!
//! Main entry point providing CLI interface for:
//! - Writing a default configuration
//! - Training a partitioned flow on CSV or synthetic data
//! - Evaluating a checkpoint
//! - Sampling from a trained flow

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use fairflow::{
    data::{denormalize_features, load_csv_triplets, synthetic, DataLoader, NormalizationParams, TripletDataset},
    model::{DiscriminatorEnsemble, PartitionedFlow},
    training::{validate, AdversarialWarmup, DatasetSplits, LatentReport, MetricCallback, Trainer, TrainingContext},
    utils::{find_checkpoint, Checkpoint, Config},
};

/// Fair representations with partitioned invertible flows
#[derive(Parser)]
#[command(name = "fairflow")]
#[command(version)]
#[command(about = "Train invertible flows with an adversarially cleaned latent segment")]
struct Cli {
    /// Path to configuration file (TOML or JSON)
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Verbosity level
    #[arg(short, long, default_value = "info")]
    verbosity: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize default configuration file
    Init {
        /// Output configuration file path
        #[arg(short, long, default_value = "config.toml")]
        output: String,
    },

    /// Train a partitioned flow
    Train {
        /// CSV file with feature columns plus sensitive and task label columns
        #[arg(short, long, conflicts_with = "synthetic")]
        data: Option<String>,

        /// Train on N synthetic samples with independent s and y
        #[arg(long)]
        synthetic: Option<usize>,

        /// Override the configured number of epochs
        #[arg(short, long)]
        epochs: Option<usize>,

        /// Resume from a checkpoint file or run directory
        #[arg(long)]
        resume: Option<String>,
    },

    /// Report validation loss and latent statistics of a checkpoint
    Evaluate {
        /// Checkpoint file or run directory
        #[arg(long)]
        checkpoint: String,

        /// CSV data to evaluate on
        #[arg(short, long, conflicts_with = "synthetic")]
        data: Option<String>,

        /// Evaluate on N synthetic samples
        #[arg(long)]
        synthetic: Option<usize>,
    },

    /// Draw samples from a trained flow
    ///
    /// Tabular samples are mapped back to the data scale when the run
    /// directory holds `norm_params.json`.
    Sample {
        /// Checkpoint file or run directory
        #[arg(long)]
        checkpoint: String,

        /// Number of samples to generate
        #[arg(short, long, default_value = "100")]
        num_samples: usize,

        /// Output file path
        #[arg(short, long, default_value = "samples.csv")]
        output: String,

        /// Sampling seed
        #[arg(long, default_value = "0")]
        seed: u64,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = match cli.verbosity.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Init { output } => init_config(&output),
        Commands::Train {
            data,
            synthetic,
            epochs,
            resume,
        } => train(&cli.config, data.as_deref(), synthetic, epochs, resume),
        Commands::Evaluate {
            checkpoint,
            data,
            synthetic,
        } => evaluate(&checkpoint, data.as_deref(), synthetic),
        Commands::Sample {
            checkpoint,
            num_samples,
            output,
            seed,
        } => sample(&checkpoint, num_samples, &output, seed),
    }
}

fn load_config(path: &str) -> Result<Config> {
    if Path::new(path).exists() {
        Config::load(path).with_context(|| format!("failed to load config {path}"))
    } else {
        info!("Config file {} not found, using defaults", path);
        Ok(Config::default())
    }
}

const NORM_PARAMS_FILE: &str = "norm_params.json";

/// Dataset plus the feature normalization fitted to it, if any
fn load_dataset(
    config: &Config,
    data: Option<&str>,
    synthetic: Option<usize>,
) -> Result<(TripletDataset, Option<NormalizationParams>)> {
    match (data, synthetic) {
        (Some(path), _) => {
            let tabular = load_csv_triplets(path, &config.data.s_column, &config.data.y_column, config.data.normalize)
                .with_context(|| format!("failed to read {path}"))?;
            Ok((tabular.dataset, tabular.normalization))
        }
        (None, Some(n)) => {
            info!("Generating {} synthetic samples", n);
            Ok((synthetic::independent_attributes(n, 0.1, config.training.seed)?, None))
        }
        (None, None) => bail!("either --data or --synthetic is required"),
    }
}

fn split(config: &Config, dataset: &TripletDataset) -> Result<(TripletDataset, TripletDataset)> {
    let (train, val) = dataset.split_at_fraction(config.data.val_fraction, config.training.seed)?;
    if train.is_empty() || val.is_empty() {
        bail!(
            "val_fraction {} leaves {} training and {} validation samples",
            config.data.val_fraction,
            train.len(),
            val.len()
        );
    }
    Ok((train, val))
}

fn open_checkpoint(path: &str) -> Result<(PathBuf, Checkpoint)> {
    let path = find_checkpoint(path).with_context(|| format!("no checkpoint found at {path}"))?;
    let ckpt = Checkpoint::load(&path).with_context(|| format!("failed to read {}", path.display()))?;
    info!("Loaded checkpoint {} (epoch {}, itr {})", path.display(), ckpt.epoch, ckpt.itr);
    Ok((path, ckpt))
}

/// Train a partitioned flow
fn train(
    config_path: &str,
    data: Option<&str>,
    synthetic: Option<usize>,
    epochs: Option<usize>,
    resume: Option<String>,
) -> Result<()> {
    let mut config = load_config(config_path)?;
    if let Some(epochs) = epochs {
        config.training.epochs = epochs;
    }
    if resume.is_some() {
        config.training.resume = resume;
    }

    let ctx = TrainingContext::timestamped(config)?;
    ctx.config.save(ctx.save_dir.join("config.toml"))?;
    info!("Writing run outputs to {}", ctx.save_dir.display());

    let (dataset, normalization) = load_dataset(&ctx.config, data, synthetic)?;
    if let Some(params) = &normalization {
        // Save normalization parameters for later denormalization
        params.save_json(ctx.save_dir.join(NORM_PARAMS_FILE))?;
    }
    let (train_set, val_set) = split(&ctx.config, &dataset)?;

    let mut flow = PartitionedFlow::new(&ctx.config, &dataset.sample_shape(), &ctx.device)?;
    let mut ensemble = DiscriminatorEnsemble::for_flow(&ctx.config, &flow, &ctx.device)?;

    let seed = ctx.config.training.seed;
    let mut train_loader = DataLoader::new(train_set, ctx.config.data.batch_size, true, false, seed);
    let mut val_loader = DataLoader::new(val_set, ctx.config.test_batch_size(), false, false, seed);
    let mut report = LatentReport::with_output_dir(ctx.save_dir.join("latents"));

    let outcome = Trainer::new(&ctx).fit(
        &mut flow,
        &mut ensemble,
        &mut train_loader,
        &mut val_loader,
        None,
        &mut report,
    )?;

    match (outcome.best_val_loss, outcome.best_epoch) {
        (Some(loss), Some(epoch)) => info!(
            "Training complete after epoch {} ({} iterations). Best validation loss {:.6} at epoch {}",
            outcome.last_epoch, outcome.itr, loss, epoch
        ),
        _ => info!(
            "Training complete after epoch {} ({} iterations)",
            outcome.last_epoch, outcome.itr
        ),
    }
    if let Some((epoch, summary)) = outcome.history.best_validation() {
        info!(
            "Best validation of this run: epoch {} acc={:.3} nll={:.4} recon_mae={:.2e}",
            epoch, summary.disc_accuracy, summary.nll, summary.recon_mae
        );
    }
    Ok(())
}

/// Report validation loss and latent statistics of a checkpoint
fn evaluate(checkpoint: &str, data: Option<&str>, synthetic: Option<usize>) -> Result<()> {
    let (path, ckpt) = open_checkpoint(checkpoint)?;
    let run_dir = path.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("."));
    let ctx = TrainingContext::new(ckpt.config.clone(), run_dir)?;

    let (dataset, _) = load_dataset(&ctx.config, data, synthetic)?;
    if dataset.sample_shape() != ckpt.input_shape {
        bail!(
            "data has sample shape {:?} but the checkpoint expects {:?}",
            dataset.sample_shape(),
            ckpt.input_shape
        );
    }
    let (train_set, val_set) = split(&ctx.config, &dataset)?;

    let (mut flow, ensemble) = ckpt.build(&ctx.device)?;
    let training = &ctx.config.training;
    let adv_weight = AdversarialWarmup::new(training.pred_s_weight, training.warmup_steps).weight(ckpt.itr);
    let mut val_loader = DataLoader::new(val_set.clone(), ctx.config.test_batch_size(), false, false, 0);
    let summary = validate(&ctx, &mut flow, &ensemble, &mut val_loader, adv_weight)?;
    info!(
        "[VAL] loss={:.6} acc={:.3} nll={:.4} recon_mae={:.2e}",
        summary.loss, summary.disc_accuracy, summary.nll, summary.recon_mae
    );

    flow.set_training(false);
    let splits = DatasetSplits {
        train: &train_set,
        validation: &val_set,
        test: None,
    };
    LatentReport::new().evaluate(&ctx, &flow, &splits)?;
    Ok(())
}

/// Draw samples from a trained flow and write them as CSV
fn sample(checkpoint: &str, num_samples: usize, output: &str, seed: u64) -> Result<()> {
    let (path, ckpt) = open_checkpoint(checkpoint)?;
    let (mut flow, _) = ckpt.build(&candle_core::Device::Cpu)?;
    flow.set_training(false);

    let mut rng = StdRng::seed_from_u64(seed);
    let samples = flow.sample(num_samples, &mut rng)?.flatten_from(1)?;
    let mut rows = samples.to_vec2::<f32>()?;

    let norm_path = path.with_file_name(NORM_PARAMS_FILE);
    if norm_path.is_file() {
        let params = NormalizationParams::load_json(&norm_path)?;
        if params.num_features() == rows.first().map_or(0, Vec::len) {
            info!("Denormalizing samples with {}", norm_path.display());
            let width = params.num_features();
            let flat: Vec<f32> = rows.concat();
            let restored = denormalize_features(&Array2::from_shape_vec((rows.len(), width), flat)?, &params)?;
            rows = restored.outer_iter().map(|row| row.to_vec()).collect();
        } else {
            warn!(
                "{} has {} features but samples have {}; writing normalized values",
                norm_path.display(),
                params.num_features(),
                rows.first().map_or(0, Vec::len)
            );
        }
    }

    if let Some(parent) = Path::new(output).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let mut writer = csv::Writer::from_path(output)?;
    let width = rows.first().map_or(0, Vec::len);
    writer.write_record((0..width).map(|i| format!("x_{i}")))?;
    for row in &rows {
        writer.write_record(row.iter().map(|v| v.to_string()))?;
    }
    writer.flush()?;

    info!("Saved {} samples to {}", rows.len(), output);
    Ok(())
}

/// Initialize default configuration file
fn init_config(output_path: &str) -> Result<()> {
    let config = Config::default();
    config.save(output_path)?;
    info!("Created default configuration at {}", output_path);
    Ok(())
}
