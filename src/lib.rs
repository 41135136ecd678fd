//! # fairflow
//!
//! Invertible normalizing flows whose latent space is partitioned into a
//! fair segment `zy`, a sensitive segment `zs` and an optional nuisance
//! segment `zn`. A gradient-reversed discriminator ensemble removes
//! information about the sensitive attribute from `zy` while the flow is
//! trained by maximum likelihood.
//!
//! ## Modules
//!
//! - `data`: `(x, s, y)` datasets, loaders, CSV input and synthetic data
//! - `model`: invertible layers, flow assembly, latent partition, discriminators
//! - `training`: loss composition, training loop, validation and history
//! - `utils`: configuration and checkpoints

pub mod data;
pub mod error;
pub mod model;
pub mod training;
pub mod utils;

pub use data::{load_csv_triplets, Batch, DataLoader, TripletDataset};
pub use error::{FairFlowError, Result};
pub use model::{DiscriminatorEnsemble, LatentPartition, LatentSplit, PartitionedFlow};
pub use training::{LatentReport, MetricCallback, Trainer, TrainingContext, TrainingOutcome};
pub use utils::{Checkpoint, Config};
