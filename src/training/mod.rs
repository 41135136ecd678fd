//! Training module for the partitioned flow
//!
//! This module provides:
//! - The explicit training context and adversarial warmup schedule
//! - Loss functions and the composed objective
//! - The training loop with validation, checkpointing and early stopping
//! - Run history and metric callbacks

mod callback;
mod context;
pub mod losses;
mod metrics;
mod schedule;
mod trainer;

pub use callback::{encode_dataset, DatasetSplits, LatentReport, MetricCallback, NoopCallback, SplitStats};
pub use context::TrainingContext;
pub use losses::{compute_loss, LossBreakdown};
pub use metrics::{AverageMeter, EpochMeters, EpochRecord, TrainingHistory, ValidationSummary};
pub use schedule::AdversarialWarmup;
pub use trainer::{clip_grad_norm, validate, EarlyStopping, Trainer, TrainingOutcome};
