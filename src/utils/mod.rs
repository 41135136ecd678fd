//! Utility module with helper functions
//!
//! This module provides:
//! - Configuration handling
//! - Checkpoint save/load utilities

pub mod checkpoint;
pub mod config;

pub use checkpoint::{find_checkpoint, Checkpoint};
pub use config::{
    ensure_config_exists, AdversaryConfig, BaseDensityKind, Config, DataConfig, DiscriminatorInput, FactorSplit,
    FlowConfig, PermutationKind, Scaling, TrainingConfig,
};
