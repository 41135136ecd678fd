//! Model module containing the flow and its adversaries
//!
//! This module provides:
//! - Invertible layers (coupling, ActNorm, permutation, squeeze)
//! - Multi-level flow assembly with base densities
//! - Latent partitioning into fair, sensitive and nuisance segments
//! - Gradient reversal and the discriminator ensemble

mod density;
mod discriminator;
mod family;
mod flow;
pub mod grad_reverse;
pub mod layers;
mod nets;
mod params;
mod partition;
mod partitioned;

pub use density::{softplus, BaseDensity};
pub use discriminator::{Discriminator, DiscriminatorEnsemble, SensitiveTarget};
pub use family::ModelFamily;
pub use flow::FlowModel;
pub use nets::{ConvNet, CouplingNet, Mlp};
pub use params::{Init, ParamStore, TensorRecord};
pub use partition::{LatentPartition, LatentSplit};
pub use partitioned::PartitionedFlow;
