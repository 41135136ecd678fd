//! Flow with a partitioned latent space
//!
//! Bundles the invertible flow, its parameter arena and optimizer, the base
//! density and the fixed latent partition.

use std::collections::BTreeMap;

use candle_core::backprop::GradStore;
use candle_core::{Device, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use rand::Rng;
use tracing::info;

use super::density::BaseDensity;
use super::family::ModelFamily;
use super::flow::FlowModel;
use super::layers::zero_log_det;
use super::params::{ParamStore, TensorRecord};
use super::partition::{LatentPartition, LatentSplit};
use crate::error::Result;
use crate::utils::config::Config;

/// Trainable flow whose latent is split into `[zn | zy | zs]`
pub struct PartitionedFlow {
    flow: FlowModel,
    params: ParamStore,
    optimizer: AdamW,
    partition: LatentPartition,
    density: BaseDensity,
    training: bool,
}

impl PartitionedFlow {
    /// Build from configuration and the per-sample input shape
    ///
    /// Fails before any training if the fractions leave an empty segment or
    /// the architecture does not fit the input shape.
    pub fn new(config: &Config, input_shape: &[usize], device: &Device) -> Result<Self> {
        config.validate()?;
        let family = ModelFamily::from_input_shape(input_shape)?;
        let mut params = ParamStore::new(config.training.seed, device);
        let flow = FlowModel::new(&config.flow, family, &mut params, config.training.seed)?;
        let partition =
            LatentPartition::from_fractions(flow.output_dim(), config.flow.zs_frac, config.flow.zy_frac())?;
        let optimizer = AdamW::new(
            params.all_vars(),
            ParamsAdamW {
                lr: config.training.lr,
                weight_decay: config.training.weight_decay,
                ..Default::default()
            },
        )?;

        info!(
            "Built {:?} flow: {} layers, {} parameters, latent zn/zy/zs = {}/{}/{}",
            family,
            flow.num_layers(),
            params.num_parameters(),
            partition.zn_dim(),
            partition.zy_dim(),
            partition.zs_dim()
        );

        Ok(Self {
            flow,
            params,
            optimizer,
            partition,
            density: BaseDensity::from_config(config.flow.base_density, config.flow.base_density_std),
            training: true,
        })
    }

    pub fn partition(&self) -> &LatentPartition {
        &self.partition
    }

    pub fn density(&self) -> BaseDensity {
        self.density
    }

    pub fn input_shape(&self) -> &[usize] {
        self.flow.input_shape()
    }

    pub fn latent_dim(&self) -> usize {
        self.flow.output_dim()
    }

    pub fn params(&self) -> &ParamStore {
        &self.params
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    /// Switch between training (ActNorm init, input noise) and evaluation
    pub fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    /// `x -> (z, log_det)` starting from a zero log-determinant
    pub fn forward(&self, x: &Tensor) -> Result<(Tensor, Tensor)> {
        self.flow.forward(x, &zero_log_det(x)?, self.training)
    }

    /// Latent only
    pub fn encode(&self, x: &Tensor) -> Result<Tensor> {
        Ok(self.forward(x)?.0)
    }

    pub fn reverse(&self, z: &Tensor) -> Result<Tensor> {
        self.flow.reverse(z)
    }

    /// Negative log-likelihood under the base density
    pub fn nll(&self, z: &Tensor, log_det: &Tensor) -> Result<Tensor> {
        self.density.nll(z, log_det)
    }

    pub fn split(&self, z: &Tensor) -> Result<LatentSplit> {
        self.partition.split(z)
    }

    pub fn assemble(&self, split: &LatentSplit) -> Result<Tensor> {
        self.partition.assemble(split)
    }

    /// Reconstructions from the full latent, the zy-only latent and the zs-only latent
    pub fn decode_partials(&self, z: &Tensor) -> Result<(Tensor, Tensor, Tensor)> {
        let all = self.reverse(z)?;
        let fair = self.reverse(&self.partition.zero_except_fair(z)?)?;
        let sensitive = self.reverse(&self.partition.zero_except_sensitive(z)?)?;
        Ok((all, fair, sensitive))
    }

    /// Draw `n` samples by reversing base-density draws
    pub fn sample<R: Rng>(&self, n: usize, rng: &mut R) -> Result<Tensor> {
        let z = self.density.sample(n, self.latent_dim(), rng, self.params.device())?;
        self.reverse(&z)
    }

    /// Apply the flow's share of a shared gradient store
    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        self.optimizer.step(grads)?;
        Ok(())
    }

    /// Named parameter records
    pub fn export(&self) -> Result<BTreeMap<String, TensorRecord>> {
        self.params.export()
    }

    /// Load parameters and treat data-dependent layers as initialized
    pub fn import(&self, records: &BTreeMap<String, TensorRecord>) -> Result<()> {
        self.params.import(records)?;
        self.flow.mark_initialized();
        Ok(())
    }
}
