//! Discriminators predicting the sensitive attribute from a latent segment
//!
//! Each discriminator owns its parameters and its own AdamW state. The
//! ensemble averages member losses so one backward pass trains all of them.

use std::collections::BTreeMap;

use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use rand::Rng;
use tracing::debug;

use super::nets::Mlp;
use super::params::{ParamStore, TensorRecord};
use super::partitioned::PartitionedFlow;
use crate::error::{FairFlowError, Result};
use crate::training::losses::{binary_cross_entropy_with_logits, cross_entropy};
use crate::utils::config::{AdversaryConfig, Config, DiscriminatorInput};

/// Label space of the sensitive attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensitiveTarget {
    /// Labels in `{0, 1}`, one logit
    Binary,
    /// Labels in `0..n`, `n` logits
    Categorical(usize),
}

impl SensitiveTarget {
    /// `s_dim == 1` means binary
    pub fn from_s_dim(s_dim: usize) -> Self {
        if s_dim <= 1 {
            SensitiveTarget::Binary
        } else {
            SensitiveTarget::Categorical(s_dim)
        }
    }

    pub fn num_logits(&self) -> usize {
        match *self {
            SensitiveTarget::Binary => 1,
            SensitiveTarget::Categorical(n) => n,
        }
    }
}

/// MLP classifier over one latent segment
pub struct Discriminator {
    net: Mlp,
    params: ParamStore,
    optimizer: AdamW,
    target: SensitiveTarget,
    input_dim: usize,
}

impl Discriminator {
    pub fn new(
        input_dim: usize,
        config: &AdversaryConfig,
        target: SensitiveTarget,
        seed: u64,
        device: &Device,
    ) -> Result<Self> {
        let mut params = ParamStore::new(seed, device);
        let net = Mlp::new(&mut params, "disc", input_dim, &config.hidden_dims, target.num_logits(), false)?;
        let optimizer = AdamW::new(
            params.all_vars(),
            ParamsAdamW {
                lr: config.lr,
                weight_decay: config.weight_decay,
                ..Default::default()
            },
        )?;
        Ok(Self {
            net,
            params,
            optimizer,
            target,
            input_dim,
        })
    }

    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    pub fn params(&self) -> &ParamStore {
        &self.params
    }

    /// Raw logits, `[B, num_logits]`
    pub fn logits(&self, z: &Tensor) -> Result<Tensor> {
        let z = z.flatten_from(1)?;
        if z.dim(1)? != self.input_dim {
            return Err(FairFlowError::shape(format!(
                "discriminator expects width {}, got {}",
                self.input_dim,
                z.dim(1)?
            )));
        }
        self.net.forward(&z)
    }

    /// Loss and accuracy of predicting `s` (u32 labels, `[B]`) from `z`
    pub fn routine(&self, z: &Tensor, s: &Tensor) -> Result<(Tensor, f64)> {
        let logits = self.logits(z)?;
        let labels = s.to_dtype(DType::U32)?.to_vec1::<u32>()?;
        let classes = match self.target {
            SensitiveTarget::Binary => 2,
            SensitiveTarget::Categorical(n) => n,
        };
        if let Some(bad) = labels.iter().find(|&&l| l as usize >= classes) {
            return Err(FairFlowError::shape(format!(
                "sensitive label {bad} out of range for {classes} classes"
            )));
        }
        match self.target {
            SensitiveTarget::Binary => {
                let targets = s.to_dtype(DType::F32)?.reshape((labels.len(), 1))?;
                let loss = binary_cross_entropy_with_logits(&logits, &targets)?;
                let predicted = logits.flatten_all()?.to_vec1::<f32>()?;
                let correct = predicted
                    .iter()
                    .zip(&labels)
                    .filter(|(logit, label)| (**logit > 0.0) == (**label == 1))
                    .count();
                Ok((loss, correct as f64 / labels.len().max(1) as f64))
            }
            SensitiveTarget::Categorical(_) => {
                let loss = cross_entropy(&logits, &s.to_dtype(DType::U32)?)?;
                let predicted = logits.argmax(1)?.to_vec1::<u32>()?;
                let correct = predicted.iter().zip(&labels).filter(|(p, l)| p == l).count();
                Ok((loss, correct as f64 / labels.len().max(1) as f64))
            }
        }
    }

    /// Apply this discriminator's share of a shared gradient store
    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        self.optimizer.step(grads)?;
        Ok(())
    }

    /// Redraw all weights; optimizer moments are kept
    pub fn reset_parameters(&mut self, seed: u64) -> Result<()> {
        self.params.reinitialize(seed)
    }
}

/// Independently initialized discriminators trained side by side
pub struct DiscriminatorEnsemble {
    members: Vec<Discriminator>,
}

impl DiscriminatorEnsemble {
    pub fn new(
        input_dim: usize,
        config: &AdversaryConfig,
        target: SensitiveTarget,
        seed: u64,
        device: &Device,
    ) -> Result<Self> {
        if config.num_discs == 0 {
            return Err(FairFlowError::config("num_discs must be >= 1"));
        }
        let members = (0..config.num_discs)
            .map(|i| {
                let member_seed = seed.wrapping_add(1_000 * (i as u64 + 1));
                Discriminator::new(input_dim, config, target, member_seed, device)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { members })
    }

    /// Ensemble sized for the configured discriminator input of `flow`
    pub fn for_flow(config: &Config, flow: &PartitionedFlow, device: &Device) -> Result<Self> {
        let input_dim = match config.adversary.input {
            DiscriminatorInput::Split => flow.partition().zy_dim(),
            DiscriminatorInput::Masked => flow.latent_dim(),
            DiscriminatorInput::Reconstruction => flow.input_shape().iter().product(),
        };
        Self::new(
            input_dim,
            &config.adversary,
            SensitiveTarget::from_s_dim(config.data.s_dim),
            config.training.seed,
            device,
        )
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn members(&self) -> &[Discriminator] {
        &self.members
    }

    /// Mean loss and mean accuracy over every member
    pub fn routine(&self, z: &Tensor, s: &Tensor) -> Result<(Tensor, f64)> {
        let mut total_loss: Option<Tensor> = None;
        let mut total_acc = 0.0;
        for member in &self.members {
            let (loss, acc) = member.routine(z, s)?;
            total_loss = Some(match total_loss {
                Some(acc_loss) => acc_loss.add(&loss)?,
                None => loss,
            });
            total_acc += acc;
        }
        let n = self.members.len() as f64;
        let loss = total_loss.ok_or_else(|| FairFlowError::config("empty discriminator ensemble"))?;
        Ok((loss.affine(1.0 / n, 0.0)?, total_acc / n))
    }

    /// Step every member, in order
    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        for member in &mut self.members {
            member.step(grads)?;
        }
        Ok(())
    }

    /// Reinitialize each member with probability `prob`; returns the reset indices
    pub fn maybe_reset<R: Rng>(&mut self, prob: f64, rng: &mut R) -> Result<Vec<usize>> {
        let mut reset = Vec::new();
        for (i, member) in self.members.iter_mut().enumerate() {
            if rng.gen::<f64>() < prob {
                member.reset_parameters(rng.gen())?;
                debug!(member = i, "reinitialized discriminator");
                reset.push(i);
            }
        }
        Ok(reset)
    }

    /// Named parameters of every member
    pub fn export(&self) -> Result<Vec<BTreeMap<String, TensorRecord>>> {
        self.members.iter().map(|m| m.params.export()).collect()
    }

    /// Load parameters exported by [`export`](Self::export)
    pub fn import(&self, records: &[BTreeMap<String, TensorRecord>]) -> Result<()> {
        if records.len() != self.members.len() {
            return Err(FairFlowError::shape(format!(
                "expected {} discriminators, got {}",
                self.members.len(),
                records.len()
            )));
        }
        for (member, record) in self.members.iter().zip(records) {
            member.params.import(record)?;
        }
        Ok(())
    }
}
