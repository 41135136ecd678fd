//! Multi-level flow assembly
//!
//! A level is `[squeeze] -> level_depth x ([actnorm] -> [batch norm] -> [mixing] -> coupling)`
//! followed by an optional factor-out. The latent is the flattened factored
//! parts, in level order, followed by the flattened output of the last level.

use candle_core::Tensor;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::debug;

use super::family::ModelFamily;
use super::layers::{
    ActNorm, AffineCoupling, InvertibleConv1x1, InvertibleLayer, MovingBatchNorm, Permutation, Squeeze,
};
use super::params::ParamStore;
use crate::error::{FairFlowError, Result};
use crate::utils::config::{FlowConfig, PermutationKind};

/// Channels leaving the flow after a level
struct FactorOut {
    keep: usize,
    out: usize,
    /// Per-sample shape of the factored part
    out_shape: Vec<usize>,
}

struct FlowLevel {
    layers: Vec<Box<dyn InvertibleLayer>>,
    factor: Option<FactorOut>,
}

/// Invertible map from data to a flat latent
pub struct FlowModel {
    family: ModelFamily,
    levels: Vec<FlowLevel>,
    input_shape: Vec<usize>,
    final_shape: Vec<usize>,
    output_dim: usize,
    input_noise: Option<f64>,
}

impl FlowModel {
    /// Build the flow, registering its parameters in `store`
    pub fn new(config: &FlowConfig, family: ModelFamily, store: &mut ParamStore, seed: u64) -> Result<Self> {
        let mut perm_rng = StdRng::seed_from_u64(seed.wrapping_add(0x9e37_79b9));
        let input_shape = family.input_shape();
        let mut shape = input_shape.clone();
        let mut levels = Vec::with_capacity(config.levels);

        for level in 0..config.levels {
            let mut layers: Vec<Box<dyn InvertibleLayer>> = Vec::new();
            if family.squeezes() {
                if shape[1] % 2 != 0 || shape[2] % 2 != 0 {
                    return Err(FairFlowError::config(format!(
                        "level {level} cannot squeeze spatial size {}x{}",
                        shape[1], shape[2]
                    )));
                }
                layers.push(Box::new(Squeeze));
                shape = vec![shape[0] * 4, shape[1] / 2, shape[2] / 2];
            }

            let channels = shape[0];
            for step in 0..config.level_depth {
                let prefix = format!("level{level}.step{step}");
                if config.actnorm {
                    layers.push(Box::new(ActNorm::new(store, &format!("{prefix}.actnorm"), channels)?));
                }
                if config.batch_norm {
                    layers.push(Box::new(MovingBatchNorm::new(
                        store,
                        &format!("{prefix}.batch_norm"),
                        channels,
                        config.bn_lag,
                    )?));
                }
                let swap = match config.permutation {
                    PermutationKind::None => step % 2 == 1,
                    PermutationKind::InvConv1x1 => {
                        layers.push(Box::new(InvertibleConv1x1::new(
                            store,
                            &format!("{prefix}.mix"),
                            channels,
                            &mut perm_rng,
                        )?));
                        false
                    }
                    kind => {
                        layers.push(Box::new(Permutation::new(channels, kind, &mut perm_rng, store)?));
                        false
                    }
                };
                let net = family.coupling_net(store, &format!("{prefix}.coupling"), channels, swap, config)?;
                layers.push(Box::new(AffineCoupling::new(net, channels, swap, config.scaling)?));
            }

            let factor = match config.factor_fraction(level) {
                Some(fraction) => {
                    let out = ((fraction * channels as f64).round() as usize).clamp(1, channels - 1);
                    let keep = channels - out;
                    let mut out_shape = shape.clone();
                    out_shape[0] = out;
                    shape[0] = keep;
                    Some(FactorOut { keep, out, out_shape })
                }
                None => None,
            };
            debug!(level, layers = layers.len(), ?shape, "built flow level");
            levels.push(FlowLevel { layers, factor });
        }

        let output_dim = input_shape.iter().product();
        Ok(Self {
            family,
            levels,
            input_shape,
            final_shape: shape,
            output_dim,
            input_noise: config.input_noise.then_some(config.noise_scale),
        })
    }

    pub fn family(&self) -> ModelFamily {
        self.family
    }

    /// Per-sample input shape
    pub fn input_shape(&self) -> &[usize] {
        &self.input_shape
    }

    /// Width of the flat latent
    pub fn output_dim(&self) -> usize {
        self.output_dim
    }

    /// Total number of invertible layers
    pub fn num_layers(&self) -> usize {
        self.levels.iter().map(|l| l.layers.len()).sum()
    }

    fn check_input(&self, x: &Tensor) -> Result<()> {
        if x.rank() == 0 || x.dims()[1..] != self.input_shape[..] {
            return Err(FairFlowError::shape(format!(
                "flow expects [B, {:?}], got {:?}",
                self.input_shape,
                x.dims()
            )));
        }
        Ok(())
    }

    /// `x -> (z, log_det)`; `z` is `[B, output_dim]`
    ///
    /// In training mode ActNorm layers initialize from the batch and, if
    /// configured, uniform dequantization noise is added to `x`.
    pub fn forward(&self, x: &Tensor, log_det: &Tensor, training: bool) -> Result<(Tensor, Tensor)> {
        self.check_input(x)?;
        let mut h = match self.input_noise {
            Some(scale) if training => {
                let noise = Tensor::rand(0f32, scale as f32, x.shape(), x.device())?;
                x.add(&noise)?
            }
            _ => x.clone(),
        };
        let mut log_det = log_det.clone();
        let mut parts = Vec::new();

        for level in &self.levels {
            for layer in &level.layers {
                (h, log_det) = layer.forward(&h, &log_det, training)?;
            }
            if let Some(factor) = &level.factor {
                parts.push(h.narrow(1, factor.keep, factor.out)?.flatten_from(1)?);
                h = h.narrow(1, 0, factor.keep)?;
            }
        }
        parts.push(h.flatten_from(1)?);
        Ok((Tensor::cat(&parts, 1)?, log_det))
    }

    /// `z -> x`, the exact inverse of `forward` without noise
    pub fn reverse(&self, z: &Tensor) -> Result<Tensor> {
        let (batch, width) = z.dims2()?;
        if width != self.output_dim {
            return Err(FairFlowError::shape(format!(
                "latent width {width} does not match flow output {}",
                self.output_dim
            )));
        }

        let mut offset = 0;
        let mut parts = Vec::new();
        for factor in self.levels.iter().filter_map(|l| l.factor.as_ref()) {
            let n: usize = factor.out_shape.iter().product();
            parts.push(z.narrow(1, offset, n)?.reshape(batch_shape(batch, &factor.out_shape))?);
            offset += n;
        }
        let n: usize = self.final_shape.iter().product();
        let mut h = z.narrow(1, offset, n)?.reshape(batch_shape(batch, &self.final_shape))?;

        for level in self.levels.iter().rev() {
            if level.factor.is_some() {
                let part = parts
                    .pop()
                    .ok_or_else(|| FairFlowError::shape("missing factored latent part"))?;
                h = Tensor::cat(&[&h, &part], 1)?;
            }
            for layer in level.layers.iter().rev() {
                h = layer.reverse(&h)?;
            }
        }
        Ok(h)
    }

    /// Treat data-dependent layers as initialized (after loading weights)
    pub fn mark_initialized(&self) {
        for layer in self.levels.iter().flat_map(|l| &l.layers) {
            layer.mark_initialized();
        }
    }
}

fn batch_shape(batch: usize, sample: &[usize]) -> Vec<usize> {
    let mut shape = Vec::with_capacity(sample.len() + 1);
    shape.push(batch);
    shape.extend_from_slice(sample);
    shape
}
