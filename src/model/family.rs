//! Model family selection
//!
//! The input shape decides, once, which components a flow is built from.

use super::layers::AffineCoupling;
use super::nets::{ConvNet, CouplingNet, Mlp};
use super::params::ParamStore;
use crate::error::{FairFlowError, Result};
use crate::utils::config::FlowConfig;

/// Tabular or image flows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFamily {
    /// Per-sample shape `[features]`
    Tabular { features: usize },
    /// Per-sample shape `[channels, height, width]`
    Image {
        channels: usize,
        height: usize,
        width: usize,
    },
}

impl ModelFamily {
    /// Pick the family from the per-sample input shape
    pub fn from_input_shape(shape: &[usize]) -> Result<Self> {
        if shape.iter().any(|&d| d == 0) {
            return Err(FairFlowError::shape(format!("input shape {shape:?} has an empty dim")));
        }
        match *shape {
            [features] => Ok(ModelFamily::Tabular { features }),
            [channels, height, width] => Ok(ModelFamily::Image {
                channels,
                height,
                width,
            }),
            _ => Err(FairFlowError::shape(format!(
                "expected a per-sample shape of rank 1 or 3, got {shape:?}"
            ))),
        }
    }

    /// Per-sample input shape
    pub fn input_shape(&self) -> Vec<usize> {
        match *self {
            ModelFamily::Tabular { features } => vec![features],
            ModelFamily::Image {
                channels,
                height,
                width,
            } => vec![channels, height, width],
        }
    }

    /// Whether every level starts with a squeeze
    pub fn squeezes(&self) -> bool {
        matches!(self, ModelFamily::Image { .. })
    }

    /// Subnet for a coupling over `channels` channels
    pub fn coupling_net(
        &self,
        store: &mut ParamStore,
        prefix: &str,
        channels: usize,
        swap: bool,
        config: &FlowConfig,
    ) -> Result<CouplingNet> {
        let cond = AffineCoupling::cond_width(channels, swap);
        let out = AffineCoupling::net_out_width(channels, swap, config.scaling);
        match self {
            ModelFamily::Tabular { .. } => {
                let hidden = vec![config.coupling_channels; config.coupling_depth];
                Ok(CouplingNet::Mlp(Mlp::new(store, prefix, cond, &hidden, out, true)?))
            }
            ModelFamily::Image { .. } => Ok(CouplingNet::Conv(ConvNet::new(
                store,
                prefix,
                cond,
                config.coupling_channels,
                config.coupling_depth,
                out,
            )?)),
        }
    }
}
