//! Small feed-forward networks built on a [`ParamStore`]
//!
//! Used as coupling subnets (tabular MLP, image conv net) and as
//! discriminators.

use candle_core::Tensor;
use candle_nn::{Conv2d, Conv2dConfig, Linear, Module};

use super::params::{Init, ParamStore};
use crate::error::Result;

/// Multi-layer perceptron with ReLU activations between layers
pub struct Mlp {
    layers: Vec<Linear>,
    out_dim: usize,
}

impl Mlp {
    /// Build `in_dim -> hidden... -> out_dim`
    ///
    /// With `zero_last` the output layer starts at zero, which makes a
    /// coupling layer start as the identity.
    pub fn new(
        store: &mut ParamStore,
        prefix: &str,
        in_dim: usize,
        hidden: &[usize],
        out_dim: usize,
        zero_last: bool,
    ) -> Result<Self> {
        let mut dims = Vec::with_capacity(hidden.len() + 2);
        dims.push(in_dim);
        dims.extend_from_slice(hidden);
        dims.push(out_dim);

        let n_layers = dims.len() - 1;
        let mut layers = Vec::with_capacity(n_layers);
        for (i, pair) in dims.windows(2).enumerate() {
            let (fan_in, fan_out) = (pair[0], pair[1]);
            let init = if zero_last && i == n_layers - 1 {
                Init::Zeros
            } else {
                Init::fan_in(fan_in)
            };
            let weight = store.var(&format!("{prefix}.fc{i}.weight"), &[fan_out, fan_in], init)?;
            let bias = store.var(&format!("{prefix}.fc{i}.bias"), &[fan_out], init)?;
            layers.push(Linear::new(weight, Some(bias)));
        }
        Ok(Self { layers, out_dim })
    }

    pub fn out_dim(&self) -> usize {
        self.out_dim
    }

    /// Forward pass on `[B, in_dim]`
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mut h = x.clone();
        let last = self.layers.len() - 1;
        for (i, layer) in self.layers.iter().enumerate() {
            h = layer.forward(&h)?;
            if i < last {
                h = h.relu()?;
            }
        }
        Ok(h)
    }
}

/// 3x3 convolutional net preserving spatial size
pub struct ConvNet {
    convs: Vec<Conv2d>,
}

impl ConvNet {
    /// Build `in_channels -> hidden (x depth) -> out_channels`; the last conv is zero-initialized
    pub fn new(
        store: &mut ParamStore,
        prefix: &str,
        in_channels: usize,
        hidden: usize,
        depth: usize,
        out_channels: usize,
    ) -> Result<Self> {
        let cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let mut channels = vec![in_channels];
        channels.extend(std::iter::repeat(hidden).take(depth.max(1)));
        channels.push(out_channels);

        let n_convs = channels.len() - 1;
        let mut convs = Vec::with_capacity(n_convs);
        for (i, pair) in channels.windows(2).enumerate() {
            let (c_in, c_out) = (pair[0], pair[1]);
            let init = if i == n_convs - 1 {
                Init::Zeros
            } else {
                Init::fan_in(c_in * 9)
            };
            let weight = store.var(&format!("{prefix}.conv{i}.weight"), &[c_out, c_in, 3, 3], init)?;
            let bias = store.var(&format!("{prefix}.conv{i}.bias"), &[c_out], init)?;
            convs.push(Conv2d::new(weight, Some(bias), cfg));
        }
        Ok(Self { convs })
    }

    /// Forward pass on `[B, C, H, W]`
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mut h = x.clone();
        let last = self.convs.len() - 1;
        for (i, conv) in self.convs.iter().enumerate() {
            h = conv.forward(&h)?;
            if i < last {
                h = h.relu()?;
            }
        }
        Ok(h)
    }
}

/// Subnet producing coupling parameters from the conditioning half
pub enum CouplingNet {
    Mlp(Mlp),
    Conv(ConvNet),
}

impl CouplingNet {
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            CouplingNet::Mlp(net) => net.forward(x),
            CouplingNet::Conv(net) => net.forward(x),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_mlp_shapes() {
        let device = Device::Cpu;
        let mut store = ParamStore::new(0, &device);
        let mlp = Mlp::new(&mut store, "disc", 5, &[16, 8], 3, false).unwrap();
        assert_eq!(store.len(), 6);
        assert_eq!(mlp.out_dim(), 3);

        let x = Tensor::ones((4, 5), DType::F32, &device).unwrap();
        assert_eq!(mlp.forward(&x).unwrap().dims(), &[4, 3]);
    }

    #[test]
    fn test_zero_last_outputs_zero() {
        let device = Device::Cpu;
        let mut store = ParamStore::new(0, &device);
        let mlp = Mlp::new(&mut store, "net", 2, &[4], 2, true).unwrap();
        let x = Tensor::new(&[[1.0f32, -3.0], [0.5, 2.0]], &device).unwrap();
        let out = mlp.forward(&x).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(out.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_conv_net_preserves_spatial_size() {
        let device = Device::Cpu;
        let mut store = ParamStore::new(0, &device);
        let net = ConvNet::new(&mut store, "net", 2, 8, 1, 4).unwrap();
        let x = Tensor::ones((3, 2, 4, 4), DType::F32, &device).unwrap();
        assert_eq!(net.forward(&x).unwrap().dims(), &[3, 4, 4, 4]);
    }
}
