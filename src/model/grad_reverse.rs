//! Gradient reversal
//!
//! Identity on the forward path; on the backward path the incoming gradient
//! is multiplied by `-lambda`. Placed between the flow's fair latent and the
//! discriminators, one loss value then trains the discriminators to predict
//! the sensitive attribute and the flow to hide it.

use candle_core::{CpuStorage, CustomOp1, Layout, Shape, Tensor};

use crate::error::Result;

/// Custom autodiff op implementing gradient reversal
#[derive(Debug, Clone, Copy)]
pub struct GradReverse {
    pub lambda: f64,
}

impl CustomOp1 for GradReverse {
    fn name(&self) -> &'static str {
        "grad-reverse"
    }

    fn cpu_fwd(&self, storage: &CpuStorage, layout: &Layout) -> candle_core::Result<(CpuStorage, Shape)> {
        let Some((start, end)) = layout.contiguous_offsets() else {
            candle_core::bail!("grad-reverse expects a contiguous input")
        };
        let out = match storage {
            CpuStorage::F32(v) => CpuStorage::F32(v[start..end].to_vec()),
            CpuStorage::F64(v) => CpuStorage::F64(v[start..end].to_vec()),
            _ => candle_core::bail!("grad-reverse supports f32 and f64 tensors"),
        };
        Ok((out, layout.shape().clone()))
    }

    fn bwd(&self, _arg: &Tensor, _res: &Tensor, grad_res: &Tensor) -> candle_core::Result<Option<Tensor>> {
        Ok(Some(grad_res.affine(-self.lambda, 0.0)?))
    }
}

/// Apply gradient reversal with scale `lambda`
pub fn grad_reverse(x: &Tensor, lambda: f64) -> Result<Tensor> {
    Ok(x.contiguous()?.apply_op1(GradReverse { lambda })?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use candle_core::{Device, Var};

    fn flat(t: &Tensor) -> Vec<f32> {
        t.flatten_all().unwrap().to_vec1::<f32>().unwrap()
    }

    #[test]
    fn test_forward_is_identity() {
        let x = Tensor::new(&[[1.0f32, -2.0, 3.5], [0.0, 0.25, -1.0]], &Device::Cpu).unwrap();
        let y = grad_reverse(&x, 0.7).unwrap();
        assert_eq!(flat(&x), flat(&y));
        assert_eq!(x.dims(), y.dims());
    }

    #[test]
    fn test_forward_on_strided_input() {
        let x = Tensor::new(&[[1.0f32, 2.0], [3.0, 4.0]], &Device::Cpu).unwrap();
        let xt = x.t().unwrap();
        let y = grad_reverse(&xt, 1.0).unwrap();
        assert_eq!(flat(&y), vec![1.0, 3.0, 2.0, 4.0]);
    }

    #[test]
    fn test_backward_negates_and_scales() {
        let device = Device::Cpu;
        let z = Var::new(&[[0.5f32, -1.0], [2.0, 0.3]], &device).unwrap();
        let w = Var::new(&[[1.5f32], [-0.7]], &device).unwrap();
        let lambda = 0.5;

        let plain = z.as_tensor().matmul(w.as_tensor()).unwrap().sqr().unwrap().sum_all().unwrap();
        let plain_grads = plain.backward().unwrap();

        let reversed = grad_reverse(z.as_tensor(), lambda)
            .unwrap()
            .matmul(w.as_tensor())
            .unwrap()
            .sqr()
            .unwrap()
            .sum_all()
            .unwrap();
        let reversed_grads = reversed.backward().unwrap();

        // the upstream side sees -lambda times the ordinary gradient
        let gz_plain = flat(plain_grads.get(z.as_tensor()).unwrap());
        let gz_rev = flat(reversed_grads.get(z.as_tensor()).unwrap());
        for (p, r) in gz_plain.iter().zip(&gz_rev) {
            assert_abs_diff_eq!(*r, -(lambda as f32) * p, epsilon = 1e-6);
        }

        // the downstream side is untouched
        let gw_plain = flat(plain_grads.get(w.as_tensor()).unwrap());
        let gw_rev = flat(reversed_grads.get(w.as_tensor()).unwrap());
        for (p, r) in gw_plain.iter().zip(&gw_rev) {
            assert_abs_diff_eq!(*r, *p, epsilon = 1e-6);
        }
    }
}
