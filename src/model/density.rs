//! Base densities of the latent space

use candle_core::{Device, Tensor};
use rand::Rng;
use rand_distr::{Distribution, Normal};

use crate::error::{FairFlowError, Result};
use crate::utils::config::BaseDensityKind;

/// Numerically stable `log(1 + exp(x))`
pub fn softplus(x: &Tensor) -> Result<Tensor> {
    let tail = x.abs()?.neg()?.exp()?.affine(1.0, 1.0)?.log()?;
    Ok(x.relu()?.add(&tail)?)
}

/// Density the flow maps data onto
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BaseDensity {
    /// Isotropic normal with the given std
    Normal { std: f64 },
    /// Standard logistic
    Logistic,
    /// Uniform on the unit cube; its log-density is the constant 0
    Uniform,
}

impl BaseDensity {
    pub fn from_config(kind: BaseDensityKind, std: f64) -> Self {
        match kind {
            BaseDensityKind::Normal => BaseDensity::Normal { std },
            BaseDensityKind::Logistic => BaseDensity::Logistic,
            BaseDensityKind::Uniform => BaseDensity::Uniform,
        }
    }

    /// Elementwise log-density
    pub fn log_prob(&self, z: &Tensor) -> Result<Tensor> {
        match *self {
            BaseDensity::Normal { std } => {
                let log_norm = -0.5 * (2.0 * std::f64::consts::PI).ln() - std.ln();
                Ok(z.sqr()?.affine(-0.5 / (std * std), log_norm)?)
            }
            BaseDensity::Logistic => {
                let pos = softplus(z)?;
                let neg = softplus(&z.neg()?)?;
                Ok(pos.add(&neg)?.neg()?)
            }
            BaseDensity::Uniform => Ok(z.zeros_like()?),
        }
    }

    /// Negative log-likelihood averaged over the batch
    ///
    /// `z` is `[B, D]` and `log_det` is `[B]`.
    pub fn nll(&self, z: &Tensor, log_det: &Tensor) -> Result<Tensor> {
        let (batch, _) = z.dims2()?;
        if log_det.dims() != [batch] {
            return Err(FairFlowError::shape(format!(
                "log_det must be [{batch}], got {:?}",
                log_det.dims()
            )));
        }
        let log_pz = self.log_prob(z)?.sum(1)?;
        Ok(log_pz.add(log_det)?.neg()?.mean_all()?)
    }

    /// Draw `n x dim` latent samples
    pub fn sample<R: Rng>(&self, n: usize, dim: usize, rng: &mut R, device: &Device) -> Result<Tensor> {
        let count = n * dim;
        let data: Vec<f32> = match *self {
            BaseDensity::Normal { std } => {
                let normal = Normal::new(0.0, std)
                    .map_err(|e| FairFlowError::config(format!("invalid base density std: {e}")))?;
                (0..count).map(|_| normal.sample(rng) as f32).collect()
            }
            BaseDensity::Logistic => (0..count)
                .map(|_| {
                    let u: f64 = rng.gen_range(1e-6..1.0 - 1e-6);
                    (u.ln() - (1.0 - u).ln()) as f32
                })
                .collect(),
            BaseDensity::Uniform => (0..count).map(|_| rng.gen::<f32>()).collect(),
        };
        Ok(Tensor::from_vec(data, (n, dim), device)?)
    }
}
