//! Loss functions and the composed training objective
//!
//! The objective is
//! `nll_weight * NLL + pred_s_weight(t) * mean_disc_loss + recon_loss`,
//! where the discriminator input passes through gradient reversal.

use candle_core::Tensor;

use super::context::TrainingContext;
use crate::data::Batch;
use crate::error::{FairFlowError, Result};
use crate::model::grad_reverse::grad_reverse;
use crate::model::{DiscriminatorEnsemble, PartitionedFlow};
use crate::utils::config::DiscriminatorInput;

/// Numerically stable binary cross entropy on logits, averaged
///
/// `max(x, 0) - x * t + log(1 + exp(-|x|))`
pub fn binary_cross_entropy_with_logits(logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
    if logits.dims() != targets.dims() {
        return Err(FairFlowError::shape(format!(
            "logits {:?} and targets {:?} differ",
            logits.dims(),
            targets.dims()
        )));
    }
    let tail = logits.abs()?.neg()?.exp()?.affine(1.0, 1.0)?.log()?;
    let loss = logits.relu()?.sub(&logits.mul(targets)?)?.add(&tail)?;
    Ok(loss.mean_all()?)
}

/// Softmax cross entropy with u32 class targets
pub fn cross_entropy(logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
    Ok(candle_nn::loss::cross_entropy(logits, targets)?)
}

/// Mean squared error
pub fn mse(prediction: &Tensor, target: &Tensor) -> Result<Tensor> {
    Ok(prediction.sub(target)?.sqr()?.mean_all()?)
}

/// Scalar components of one loss evaluation
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LossBreakdown {
    /// Unweighted negative log-likelihood
    pub nll: f64,
    /// Mean discriminator loss, unweighted
    pub adversarial: f64,
    /// Mean discriminator accuracy
    pub disc_accuracy: f64,
    /// Weighted reconstruction loss
    pub recon: f64,
    /// Adversarial weight in effect
    pub adv_weight: f64,
    /// Training objective
    pub total: f64,
    /// Flow-view objective, `nll_weight * nll - adv_weight * adversarial + recon`
    pub validation: f64,
}

impl LossBreakdown {
    pub fn is_finite(&self) -> bool {
        self.total.is_finite() && self.nll.is_finite() && self.adversarial.is_finite()
    }
}

fn scalar(t: &Tensor) -> Result<f64> {
    Ok(t.to_dtype(candle_core::DType::F64)?.to_scalar::<f64>()?)
}

/// Compose the training objective for one batch
///
/// Returns the graph-connected total loss and its scalar breakdown.
pub fn compute_loss(
    ctx: &TrainingContext,
    batch: &Batch,
    flow: &PartitionedFlow,
    ensemble: &DiscriminatorEnsemble,
    adv_weight: f64,
) -> Result<(Tensor, LossBreakdown)> {
    let training = &ctx.config.training;
    let adversary = &ctx.config.adversary;

    let (z, log_det) = flow.forward(&batch.x)?;
    let nll = flow.nll(&z, &log_det)?;

    let needs_recon =
        training.recon_stability_weight > 0.0 || adversary.input == DiscriminatorInput::Reconstruction;
    let recon = if needs_recon {
        let source = if training.recon_detach { z.detach() } else { z.clone() };
        Some(flow.reverse(&flow.partition().zero_except_fair(&source)?)?)
    } else {
        None
    };
    let recon_loss = match &recon {
        Some(recon) if training.recon_stability_weight > 0.0 => {
            Some(mse(recon, &batch.x)?.affine(training.recon_stability_weight, 0.0)?)
        }
        _ => None,
    };

    let disc_input = match (adversary.input, &recon) {
        (DiscriminatorInput::Split, _) => flow.split(&z)?.zy,
        (DiscriminatorInput::Masked, _) => flow.partition().zero_except_fair(&z)?,
        (DiscriminatorInput::Reconstruction, Some(recon)) => recon.flatten_from(1)?,
        (DiscriminatorInput::Reconstruction, None) => {
            return Err(FairFlowError::config("reconstruction input requires a reconstruction"))
        }
    };
    let reversed = grad_reverse(&disc_input, adversary.grl_lambda)?;
    let (disc_loss, disc_accuracy) = ensemble.routine(&reversed, &batch.s)?;

    let mut total = nll
        .affine(training.nll_weight, 0.0)?
        .add(&disc_loss.affine(adv_weight, 0.0)?)?;
    if let Some(recon_loss) = &recon_loss {
        total = total.add(recon_loss)?;
    }

    let nll_value = scalar(&nll)?;
    let adversarial = scalar(&disc_loss)?;
    let recon_value = match &recon_loss {
        Some(r) => scalar(r)?,
        None => 0.0,
    };
    let breakdown = LossBreakdown {
        nll: nll_value,
        adversarial,
        disc_accuracy,
        recon: recon_value,
        adv_weight,
        total: scalar(&total)?,
        validation: training.nll_weight * nll_value - adv_weight * adversarial + recon_value,
    };
    Ok((total, breakdown))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use candle_core::Device;

    #[test]
    fn test_bce_matches_reference() {
        let logits = Tensor::new(&[[0.0f32], [2.0], [-3.0]], &Device::Cpu).unwrap();
        let targets = Tensor::new(&[[1.0f32], [0.0], [0.0]], &Device::Cpu).unwrap();
        let loss = binary_cross_entropy_with_logits(&logits, &targets)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();

        let sigmoid = |x: f32| 1.0 / (1.0 + (-x).exp());
        let expected = (-(sigmoid(0.0)).ln() - (1.0 - sigmoid(2.0)).ln() - (1.0 - sigmoid(-3.0)).ln()) / 3.0;
        assert_abs_diff_eq!(loss, expected, epsilon = 1e-5);
    }

    #[test]
    fn test_bce_is_finite_for_saturated_logits() {
        let logits = Tensor::new(&[[80.0f32], [-80.0]], &Device::Cpu).unwrap();
        let targets = Tensor::new(&[[0.0f32], [1.0]], &Device::Cpu).unwrap();
        let loss = binary_cross_entropy_with_logits(&logits, &targets)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert_abs_diff_eq!(loss, 80.0, epsilon = 1e-3);
    }

    #[test]
    fn test_bce_shape_mismatch() {
        let logits = Tensor::new(&[[0.0f32], [1.0]], &Device::Cpu).unwrap();
        let targets = Tensor::new(&[0.0f32, 1.0], &Device::Cpu).unwrap();
        assert!(binary_cross_entropy_with_logits(&logits, &targets).is_err());
    }

    fn loss_setup(input: DiscriminatorInput, recon_weight: f64) -> (TrainingContext, PartitionedFlow, DiscriminatorEnsemble, Batch, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = crate::utils::config::Config::default();
        config.flow.coupling_channels = 8;
        config.flow.zs_frac = 0.5;
        config.adversary.input = input;
        config.training.nll_weight = 0.5;
        config.training.recon_stability_weight = recon_weight;
        let ctx = TrainingContext::new(config, dir.path()).unwrap();
        let flow = PartitionedFlow::new(&ctx.config, &[2], &ctx.device).unwrap();
        let ensemble = DiscriminatorEnsemble::for_flow(&ctx.config, &flow, &ctx.device).unwrap();
        let batch = crate::data::synthetic::independent_attributes(8, 0.1, 2)
            .unwrap()
            .batch(&[0, 1, 2, 3, 4, 5, 6, 7], &ctx.device)
            .unwrap();
        (ctx, flow, ensemble, batch, dir)
    }

    #[test]
    fn test_compute_loss_composition() {
        let (ctx, flow, ensemble, batch, _dir) = loss_setup(DiscriminatorInput::Split, 0.0);
        let (total, b) = compute_loss(&ctx, &batch, &flow, &ensemble, 2.0).unwrap();

        assert!(b.is_finite());
        assert_eq!(b.recon, 0.0);
        assert_eq!(b.adv_weight, 2.0);
        assert_abs_diff_eq!(b.total, 0.5 * b.nll + 2.0 * b.adversarial, epsilon = 1e-4);
        assert_abs_diff_eq!(b.validation, 0.5 * b.nll - 2.0 * b.adversarial, epsilon = 1e-4);
        assert_abs_diff_eq!(scalar(&total).unwrap(), b.total, epsilon = 1e-9);
        assert!((0.0..=1.0).contains(&b.disc_accuracy));

        let grads = total.backward().unwrap();
        let disc_vars = ensemble.members()[0].params().all_vars();
        assert!(disc_vars.iter().any(|v| grads.get(v.as_tensor()).is_some()));
    }

    #[test]
    fn test_compute_loss_reconstruction_terms() {
        let (ctx, flow, ensemble, batch, _dir) = loss_setup(DiscriminatorInput::Reconstruction, 3.0);
        let (_, b) = compute_loss(&ctx, &batch, &flow, &ensemble, 1.0).unwrap();
        // zeroing zs of an untrained flow loses information, so the penalty is positive
        assert!(b.recon > 0.0);
        assert_abs_diff_eq!(b.total, 0.5 * b.nll + b.adversarial + b.recon, epsilon = 1e-4);
    }

    #[test]
    fn test_mse() {
        let a = Tensor::new(&[1.0f32, 2.0], &Device::Cpu).unwrap();
        let b = Tensor::new(&[0.0f32, 4.0], &Device::Cpu).unwrap();
        assert_abs_diff_eq!(mse(&a, &b).unwrap().to_scalar::<f32>().unwrap(), 2.5);
    }
}
