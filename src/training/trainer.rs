//! Training loop for the partitioned flow
//!
//! One backward pass per batch feeds both the flow optimizer and every
//! discriminator optimizer; gradient reversal inside the loss makes the
//! flow work against the discriminators. Validation drives checkpointing
//! and early stopping.

use candle_core::backprop::GradStore;
use candle_core::{DType, Var};
use indicatif::{ProgressBar, ProgressStyle};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, error, info, warn};

use super::callback::{DatasetSplits, MetricCallback};
use super::context::TrainingContext;
use super::losses::compute_loss;
use super::metrics::{AverageMeter, EpochMeters, EpochRecord, TrainingHistory, ValidationSummary};
use super::schedule::AdversarialWarmup;
use crate::data::{DataLoader, TripletDataset};
use crate::error::{FairFlowError, Result};
use crate::model::{DiscriminatorEnsemble, PartitionedFlow};
use crate::utils::checkpoint::{find_checkpoint, Checkpoint};

/// Epochs averaged in the closing loss summary
const LOSS_MA_WINDOW: usize = 10;

/// Scale every gradient in `grads` belonging to `vars` so their joint L2
/// norm is at most `max_norm`. Returns the norm before clipping.
pub fn clip_grad_norm(grads: &mut GradStore, vars: &[Var], max_norm: f64) -> Result<f64> {
    let mut total = 0.0;
    for var in vars {
        if let Some(g) = grads.get(var.as_tensor()) {
            total += g.to_dtype(DType::F64)?.sqr()?.sum_all()?.to_scalar::<f64>()?;
        }
    }
    let norm = total.sqrt();
    if norm.is_finite() && norm > max_norm {
        let scale = max_norm / (norm + 1e-6);
        for var in vars {
            if let Some(g) = grads.remove(var.as_tensor()) {
                grads.insert(var.as_tensor(), g.affine(scale, 0.0)?);
            }
        }
    }
    Ok(norm)
}

/// Validation loss over a whole loader, without parameter updates
///
/// The flow is switched to evaluation mode for the pass and restored after.
pub fn validate(
    ctx: &TrainingContext,
    flow: &mut PartitionedFlow,
    ensemble: &DiscriminatorEnsemble,
    loader: &mut DataLoader,
    adv_weight: f64,
) -> Result<ValidationSummary> {
    let was_training = flow.is_training();
    flow.set_training(false);
    let result = validation_pass(ctx, flow, ensemble, loader, adv_weight);
    flow.set_training(was_training);
    result
}

fn validation_pass(
    ctx: &TrainingContext,
    flow: &PartitionedFlow,
    ensemble: &DiscriminatorEnsemble,
    loader: &mut DataLoader,
    adv_weight: f64,
) -> Result<ValidationSummary> {
    loader.reset();
    let mut loss = AverageMeter::new();
    let mut accuracy = AverageMeter::new();
    let mut nll = AverageMeter::new();
    let mut recon_mae = None;

    while let Some(batch) = loader.next_batch(&ctx.device)? {
        let (_, breakdown) = compute_loss(ctx, &batch, flow, ensemble, adv_weight)?;
        loss.update(breakdown.validation, batch.len());
        accuracy.update(breakdown.disc_accuracy, batch.len());
        nll.update(breakdown.nll, batch.len());

        if recon_mae.is_none() {
            let recon = flow.reverse(&flow.encode(&batch.x)?)?;
            let mae = recon
                .sub(&batch.x)?
                .abs()?
                .mean_all()?
                .to_dtype(DType::F64)?
                .to_scalar::<f64>()?;
            recon_mae = Some(mae);
        }
    }

    if loss.count() == 0 {
        return Err(FairFlowError::config("validation loader yielded no batches"));
    }
    Ok(ValidationSummary {
        loss: loss.avg(),
        disc_accuracy: accuracy.avg(),
        nll: nll.avg(),
        recon_mae: recon_mae.unwrap_or(0.0),
    })
}

/// Patience counter over validation losses
#[derive(Debug, Clone, Copy, Default)]
pub struct EarlyStopping {
    patience: usize,
    counter: usize,
    best: Option<f64>,
}

impl EarlyStopping {
    /// `patience == 0` never stops
    pub fn new(patience: usize, best: Option<f64>) -> Self {
        Self {
            patience,
            counter: 0,
            best,
        }
    }

    /// Record a validation loss; returns true on a new best
    pub fn update(&mut self, loss: f64) -> bool {
        if self.best.map_or(loss.is_finite(), |best| loss < best) {
            self.best = Some(loss);
            self.counter = 0;
            true
        } else {
            self.counter += 1;
            false
        }
    }

    pub fn should_stop(&self) -> bool {
        self.patience > 0 && self.counter > self.patience
    }

    pub fn best(&self) -> Option<f64> {
        self.best
    }

    pub fn counter(&self) -> usize {
        self.counter
    }
}

/// Summary of a finished run
#[derive(Debug, Clone)]
pub struct TrainingOutcome {
    pub best_val_loss: Option<f64>,
    pub best_epoch: Option<usize>,
    /// Last epoch that ran
    pub last_epoch: usize,
    /// Total iterations, including resumed ones
    pub itr: usize,
    pub stopped_early: bool,
    pub history: TrainingHistory,
}

/// Partitioned flow trainer
pub struct Trainer<'a> {
    ctx: &'a TrainingContext,
    warmup: AdversarialWarmup,
    history: TrainingHistory,
    rng: StdRng,
    itr: usize,
    start_epoch: usize,
    best_epoch: Option<usize>,
    stopping: EarlyStopping,
}

impl<'a> Trainer<'a> {
    pub fn new(ctx: &'a TrainingContext) -> Self {
        let training = &ctx.config.training;
        Self {
            ctx,
            warmup: AdversarialWarmup::new(training.pred_s_weight, training.warmup_steps),
            history: TrainingHistory::new(),
            rng: StdRng::seed_from_u64(training.seed.wrapping_add(1)),
            itr: 0,
            start_epoch: 1,
            best_epoch: None,
            stopping: EarlyStopping::new(training.early_stopping, None),
        }
    }

    pub fn itr(&self) -> usize {
        self.itr
    }

    pub fn history(&self) -> &TrainingHistory {
        &self.history
    }

    /// Restore a checkpoint and continue after its epoch
    pub fn resume(&mut self, path: &str, flow: &PartitionedFlow, ensemble: &DiscriminatorEnsemble) -> Result<()> {
        let path = find_checkpoint(path)
            .ok_or_else(|| FairFlowError::config(format!("no checkpoint found at {path}")))?;
        let ckpt = Checkpoint::load(&path)?;
        ckpt.restore(&self.ctx.config, flow, ensemble)?;

        self.start_epoch = ckpt.epoch + 1;
        self.itr = ckpt.itr;
        self.stopping = EarlyStopping::new(self.ctx.config.training.early_stopping, ckpt.best_val_loss);
        if ckpt.best_val_loss.is_some() {
            self.carry_best_checkpoint(&path)?;
        }
        info!(
            "Resumed from {} at epoch {} (itr {}, best {:?})",
            path.display(),
            ckpt.epoch,
            ckpt.itr,
            ckpt.best_val_loss
        );
        Ok(())
    }

    /// Copy the source run's `best.ckpt` into this run's directory
    ///
    /// The restored best loss only counts as recorded if its weights can be
    /// reloaded at the end of `fit`, even when no later validation improves.
    fn carry_best_checkpoint(&mut self, resumed: &std::path::Path) -> Result<()> {
        let dst = self.ctx.best_checkpoint_path();
        let src = match (resumed.parent(), dst.file_name()) {
            (Some(dir), Some(name)) => dir.join(name),
            _ => return Ok(()),
        };
        if !src.is_file() {
            warn!("Resumed run has no {}; its best weights cannot be reloaded", src.display());
            return Ok(());
        }
        if src != dst {
            std::fs::copy(&src, &dst)?;
            debug!("Copied {} to {}", src.display(), dst.display());
        }
        self.best_epoch = Some(Checkpoint::load(&dst)?.epoch);
        Ok(())
    }

    fn progress_bar(&self, len: usize, epoch: usize) -> ProgressBar {
        if !self.ctx.config.training.progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(len as u64);
        match ProgressStyle::default_bar().template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}") {
            Ok(style) => pb.set_style(style.progress_chars("##-")),
            Err(e) => warn!("progress bar template rejected: {}", e),
        }
        pb.set_message(format!("epoch {epoch}"));
        pb
    }

    /// One pass over the training loader
    fn train_epoch(
        &mut self,
        epoch: usize,
        flow: &mut PartitionedFlow,
        ensemble: &mut DiscriminatorEnsemble,
        loader: &mut DataLoader,
    ) -> Result<EpochMeters> {
        let ctx = self.ctx;
        let training = &ctx.config.training;
        flow.set_training(true);
        loader.reset();

        let pb = self.progress_bar(loader.num_batches(), epoch);
        let mut meters = EpochMeters::default();

        while let Some(batch) = loader.next_batch(&ctx.device)? {
            let adv_weight = self.warmup.weight(self.itr);
            let (loss, breakdown) = compute_loss(ctx, &batch, flow, ensemble, adv_weight)?;
            if !breakdown.is_finite() {
                error!(itr = self.itr, epoch, "non-finite loss: {:?}", breakdown);
                pb.abandon();
                return Err(FairFlowError::NonFiniteLoss {
                    itr: self.itr,
                    detail: format!("{breakdown:?}"),
                });
            }

            let mut grads = loss.backward()?;
            if let Some(max_norm) = training.grad_clip {
                let mut vars = flow.params().all_vars();
                vars.extend(ensemble.members().iter().flat_map(|m| m.params().all_vars()));
                let norm = clip_grad_norm(&mut grads, &vars, max_norm)?;
                if norm > max_norm {
                    debug!(itr = self.itr, norm, "clipped gradients");
                }
            }
            flow.step(&grads)?;
            ensemble.step(&grads)?;

            meters.update(&breakdown, batch.len());
            if training.log_freq > 0 && self.itr % training.log_freq == 0 {
                debug!(
                    itr = self.itr,
                    total = breakdown.total,
                    nll = breakdown.nll,
                    adv = breakdown.adversarial,
                    acc = breakdown.disc_accuracy,
                    recon = breakdown.recon,
                    adv_weight = breakdown.adv_weight,
                    "step"
                );
            }
            self.itr += 1;

            pb.inc(1);
            pb.set_message(format!("loss {:.4}", meters.total.avg()));
        }

        pb.finish_and_clear();
        Ok(meters)
    }

    /// Train until the epoch budget is spent or early stopping triggers
    ///
    /// Writes `best.ckpt` on every validation improvement and `last.ckpt` at
    /// the end, then reloads the best weights into `flow` and `ensemble`
    /// before the final callback run.
    pub fn fit(
        &mut self,
        flow: &mut PartitionedFlow,
        ensemble: &mut DiscriminatorEnsemble,
        train: &mut DataLoader,
        val: &mut DataLoader,
        test: Option<&TripletDataset>,
        callback: &mut dyn MetricCallback,
    ) -> Result<TrainingOutcome> {
        let ctx = self.ctx;
        let training = &ctx.config.training;
        if let Some(path) = &training.resume {
            self.resume(path, flow, ensemble)?;
        }

        info!(
            "Training epochs {}..={} on {} samples ({} batches/epoch), validating on {}",
            self.start_epoch,
            training.epochs,
            train.num_samples(),
            train.num_batches(),
            val.num_samples()
        );

        let mut last_epoch = self.start_epoch.saturating_sub(1);
        let mut stopped_early = false;
        let mut warm = self.warmup.is_warm(self.itr);

        for epoch in self.start_epoch..=training.epochs {
            let meters = self.train_epoch(epoch, flow, ensemble, train)?;
            last_epoch = epoch;
            let adv_weight = self.warmup.weight(self.itr);
            if !warm && self.warmup.is_warm(self.itr) {
                info!("Adversarial weight reached {:.3} at iteration {}", self.warmup.target(), self.itr);
                warm = true;
            }

            self.history.record_epoch(EpochRecord {
                epoch,
                itr: self.itr,
                loss: meters.total.avg(),
                nll: meters.nll.avg(),
                adversarial: meters.adversarial.avg(),
                disc_accuracy: meters.disc_accuracy.avg(),
                adv_weight,
                validation: None,
            });
            info!(
                "Epoch {}/{}: loss={:.4} nll={:.4} adv={:.4} acc={:.3} w={:.3}",
                epoch,
                training.epochs,
                meters.total.avg(),
                meters.nll.avg(),
                meters.adversarial.avg(),
                meters.disc_accuracy.avg(),
                adv_weight
            );

            if epoch % training.val_freq == 0 {
                let summary = validate(ctx, flow, ensemble, val, adv_weight)?;
                self.history.record_validation(summary);
                let improved = self.stopping.update(summary.loss);
                info!(
                    "[VAL] Epoch {}: loss={:.6} acc={:.3} nll={:.4} recon_mae={:.2e}{}",
                    epoch,
                    summary.loss,
                    summary.disc_accuracy,
                    summary.nll,
                    summary.recon_mae,
                    if improved { " *" } else { "" }
                );

                if improved {
                    self.best_epoch = Some(epoch);
                    Checkpoint::capture(ctx, flow, ensemble, epoch, self.itr, self.stopping.best())?
                        .save(ctx.best_checkpoint_path())?;
                } else if self.stopping.should_stop() {
                    info!(
                        "Early stopping at epoch {}: no improvement in {} validations",
                        epoch,
                        self.stopping.counter()
                    );
                    stopped_early = true;
                    break;
                }
            }

            if training.super_val && epoch % training.super_val_freq == 0 {
                flow.set_training(false);
                let splits = DatasetSplits {
                    train: train.dataset(),
                    validation: val.dataset(),
                    test,
                };
                callback.evaluate(ctx, flow, &splits)?;
            }

            let reset = ensemble.maybe_reset(ctx.config.adversary.reset_prob, &mut self.rng)?;
            if !reset.is_empty() {
                debug!(epoch, ?reset, "discriminators reinitialized");
            }
        }

        Checkpoint::capture(ctx, flow, ensemble, last_epoch, self.itr, self.stopping.best())?
            .save(ctx.last_checkpoint_path())?;

        let best_path = ctx.best_checkpoint_path();
        match self.stopping.best() {
            Some(_) if best_path.is_file() => {
                let best = Checkpoint::load(&best_path)?;
                best.restore(&ctx.config, flow, ensemble)?;
                info!("Reloaded best checkpoint from epoch {}", best.epoch);
            }
            Some(loss) => warn!(
                "Best validation loss {:.6} has no checkpoint at {}; keeping final weights",
                loss,
                best_path.display()
            ),
            None => warn!("No validation improvement recorded; keeping final weights"),
        }

        flow.set_training(false);
        let splits = DatasetSplits {
            train: train.dataset(),
            validation: val.dataset(),
            test,
        };
        callback.evaluate(ctx, flow, &splits)?;

        self.history.save_csv(ctx.history_path())?;
        if let Some(latest) = self.history.latest_loss() {
            info!(
                "Finished at epoch {}: loss={:.4} ({}-epoch average {:.4})",
                last_epoch,
                latest,
                LOSS_MA_WINDOW,
                self.history.loss_ma(LOSS_MA_WINDOW)
            );
        }

        Ok(TrainingOutcome {
            best_val_loss: self.stopping.best(),
            best_epoch: self.best_epoch,
            last_epoch,
            itr: self.itr,
            stopped_early,
            history: self.history.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::synthetic::independent_attributes;
    use crate::training::callback::{LatentReport, NoopCallback};
    use crate::utils::config::Config;
    use approx::assert_abs_diff_eq;
    use candle_core::{Device, Tensor};
    use ndarray::{Array1, ArrayD, IxDyn};
    use tempfile::tempdir;

    fn config() -> Config {
        let mut config = Config::default();
        config.data.batch_size = 16;
        config.flow.level_depth = 2;
        config.flow.coupling_channels = 8;
        config.flow.zs_frac = 0.5;
        config.adversary.hidden_dims = vec![8];
        config.training.epochs = 4;
        config.training.val_freq = 2;
        config.training.nll_weight = 1.0;
        config.training.lr = 1e-3;
        config.training.progress = false;
        config
    }

    fn loaders(config: &Config) -> (DataLoader, DataLoader) {
        let data = independent_attributes(96, 0.1, 5).unwrap();
        let (train, val) = data.split_at_fraction(1.0 / 3.0, 0).unwrap();
        (
            DataLoader::new(train, config.data.batch_size, true, false, config.training.seed),
            DataLoader::new(val, config.test_batch_size(), false, false, 0),
        )
    }

    fn models(ctx: &TrainingContext) -> (PartitionedFlow, DiscriminatorEnsemble) {
        let flow = PartitionedFlow::new(&ctx.config, &[2], &ctx.device).unwrap();
        let ensemble = DiscriminatorEnsemble::for_flow(&ctx.config, &flow, &ctx.device).unwrap();
        (flow, ensemble)
    }

    #[test]
    fn test_fit_writes_artifacts() {
        let dir = tempdir().unwrap();
        let ctx = TrainingContext::new(config(), dir.path()).unwrap();
        let (mut flow, mut ensemble) = models(&ctx);
        let (mut train, mut val) = loaders(&ctx.config);
        let mut report = LatentReport::new();

        let outcome = Trainer::new(&ctx)
            .fit(&mut flow, &mut ensemble, &mut train, &mut val, None, &mut report)
            .unwrap();

        assert_eq!(outcome.last_epoch, 4);
        assert_eq!(outcome.itr, 4 * train.num_batches());
        assert_eq!(outcome.history.num_epochs(), 4);
        assert_eq!(outcome.history.validations().len(), 2);
        assert!(outcome.best_val_loss.is_some());
        assert!(!outcome.stopped_early);
        assert!(!flow.is_training());
        assert_eq!(report.calls, 1);

        assert!(ctx.best_checkpoint_path().is_file());
        assert!(ctx.last_checkpoint_path().is_file());
        let history = TrainingHistory::load_csv(ctx.history_path()).unwrap();
        assert_eq!(history.num_epochs(), 4);
        assert_eq!(Checkpoint::load(ctx.last_checkpoint_path()).unwrap().epoch, 4);
    }

    #[test]
    fn test_super_val_runs_callback_periodically() {
        let dir = tempdir().unwrap();
        let mut config = config();
        config.training.super_val = true;
        config.training.super_val_freq = 2;
        let ctx = TrainingContext::new(config, dir.path()).unwrap();
        let (mut flow, mut ensemble) = models(&ctx);
        let (mut train, mut val) = loaders(&ctx.config);
        let mut report = LatentReport::new();

        Trainer::new(&ctx)
            .fit(&mut flow, &mut ensemble, &mut train, &mut val, None, &mut report)
            .unwrap();
        // epochs 2 and 4, then the final run
        assert_eq!(report.calls, 3);
    }

    #[test]
    fn test_resume_continues_from_checkpoint() {
        let first_dir = tempdir().unwrap();
        let ctx = TrainingContext::new(config(), first_dir.path()).unwrap();
        let (mut flow, mut ensemble) = models(&ctx);
        let (mut train, mut val) = loaders(&ctx.config);
        let first = Trainer::new(&ctx)
            .fit(&mut flow, &mut ensemble, &mut train, &mut val, None, &mut NoopCallback)
            .unwrap();

        let second_dir = tempdir().unwrap();
        let mut config = config();
        config.training.epochs = 6;
        config.training.resume = Some(first_dir.path().join("last.ckpt").display().to_string());
        let ctx = TrainingContext::new(config, second_dir.path()).unwrap();
        let (mut flow, mut ensemble) = models(&ctx);
        let (mut train, mut val) = loaders(&ctx.config);
        let second = Trainer::new(&ctx)
            .fit(&mut flow, &mut ensemble, &mut train, &mut val, None, &mut NoopCallback)
            .unwrap();

        assert_eq!(second.history.records()[0].epoch, 5);
        assert_eq!(second.history.num_epochs(), 2);
        assert_eq!(second.itr, first.itr + 2 * train.num_batches());
    }

    #[test]
    fn test_resume_without_improvement_reloads_carried_best() {
        let first_dir = tempdir().unwrap();
        let ctx = TrainingContext::new(config(), first_dir.path()).unwrap();
        let (mut flow, mut ensemble) = models(&ctx);
        let (mut train, mut val) = loaders(&ctx.config);
        let first = Trainer::new(&ctx)
            .fit(&mut flow, &mut ensemble, &mut train, &mut val, None, &mut NoopCallback)
            .unwrap();
        let first_best = Checkpoint::load(ctx.best_checkpoint_path()).unwrap();

        // epochs 5 and 6 never hit a validation step, so nothing improves
        let second_dir = tempdir().unwrap();
        let mut config = config();
        config.training.epochs = 6;
        config.training.val_freq = 4;
        config.training.resume = Some(first_dir.path().join("last.ckpt").display().to_string());
        let ctx = TrainingContext::new(config, second_dir.path()).unwrap();
        let (mut flow, mut ensemble) = models(&ctx);
        let (mut train, mut val) = loaders(&ctx.config);
        let second = Trainer::new(&ctx)
            .fit(&mut flow, &mut ensemble, &mut train, &mut val, None, &mut NoopCallback)
            .unwrap();

        assert!(second.history.validations().is_empty());
        assert!(ctx.best_checkpoint_path().is_file());
        assert_eq!(second.best_epoch, first.best_epoch);
        assert_eq!(second.best_val_loss, first.best_val_loss);
        // final weights are the carried best, not the epoch-6 weights
        assert_eq!(flow.export().unwrap(), first_best.flow);
    }

    #[test]
    fn test_non_finite_loss_aborts() {
        let dir = tempdir().unwrap();
        let ctx = TrainingContext::new(config(), dir.path()).unwrap();
        let (mut flow, mut ensemble) = models(&ctx);

        let mut x = ArrayD::<f32>::zeros(IxDyn(&[8, 2]));
        x[[3, 0]] = f32::NAN;
        let data = TripletDataset::new(x, Array1::zeros(8), Array1::zeros(8)).unwrap();
        let mut train = DataLoader::new(data.clone(), 4, false, false, 0);
        let mut val = DataLoader::new(data, 4, false, false, 0);

        let err = Trainer::new(&ctx)
            .fit(&mut flow, &mut ensemble, &mut train, &mut val, None, &mut NoopCallback)
            .unwrap_err();
        assert!(matches!(err, FairFlowError::NonFiniteLoss { itr: 0, .. }));
        assert!(!ctx.last_checkpoint_path().exists());
    }

    #[test]
    fn test_validate_is_deterministic_and_restores_mode() {
        let dir = tempdir().unwrap();
        let ctx = TrainingContext::new(config(), dir.path()).unwrap();
        let (mut flow, ensemble) = models(&ctx);
        let (_, mut val) = loaders(&ctx.config);

        let a = validate(&ctx, &mut flow, &ensemble, &mut val, 1.0).unwrap();
        let b = validate(&ctx, &mut flow, &ensemble, &mut val, 1.0).unwrap();
        assert_eq!(a, b);
        assert!(flow.is_training());
        assert!(a.recon_mae < 1e-4);
        assert!((0.0..=1.0).contains(&a.disc_accuracy));
    }

    #[test]
    fn test_early_stopping() {
        let mut stopping = EarlyStopping::new(2, None);
        assert!(stopping.update(3.0));
        assert!(!stopping.update(3.5));
        assert!(!stopping.update(3.0));
        assert!(!stopping.should_stop());
        assert!(!stopping.update(4.0));
        assert!(stopping.should_stop());
        assert!(stopping.update(1.0));
        assert_eq!(stopping.counter(), 0);
        assert_eq!(stopping.best(), Some(1.0));

        let mut never = EarlyStopping::new(0, None);
        for _ in 0..10 {
            never.update(f64::NAN);
        }
        assert!(!never.should_stop());
        assert_eq!(never.best(), None);
    }

    #[test]
    fn test_clip_grad_norm() {
        let w = Var::from_tensor(&Tensor::new(&[1.0f32, -2.0], &Device::Cpu).unwrap()).unwrap();
        let loss = w.as_tensor().affine(3.0, 0.0).unwrap().sum_all().unwrap();
        let mut grads = loss.backward().unwrap();

        let norm = clip_grad_norm(&mut grads, &[w.clone()], 1.0).unwrap();
        assert_abs_diff_eq!(norm, 18f64.sqrt(), epsilon = 1e-6);
        let clipped = grads.get(w.as_tensor()).unwrap().to_vec1::<f32>().unwrap();
        assert_abs_diff_eq!(clipped[0], 3.0 / 18f32.sqrt(), epsilon = 1e-5);

        let norm = clip_grad_norm(&mut grads, &[w.clone()], 10.0).unwrap();
        assert_abs_diff_eq!(norm, 1.0, epsilon = 1e-5);
    }
}
