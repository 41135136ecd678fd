//! Invertible building blocks
//!
//! Every layer maps `(x, log_det) -> (y, log_det')` forward and `y -> x` in
//! reverse using the same parameters. Tensors are `[B, F]` (tabular) or
//! `[B, C, H, W]` (image); axis 1 is always the channel/feature axis.

use std::cell::Cell;

use candle_core::{DType, Tensor, Var};
use rand::seq::SliceRandom;
use rand::Rng;
use rand_distr::StandardNormal;

use super::density::softplus;
use super::nets::CouplingNet;
use super::params::{Init, ParamStore};
use crate::error::{FairFlowError, Result};
use crate::utils::config::{PermutationKind, Scaling};

/// Bound on the log scale of exp-scaled couplings
const LOG_SCALE_CLAMP: f64 = 5.0;

/// Weight of the current batch in the running batch-norm statistics
const BN_MOMENTUM: f64 = 0.1;
const BN_EPS: f64 = 1e-4;

/// Bijection with a tractable log-determinant
pub trait InvertibleLayer {
    /// Transform `x` and add this layer's log-determinant to `log_det` (`[B]`)
    fn forward(&self, x: &Tensor, log_det: &Tensor, training: bool) -> Result<(Tensor, Tensor)>;

    /// Exact inverse of `forward`
    fn reverse(&self, y: &Tensor) -> Result<Tensor>;

    /// Short name for logging
    fn name(&self) -> &'static str;

    /// Mark data-dependent state as already initialized (after a restore)
    fn mark_initialized(&self) {}
}

/// Product of all dims after the channel axis
fn spatial_size(x: &Tensor) -> usize {
    x.dims().iter().skip(2).product()
}

/// Reshape a per-channel vector to broadcast against `x`
fn per_channel(param: &Tensor, x: &Tensor) -> Result<Tensor> {
    let mut shape = vec![1; x.rank()];
    shape[1] = param.elem_count();
    Ok(param.reshape(shape)?)
}

/// Per-sample sum over every non-batch dim
fn sum_per_sample(x: &Tensor) -> Result<Tensor> {
    Ok(x.flatten_from(1)?.sum(1)?)
}

/// Per-channel `(mean, biased variance)` over batch and spatial dims, each `[C]`
fn channel_moments(x: &Tensor) -> Result<(Tensor, Tensor)> {
    let channels = x.dim(1)?;
    let flat = x.transpose(0, 1)?.reshape((channels, ()))?;
    let mean = flat.mean_keepdim(1)?;
    let var = flat.broadcast_sub(&mean)?.sqr()?.mean(1)?;
    Ok((mean.flatten_all()?, var))
}

fn fetch_var(store: &ParamStore, name: &str) -> Result<Var> {
    store
        .get(name)
        .cloned()
        .ok_or_else(|| FairFlowError::shape(format!("missing parameter `{name}`")))
}

// ---------------------------------------------------------------------------
// ActNorm
// ---------------------------------------------------------------------------

/// Per-channel affine normalization with data-dependent initialization
///
/// Until the first training-mode forward it is the identity, so reversing a
/// fresh model stays finite.
pub struct ActNorm {
    loc: Var,
    log_scale: Var,
    initialized: Cell<bool>,
}

impl ActNorm {
    pub fn new(store: &mut ParamStore, prefix: &str, channels: usize) -> Result<Self> {
        store.var(&format!("{prefix}.loc"), &[channels], Init::Zeros)?;
        store.var(&format!("{prefix}.log_scale"), &[channels], Init::Zeros)?;
        Ok(Self {
            loc: fetch_var(store, &format!("{prefix}.loc"))?,
            log_scale: fetch_var(store, &format!("{prefix}.log_scale"))?,
            initialized: Cell::new(false),
        })
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.get()
    }

    /// Set loc/scale so the batch comes out zero-mean, unit-variance per channel
    fn initialize(&self, x: &Tensor) -> Result<()> {
        let (mean, var) = channel_moments(&x.detach())?;
        let log_scale = var.sqrt()?.affine(1.0, 1e-6)?.log()?.neg()?;
        self.loc.set(&mean)?;
        self.log_scale.set(&log_scale)?;
        self.initialized.set(true);
        Ok(())
    }
}

impl InvertibleLayer for ActNorm {
    fn forward(&self, x: &Tensor, log_det: &Tensor, training: bool) -> Result<(Tensor, Tensor)> {
        if training && !self.initialized.get() {
            self.initialize(x)?;
        }
        let loc = per_channel(self.loc.as_tensor(), x)?;
        let log_scale = per_channel(self.log_scale.as_tensor(), x)?;
        let y = x.broadcast_sub(&loc)?.broadcast_mul(&log_scale.exp()?)?;

        let ld = self
            .log_scale
            .as_tensor()
            .sum_all()?
            .affine(spatial_size(x) as f64, 0.0)?;
        Ok((y, log_det.broadcast_add(&ld)?))
    }

    fn reverse(&self, y: &Tensor) -> Result<Tensor> {
        let loc = per_channel(self.loc.as_tensor(), y)?;
        let log_scale = per_channel(self.log_scale.as_tensor(), y)?;
        Ok(y.broadcast_mul(&log_scale.neg()?.exp()?)?.broadcast_add(&loc)?)
    }

    fn name(&self) -> &'static str {
        "actnorm"
    }

    fn mark_initialized(&self) {
        self.initialized.set(true);
    }
}

// ---------------------------------------------------------------------------
// Moving batch norm
// ---------------------------------------------------------------------------

/// Batch normalization with running statistics
///
/// A training forward normalizes with the batch statistics and then updates
/// the running averages. A positive `lag` mixes the running statistics in,
/// keeping a `lag` share of the batch ones. Evaluation forwards and `reverse` use the running statistics
/// only, so `reverse` inverts an evaluation forward exactly. The running
/// statistics start at mean 0, variance 1 and are seeded from the first
/// training batch.
pub struct MovingBatchNorm {
    log_scale: Tensor,
    bias: Tensor,
    // kept in the store so checkpoints carry them; always used detached
    running_mean: Var,
    running_var: Var,
    lag: f64,
    initialized: Cell<bool>,
}

impl MovingBatchNorm {
    pub fn new(store: &mut ParamStore, prefix: &str, channels: usize, lag: f64) -> Result<Self> {
        if !(0.0..=1.0).contains(&lag) {
            return Err(FairFlowError::config(format!("bn_lag must be in [0, 1], got {lag}")));
        }
        let log_scale = store.var(&format!("{prefix}.log_scale"), &[channels], Init::Zeros)?;
        let bias = store.var(&format!("{prefix}.bias"), &[channels], Init::Zeros)?;
        store.var(&format!("{prefix}.running_mean"), &[channels], Init::Zeros)?;
        store.var(&format!("{prefix}.running_var"), &[channels], Init::Ones)?;
        Ok(Self {
            log_scale,
            bias,
            running_mean: fetch_var(store, &format!("{prefix}.running_mean"))?,
            running_var: fetch_var(store, &format!("{prefix}.running_var"))?,
            lag,
            initialized: Cell::new(false),
        })
    }

    pub fn running_stats(&self) -> Result<(Vec<f32>, Vec<f32>)> {
        Ok((
            self.running_mean.as_tensor().to_vec1::<f32>()?,
            self.running_var.as_tensor().to_vec1::<f32>()?,
        ))
    }

    /// Statistics used by a training forward; updates the running averages
    fn training_stats(&self, x: &Tensor) -> Result<(Tensor, Tensor)> {
        let (batch_mean, batch_var) = channel_moments(x)?;
        if !self.initialized.get() {
            self.running_mean.set(&batch_mean.detach())?;
            self.running_var.set(&batch_var.detach())?;
            self.initialized.set(true);
        }

        let running_mean = self.running_mean.as_tensor().detach();
        let running_var = self.running_var.as_tensor().detach();
        let blend = |batch: &Tensor, running: &Tensor| -> Result<Tensor> {
            if self.lag > 0.0 {
                Ok(batch.affine(self.lag, 0.0)?.add(&running.affine(1.0 - self.lag, 0.0)?)?)
            } else {
                Ok(batch.clone())
            }
        };
        let used = (blend(&batch_mean, &running_mean)?, blend(&batch_var, &running_var)?);

        let update = |running: &Tensor, batch: &Tensor| -> Result<Tensor> {
            Ok(running
                .affine(1.0 - BN_MOMENTUM, 0.0)?
                .add(&batch.detach().affine(BN_MOMENTUM, 0.0)?)?)
        };
        self.running_mean.set(&update(&running_mean, &batch_mean)?)?;
        self.running_var.set(&update(&running_var, &batch_var)?)?;
        Ok(used)
    }
}

impl InvertibleLayer for MovingBatchNorm {
    fn forward(&self, x: &Tensor, log_det: &Tensor, training: bool) -> Result<(Tensor, Tensor)> {
        let (mean, var) = if training {
            self.training_stats(x)?
        } else {
            (
                self.running_mean.as_tensor().detach(),
                self.running_var.as_tensor().detach(),
            )
        };
        // log of the per-channel gain
        let log_gain = var.affine(1.0, BN_EPS)?.log()?.affine(-0.5, 0.0)?.add(&self.log_scale)?;
        let y = x
            .broadcast_sub(&per_channel(&mean, x)?)?
            .broadcast_mul(&per_channel(&log_gain.exp()?, x)?)?
            .broadcast_add(&per_channel(&self.bias, x)?)?;
        let ld = log_gain.sum_all()?.affine(spatial_size(x) as f64, 0.0)?;
        Ok((y, log_det.broadcast_add(&ld)?))
    }

    fn reverse(&self, y: &Tensor) -> Result<Tensor> {
        let mean = self.running_mean.as_tensor().detach();
        let var = self.running_var.as_tensor().detach();
        let log_gain = var.affine(1.0, BN_EPS)?.log()?.affine(-0.5, 0.0)?.add(&self.log_scale)?;
        Ok(y
            .broadcast_sub(&per_channel(&self.bias, y)?)?
            .broadcast_mul(&per_channel(&log_gain.neg()?.exp()?, y)?)?
            .broadcast_add(&per_channel(&mean, y)?)?)
    }

    fn name(&self) -> &'static str {
        "batch_norm"
    }

    fn mark_initialized(&self) {
        self.initialized.set(true);
    }
}

// ---------------------------------------------------------------------------
// Permutation
// ---------------------------------------------------------------------------

/// Fixed channel permutation (volume preserving)
pub struct Permutation {
    forward_idx: Tensor,
    inverse_idx: Tensor,
}

impl Permutation {
    pub fn new<R: Rng>(channels: usize, kind: PermutationKind, rng: &mut R, store: &ParamStore) -> Result<Self> {
        let mut order: Vec<u32> = (0..channels as u32).collect();
        match kind {
            PermutationKind::Reverse => order.reverse(),
            PermutationKind::Random => order.shuffle(rng),
            PermutationKind::None => {}
            PermutationKind::InvConv1x1 => {
                return Err(FairFlowError::config(
                    "learned channel mixing is built by InvertibleConv1x1",
                ))
            }
        }
        let mut inverse = vec![0u32; channels];
        for (i, &o) in order.iter().enumerate() {
            inverse[o as usize] = i as u32;
        }
        Ok(Self {
            forward_idx: Tensor::from_vec(order, channels, store.device())?,
            inverse_idx: Tensor::from_vec(inverse, channels, store.device())?,
        })
    }
}

impl InvertibleLayer for Permutation {
    // index_select needs a contiguous input; coupling outputs are concatenations
    fn forward(&self, x: &Tensor, log_det: &Tensor, _training: bool) -> Result<(Tensor, Tensor)> {
        Ok((x.contiguous()?.index_select(&self.forward_idx, 1)?, log_det.clone()))
    }

    fn reverse(&self, y: &Tensor) -> Result<Tensor> {
        Ok(y.contiguous()?.index_select(&self.inverse_idx, 1)?)
    }

    fn name(&self) -> &'static str {
        "permutation"
    }
}

// ---------------------------------------------------------------------------
// Invertible 1x1 convolution
// ---------------------------------------------------------------------------

/// Learned channel mixing `y = W x` at every position
///
/// `W = P L (U + diag(sign * exp(log_s)))` with `P` a fixed permutation, `L`
/// unit lower triangular and `U` strictly upper triangular. The
/// log-determinant is `sum(log_s)` per position, and both triangular factors
/// are inverted with matrix products only, so gradients flow through `reverse`.
pub struct InvertibleConv1x1 {
    channels: usize,
    lower: Tensor,
    upper: Tensor,
    log_s: Tensor,
    sign: Tensor,
    perm: Tensor,
    lower_mask: Tensor,
    upper_mask: Tensor,
    eye: Tensor,
}

/// Random orthogonal `n x n` matrix, Gram-Schmidt over Gaussian columns
fn random_orthogonal<R: Rng>(n: usize, rng: &mut R) -> Vec<Vec<f64>> {
    let mut q: Vec<Vec<f64>> = (0..n)
        .map(|_| (0..n).map(|_| rng.sample::<f64, _>(StandardNormal)).collect())
        .collect();
    let col_dot = |q: &[Vec<f64>], a: usize, b: usize| (0..n).map(|r| q[r][a] * q[r][b]).sum::<f64>();
    for i in 0..n {
        for j in 0..i {
            let dot = col_dot(&q, i, j);
            for row in q.iter_mut() {
                row[i] -= dot * row[j];
            }
        }
        let norm = col_dot(&q, i, i).sqrt().max(1e-12);
        for row in q.iter_mut() {
            row[i] /= norm;
        }
    }
    q
}

/// `P A = L U` with partial pivoting; returns `(perm, L, U)` where row `i` of
/// `P A` is row `perm[i]` of `A`
fn lu_decompose(a: &[Vec<f64>]) -> Result<(Vec<usize>, Vec<Vec<f64>>, Vec<Vec<f64>>)> {
    let n = a.len();
    let mut u = a.to_vec();
    let mut l = vec![vec![0.0; n]; n];
    let mut perm: Vec<usize> = (0..n).collect();
    for k in 0..n {
        let pivot = (k..n)
            .max_by(|&i, &j| u[i][k].abs().total_cmp(&u[j][k].abs()))
            .unwrap_or(k);
        if u[pivot][k].abs() < 1e-12 {
            return Err(FairFlowError::shape("singular matrix in LU decomposition"));
        }
        u.swap(k, pivot);
        l.swap(k, pivot);
        perm.swap(k, pivot);
        for i in k + 1..n {
            let factor = u[i][k] / u[k][k];
            l[i][k] = factor;
            for j in k..n {
                u[i][j] -= factor * u[k][j];
            }
        }
    }
    for (i, row) in l.iter_mut().enumerate() {
        row[i] = 1.0;
    }
    Ok((perm, l, u))
}

fn matrix_tensor(n: usize, store: &ParamStore, entry: impl Fn(usize, usize) -> f64) -> Result<Tensor> {
    let data: Vec<f32> = (0..n * n).map(|k| entry(k / n, k % n) as f32).collect();
    Ok(Tensor::from_vec(data, (n, n), store.device())?)
}

/// `(I + N)^-1` for strictly triangular `N` of size `n`
///
/// `(I - N)(I + N^2)(I + N^4)...` telescopes to the inverse once the power
/// reaches `n`, since `N^n = 0`.
fn unipotent_inverse(nilpotent: &Tensor, eye: &Tensor, n: usize) -> Result<Tensor> {
    let mut inverse = eye.sub(nilpotent)?;
    let mut power = nilpotent.matmul(nilpotent)?;
    let mut order = 2;
    while order < n {
        inverse = inverse.matmul(&eye.add(&power)?)?;
        power = power.matmul(&power)?;
        order *= 2;
    }
    Ok(inverse)
}

/// Apply `w` along axis 1 of a `[B, C]` or `[B, C, H, W]` tensor
fn mix_channels(x: &Tensor, w: &Tensor) -> Result<Tensor> {
    let wt = w.t()?.contiguous()?;
    match x.rank() {
        2 => Ok(x.contiguous()?.matmul(&wt)?),
        4 => {
            let (b, c, h, width) = x.dims4()?;
            let flat = x.permute([0, 2, 3, 1])?.contiguous()?.reshape((b * h * width, c))?;
            Ok(flat
                .matmul(&wt)?
                .reshape((b, h, width, c))?
                .permute([0, 3, 1, 2])?
                .contiguous()?)
        }
        rank => Err(FairFlowError::shape(format!("cannot mix channels of a rank-{rank} tensor"))),
    }
}

impl InvertibleConv1x1 {
    /// Start from a random rotation drawn from `rng`
    pub fn new<R: Rng>(store: &mut ParamStore, prefix: &str, channels: usize, rng: &mut R) -> Result<Self> {
        let (perm, l, u) = lu_decompose(&random_orthogonal(channels, rng))?;
        let n = channels;

        let names = [
            format!("{prefix}.lower"),
            format!("{prefix}.upper"),
            format!("{prefix}.log_s"),
        ];
        let lower = store.var(&names[0], &[n, n], Init::Zeros)?;
        let upper = store.var(&names[1], &[n, n], Init::Zeros)?;
        let log_s = store.var(&names[2], &[n], Init::Zeros)?;
        store.set(&names[0], &matrix_tensor(n, store, |i, j| if j < i { l[i][j] } else { 0.0 })?)?;
        store.set(&names[1], &matrix_tensor(n, store, |i, j| if j > i { u[i][j] } else { 0.0 })?)?;
        let diag: Vec<f32> = (0..n).map(|i| u[i][i].abs().ln() as f32).collect();
        store.set(&names[2], &Tensor::from_vec(diag, n, store.device())?)?;
        let sign: Vec<f32> = (0..n).map(|i| if u[i][i] < 0.0 { -1.0 } else { 1.0 }).collect();

        Ok(Self {
            channels,
            lower,
            upper,
            log_s,
            sign: Tensor::from_vec(sign, n, store.device())?,
            // W = P^T L U, so P^T has a one at (perm[i], i)
            perm: matrix_tensor(n, store, |r, i| if perm[i] == r { 1.0 } else { 0.0 })?,
            lower_mask: matrix_tensor(n, store, |i, j| if j < i { 1.0 } else { 0.0 })?,
            upper_mask: matrix_tensor(n, store, |i, j| if j > i { 1.0 } else { 0.0 })?,
            eye: Tensor::eye(n, DType::F32, store.device())?,
        })
    }

    /// Current mixing matrix
    pub fn weight(&self) -> Result<Tensor> {
        let l = self.lower.mul(&self.lower_mask)?.add(&self.eye)?;
        let diag = self.sign.mul(&self.log_s.exp()?)?;
        let u = self
            .upper
            .mul(&self.upper_mask)?
            .add(&self.eye.broadcast_mul(&diag.reshape((1, self.channels))?)?)?;
        Ok(self.perm.matmul(&l)?.matmul(&u)?)
    }

    /// `W^-1 = U^-1 L^-1 P`
    pub fn inverse_weight(&self) -> Result<Tensor> {
        let c = self.channels;
        let l_inv = unipotent_inverse(&self.lower.mul(&self.lower_mask)?, &self.eye, c)?;
        // U = D (I + D^-1 U_strict), and 1 / (sign * e^s) = sign * e^-s
        let d_inv = self.sign.mul(&self.log_s.neg()?.exp()?)?;
        let scaled = self.upper.mul(&self.upper_mask)?.broadcast_mul(&d_inv.reshape((c, 1))?)?;
        let u_inv = unipotent_inverse(&scaled, &self.eye, c)?.broadcast_mul(&d_inv.reshape((1, c))?)?;
        Ok(u_inv.matmul(&l_inv)?.matmul(&self.perm.t()?.contiguous()?)?)
    }
}

impl InvertibleLayer for InvertibleConv1x1 {
    fn forward(&self, x: &Tensor, log_det: &Tensor, _training: bool) -> Result<(Tensor, Tensor)> {
        if x.dim(1)? != self.channels {
            return Err(FairFlowError::shape(format!(
                "1x1 convolution expects {} channels, got {}",
                self.channels,
                x.dim(1)?
            )));
        }
        let y = mix_channels(x, &self.weight()?)?;
        let ld = self.log_s.sum_all()?.affine(spatial_size(x) as f64, 0.0)?;
        Ok((y, log_det.broadcast_add(&ld)?))
    }

    fn reverse(&self, y: &Tensor) -> Result<Tensor> {
        mix_channels(y, &self.inverse_weight()?)
    }

    fn name(&self) -> &'static str {
        "inv_conv1x1"
    }
}

// ---------------------------------------------------------------------------
// Squeeze
// ---------------------------------------------------------------------------

/// `[B, C, H, W] -> [B, 4C, H/2, W/2]`
pub struct Squeeze;

impl InvertibleLayer for Squeeze {
    fn forward(&self, x: &Tensor, log_det: &Tensor, _training: bool) -> Result<(Tensor, Tensor)> {
        let (b, c, h, w) = x.dims4()?;
        if h % 2 != 0 || w % 2 != 0 {
            return Err(FairFlowError::shape(format!("cannot squeeze odd spatial size {h}x{w}")));
        }
        let y = x
            .reshape(vec![b, c, h / 2, 2, w / 2, 2])?
            .permute([0, 1, 3, 5, 2, 4])?
            .reshape((b, c * 4, h / 2, w / 2))?;
        Ok((y, log_det.clone()))
    }

    fn reverse(&self, y: &Tensor) -> Result<Tensor> {
        let (b, c4, h, w) = y.dims4()?;
        let c = c4 / 4;
        Ok(y
            .reshape(vec![b, c, 2, 2, h, w])?
            .permute([0, 1, 4, 2, 5, 3])?
            .reshape((b, c, h * 2, w * 2))?)
    }

    fn name(&self) -> &'static str {
        "squeeze"
    }
}

// ---------------------------------------------------------------------------
// Coupling
// ---------------------------------------------------------------------------

/// Affine (or additive) coupling layer
///
/// The input is split along axis 1 at `channels / 2`. One half conditions a
/// subnet whose output shifts, and for affine variants scales, the other.
pub struct AffineCoupling {
    net: CouplingNet,
    split: usize,
    channels: usize,
    swap: bool,
    scaling: Scaling,
}

impl AffineCoupling {
    /// Width of the half that is transformed
    pub fn target_width(channels: usize, swap: bool) -> usize {
        let split = channels / 2;
        if swap {
            split
        } else {
            channels - split
        }
    }

    /// Width of the conditioning half
    pub fn cond_width(channels: usize, swap: bool) -> usize {
        channels - Self::target_width(channels, swap)
    }

    /// Subnet output width for `scaling`
    pub fn net_out_width(channels: usize, swap: bool, scaling: Scaling) -> usize {
        let target = Self::target_width(channels, swap);
        match scaling {
            Scaling::Additive => target,
            Scaling::Exp | Scaling::Sigmoid | Scaling::SigmoidHalf => 2 * target,
        }
    }

    pub fn new(net: CouplingNet, channels: usize, swap: bool, scaling: Scaling) -> Result<Self> {
        if channels < 2 {
            return Err(FairFlowError::shape(format!(
                "coupling needs at least 2 channels, got {channels}"
            )));
        }
        Ok(Self {
            net,
            split: channels / 2,
            channels,
            swap,
            scaling,
        })
    }

    /// `(conditioning, target)` halves
    fn halves(&self, x: &Tensor) -> Result<(Tensor, Tensor)> {
        let first = x.narrow(1, 0, self.split)?;
        let second = x.narrow(1, self.split, self.channels - self.split)?;
        Ok(if self.swap { (second, first) } else { (first, second) })
    }

    fn join(&self, cond: &Tensor, target: &Tensor) -> Result<Tensor> {
        let parts = if self.swap { [target, cond] } else { [cond, target] };
        Ok(Tensor::cat(&parts, 1)?)
    }

    /// `(shift, log_scale)` for the target half; `log_scale` is `None` when additive
    fn params(&self, cond: &Tensor, width: usize) -> Result<(Tensor, Option<Tensor>)> {
        let h = self.net.forward(cond)?;
        match self.scaling {
            Scaling::Additive => Ok((h, None)),
            Scaling::Exp => {
                let shift = h.narrow(1, 0, width)?;
                let raw = h.narrow(1, width, width)?;
                let log_scale = raw
                    .affine(1.0 / LOG_SCALE_CLAMP, 0.0)?
                    .tanh()?
                    .affine(LOG_SCALE_CLAMP, 0.0)?;
                Ok((shift, Some(log_scale)))
            }
            Scaling::Sigmoid => {
                let shift = h.narrow(1, 0, width)?;
                let raw = h.narrow(1, width, width)?;
                // log(sigmoid(u)) = -softplus(-u)
                let log_scale = softplus(&raw.affine(-1.0, -2.0)?)?.neg()?;
                Ok((shift, Some(log_scale)))
            }
            Scaling::SigmoidHalf => {
                let shift = h.narrow(1, 0, width)?;
                let raw = h.narrow(1, width, width)?;
                // scale in (0.5, 1.5), exactly 1 at raw = 0
                let sigmoid = softplus(&raw.neg()?)?.neg()?.exp()?;
                Ok((shift, Some(sigmoid.affine(1.0, 0.5)?.log()?)))
            }
        }
    }
}

impl InvertibleLayer for AffineCoupling {
    fn forward(&self, x: &Tensor, log_det: &Tensor, _training: bool) -> Result<(Tensor, Tensor)> {
        if x.dim(1)? != self.channels {
            return Err(FairFlowError::shape(format!(
                "coupling expects {} channels, got {}",
                self.channels,
                x.dim(1)?
            )));
        }
        let (cond, target) = self.halves(x)?;
        let width = target.dim(1)?;
        let (shift, log_scale) = self.params(&cond, width)?;
        let (out, log_det) = match log_scale {
            None => (target.add(&shift)?, log_det.clone()),
            Some(log_scale) => {
                let out = target.mul(&log_scale.exp()?)?.add(&shift)?;
                (out, log_det.add(&sum_per_sample(&log_scale)?)?)
            }
        };
        Ok((self.join(&cond, &out)?, log_det))
    }

    fn reverse(&self, y: &Tensor) -> Result<Tensor> {
        let (cond, out) = self.halves(y)?;
        let width = out.dim(1)?;
        let (shift, log_scale) = self.params(&cond, width)?;
        let target = match log_scale {
            None => out.sub(&shift)?,
            Some(log_scale) => out.sub(&shift)?.mul(&log_scale.neg()?.exp()?)?,
        };
        self.join(&cond, &target)
    }

    fn name(&self) -> &'static str {
        "coupling"
    }
}

/// Zero log-determinant accumulator for a batch
pub fn zero_log_det(x: &Tensor) -> Result<Tensor> {
    Ok(Tensor::zeros(x.dim(0)?, DType::F32, x.device())?)
}
