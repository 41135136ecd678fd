//! Latent partitioning
//!
//! The flat latent is laid out as `[zn | zy | zs]`. Boundaries are computed
//! once from the configured fractions and never change afterwards.

use std::ops::Range;

use candle_core::{Device, Tensor};

use crate::error::{FairFlowError, Result};

/// Segments of one latent batch
#[derive(Debug, Clone)]
pub struct LatentSplit {
    /// Nuisance segment; `None` when it has zero width
    pub zn: Option<Tensor>,
    /// Fair segment
    pub zy: Tensor,
    /// Sensitive segment
    pub zs: Tensor,
}

/// Fixed index boundaries of the latent segments
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatentPartition {
    zn_dim: usize,
    zy_dim: usize,
    zs_dim: usize,
}

impl LatentPartition {
    /// Derive segment widths from fractions of a `total`-wide latent
    ///
    /// `zs_dim = round(zs_frac * total)`, `zy_dim = round(zy_frac * total)`
    /// (trimmed if rounding overshoots), the rest is nuisance.
    pub fn from_fractions(total: usize, zs_frac: f64, zy_frac: f64) -> Result<Self> {
        for (name, frac) in [("zs_frac", zs_frac), ("zy_frac", zy_frac)] {
            if !(0.0..=1.0).contains(&frac) {
                return Err(FairFlowError::config(format!("{name} must be in [0, 1], got {frac}")));
            }
        }
        if zs_frac + zy_frac > 1.0 + 1e-9 {
            return Err(FairFlowError::config(format!(
                "zs_frac + zy_frac must be <= 1, got {}",
                zs_frac + zy_frac
            )));
        }

        let zs_dim = (zs_frac * total as f64).round() as usize;
        let zy_dim = ((zy_frac * total as f64).round() as usize).min(total.saturating_sub(zs_dim));
        if zs_dim == 0 || zy_dim == 0 {
            return Err(FairFlowError::shape(format!(
                "latent of width {total} leaves an empty segment (zy={zy_dim}, zs={zs_dim}); \
                 adjust zs_frac/zy_frac"
            )));
        }
        Ok(Self {
            zn_dim: total - zs_dim - zy_dim,
            zy_dim,
            zs_dim,
        })
    }

    pub fn total(&self) -> usize {
        self.zn_dim + self.zy_dim + self.zs_dim
    }

    pub fn zn_dim(&self) -> usize {
        self.zn_dim
    }

    pub fn zy_dim(&self) -> usize {
        self.zy_dim
    }

    pub fn zs_dim(&self) -> usize {
        self.zs_dim
    }

    pub fn zy_range(&self) -> Range<usize> {
        self.zn_dim..self.zn_dim + self.zy_dim
    }

    pub fn zs_range(&self) -> Range<usize> {
        let start = self.zn_dim + self.zy_dim;
        start..start + self.zs_dim
    }

    fn check_width(&self, z: &Tensor) -> Result<()> {
        let (_, width) = z.dims2()?;
        if width != self.total() {
            return Err(FairFlowError::shape(format!(
                "latent width {width} does not match partition width {}",
                self.total()
            )));
        }
        Ok(())
    }

    /// Slice `z` into its segments
    pub fn split(&self, z: &Tensor) -> Result<LatentSplit> {
        self.check_width(z)?;
        let zn = if self.zn_dim > 0 {
            Some(z.narrow(1, 0, self.zn_dim)?)
        } else {
            None
        };
        Ok(LatentSplit {
            zn,
            zy: z.narrow(1, self.zn_dim, self.zy_dim)?,
            zs: z.narrow(1, self.zn_dim + self.zy_dim, self.zs_dim)?,
        })
    }

    /// Inverse of [`split`](Self::split)
    pub fn assemble(&self, split: &LatentSplit) -> Result<Tensor> {
        let mut parts = Vec::with_capacity(3);
        match (&split.zn, self.zn_dim) {
            (Some(zn), n) if n > 0 => parts.push(zn.clone()),
            (None, 0) => {}
            _ => return Err(FairFlowError::shape("nuisance segment does not match the partition")),
        }
        if split.zy.dim(1)? != self.zy_dim || split.zs.dim(1)? != self.zs_dim {
            return Err(FairFlowError::shape(format!(
                "segments [{}, {}] do not match partition [{}, {}]",
                split.zy.dim(1)?,
                split.zs.dim(1)?,
                self.zy_dim,
                self.zs_dim
            )));
        }
        parts.push(split.zy.clone());
        parts.push(split.zs.clone());
        Ok(Tensor::cat(&parts, 1)?)
    }

    /// `[1, D]` mask with ones over `range`
    fn mask(&self, range: Range<usize>, device: &Device) -> Result<Tensor> {
        let data: Vec<f32> = (0..self.total())
            .map(|i| if range.contains(&i) { 1.0 } else { 0.0 })
            .collect();
        Ok(Tensor::from_vec(data, (1, self.total()), device)?)
    }

    /// Full-width latent with every segment except zy zeroed
    pub fn zero_except_fair(&self, z: &Tensor) -> Result<Tensor> {
        self.check_width(z)?;
        Ok(z.broadcast_mul(&self.mask(self.zy_range(), z.device())?)?)
    }

    /// Full-width latent with every segment except zs zeroed
    pub fn zero_except_sensitive(&self, z: &Tensor) -> Result<Tensor> {
        self.check_width(z)?;
        Ok(z.broadcast_mul(&self.mask(self.zs_range(), z.device())?)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn latent_rows(width: usize) -> Tensor {
        let data: Vec<f32> = (0..3 * width).map(|i| i as f32 * 0.37 - 4.0).collect();
        Tensor::from_vec(data, (3, width), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_assemble_inverts_split_exactly() {
        for (total, zs, zy) in [(2, 0.5, 0.5), (10, 0.2, 0.8), (10, 0.2, 0.5), (7, 0.3, 0.3), (50, 0.02, 0.98)] {
            let partition = LatentPartition::from_fractions(total, zs, zy).unwrap();
            assert_eq!(partition.total(), total);
            let z = latent_rows(total);
            let back = partition.assemble(&partition.split(&z).unwrap()).unwrap();
            assert_eq!(z.to_vec2::<f32>().unwrap(), back.to_vec2::<f32>().unwrap());
        }
    }

    #[test]
    fn test_segment_sizes() {
        let p = LatentPartition::from_fractions(10, 0.2, 0.5).unwrap();
        assert_eq!((p.zn_dim(), p.zy_dim(), p.zs_dim()), (3, 5, 2));
        assert_eq!(p.zy_range(), 3..8);
        assert_eq!(p.zs_range(), 8..10);

        // rounding overshoot is taken from zy
        let p = LatentPartition::from_fractions(3, 0.5, 0.5).unwrap();
        assert_eq!((p.zn_dim(), p.zy_dim(), p.zs_dim()), (0, 1, 2));
    }

    #[test]
    fn test_invalid_fractions() {
        assert!(LatentPartition::from_fractions(10, -0.1, 0.5).is_err());
        assert!(LatentPartition::from_fractions(10, 0.6, 0.6).is_err());
        // 0.02 of 4 rounds to an empty zs segment
        assert!(LatentPartition::from_fractions(4, 0.02, 0.98).is_err());
    }

    #[test]
    fn test_split_without_nuisance() {
        let p = LatentPartition::from_fractions(4, 0.25, 0.75).unwrap();
        let split = p.split(&latent_rows(4)).unwrap();
        assert!(split.zn.is_none());
        assert_eq!(split.zy.dims(), &[3, 3]);
        assert_eq!(split.zs.dims(), &[3, 1]);
        assert!(p.split(&latent_rows(5)).is_err());
    }

    #[test]
    fn test_masks_cover_their_segment() {
        let p = LatentPartition::from_fractions(6, 0.5, 0.5).unwrap();
        let z = Tensor::ones((2, 6), candle_core::DType::F32, &Device::Cpu).unwrap();
        let fair = p.zero_except_fair(&z).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(fair[0], vec![1.0, 1.0, 1.0, 0.0, 0.0, 0.0]);
        let sensitive = p.zero_except_sensitive(&z).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(sensitive[1], vec![0.0, 0.0, 0.0, 1.0, 1.0, 1.0]);
    }
}
