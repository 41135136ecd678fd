//! Synthetic datasets with known structure

use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

use super::loader::TripletDataset;
use crate::error::{FairFlowError, Result};

fn normal(std: f64) -> Result<Normal<f64>> {
    Normal::new(0.0, std).map_err(|e| FairFlowError::config(format!("invalid noise std: {e}")))
}

/// `x = (s + noise, y + noise)` with independent fair-coin labels `s` and `y`
///
/// The first feature carries the sensitive attribute, the second the task label.
pub fn independent_attributes(n: usize, noise: f64, seed: u64) -> Result<TripletDataset> {
    let mut rng = StdRng::seed_from_u64(seed);
    let noise = normal(noise)?;
    let mut x = Array2::<f32>::zeros((n, 2));
    let mut s = Array1::<u32>::zeros(n);
    let mut y = Array1::<u32>::zeros(n);

    for i in 0..n {
        s[i] = rng.gen_bool(0.5) as u32;
        y[i] = rng.gen_bool(0.5) as u32;
        x[[i, 0]] = (s[i] as f64 + noise.sample(&mut rng)) as f32;
        x[[i, 1]] = (y[i] as f64 + noise.sample(&mut rng)) as f32;
    }
    TripletDataset::new(x.into_dyn(), s, y)
}

/// Isotropic Gaussian mixture in `centers[0].len()` dimensions
///
/// `s` is the component index and `y` is always 0.
pub fn gaussian_mixture(n: usize, centers: &[Vec<f32>], std: f64, seed: u64) -> Result<TripletDataset> {
    let dim = centers
        .first()
        .map(Vec::len)
        .ok_or_else(|| FairFlowError::config("gaussian mixture needs at least one center"))?;
    if centers.iter().any(|c| c.len() != dim) {
        return Err(FairFlowError::shape("mixture centers differ in dimension"));
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let noise = normal(std)?;
    let mut x = Array2::<f32>::zeros((n, dim));
    let mut s = Array1::<u32>::zeros(n);

    for i in 0..n {
        let component = rng.gen_range(0..centers.len());
        s[i] = component as u32;
        for j in 0..dim {
            x[[i, j]] = centers[component][j] + noise.sample(&mut rng) as f32;
        }
    }
    TripletDataset::new(x.into_dyn(), s, Array1::zeros(n))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_independent_attributes() {
        let data = independent_attributes(400, 0.1, 3).unwrap();
        assert_eq!(data.len(), 400);
        assert_eq!(data.sample_shape(), vec![2]);

        let ones = data.s().iter().filter(|&&v| v == 1).count();
        assert!((150..250).contains(&ones));

        // the first feature tracks s
        for (row, &label) in data.x().outer_iter().zip(data.s().iter()) {
            assert!((row[0] - label as f32).abs() < 0.6);
        }
    }

    #[test]
    fn test_gaussian_mixture() {
        let centers = vec![vec![-2.0, 0.0], vec![2.0, 0.0]];
        let data = gaussian_mixture(100, &centers, 0.1, 1).unwrap();
        assert_eq!(data.sample_shape(), vec![2]);
        assert!(data.s().iter().all(|&c| c < 2));
        assert!(gaussian_mixture(10, &[], 0.1, 1).is_err());
    }
}
