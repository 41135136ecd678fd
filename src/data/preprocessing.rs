//! Feature preprocessing for tabular data
//!
//! Z-score normalization per feature column, with the fitted statistics
//! kept so samples drawn from the flow can be mapped back.

use std::path::Path;

use ndarray::{Array2, Axis};
use serde::{Deserialize, Serialize};

use crate::error::{FairFlowError, Result};

/// Normalization parameters for denormalization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizationParams {
    pub means: Vec<f32>,
    pub stds: Vec<f32>,
}

impl NormalizationParams {
    pub fn num_features(&self) -> usize {
        self.means.len()
    }

    /// Save as `norm_params.json`-style JSON
    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let params: Self = serde_json::from_str(&std::fs::read_to_string(path)?)?;
        if params.means.len() != params.stds.len() {
            return Err(FairFlowError::shape(format!(
                "normalization has {} means but {} stds",
                params.means.len(),
                params.stds.len()
            )));
        }
        Ok(params)
    }
}

/// Normalize each column to zero mean and unit variance
///
/// Constant columns keep a std of 1 so they map to 0.
///
/// # Arguments
///
/// * `data` - 2D array of shape (num_samples, num_features)
///
/// # Returns
///
/// Tuple of (normalized data, normalization parameters)
pub fn normalize_features(data: &Array2<f32>) -> (Array2<f32>, NormalizationParams) {
    let n = data.nrows().max(1) as f32;
    let mut means = Vec::with_capacity(data.ncols());
    let mut stds = Vec::with_capacity(data.ncols());

    for column in data.axis_iter(Axis(1)) {
        let mean = column.sum() / n;
        let var = column.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n;
        let std = var.sqrt();
        means.push(mean);
        stds.push(if std > 1e-8 { std } else { 1.0 });
    }

    let mut normalized = data.clone();
    for (col, mut column) in normalized.axis_iter_mut(Axis(1)).enumerate() {
        column.mapv_inplace(|v| (v - means[col]) / stds[col]);
    }

    (normalized, NormalizationParams { means, stds })
}

/// Map normalized data back to the original scale
pub fn denormalize_features(data: &Array2<f32>, params: &NormalizationParams) -> Result<Array2<f32>> {
    if data.ncols() != params.num_features() {
        return Err(FairFlowError::shape(format!(
            "data has {} features, normalization has {}",
            data.ncols(),
            params.num_features()
        )));
    }
    let mut restored = data.clone();
    for (col, mut column) in restored.axis_iter_mut(Axis(1)).enumerate() {
        let (mean, std) = (params.means[col], params.stds[col]);
        column.mapv_inplace(|v| v * std + mean);
    }
    Ok(restored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_normalize_features() {
        let data = array![[1.0f32, 10.0, 5.0], [3.0, 20.0, 5.0], [5.0, 30.0, 5.0]];
        let (normalized, params) = normalize_features(&data);

        for col in 0..2 {
            let column = normalized.column(col);
            assert_abs_diff_eq!(column.sum() / 3.0, 0.0, epsilon = 1e-6);
        }
        // constant column
        assert!(normalized.column(2).iter().all(|v| *v == 0.0));
        assert_eq!(params.stds[2], 1.0);

        let restored = denormalize_features(&normalized, &params).unwrap();
        for (a, b) in restored.iter().zip(data.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-4);
        }
        assert!(denormalize_features(&array![[1.0f32, 2.0]], &params).is_err());
    }

    #[test]
    fn test_normalization_params_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("norm_params.json");
        let params = NormalizationParams {
            means: vec![1.0, -2.5],
            stds: vec![0.5, 3.0],
        };
        params.save_json(&path).unwrap();
        assert_eq!(NormalizationParams::load_json(&path).unwrap(), params);

        std::fs::write(&path, r#"{"means": [1.0], "stds": []}"#).unwrap();
        assert!(NormalizationParams::load_json(&path).is_err());
    }
}
