//! CSV reader for tabular triplets
//!
//! One row per sample with a header. The sensitive and task label columns
//! are picked by name; every other column is a numeric feature.

use std::path::Path;

use ndarray::{Array1, Array2};
use tracing::info;

use super::loader::TripletDataset;
use super::preprocessing::{normalize_features, NormalizationParams};
use crate::error::{FairFlowError, Result};

/// Dataset read from CSV plus the feature normalization that was applied
#[derive(Debug, Clone)]
pub struct TabularData {
    pub dataset: TripletDataset,
    pub feature_names: Vec<String>,
    pub normalization: Option<NormalizationParams>,
}

fn parse_label(value: &str, column: &str, row: usize) -> Result<u32> {
    let parsed: f64 = value.trim().parse().map_err(|_| {
        FairFlowError::config(format!("row {row}: label `{column}` is not numeric: {value:?}"))
    })?;
    if parsed < 0.0 || parsed.fract() != 0.0 {
        return Err(FairFlowError::config(format!(
            "row {row}: label `{column}` must be a non-negative integer, got {parsed}"
        )));
    }
    Ok(parsed as u32)
}

/// Read `(x, s, y)` triplets from a CSV file
pub fn load_csv_triplets<P: AsRef<Path>>(
    path: P,
    s_column: &str,
    y_column: &str,
    normalize: bool,
) -> Result<TabularData> {
    let path = path.as_ref();
    let mut reader = csv::Reader::from_path(path)?;
    let headers = reader.headers()?.clone();

    let find = |name: &str| {
        headers
            .iter()
            .position(|h| h.trim() == name)
            .ok_or_else(|| FairFlowError::config(format!("column `{name}` not found in {}", path.display())))
    };
    let s_idx = find(s_column)?;
    let y_idx = find(y_column)?;
    let feature_idx: Vec<usize> = (0..headers.len()).filter(|&i| i != s_idx && i != y_idx).collect();
    if feature_idx.is_empty() {
        return Err(FairFlowError::config("CSV has no feature columns"));
    }

    let mut features = Vec::new();
    let mut s = Vec::new();
    let mut y = Vec::new();
    for (row, record) in reader.records().enumerate() {
        let record = record?;
        s.push(parse_label(&record[s_idx], s_column, row)?);
        y.push(parse_label(&record[y_idx], y_column, row)?);
        for &i in &feature_idx {
            let value: f32 = record[i].trim().parse().map_err(|_| {
                FairFlowError::config(format!("row {row}: feature `{}` is not numeric", &headers[i]))
            })?;
            features.push(value);
        }
    }

    let n = s.len();
    let x = Array2::from_shape_vec((n, feature_idx.len()), features)
        .map_err(|e| FairFlowError::shape(e.to_string()))?;
    let (x, normalization) = if normalize {
        let (x, params) = normalize_features(&x);
        (x, Some(params))
    } else {
        (x, None)
    };

    info!("Loaded {} samples with {} features from {}", n, feature_idx.len(), path.display());
    Ok(TabularData {
        dataset: TripletDataset::new(x.into_dyn(), Array1::from_vec(s), Array1::from_vec(y))?,
        feature_names: feature_idx.iter().map(|&i| headers[i].to_string()).collect(),
        normalization,
    })
}
