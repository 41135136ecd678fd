//! Data module for `(x, s, y)` triplets
//!
//! This module provides:
//! - In-memory triplet datasets and a seeded DataLoader
//! - A CSV reader for tabular data
//! - Feature normalization
//! - Synthetic datasets with known structure

mod loader;
mod preprocessing;
mod tabular;
pub mod synthetic;

pub use loader::{Batch, DataLoader, TripletDataset};
pub use preprocessing::{denormalize_features, normalize_features, NormalizationParams};
pub use tabular::{load_csv_triplets, TabularData};
