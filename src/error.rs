//! Error types for the fairflow library

use thiserror::Error;

/// Result type alias for this crate
pub type Result<T> = std::result::Result<T, FairFlowError>;

/// Main error type for the library
#[derive(Error, Debug)]
pub enum FairFlowError {
    /// Rejected configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Tensor or latent shape inconsistency
    #[error("Shape mismatch: {0}")]
    Shape(String),

    /// Checkpoint was written with different hyperparameters
    #[error("Checkpoint mismatch on `{field}`: checkpoint has {stored}, config has {current}")]
    CheckpointMismatch {
        field: String,
        stored: String,
        current: String,
    },

    /// NaN or infinite training loss
    #[error("Non-finite loss at iteration {itr}: {detail}")]
    NonFiniteLoss { itr: usize, detail: String },

    /// Tensor backend error
    #[error("Tensor error: {0}")]
    Candle(#[from] candle_core::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error (bincode, JSON, TOML)
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// CSV reading/writing error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl FairFlowError {
    /// Shorthand for a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Shorthand for a shape error
    pub fn shape(msg: impl Into<String>) -> Self {
        Self::Shape(msg.into())
    }
}

impl From<serde_json::Error> for FairFlowError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<bincode::Error> for FairFlowError {
    fn from(e: bincode::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for FairFlowError {
    fn from(e: toml::de::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<toml::ser::Error> for FairFlowError {
    fn from(e: toml::ser::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
