//! Error types for the pose estimator
//!
//! Statistical rejection of an observation is not an error and never shows up here; it is
//! reported through [`crate::filter::CorrectionOutcome`]. The variants below are numerical or
//! configuration failures that the caller must decide how to handle (skip the cycle or abort).

use thiserror::Error;

/// Filter error type
#[derive(Error, Debug)]
pub enum FilterError {
    #[error("filter used before init() established an initial belief")]
    Uninitialized,

    #[error("singular matrix while computing {context}")]
    SingularMatrix { context: &'static str },

    #[error("invalid {name}: {reason}")]
    InvalidCovariance { name: &'static str, reason: String },

    #[error("invalid time step: {0} s")]
    InvalidTimeStep(f64),

    #[error("non-finite values in {name}")]
    NonFinite { name: &'static str },

    #[error("{name} has {found} elements, expected {expected}")]
    DimensionMismatch {
        name: &'static str,
        expected: String,
        found: usize,
    },

    #[error("kalman engine step out of order: expected {expected}, found {found}")]
    OutOfOrder {
        expected: &'static str,
        found: &'static str,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl From<serde_json::Error> for FilterError {
    fn from(e: serde_json::Error) -> Self {
        FilterError::Config(e.to_string())
    }
}

impl From<serde_yaml::Error> for FilterError {
    fn from(e: serde_yaml::Error) -> Self {
        FilterError::Config(e.to_string())
    }
}

impl From<toml::de::Error> for FilterError {
    fn from(e: toml::de::Error) -> Self {
        FilterError::Config(e.to_string())
    }
}

impl From<toml::ser::Error> for FilterError {
    fn from(e: toml::ser::Error) -> Self {
        FilterError::Config(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, FilterError>;
