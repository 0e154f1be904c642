//! Error types for model construction and variational inference.

use thiserror::Error;

/// Errors raised while building a model or fitting a variational approximation.
#[derive(Debug, Error)]
pub enum VariationalError {
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Model has no observed data bound")]
    MissingData,

    #[error("Expected {expected} observations, got {actual}")]
    ObservationCount { expected: usize, actual: usize },

    #[error("Unknown gradient estimator `{0}` (expected reparam-kl, reparam or score)")]
    UnknownEstimator(String),

    #[error("Tensor data conversion failed: {0}")]
    TensorData(String),

    #[error("Loss is not finite at iteration {iteration}: {loss}")]
    NonFiniteLoss { iteration: usize, loss: f64 },

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, VariationalError>;
