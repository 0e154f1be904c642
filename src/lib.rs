//! A compact library for mean-field variational inference on `burn` autodiff backends.
//!
//! - [`distributions`]: Normal log-densities, closed-form KL and the softplus transform.
//! - [`model`]: the [`model::VariationalTarget`] trait and the Normal-Normal model.
//! - [`guide`]: the mean-field Normal variational family.
//! - [`inference`]: the MFVI driver with its configuration and gradient estimators.

pub mod distributions;
pub mod error;
pub mod guide;
pub mod inference;
pub mod model;
