//! Generative models that can be fitted with variational inference.
//!
//! A model exposes its log-likelihood and log-prior for a batch of latent draws through
//! [`VariationalTarget`]. [`NormalNormal`] is the conjugate Normal-Normal model with known
//! observation noise: a scalar latent mean `mu ~ N(mu_0, sigma_0)` and observations
//! `x_i ~ N(mu, sigma)`, `i = 1..n`.

use crate::distributions::{Normal, LN_SQRT_2PI};
use crate::error::{Result, VariationalError};
use burn::prelude::*;
use rand::Rng;

/// A batched model trait for variational inference.
///
/// Latent draws are passed as a tensor of shape `[n_samples, latent_dim]`; each method returns
/// a tensor of shape `[n_samples]`.
pub trait VariationalTarget<B: Backend> {
    /// Number of latent variables.
    fn latent_dim(&self) -> usize;

    /// `log p(x | z)` of the bound data for each latent draw.
    fn log_likelihood_batch(&self, z: &Tensor<B, 2>) -> Tensor<B, 1>;

    /// `log p(z)` for each latent draw.
    fn log_prior_batch(&self, z: &Tensor<B, 2>) -> Tensor<B, 1>;

    /// The prior shared by every latent coordinate, if it is Normal.
    ///
    /// When available, the KL term of the ELBO can be computed in closed form.
    fn normal_prior(&self) -> Option<Normal> {
        None
    }

    /// Checks that the model is ready for inference (e.g. that data is bound).
    fn validate(&self) -> Result<()> {
        Ok(())
    }
}

/// Normal-Normal model with known observation scale.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalNormal {
    prior: Normal,
    obs_scale: f64,
    n_obs: usize,
    observed: Option<Vec<f64>>,
    stats: Option<SufficientStats>,
}

/// Sample mean and sum of squared deviations of the bound data. The Normal likelihood depends
/// on the data only through these.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SufficientStats {
    pub mean: f64,
    pub sum_sq_dev: f64,
}

impl SufficientStats {
    fn from_data(data: &[f64]) -> Self {
        let n = data.len() as f64;
        let mean = data.iter().sum::<f64>() / n;
        let sum_sq_dev = data.iter().map(|x| (x - mean).powi(2)).sum();
        Self { mean, sum_sq_dev }
    }
}

impl NormalNormal {
    /// Creates the model with prior `prior` on the mean and `n_obs` observations of scale
    /// `obs_scale`. No data is bound yet.
    pub fn new(prior: Normal, obs_scale: f64, n_obs: usize) -> Result<Self> {
        if !(obs_scale.is_finite() && obs_scale > 0.0) {
            return Err(VariationalError::InvalidParameter(format!(
                "observation scale must be positive and finite, got {obs_scale}"
            )));
        }
        if n_obs == 0 {
            return Err(VariationalError::InvalidParameter(
                "the model needs at least one observation".to_string(),
            ));
        }
        Ok(Self {
            prior,
            obs_scale,
            n_obs,
            observed: None,
            stats: None,
        })
    }

    /// Binds observed data to the model.
    pub fn observe(mut self, data: Vec<f64>) -> Result<Self> {
        if data.len() != self.n_obs {
            return Err(VariationalError::ObservationCount {
                expected: self.n_obs,
                actual: data.len(),
            });
        }
        if let Some(x) = data.iter().find(|x| !x.is_finite()) {
            return Err(VariationalError::InvalidParameter(format!(
                "observations must be finite, got {x}"
            )));
        }
        self.stats = Some(SufficientStats::from_data(&data));
        self.observed = Some(data);
        Ok(self)
    }

    /// Draws `(mu, x)` from the generative model.
    pub fn simulate<R: Rng + ?Sized>(&self, rng: &mut R) -> (f64, Vec<f64>) {
        let mu = self.prior.sample(rng);
        let likelihood = Normal {
            loc: mu,
            scale: self.obs_scale,
        };
        let x = (0..self.n_obs).map(|_| likelihood.sample(rng)).collect();
        (mu, x)
    }

    /// Closed-form posterior of `mu` given the bound data.
    pub fn posterior(&self) -> Result<Normal> {
        let data = self.observed.as_ref().ok_or(VariationalError::MissingData)?;
        let prior_precision = 1.0 / self.prior.variance();
        let obs_precision = 1.0 / (self.obs_scale * self.obs_scale);
        let precision = prior_precision + self.n_obs as f64 * obs_precision;
        let sum: f64 = data.iter().sum();
        let loc = (self.prior.loc * prior_precision + sum * obs_precision) / precision;
        Normal::new(loc, precision.recip().sqrt())
    }

    pub fn prior(&self) -> Normal {
        self.prior
    }

    pub fn obs_scale(&self) -> f64 {
        self.obs_scale
    }

    pub fn n_obs(&self) -> usize {
        self.n_obs
    }

    pub fn observed(&self) -> Option<&[f64]> {
        self.observed.as_deref()
    }

    pub fn sufficient_stats(&self) -> Option<SufficientStats> {
        self.stats
    }
}

impl<B: Backend> VariationalTarget<B> for NormalNormal {
    fn latent_dim(&self) -> usize {
        1
    }

    /// `sum_i log N(x_i | z, sigma)`, evaluated from the cached statistics as
    /// `-(S + n (z - mean)^2) / (2 sigma^2) - n ln(sigma sqrt(2 pi))`.
    fn log_likelihood_batch(&self, z: &Tensor<B, 2>) -> Tensor<B, 1> {
        let stats = self.stats.unwrap_or(SufficientStats {
            mean: 0.0,
            sum_sq_dev: 0.0,
        });
        let n = self.n_obs as f64;
        let variance = self.obs_scale * self.obs_scale;

        z.clone()
            .sub_scalar(stats.mean)
            .powi_scalar(2)
            .mul_scalar(n)
            .add_scalar(stats.sum_sq_dev)
            .mul_scalar(-0.5 / variance)
            .sub_scalar(n * (self.obs_scale.ln() + LN_SQRT_2PI))
            .sum_dim(1)
            .squeeze(1)
    }

    fn log_prior_batch(&self, z: &Tensor<B, 2>) -> Tensor<B, 1> {
        self.prior.log_prob_tensor(z.clone()).sum_dim(1).squeeze(1)
    }

    fn normal_prior(&self) -> Option<Normal> {
        Some(self.prior)
    }

    fn validate(&self) -> Result<()> {
        match &self.stats {
            Some(_) => Ok(()),
            None => Err(VariationalError::MissingData),
        }
    }
}
