//! Mean-field Normal variational family.
//!
//! Each latent coordinate gets an independent Normal with a free location and a scale
//! parameterized as `softplus(raw_scale)`, which keeps it strictly positive while the optimizer
//! works on an unconstrained value. The guide is a `burn` [`Module`], so its parameters are
//! updated directly by `burn` optimizers.

use crate::distributions::{
    inverse_softplus, normal_kl, normal_log_density, softplus, Normal, LN_SQRT_2PI,
};
use crate::error::{Result, VariationalError};
use burn::module::Param;
use burn::prelude::*;
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

/// Fully factorized Normal approximation `q(z) = prod_d N(z_d | loc_d, softplus(raw_scale_d))`.
#[derive(Module, Debug)]
pub struct NormalGuide<B: Backend> {
    /// Location of each coordinate.
    pub loc: Param<Tensor<B, 1>>,
    /// Unconstrained scale; the actual scale is `softplus(raw_scale)`.
    pub raw_scale: Param<Tensor<B, 1>>,
}

impl<B: Backend> NormalGuide<B> {
    /// Initializes both parameters with independent standard Normal draws.
    pub fn init<R: Rng + ?Sized>(dim: usize, rng: &mut R, device: &B::Device) -> Self {
        let loc: Vec<f64> = (0..dim).map(|_| StandardNormal.sample(rng)).collect();
        let raw_scale: Vec<f64> = (0..dim).map(|_| StandardNormal.sample(rng)).collect();
        Self {
            loc: param(loc, device),
            raw_scale: param(raw_scale, device),
        }
    }

    /// Builds a guide with the given per-coordinate location and (positive) scale.
    pub fn from_values(loc: &[f64], scale: &[f64], device: &B::Device) -> Result<Self> {
        if loc.len() != scale.len() {
            return Err(VariationalError::InvalidParameter(format!(
                "guide has {} locations but {} scales",
                loc.len(),
                scale.len()
            )));
        }
        let raw_scale = scale
            .iter()
            .map(|s| inverse_softplus(*s))
            .collect::<Result<Vec<f64>>>()?;
        Ok(Self {
            loc: param(loc.to_vec(), device),
            raw_scale: param(raw_scale, device),
        })
    }

    pub fn dim(&self) -> usize {
        self.loc.val().dims()[0]
    }

    pub fn scale(&self) -> Tensor<B, 1> {
        softplus(self.raw_scale.val())
    }

    /// Reparameterized draws `loc + scale * eps` for standard Normal noise `eps` of shape
    /// `[n_samples, dim]`.
    pub fn sample(&self, eps: Tensor<B, 2>) -> Tensor<B, 2> {
        let [n_samples, dim] = eps.dims();
        let loc = self.loc.val().unsqueeze_dim::<2>(0).expand([n_samples, dim]);
        let scale = self.scale().unsqueeze_dim::<2>(0).expand([n_samples, dim]);
        loc.add(scale.mul(eps))
    }

    /// `log q(z)` for each row of `z`.
    pub fn log_prob_batch(&self, z: &Tensor<B, 2>) -> Tensor<B, 1> {
        let [n_samples, dim] = z.dims();
        let loc = self.loc.val().unsqueeze_dim::<2>(0).expand([n_samples, dim]);
        let scale = self.scale().unsqueeze_dim::<2>(0).expand([n_samples, dim]);
        normal_log_density(z.clone(), loc, scale).sum_dim(1).squeeze(1)
    }

    /// Differential entropy of `q`, as a one-element tensor.
    pub fn entropy(&self) -> Tensor<B, 1> {
        self.scale().log().add_scalar(0.5 + LN_SQRT_2PI).sum()
    }

    /// `KL(q || prior)` summed over coordinates, as a one-element tensor.
    pub fn kl_to(&self, prior: &Normal) -> Tensor<B, 1> {
        normal_kl(self.loc.val(), self.scale(), prior).sum()
    }

    pub fn mean(&self) -> Result<Vec<f64>> {
        tensor_to_vec(self.loc.val())
    }

    pub fn stddev(&self) -> Result<Vec<f64>> {
        tensor_to_vec(self.scale())
    }

    /// The fitted marginal of each coordinate.
    pub fn to_normals(&self) -> Result<Vec<Normal>> {
        self.mean()?
            .into_iter()
            .zip(self.stddev()?)
            .map(|(loc, scale)| Normal::new(loc, scale))
            .collect()
    }
}

fn param<B: Backend>(values: Vec<f64>, device: &B::Device) -> Param<Tensor<B, 1>> {
    let n = values.len();
    let td = TensorData::new(values, [n]).convert::<B::FloatElem>();
    Param::from_tensor(Tensor::from_data(td, device))
}

/// Reads a tensor back to the host as `f64` values.
pub(crate) fn tensor_to_vec<B: Backend, const D: usize>(t: Tensor<B, D>) -> Result<Vec<f64>> {
    t.into_data()
        .convert::<f64>()
        .to_vec::<f64>()
        .map_err(|e| VariationalError::TensorData(format!("{e:?}")))
}
