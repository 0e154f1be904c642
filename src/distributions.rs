/*!
Normal distributions in scalar and tensor form, together with the closed-form
quantities that mean-field variational inference needs: log-densities, the
Kullback–Leibler divergence between two Normals, and the softplus transform that
keeps a scale parameter positive.

Scalar hyperparameters are plain `f64`. Tensor-valued functions are generic over the
`burn` backend and the tensor rank, so they can be used both on raw backends and on
autodiff backends.

# Examples

```rust
use mini_vi::distributions::Normal;

let prior = Normal::new(0.0, 1.0).unwrap();
let q = Normal::new(0.5, 0.2).unwrap();
println!("log p(0.3) = {}", prior.log_prob(0.3));
println!("KL(q || p) = {}", q.kl_divergence(&prior));
```
*/

use crate::error::{Result, VariationalError};
use burn::prelude::*;
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

/// `ln(sqrt(2 * pi))`
pub const LN_SQRT_2PI: f64 = 0.918_938_533_204_672_8;

/// A univariate Normal distribution with location `loc` and standard deviation `scale`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Normal {
    pub loc: f64,
    pub scale: f64,
}

impl Normal {
    /// Creates a new Normal distribution.
    ///
    /// Fails if `loc` is not finite or `scale` is not a strictly positive finite number.
    pub fn new(loc: f64, scale: f64) -> Result<Self> {
        if !loc.is_finite() {
            return Err(VariationalError::InvalidParameter(format!(
                "Normal location must be finite, got {loc}"
            )));
        }
        if !(scale.is_finite() && scale > 0.0) {
            return Err(VariationalError::InvalidParameter(format!(
                "Normal scale must be positive and finite, got {scale}"
            )));
        }
        Ok(Self { loc, scale })
    }

    /// The standard Normal `N(0, 1)`.
    pub fn standard() -> Self {
        Self {
            loc: 0.0,
            scale: 1.0,
        }
    }

    pub fn variance(&self) -> f64 {
        self.scale * self.scale
    }

    /// Evaluates the normalized log-density at `x`.
    pub fn log_prob(&self, x: f64) -> f64 {
        let z = (x - self.loc) / self.scale;
        -0.5 * z * z - self.scale.ln() - LN_SQRT_2PI
    }

    /// Evaluates the normalized log-density element-wise on a tensor.
    pub fn log_prob_tensor<B: Backend, const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        x.sub_scalar(self.loc)
            .div_scalar(self.scale)
            .powi_scalar(2)
            .mul_scalar(-0.5)
            .sub_scalar(self.scale.ln() + LN_SQRT_2PI)
    }

    /// Draws a single value.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        let eps: f64 = StandardNormal.sample(rng);
        self.loc + self.scale * eps
    }

    /// Closed-form `KL(self || other)`.
    pub fn kl_divergence(&self, other: &Normal) -> f64 {
        let diff = self.loc - other.loc;
        (other.scale / self.scale).ln() + (self.variance() + diff * diff) / (2.0 * other.variance())
            - 0.5
    }
}

impl Default for Normal {
    fn default() -> Self {
        Self::standard()
    }
}

/// Normal log-density with tensor-valued parameters. `x`, `loc` and `scale` must share a shape.
pub fn normal_log_density<B: Backend, const D: usize>(
    x: Tensor<B, D>,
    loc: Tensor<B, D>,
    scale: Tensor<B, D>,
) -> Tensor<B, D> {
    let z = x.sub(loc).div(scale.clone());
    z.powi_scalar(2)
        .mul_scalar(-0.5)
        .sub(scale.log())
        .sub_scalar(LN_SQRT_2PI)
}

/// Element-wise `KL(N(q_loc, q_scale) || p)` for a scalar prior `p`.
pub fn normal_kl<B: Backend, const D: usize>(
    q_loc: Tensor<B, D>,
    q_scale: Tensor<B, D>,
    p: &Normal,
) -> Tensor<B, D> {
    let spread = q_scale
        .clone()
        .powi_scalar(2)
        .add(q_loc.sub_scalar(p.loc).powi_scalar(2))
        .div_scalar(2.0 * p.variance());
    q_scale.log().neg().add_scalar(p.scale.ln() - 0.5).add(spread)
}

/// Numerically stable `ln(1 + exp(x))`, computed as `max(x, 0) + ln(1 + exp(-|x|))`.
pub fn softplus<B: Backend, const D: usize>(x: Tensor<B, D>) -> Tensor<B, D> {
    let tail = x.clone().abs().neg().exp().log1p();
    x.clamp_min(0.0).add(tail)
}

/// Inverse of [`softplus`] for a positive value.
pub fn inverse_softplus(y: f64) -> Result<f64> {
    if !(y.is_finite() && y > 0.0) {
        return Err(VariationalError::InvalidParameter(format!(
            "softplus is only invertible on positive values, got {y}"
        )));
    }
    Ok(y.exp_m1().ln())
}
