//! Mean-field variational inference (MFVI) driven by `burn` autodiff.
//!
//! [`Mfvi`] fits a [`NormalGuide`] to the posterior of a [`VariationalTarget`] by stochastic
//! gradient descent on the negative evidence lower bound (ELBO). Each update draws
//! `n_samples` standard Normal noise vectors, builds a Monte Carlo estimate of the ELBO with
//! the configured [`Estimator`], backpropagates through it and lets the optimizer (usually
//! Adam) update the guide. The learning rate follows a staircase exponential decay.
//!
//! # Example
//!
//! ```rust
//! use burn::backend::{Autodiff, NdArray};
//! use burn::optim::AdamConfig;
//! use mini_vi::distributions::Normal;
//! use mini_vi::guide::NormalGuide;
//! use mini_vi::inference::{Mfvi, MfviConfig};
//! use mini_vi::model::NormalNormal;
//!
//! type B = Autodiff<NdArray>;
//!
//! let model = NormalNormal::new(Normal::standard(), 1.0, 50)
//!     .unwrap()
//!     .observe(vec![0.0; 50])
//!     .unwrap();
//! let config = MfviConfig::new().with_n_iter(200).with_n_print(0);
//! let mut inference: Mfvi<B, _, _> =
//!     Mfvi::new(model, config, AdamConfig::new().init::<B, NormalGuide<B>>()).unwrap();
//! let losses = inference.run().unwrap();
//! assert_eq!(losses.len(), 200);
//! ```

use crate::distributions::Normal;
use crate::error::{self, VariationalError};
use crate::guide::NormalGuide;
use crate::model::VariationalTarget;
use burn::config::Config;
use burn::optim::{GradientsParams, Optimizer};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::cast::ToElement;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use rand::prelude::*;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

/// Monte Carlo gradient estimator of the ELBO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Estimator {
    /// Reparameterization gradient of `E_q[log p(x | z)]` with the KL term in closed form.
    /// Needs a Normal prior; otherwise inference falls back to [`Estimator::Reparam`].
    ReparamKl,
    /// Reparameterization gradient of `E_q[log p(x, z) - log q(z)]`.
    Reparam,
    /// Score-function (REINFORCE) gradient.
    Score,
}

impl fmt::Display for Estimator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Estimator::ReparamKl => "reparam-kl",
            Estimator::Reparam => "reparam",
            Estimator::Score => "score",
        };
        f.write_str(name)
    }
}

impl FromStr for Estimator {
    type Err = VariationalError;

    fn from_str(s: &str) -> error::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "reparam-kl" | "reparam_kl" => Ok(Estimator::ReparamKl),
            "reparam" => Ok(Estimator::Reparam),
            "score" => Ok(Estimator::Score),
            _ => Err(VariationalError::UnknownEstimator(s.to_string())),
        }
    }
}

/// Settings for [`Mfvi`].
#[derive(Config, Debug)]
pub struct MfviConfig {
    /// Number of optimization steps taken by [`Mfvi::run`].
    #[config(default = 1000)]
    pub n_iter: usize,
    /// Monte Carlo draws per ELBO estimate.
    #[config(default = 1)]
    pub n_samples: usize,
    /// Print the loss every `n_print` iterations; 0 disables printing.
    #[config(default = 100)]
    pub n_print: usize,
    /// Initial learning rate.
    #[config(default = 0.1)]
    pub learning_rate: f64,
    #[config(default = 100)]
    pub decay_steps: usize,
    #[config(default = 0.9)]
    pub decay_rate: f64,
    #[config(default = "Estimator::ReparamKl")]
    pub estimator: Estimator,
    #[config(default = 42)]
    pub seed: u64,
}

impl MfviConfig {
    /// Rejects settings under which the optimization is meaningless.
    pub fn check(&self) -> error::Result<()> {
        if self.n_samples == 0 {
            return Err(VariationalError::InvalidParameter(
                "n_samples must be at least 1".to_string(),
            ));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(VariationalError::InvalidParameter(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if self.decay_steps == 0 {
            return Err(VariationalError::InvalidParameter(
                "decay_steps must be at least 1".to_string(),
            ));
        }
        if !(self.decay_rate > 0.0 && self.decay_rate <= 1.0) {
            return Err(VariationalError::InvalidParameter(format!(
                "decay_rate must lie in (0, 1], got {}",
                self.decay_rate
            )));
        }
        Ok(())
    }
}

/// `learning_rate * decay_rate ^ floor(t / decay_steps)`
pub fn staircase_decay(learning_rate: f64, decay_rate: f64, decay_steps: usize, t: usize) -> f64 {
    learning_rate * decay_rate.powi((t / decay_steps) as i32)
}

/// The progress line for iteration `t`, or `None` when nothing is due. `n_print == 0` never
/// prints.
pub fn progress_line(n_print: usize, t: usize, loss: f64) -> Option<String> {
    if n_print > 0 && t % n_print == 0 {
        Some(format!("iter {t} loss {loss:.2}"))
    } else {
        None
    }
}

/// Mean-field variational inference for a model `M` with optimizer `O`.
///
/// # Type Parameters
///
/// * `B`: Autodiff backend from the `burn` crate.
/// * `M`: The model, implementing [`VariationalTarget`].
/// * `O`: A `burn` optimizer over the guide, e.g. `AdamConfig::new().init()`.
pub struct Mfvi<B, M, O>
where
    B: AutodiffBackend,
{
    model: M,
    guide: NormalGuide<B>,
    optim: O,
    config: MfviConfig,
    estimator: Estimator,
    rng: SmallRng,
    t: usize,
}

impl<B, M, O> Mfvi<B, M, O>
where
    B: AutodiffBackend,
    M: VariationalTarget<B>,
    O: Optimizer<NormalGuide<B>, B>,
{
    /// Validates the model and configuration, seeds the random number generator and draws
    /// the initial guide parameters from a standard Normal.
    pub fn new(model: M, config: MfviConfig, optim: O) -> error::Result<Self> {
        config.check()?;
        model.validate()?;

        let estimator = match (config.estimator, model.normal_prior()) {
            (Estimator::ReparamKl, None) => {
                warn!("Model has no Normal prior, falling back to the reparam estimator");
                Estimator::Reparam
            }
            (estimator, _) => estimator,
        };

        let mut rng = SmallRng::seed_from_u64(config.seed);
        let guide = NormalGuide::init(model.latent_dim(), &mut rng, &B::Device::default());
        info!(
            "MFVI over {} latent variable(s): {} iterations, {} sample(s) per step, {} estimator",
            model.latent_dim(),
            config.n_iter,
            config.n_samples,
            estimator
        );

        Ok(Self {
            model,
            guide,
            optim,
            config,
            estimator,
            rng,
            t: 0,
        })
    }

    /// Replaces the initial guide.
    pub fn with_guide(mut self, guide: NormalGuide<B>) -> error::Result<Self> {
        if guide.dim() != self.model.latent_dim() {
            return Err(VariationalError::InvalidParameter(format!(
                "guide has {} coordinates but the model has {} latent variables",
                guide.dim(),
                self.model.latent_dim()
            )));
        }
        self.guide = guide;
        Ok(self)
    }

    /// Learning rate used by the next update.
    pub fn learning_rate(&self) -> f64 {
        staircase_decay(
            self.config.learning_rate,
            self.config.decay_rate,
            self.config.decay_steps,
            self.t,
        )
    }

    /// Takes one optimization step and returns the loss (the negative ELBO estimate) at the
    /// parameters before the step.
    pub fn update(&mut self) -> error::Result<f64> {
        let lr = self.learning_rate();
        let (surrogate, loss) = self.objective();

        let loss = loss.into_scalar().to_f64();
        if !loss.is_finite() {
            return Err(VariationalError::NonFiniteLoss {
                iteration: self.t,
                loss,
            });
        }

        let grads = GradientsParams::from_grads(surrogate.backward(), &self.guide);
        self.guide = self.optim.step(lr, self.guide.clone(), grads);
        debug!("iter {} lr {:.5} loss {:.4}", self.t, lr, loss);

        self.t += 1;
        Ok(loss)
    }

    /// Prints the loss every `n_print` iterations.
    pub fn print_progress(&self, t: usize, loss: f64) {
        if let Some(line) = progress_line(self.config.n_print, t, loss) {
            println!("{line}");
        }
    }

    /// Runs `n_iter` updates, printing progress, and returns the loss of every iteration.
    pub fn run(&mut self) -> error::Result<Vec<f64>> {
        let mut losses = Vec::with_capacity(self.config.n_iter);
        for _ in 0..self.config.n_iter {
            let t = self.t;
            let loss = self.update()?;
            self.print_progress(t, loss);
            losses.push(loss);
        }
        self.log_summary(&losses);
        Ok(losses)
    }

    /// Runs `n_iter` updates and displays a progress bar with the mean loss over a sliding
    /// window of 100 iterations.
    pub fn run_progress(&mut self) -> error::Result<Vec<f64>> {
        let n_iter = self.config.n_iter;
        let pb = ProgressBar::new(n_iter as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{prefix:8} {bar:40.white} ETA {eta:3} | {msg}")
                .map_err(|e| VariationalError::Config(e.to_string()))?
                .progress_chars("=>-"),
        );
        pb.set_prefix("MFVI");

        let window_size = 100;
        let mut window: VecDeque<f64> = VecDeque::with_capacity(window_size);
        let mut losses = Vec::with_capacity(n_iter);

        for _ in 0..n_iter {
            let loss = self.update()?;
            losses.push(loss);

            window.push_front(loss);
            if window.len() > window_size {
                window.pop_back();
            }
            let avg_loss = window.iter().sum::<f64>() / window.len() as f64;

            pb.inc(1);
            pb.set_message(format!("loss≈{:.3} lr≈{:.4}", avg_loss, self.learning_rate()));
        }
        pb.finish_with_message("Done!");
        self.log_summary(&losses);
        Ok(losses)
    }

    /// The fitted approximation of each latent variable's posterior.
    pub fn posterior(&self) -> error::Result<Vec<Normal>> {
        self.guide.to_normals()
    }

    /// Number of updates taken so far.
    pub fn iteration(&self) -> usize {
        self.t
    }

    pub fn guide(&self) -> &NormalGuide<B> {
        &self.guide
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn config(&self) -> &MfviConfig {
        &self.config
    }

    /// The estimator in use, after any fallback.
    pub fn estimator(&self) -> Estimator {
        self.estimator
    }

    /// Builds `(surrogate, loss)`: the tensor to differentiate and the negative ELBO estimate.
    /// They only differ for the score-function estimator.
    fn objective(&mut self) -> (Tensor<B, 1>, Tensor<B, 1>) {
        let eps = self.draw_noise();

        match (self.estimator, self.model.normal_prior()) {
            (Estimator::ReparamKl, Some(prior)) => {
                let z = self.guide.sample(eps);
                let expected_loglik = self.model.log_likelihood_batch(&z).mean();
                let loss = expected_loglik.sub(self.guide.kl_to(&prior)).neg();
                (loss.clone(), loss)
            }
            (Estimator::Score, _) => {
                let z = self.guide.sample(eps).detach();
                let log_q = self.guide.log_prob_batch(&z);
                let log_p = self
                    .model
                    .log_likelihood_batch(&z)
                    .add(self.model.log_prior_batch(&z));
                let weight = log_p.sub(log_q.clone()).detach();
                let surrogate = log_q.mul(weight.clone()).mean().neg();
                (surrogate, weight.mean().neg())
            }
            _ => {
                let z = self.guide.sample(eps);
                let log_p = self
                    .model
                    .log_likelihood_batch(&z)
                    .add(self.model.log_prior_batch(&z));
                let loss = log_p.sub(self.guide.log_prob_batch(&z)).mean().neg();
                (loss.clone(), loss)
            }
        }
    }

    /// Standard Normal noise of shape `[n_samples, latent_dim]`.
    fn draw_noise(&mut self) -> Tensor<B, 2> {
        let (n_samples, dim) = (self.config.n_samples, self.guide.dim());
        let eps: Vec<f64> = (0..n_samples * dim)
            .map(|_| self.rng.sample(StandardNormal))
            .collect();
        let td = TensorData::new(eps, [n_samples, dim]).convert::<B::FloatElem>();
        Tensor::from_data(td, &B::Device::default())
    }

    fn log_summary(&self, losses: &[f64]) {
        if let Some(last) = losses.last() {
            info!(
                "Finished {} iterations (total {}), final loss {:.4}",
                losses.len(),
                self.t,
                last
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NormalNormal;
    use approx::assert_abs_diff_eq;
    use burn::backend::{Autodiff, NdArray};
    use burn::optim::AdamConfig;

    type B = Autodiff<NdArray>;

    fn zeros_model(n: usize) -> NormalNormal {
        NormalNormal::new(Normal::standard(), 1.0, n)
            .unwrap()
            .observe(vec![0.0; n])
            .unwrap()
    }

    fn adam() -> impl Optimizer<NormalGuide<B>, B> {
        AdamConfig::new().init::<B, NormalGuide<B>>()
    }

    /// Same as the wrapped model, but hides its Normal prior.
    struct OpaquePrior(NormalNormal);

    impl VariationalTarget<B> for OpaquePrior {
        fn latent_dim(&self) -> usize {
            VariationalTarget::<B>::latent_dim(&self.0)
        }

        fn log_likelihood_batch(&self, z: &Tensor<B, 2>) -> Tensor<B, 1> {
            self.0.log_likelihood_batch(z)
        }

        fn log_prior_batch(&self, z: &Tensor<B, 2>) -> Tensor<B, 1> {
            self.0.log_prior_batch(z)
        }
    }

    #[test]
    fn test_staircase_decay() {
        assert_abs_diff_eq!(staircase_decay(0.1, 0.9, 100, 0), 0.1, epsilon = 1e-12);
        assert_abs_diff_eq!(staircase_decay(0.1, 0.9, 100, 99), 0.1, epsilon = 1e-12);
        assert_abs_diff_eq!(staircase_decay(0.1, 0.9, 100, 100), 0.09, epsilon = 1e-12);
        assert_abs_diff_eq!(
            staircase_decay(0.1, 0.9, 100, 999),
            0.1 * 0.9f64.powi(9),
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_progress_line() {
        assert_eq!(progress_line(100, 0, 73.3349).as_deref(), Some("iter 0 loss 73.33"));
        assert_eq!(progress_line(100, 100, 48.736).as_deref(), Some("iter 100 loss 48.74"));
        assert_eq!(progress_line(100, 99, 48.0), None);
        assert_eq!(progress_line(0, 0, 48.0), None);
        assert_eq!(progress_line(0, 100, 48.0), None);
    }

    #[test]
    fn test_run_progress_returns_trace() {
        let config = MfviConfig::new().with_n_iter(20);
        let mut inference: Mfvi<B, _, _> = Mfvi::new(zeros_model(50), config, adam()).unwrap();
        let losses = inference.run_progress().unwrap();
        assert_eq!(losses.len(), 20);
        assert!(losses.iter().all(|l| l.is_finite()));
        assert_eq!(inference.iteration(), 20);
    }

    #[test]
    fn test_config_json_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = MfviConfig::new()
            .with_estimator(Estimator::Reparam)
            .with_decay_rate(0.5);
        config.save(&path).unwrap();
        let loaded = MfviConfig::load(&path).unwrap();
        assert_eq!(loaded.estimator, Estimator::Reparam);
        assert_abs_diff_eq!(loaded.decay_rate, 0.5, epsilon = 1e-12);
        assert_eq!(loaded.n_iter, config.n_iter);
    }

    #[test]
    fn test_default_config() {
        let config = MfviConfig::new();
        assert_eq!(config.n_iter, 1000);
        assert_eq!(config.n_samples, 1);
        assert_eq!(config.estimator, Estimator::ReparamKl);
        assert!(config.check().is_ok());
    }

    #[test]
    fn test_config_check_rejects() {
        assert!(MfviConfig::new().with_n_samples(0).check().is_err());
        assert!(MfviConfig::new().with_learning_rate(0.0).check().is_err());
        assert!(MfviConfig::new().with_decay_rate(1.5).check().is_err());
        assert!(MfviConfig::new().with_decay_rate(0.0).check().is_err());
        assert!(MfviConfig::new().with_decay_steps(0).check().is_err());
        assert!(MfviConfig::new().with_decay_rate(1.0).check().is_ok());
    }

    #[test]
    fn test_estimator_parse() {
        assert_eq!("reparam-kl".parse::<Estimator>().unwrap(), Estimator::ReparamKl);
        assert_eq!("Reparam".parse::<Estimator>().unwrap(), Estimator::Reparam);
        assert_eq!("score".parse::<Estimator>().unwrap(), Estimator::Score);
        assert!("klqp".parse::<Estimator>().is_err());
        assert_eq!(Estimator::ReparamKl.to_string(), "reparam-kl");
    }

    #[test]
    fn test_missing_data_is_rejected() {
        let model = NormalNormal::new(Normal::standard(), 1.0, 50).unwrap();
        let result: error::Result<Mfvi<B, _, _>> = Mfvi::new(model, MfviConfig::new(), adam());
        assert!(matches!(result, Err(VariationalError::MissingData)));
    }

    #[test]
    fn test_falls_back_without_normal_prior() {
        let model = OpaquePrior(zeros_model(10));
        let mut inference: Mfvi<B, _, _> =
            Mfvi::new(model, MfviConfig::new().with_n_print(0), adam()).unwrap();
        assert_eq!(inference.estimator(), Estimator::Reparam);
        assert!(inference.update().unwrap().is_finite());
    }

    #[test]
    fn test_update_advances_schedule() {
        let config = MfviConfig::new().with_decay_steps(2).with_n_print(0);
        let mut inference: Mfvi<B, _, _> = Mfvi::new(zeros_model(50), config, adam()).unwrap();
        assert_abs_diff_eq!(inference.learning_rate(), 0.1, epsilon = 1e-12);
        for _ in 0..5 {
            assert!(inference.update().unwrap().is_finite());
        }
        assert_eq!(inference.iteration(), 5);
        assert_abs_diff_eq!(inference.learning_rate(), 0.1 * 0.81, epsilon = 1e-12);
    }

    #[test]
    fn test_same_seed_same_trace() {
        let config = MfviConfig::new().with_n_iter(20).with_n_print(0);
        let mut a: Mfvi<B, _, _> = Mfvi::new(zeros_model(50), config.clone(), adam()).unwrap();
        let mut b: Mfvi<B, _, _> = Mfvi::new(zeros_model(50), config, adam()).unwrap();
        assert_eq!(a.run().unwrap(), b.run().unwrap());
    }

    #[test]
    fn test_with_guide_checks_dimension() {
        let device = Default::default();
        let inference: Mfvi<B, _, _> =
            Mfvi::new(zeros_model(50), MfviConfig::new(), adam()).unwrap();
        let guide = NormalGuide::<B>::from_values(&[0.0, 0.0], &[1.0, 1.0], &device).unwrap();
        assert!(inference.with_guide(guide).is_err());
    }

    #[test]
    fn test_reparam_kl_loss_at_known_guide() {
        // With q = N(0, s) and zero data the single-draw loss is
        // n ln sqrt(2 pi) + (n / 2) s^2 eps^2 + KL(q || p).
        let device = Default::default();
        let guide = NormalGuide::<B>::from_values(&[0.0], &[0.5], &device).unwrap();
        let config = MfviConfig::new().with_n_print(0);
        let mut inference: Mfvi<B, _, _> = Mfvi::new(zeros_model(50), config, adam())
            .unwrap()
            .with_guide(guide)
            .unwrap();
        let loss = inference.update().unwrap();
        let kl = Normal::new(0.0, 0.5)
            .unwrap()
            .kl_divergence(&Normal::standard());
        let base = 50.0 * crate::distributions::LN_SQRT_2PI + kl;
        assert!(loss >= base - 1e-3);
    }
}
