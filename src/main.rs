//! Mean-field variational inference on a Normal-Normal model with known variance.
//!
//! The latent mean has a `N(0, 1)` prior and each observation is `N(mu, 1)`. By default 50
//! zeros are observed, for which the analytic posterior is `N(0, sqrt(1/51) ≈ 0.140)`.

use burn::backend::{Autodiff, NdArray};
use burn::config::Config;
use burn::optim::AdamConfig;
use clap::Parser;
use log::info;
use mini_vi::distributions::Normal;
use mini_vi::error::VariationalError;
use mini_vi::guide::NormalGuide;
use mini_vi::inference::{Estimator, Mfvi, MfviConfig};
use mini_vi::model::NormalNormal;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use std::error::Error;
use std::path::PathBuf;

type BackendType = Autodiff<NdArray>;

#[derive(Parser, Debug)]
#[command(
    version,
    about = "Fit a mean-field Normal approximation to a Normal-Normal posterior"
)]
struct Args {
    /// Number of optimization steps
    #[arg(long, default_value_t = 1000)]
    n_iter: usize,

    /// Number of observations
    #[arg(long, default_value_t = 50)]
    n_obs: usize,

    /// Monte Carlo samples per ELBO estimate
    #[arg(long, default_value_t = 1)]
    n_samples: usize,

    /// Initial Adam learning rate
    #[arg(long, default_value_t = 0.1)]
    learning_rate: f64,

    /// Print the loss every N iterations (0 = never)
    #[arg(long, default_value_t = 100)]
    n_print: usize,

    /// Gradient estimator: reparam-kl, reparam or score
    #[arg(long, default_value_t = Estimator::ReparamKl)]
    estimator: Estimator,

    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Draw the observations from the model instead of observing zeros
    #[arg(long)]
    simulate: bool,

    /// Show a progress bar instead of periodic loss prints
    #[arg(long)]
    progress: bool,

    /// Load the inference settings from a JSON file (overrides the flags above)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write the inference settings to a JSON file
    #[arg(long)]
    save_config: Option<PathBuf>,
}

impl Args {
    fn mfvi_config(&self) -> Result<MfviConfig, VariationalError> {
        match &self.config {
            Some(path) => MfviConfig::load(path).map_err(|e| {
                VariationalError::Config(format!("cannot load {}: {e:?}", path.display()))
            }),
            None => Ok(MfviConfig::new()
                .with_n_iter(self.n_iter)
                .with_n_samples(self.n_samples)
                .with_learning_rate(self.learning_rate)
                .with_n_print(self.n_print)
                .with_estimator(self.estimator)
                .with_seed(self.seed)),
        }
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = args.mfvi_config()?;
    if let Some(path) = &args.save_config {
        config.save(path)?;
        info!("Saved inference settings to {}", path.display());
    }

    let model = NormalNormal::new(Normal::standard(), 1.0, args.n_obs)?;
    let data = if args.simulate {
        let (mu, x) = model.simulate(&mut SmallRng::seed_from_u64(config.seed));
        info!("Simulated {} observations with mu = {:.3}", x.len(), mu);
        x
    } else {
        vec![0.0; args.n_obs]
    };
    let model = model.observe(data)?;
    let analytic = model.posterior()?;

    let optim = AdamConfig::new().init::<BackendType, NormalGuide<BackendType>>();
    let mut inference: Mfvi<BackendType, _, _> = Mfvi::new(model, config, optim)?;
    if args.progress {
        inference.run_progress()?;
    } else {
        inference.run()?;
    }

    for (i, q) in inference.posterior()?.iter().enumerate() {
        println!("q(mu[{i}]) = N({:.3}, {:.3})", q.loc, q.scale);
    }
    println!(
        "analytic posterior: N({:.3}, {:.3})",
        analytic.loc, analytic.scale
    );
    Ok(())
}
