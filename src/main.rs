use std::{env, fs};

use anyhow::{Context, Result, bail};
use fromage::{
    Fromage, FromageConfig, Grad, Optimizer, ParamGroup, ParamId, ParamSet,
    optimization::GroupOptions,
};
use log::{debug, info};
use ndarray::{Array1, Array2};
use rand::{Rng, SeedableRng, rngs::StdRng};
use serde::Deserialize;

const LOG_EVERY: usize = 100;

/// Samples uniformly from `[-scale, scale)`.
fn uniform(rng: &mut impl Rng, scale: f32) -> f32 {
    (rng.random::<f32>() - 0.5) * 2. * scale
}

/// The demo's training setup, read from an optional JSON file.
#[derive(Debug, Deserialize)]
#[serde(default)]
struct DemoConfig {
    optimizer: FromageConfig,
    /// Overrides for the bias' parameter group.
    bias: GroupOptions,
    epochs: usize,
    samples: usize,
    features: usize,
    seed: u64,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            optimizer: FromageConfig {
                lr: 1e-2,
                p_bound: Some(10.0),
            },
            bias: GroupOptions::default(),
            epochs: 2000,
            samples: 256,
            features: 8,
            seed: 42,
        }
    }
}

/// A linear model `y = x·w + b` trained with the mean squared error.
struct Linear {
    weights: ParamId,
    bias: ParamId,
}

impl Linear {
    fn new(params: &mut ParamSet, features: usize, rng: &mut impl Rng) -> Self {
        let weights = Array1::from_shape_fn(features, |_| uniform(rng, 0.1));

        Self {
            weights: params.register(weights.into_dyn()),
            bias: params.register(Array1::from_elem(1, 0.1).into_dyn()),
        }
    }

    fn predict(&self, params: &ParamSet, x: &Array2<f32>) -> Option<Array1<f32>> {
        let w: Array1<f32> = params.get(self.weights)?.value().iter().copied().collect();
        let b = params.get(self.bias)?.value().sum();

        Some(x.dot(&w) + b)
    }

    /// Computes the loss and writes its gradient with respect to every parameter.
    fn backward(&self, params: &mut ParamSet, x: &Array2<f32>, y: &Array1<f32>) -> Option<f32> {
        let residual = self.predict(params, x)? - y;
        let n = y.len() as f32;

        let loss = residual.mapv(|r| r * r).sum() / n;
        let grad_w = x.t().dot(&residual) * (2.0 / n);
        let grad_b = Array1::from_elem(1, residual.sum() * 2.0 / n);

        params
            .get_mut(self.weights)?
            .set_grad(Grad::Dense(grad_w.into_dyn()));
        params
            .get_mut(self.bias)?
            .set_grad(Grad::Dense(grad_b.into_dyn()));

        Some(loss)
    }
}

fn main() -> Result<()> {
    env_logger::init();

    let config: DemoConfig = match env::args().nth(1) {
        Some(path) => {
            let json = fs::read_to_string(&path).with_context(|| format!("failed to read {path}"))?;
            serde_json::from_str(&json).with_context(|| format!("invalid config at {path}"))?
        }
        None => DemoConfig::default(),
    };
    debug!("{config:?}");

    let mut rng = StdRng::seed_from_u64(config.seed);
    let true_w = Array1::from_shape_fn(config.features, |_| uniform(&mut rng, 1.));
    let x = Array2::from_shape_fn((config.samples, config.features), |_| uniform(&mut rng, 1.));
    let y = x.dot(&true_w) + 0.5;

    let mut params = ParamSet::new();
    let model = Linear::new(&mut params, config.features, &mut rng);

    let groups = [
        ParamGroup::new([model.weights]),
        ParamGroup {
            params: vec![model.bias],
            options: config.bias,
        },
    ];
    let mut optimizer = Fromage::from_config(groups, config.optimizer)?;
    info!(params = params.len(), epochs = config.epochs; "training linear model with {optimizer}");

    let mut closure =
        |params: &mut ParamSet| model.backward(params, &x, &y).unwrap_or(f32::NAN);

    for epoch in 0..config.epochs {
        optimizer.zero_grad(&mut params);
        let loss = optimizer
            .step(&mut params, Some(&mut closure))?
            .unwrap_or(f32::NAN);

        if !loss.is_finite() {
            bail!("loss diverged at epoch {epoch}");
        }

        if epoch % LOG_EVERY == 0 {
            info!(epoch = epoch, loss = loss; "training");
        }
    }

    let loss = model
        .backward(&mut params, &x, &y)
        .context("model parameters are no longer registered")?;
    info!(loss = loss; "training finished");
    debug!(
        "optimizer state: {}",
        serde_json::to_string(&optimizer.state_dict())?
    );

    println!("final loss: {loss}");
    Ok(())
}
