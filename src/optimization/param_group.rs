use serde::{Deserialize, Serialize};

use crate::{
    Result,
    configs::{FromageConfig, validate_positive},
    tensor::ParamId,
};

/// Per-group hyperparameter overrides, unset fields fall back to the optimizer defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupOptions {
    #[serde(default)]
    pub lr: Option<f32>,
    #[serde(default)]
    pub p_bound: Option<f32>,
}

/// An ordered set of parameters sharing one set of hyperparameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamGroup {
    pub params: Vec<ParamId>,
    pub options: GroupOptions,
}

impl ParamGroup {
    /// Creates a group that uses the optimizer's defaults.
    pub fn new(params: impl IntoIterator<Item = ParamId>) -> Self {
        Self {
            params: params.into_iter().collect(),
            options: GroupOptions::default(),
        }
    }

    pub fn with_lr(mut self, lr: f32) -> Self {
        self.options.lr = Some(lr);
        self
    }

    pub fn with_p_bound(mut self, p_bound: f32) -> Self {
        self.options.p_bound = Some(p_bound);
        self
    }
}

/// The effective hyperparameters of a group once its overrides have been merged with the
/// optimizer defaults.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GroupConfig {
    pub lr: f32,
    pub p_bound: Option<f32>,
}

impl GroupConfig {
    /// Merges the group's overrides on top of `defaults` and validates the result.
    ///
    /// # Errors
    /// Returns `OptimErr::InvalidConfig` if the effective `lr` or `p_bound` is not positive.
    pub fn resolve(options: &GroupOptions, defaults: &FromageConfig) -> Result<Self> {
        let config = Self {
            lr: options.lr.unwrap_or(defaults.lr),
            p_bound: options.p_bound.or(defaults.p_bound),
        };
        config.validate()?;

        Ok(config)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        validate_positive("learning rate", self.lr)?;
        if let Some(p_bound) = self.p_bound {
            validate_positive("p_bound", p_bound)?;
        }

        Ok(())
    }

    /// The per-step damping divisor, `sqrt(1 + lr^2)`.
    pub fn prefactor(&self) -> f32 {
        (1.0 + self.lr * self.lr).sqrt()
    }
}

/// A group after resolution, as held by the optimizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedGroup {
    pub params: Vec<ParamId>,
    pub config: GroupConfig,
}
