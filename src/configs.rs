use serde::{Deserialize, Serialize};

use crate::{OptimErr, Result};

const DEFAULT_LR: f32 = 1e-2;

fn default_lr() -> f32 {
    DEFAULT_LR
}

/// Checks that a hyperparameter is a finite, strictly positive number.
pub(crate) fn validate_positive(what: &'static str, value: f32) -> Result<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(OptimErr::InvalidConfig { what, value })
    }
}

/// The optimizer-wide defaults every parameter group falls back to.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FromageConfig {
    #[serde(default = "default_lr")]
    pub lr: f32,
    /// Restricts parameter norms to `p_bound` times their initial norm.
    #[serde(default)]
    pub p_bound: Option<f32>,
}

impl Default for FromageConfig {
    fn default() -> Self {
        Self {
            lr: DEFAULT_LR,
            p_bound: None,
        }
    }
}

impl FromageConfig {
    /// Parses and validates a configuration from its JSON representation.
    ///
    /// # Errors
    /// Returns `OptimErr::Config` on malformed JSON and `OptimErr::InvalidConfig` on
    /// out of range values.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        validate_positive("learning rate", self.lr)?;
        if let Some(p_bound) = self.p_bound {
            validate_positive("p_bound", p_bound)?;
        }

        Ok(())
    }
}
