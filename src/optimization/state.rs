use serde::{Deserialize, Serialize};

use super::param_group::ResolvedGroup;
use crate::tensor::ParamId;

/// The per-parameter state kept by `Fromage`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ParamState {
    /// The norm ceiling of the parameter, set only when its group has a `p_bound`.
    pub max_norm: Option<f32>,
}

/// A serializable snapshot of an optimizer, used to resume training.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateDict {
    pub groups: Vec<ResolvedGroup>,
    /// Sorted by parameter id.
    pub state: Vec<(ParamId, ParamState)>,
}
