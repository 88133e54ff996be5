mod fromage;
mod optimizer;
mod param_group;
mod state;

pub use fromage::Fromage;
pub use optimizer::{Closure, Optimizer};
pub use param_group::{GroupConfig, GroupOptions, ParamGroup, ResolvedGroup};
pub use state::{ParamState, StateDict};
