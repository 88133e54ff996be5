pub mod configs;
pub mod error;
pub mod optimization;
pub mod tensor;

pub use configs::FromageConfig;
pub use error::{OptimErr, Result};
pub use optimization::{Fromage, Optimizer, ParamGroup};
pub use tensor::{Grad, ParamId, ParamSet, Parameter, SparseGrad};
