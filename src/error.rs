use std::{
    error::Error,
    fmt::{self, Display},
};

use crate::tensor::ParamId;

/// The result type used in the entire crate.
pub type Result<T> = std::result::Result<T, OptimErr>;

/// The optimizer's error type.
#[derive(Debug)]
pub enum OptimErr {
    /// A hyperparameter is out of its valid range.
    InvalidConfig { what: &'static str, value: f32 },
    /// The gradient representation can't be handled by the named optimizer.
    UnsupportedGradient { optimizer: &'static str },
    ShapeMismatch {
        what: &'static str,
        got: usize,
        expected: usize,
    },
    UnknownParameter(ParamId),
    DuplicateParameter(ParamId),
    StateMismatch {
        what: &'static str,
        got: usize,
        expected: usize,
    },
    Config(serde_json::Error),
}

impl Display for OptimErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptimErr::InvalidConfig { what, value } => {
                write!(f, "invalid configuration: {what} is out of range, got {value}")
            }
            OptimErr::UnsupportedGradient { optimizer } => write!(
                f,
                "{optimizer} does not support sparse gradients, convert them to dense first"
            ),
            OptimErr::ShapeMismatch {
                what,
                got,
                expected,
            } => write!(
                f,
                "shape mismatch for {what}: got {got} elements, expected {expected}"
            ),
            OptimErr::UnknownParameter(id) => {
                write!(f, "parameter {id} is not registered in the parameter set")
            }
            OptimErr::DuplicateParameter(id) => {
                write!(f, "parameter {id} already belongs to a parameter group")
            }
            OptimErr::StateMismatch {
                what,
                got,
                expected,
            } => write!(
                f,
                "loaded state doesn't match the optimizer's {what}: got {got}, expected {expected}"
            ),
            OptimErr::Config(e) => write!(f, "failed to parse configuration: {e}"),
        }
    }
}

impl Error for OptimErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            OptimErr::Config(e) => Some(e),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for OptimErr {
    fn from(value: serde_json::Error) -> Self {
        Self::Config(value)
    }
}
