use std::{collections::HashMap, fmt};

use ndarray::{ArrayD, ArrayViewD, IxDyn};
use serde::{Deserialize, Serialize};

use crate::{OptimErr, Result};

/// Stable handle of a parameter, assigned once by `ParamSet::register`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParamId(usize);

impl fmt::Display for ParamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Euclidean norm of a tensor treated as a flat vector, accumulated in `f64`.
///
/// Squares of `f32` values below ~1e-19 or above ~1e19 leave the `f32` range.
pub(crate) fn l2_norm_wide(values: ArrayViewD<f32>) -> f64 {
    values
        .iter()
        .map(|&x| f64::from(x).powi(2))
        .sum::<f64>()
        .sqrt()
}

/// Euclidean norm of a tensor treated as a flat vector.
pub fn l2_norm(values: ArrayViewD<f32>) -> f32 {
    l2_norm_wide(values) as f32
}

/// A gradient stored in COO form: flat (row-major) element indices and their values.
#[derive(Debug, Clone, PartialEq)]
pub struct SparseGrad {
    shape: Vec<usize>,
    indices: Vec<usize>,
    values: Vec<f32>,
}

impl SparseGrad {
    /// Creates a new `SparseGrad`.
    ///
    /// # Arguments
    /// * `shape` - The shape of the dense tensor this gradient represents.
    /// * `indices` - Flat row-major indices of the non-zero entries.
    /// * `values` - The entries' values, one per index.
    ///
    /// # Errors
    /// Returns `OptimErr::ShapeMismatch` if `indices` and `values` differ in length.
    pub fn new(shape: Vec<usize>, indices: Vec<usize>, values: Vec<f32>) -> Result<Self> {
        if indices.len() != values.len() {
            return Err(OptimErr::ShapeMismatch {
                what: "sparse values",
                got: values.len(),
                expected: indices.len(),
            });
        }

        Ok(Self {
            shape,
            indices,
            values,
        })
    }

    /// Materializes the gradient, summing entries that share an index.
    ///
    /// # Errors
    /// Returns `OptimErr::ShapeMismatch` if an index lies outside the tensor.
    pub fn to_dense(&self) -> Result<ArrayD<f32>> {
        let mut dense = ArrayD::zeros(IxDyn(&self.shape));
        let len = dense.len();

        // Freshly allocated arrays are standard layout.
        let flat = dense
            .as_slice_mut()
            .ok_or(OptimErr::ShapeMismatch {
                what: "sparse layout",
                got: 0,
                expected: len,
            })?;

        for (&i, &v) in self.indices.iter().zip(&self.values) {
            if i >= len {
                return Err(OptimErr::ShapeMismatch {
                    what: "sparse index",
                    got: i,
                    expected: len,
                });
            }
            flat[i] += v;
        }

        Ok(dense)
    }
}

/// A parameter's gradient.
#[derive(Debug, Clone, PartialEq)]
pub enum Grad {
    Dense(ArrayD<f32>),
    Sparse(SparseGrad),
}

impl Grad {
    pub fn is_sparse(&self) -> bool {
        matches!(self, Grad::Sparse(_))
    }

    /// Converts the gradient into its dense form.
    pub fn into_dense(self) -> Result<Self> {
        match self {
            Grad::Sparse(sparse) => sparse.to_dense().map(Grad::Dense),
            dense => Ok(dense),
        }
    }
}

/// A trainable tensor together with its (optional) gradient for the current iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    value: ArrayD<f32>,
    grad: Option<Grad>,
}

impl Parameter {
    /// Creates a new `Parameter` with no gradient.
    pub fn new(value: ArrayD<f32>) -> Self {
        Self { value, grad: None }
    }

    pub fn value(&self) -> &ArrayD<f32> {
        &self.value
    }

    pub fn value_mut(&mut self) -> &mut ArrayD<f32> {
        &mut self.value
    }

    pub fn grad(&self) -> Option<&Grad> {
        self.grad.as_ref()
    }

    pub fn set_grad(&mut self, grad: Grad) {
        self.grad = Some(grad);
    }

    /// Drops the gradient, leaving it absent.
    pub fn clear_grad(&mut self) {
        self.grad = None;
    }

    /// Splits the parameter into its value and gradient, so both can be borrowed at once.
    pub(crate) fn parts_mut(&mut self) -> (&mut ArrayD<f32>, Option<&Grad>) {
        (&mut self.value, self.grad.as_ref())
    }

    pub fn norm(&self) -> f32 {
        l2_norm(self.value.view())
    }
}

/// The registry of parameters owned by the training loop.
///
/// Every registered parameter receives a `ParamId` that never changes and is never reused, so
/// optimizer state keyed by it follows the parameter and not its value.
#[derive(Debug, Default)]
pub struct ParamSet {
    params: HashMap<ParamId, Parameter>,
    next_id: usize,
}

impl ParamSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new parameter.
    ///
    /// # Arguments
    /// * `value` - The parameter's initial value.
    ///
    /// # Returns
    /// The handle of the newly registered parameter.
    pub fn register(&mut self, value: ArrayD<f32>) -> ParamId {
        let id = ParamId(self.next_id);
        self.next_id += 1;
        self.params.insert(id, Parameter::new(value));
        id
    }

    /// Stops tracking a parameter, returning it.
    pub fn remove(&mut self, id: ParamId) -> Option<Parameter> {
        self.params.remove(&id)
    }

    pub fn get(&self, id: ParamId) -> Option<&Parameter> {
        self.params.get(&id)
    }

    pub fn get_mut(&mut self, id: ParamId) -> Option<&mut Parameter> {
        self.params.get_mut(&id)
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}
