use crate::{Result, tensor::ParamSet};

/// A loss-computing callback.
///
/// It receives mutable access to the parameters so it can run the forward and backward passes
/// and write fresh gradients before the update is applied.
pub type Closure<'c> = &'c mut dyn FnMut(&mut ParamSet) -> f32;

/// Defines the strategy for updating model parameters based on their gradients.
///
/// The `Optimizer` trait is responsible for the mathematical transition of parameters from state
/// `t` to `t+1`.
pub trait Optimizer {
    /// A human readable name identifying the algorithm.
    fn name(&self) -> &'static str;

    /// Updates every tracked parameter in place using its current gradient.
    ///
    /// # Arguments
    /// * `params` - The parameters being optimized.
    /// * `closure` - An optional callback that recomputes the loss before the update.
    ///
    /// # Returns
    /// The loss returned by `closure`, if one was given.
    ///
    /// # Errors
    /// Returns `OptimErr` if a parameter or its gradient can't be handled. Parameters
    /// processed before the failing one are left updated.
    fn step(&mut self, params: &mut ParamSet, closure: Option<Closure<'_>>)
    -> Result<Option<f32>>;

    /// Clears the gradient of every tracked parameter.
    fn zero_grad(&self, params: &mut ParamSet);
}

impl<T: Optimizer + ?Sized> Optimizer for Box<T> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn step(
        &mut self,
        params: &mut ParamSet,
        closure: Option<Closure<'_>>,
    ) -> Result<Option<f32>> {
        (**self).step(params, closure)
    }

    fn zero_grad(&self, params: &mut ParamSet) {
        (**self).zero_grad(params)
    }
}
