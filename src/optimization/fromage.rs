use std::{
    collections::{HashMap, HashSet},
    fmt,
};

use log::{debug, info, trace};
use ndarray::ArrayD;

use super::{
    Closure, Optimizer,
    param_group::{GroupConfig, ParamGroup, ResolvedGroup},
    state::{ParamState, StateDict},
};
use crate::{
    OptimErr, Result,
    configs::{FromageConfig, validate_positive},
    tensor::{Grad, ParamId, ParamSet, l2_norm_wide},
};

/// The Fromage optimization algorithm.
///
/// Every step rescales the gradient to the norm of the parameter it updates, so the relative
/// change of a parameter is governed by the learning rate alone. The parameter is then divided
/// by `sqrt(1 + lr^2)`, and, when the group sets a `p_bound`, projected back onto the ball of
/// radius `p_bound` times its reference norm.
#[derive(Debug)]
pub struct Fromage {
    defaults: FromageConfig,
    groups: Vec<ResolvedGroup>,
    state: HashMap<ParamId, ParamState>,
}

impl Fromage {
    pub const NAME: &'static str = "Fromage";

    /// Creates a new `Fromage` optimizer.
    ///
    /// # Arguments
    /// * `groups` - The parameter groups to optimize, each with optional overrides.
    /// * `lr` - The default learning rate, must be strictly positive.
    /// * `p_bound` - The default proportional bound. A value of `2.0` restricts parameter norms to
    ///   twice their initial norms.
    ///
    /// # Errors
    /// Returns `OptimErr::InvalidConfig` if a learning rate or bound is not positive, and
    /// `OptimErr::DuplicateParameter` if a parameter appears in more than one group.
    pub fn new(
        groups: impl IntoIterator<Item = ParamGroup>,
        lr: f32,
        p_bound: Option<f32>,
    ) -> Result<Self> {
        Self::from_config(groups, FromageConfig { lr, p_bound })
    }

    /// Creates a new `Fromage` optimizer taking its defaults from `config`.
    pub fn from_config(
        groups: impl IntoIterator<Item = ParamGroup>,
        config: FromageConfig,
    ) -> Result<Self> {
        config.validate()?;

        let mut fromage = Self {
            defaults: config,
            groups: Vec::new(),
            state: HashMap::new(),
        };

        for group in groups {
            fromage.add_param_group(group)?;
        }

        Ok(fromage)
    }

    /// Resolves `group` against the optimizer defaults and starts tracking it.
    ///
    /// # Errors
    /// Same as `Fromage::new`.
    pub fn add_param_group(&mut self, group: ParamGroup) -> Result<()> {
        let config = GroupConfig::resolve(&group.options, &self.defaults)?;

        let mut seen = HashSet::with_capacity(group.params.len());
        for &id in &group.params {
            if !seen.insert(id) || self.tracks(id) {
                return Err(OptimErr::DuplicateParameter(id));
            }
        }

        self.groups.push(ResolvedGroup {
            params: group.params,
            config,
        });

        Ok(())
    }

    fn tracks(&self, id: ParamId) -> bool {
        self.groups.iter().any(|group| group.params.contains(&id))
    }

    pub fn param_groups(&self) -> &[ResolvedGroup] {
        &self.groups
    }

    /// The default learning rate.
    pub fn lr(&self) -> f32 {
        self.defaults.lr
    }

    /// Sets the learning rate of the defaults and of every group.
    ///
    /// # Errors
    /// Returns `OptimErr::InvalidConfig` if `lr` is not positive, in which case nothing changes.
    pub fn set_lr(&mut self, lr: f32) -> Result<()> {
        validate_positive("learning rate", lr)?;

        self.defaults.lr = lr;
        for group in &mut self.groups {
            group.config.lr = lr;
        }

        Ok(())
    }

    pub fn state(&self, id: ParamId) -> Option<&ParamState> {
        self.state.get(&id)
    }

    /// Drops the state of a parameter that is no longer being trained.
    pub fn forget(&mut self, id: ParamId) -> Option<ParamState> {
        self.state.remove(&id)
    }

    /// Re-establishes the norm bound of every parameter in a bounded group from its current norm.
    ///
    /// Unlike the lazy initialization done by `step`, this always overwrites existing bounds,
    /// which is what's wanted after loading a checkpoint.
    ///
    /// # Errors
    /// Returns `OptimErr::UnknownParameter` if a tracked parameter is missing from `params`.
    pub fn reset(&mut self, params: &ParamSet) -> Result<()> {
        for group in &self.groups {
            let Some(p_bound) = group.config.p_bound else {
                continue;
            };

            for &id in &group.params {
                let param = params.get(id).ok_or(OptimErr::UnknownParameter(id))?;
                self.state.entry(id).or_default().max_norm = Some(param.norm() * p_bound);
            }
        }

        info!(groups = self.groups.len(); "reset parameter norm bounds");
        Ok(())
    }

    /// Returns a snapshot of the groups and per-parameter state.
    pub fn state_dict(&self) -> StateDict {
        let mut state: Vec<_> = self.state.iter().map(|(&id, &s)| (id, s)).collect();
        state.sort_by_key(|(id, _)| *id);

        StateDict {
            groups: self.groups.clone(),
            state,
        }
    }

    /// Restores a snapshot taken with `state_dict` on an optimizer with the same groups.
    ///
    /// # Errors
    /// Returns `OptimErr::StateMismatch` if the group layout differs,
    /// `OptimErr::UnknownParameter` if the state names an untracked parameter and
    /// `OptimErr::InvalidConfig` if a stored hyperparameter is invalid, or a stored norm bound is
    /// negative, not finite or belongs to a group without `p_bound`.
    pub fn load_state_dict(&mut self, dict: StateDict) -> Result<()> {
        if dict.groups.len() != self.groups.len() {
            return Err(OptimErr::StateMismatch {
                what: "parameter groups",
                got: dict.groups.len(),
                expected: self.groups.len(),
            });
        }

        for (loaded, group) in dict.groups.iter().zip(&self.groups) {
            if loaded.params != group.params {
                return Err(OptimErr::StateMismatch {
                    what: "group members",
                    got: loaded.params.len(),
                    expected: group.params.len(),
                });
            }
            loaded.config.validate()?;
        }

        for &(id, param_state) in &dict.state {
            let group = dict
                .groups
                .iter()
                .find(|group| group.params.contains(&id))
                .ok_or(OptimErr::UnknownParameter(id))?;

            if let Some(max_norm) = param_state.max_norm {
                if group.config.p_bound.is_none() || !max_norm.is_finite() || max_norm < 0.0 {
                    return Err(OptimErr::InvalidConfig {
                        what: "max_norm",
                        value: max_norm,
                    });
                }
            }
        }

        self.groups = dict.groups;
        self.state = dict.state.into_iter().collect();

        info!(groups = self.groups.len(), params = self.state.len(); "loaded optimizer state");
        Ok(())
    }
}

/// Applies one Fromage update to a single parameter.
///
/// A parameter without gradient is left untouched. Nothing is modified when an error is
/// returned.
fn update(
    value: &mut ArrayD<f32>,
    grad: Option<&Grad>,
    state: &mut HashMap<ParamId, ParamState>,
    id: ParamId,
    config: GroupConfig,
    prefactor: f32,
) -> Result<()> {
    let grad = match grad {
        None => return Ok(()),
        Some(Grad::Sparse(_)) => {
            return Err(OptimErr::UnsupportedGradient {
                optimizer: Fromage::NAME,
            });
        }
        Some(Grad::Dense(grad)) => grad,
    };

    if grad.shape() != value.shape() {
        return Err(OptimErr::ShapeMismatch {
            what: "gradient",
            got: grad.len(),
            expected: value.len(),
        });
    }

    let p_norm = l2_norm_wide(value.view());
    let g_norm = l2_norm_wide(grad.view());

    // Bounds are established lazily, only if no previous bound exists.
    let max_norm = config.p_bound.map(|p_bound| {
        *state
            .entry(id)
            .or_default()
            .max_norm
            .get_or_insert(p_norm as f32 * p_bound)
    });

    let lr = config.lr;
    let ratio = if p_norm > 0.0 && g_norm > 0.0 {
        p_norm / g_norm
    } else {
        1.0
    };

    for (w, g) in value.iter_mut().zip(grad) {
        let step = (f64::from(*g) * ratio) as f32;
        *w = (*w - lr * step) / prefactor;
    }

    if let Some(max_norm) = max_norm {
        let norm = l2_norm_wide(value.view());
        if norm > f64::from(max_norm) {
            trace!(param:% = id, norm = norm, max_norm = max_norm; "projecting onto norm bound");
            let scale = f64::from(max_norm) / norm;
            value.mapv_inplace(|w| (f64::from(w) * scale) as f32);
        }
    }

    Ok(())
}

impl Optimizer for Fromage {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn step(
        &mut self,
        params: &mut ParamSet,
        closure: Option<Closure<'_>>,
    ) -> Result<Option<f32>> {
        let loss = match closure {
            Some(closure) => Some(closure(params)),
            None => None,
        };

        for (i, group) in self.groups.iter().enumerate() {
            let prefactor = group.config.prefactor();
            debug!(group = i, lr = group.config.lr, prefactor = prefactor; "applying update");

            for &id in &group.params {
                let param = params.get_mut(id).ok_or(OptimErr::UnknownParameter(id))?;
                let (value, grad) = param.parts_mut();
                update(value, grad, &mut self.state, id, group.config, prefactor)?;
            }
        }

        Ok(loss)
    }

    fn zero_grad(&self, params: &mut ParamSet) {
        for id in self.groups.iter().flat_map(|group| &group.params) {
            if let Some(param) = params.get_mut(*id) {
                param.clear_grad();
            }
        }
    }
}

impl fmt::Display for Fromage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Self::NAME)
    }
}

#[cfg(test)]
mod tests {
    use ndarray::arr1;

    use super::*;
    use crate::tensor::SparseGrad;

    const TOL: f32 = 1e-5;

    fn scalar_setup(p: f32, g: f32) -> (ParamSet, ParamId) {
        let mut params = ParamSet::new();
        let id = params.register(arr1(&[p]).into_dyn());
        params
            .get_mut(id)
            .unwrap()
            .set_grad(Grad::Dense(arr1(&[g]).into_dyn()));
        (params, id)
    }

    fn value(params: &ParamSet, id: ParamId) -> Vec<f32> {
        params.get(id).unwrap().value().iter().copied().collect()
    }

    #[test]
    fn name() {
        let fromage = Fromage::new(Vec::<ParamGroup>::new(), 0.1, None).unwrap();
        assert_eq!(fromage.name(), "Fromage");
        assert_eq!(fromage.to_string(), "Fromage");
    }

    #[test]
    fn rejects_non_positive_lr() {
        for lr in [0.0, -0.1, f32::NAN] {
            assert!(matches!(
                Fromage::new(Vec::<ParamGroup>::new(), lr, None),
                Err(OptimErr::InvalidConfig { what: "learning rate", .. })
            ));
        }
    }

    #[test]
    fn rejects_non_positive_p_bound() {
        assert!(matches!(
            Fromage::new(Vec::<ParamGroup>::new(), 0.1, Some(0.0)),
            Err(OptimErr::InvalidConfig { what: "p_bound", .. })
        ));
    }

    #[test]
    fn rejects_parameter_in_two_groups() {
        let (_, id) = scalar_setup(1.0, 1.0);
        let groups = [ParamGroup::new([id]), ParamGroup::new([id]).with_lr(0.5)];
        assert!(matches!(
            Fromage::new(groups, 0.1, None),
            Err(OptimErr::DuplicateParameter(dup)) if dup == id
        ));
    }

    #[test]
    fn scalar_norm_ratio_step() {
        let (mut params, id) = scalar_setup(4.0, 2.0);
        let mut fromage = Fromage::new([ParamGroup::new([id])], 0.1, None).unwrap();

        let loss = fromage.step(&mut params, None).unwrap();

        assert_eq!(loss, None);
        let expected = 3.6 / 1.01f32.sqrt();
        assert!((value(&params, id)[0] - expected).abs() < TOL);
        assert!((value(&params, id)[0] - 3.582134).abs() < TOL);
    }

    #[test]
    fn tiny_and_huge_gradients_take_norm_ratio_step() {
        for g in [1e-25, 1e20] {
            let (mut params, id) = scalar_setup(4.0, g);
            let mut fromage = Fromage::new([ParamGroup::new([id])], 0.1, None).unwrap();

            fromage.step(&mut params, None).unwrap();

            assert!((value(&params, id)[0] - 3.582134).abs() < TOL, "g = {g}");
        }
    }

    #[test]
    fn zero_parameter_takes_plain_step() {
        let (mut params, id) = scalar_setup(0.0, 2.0);
        let mut fromage = Fromage::new([ParamGroup::new([id])], 0.1, None).unwrap();

        fromage.step(&mut params, None).unwrap();

        assert!((value(&params, id)[0] + 0.19901).abs() < TOL);
    }

    #[test]
    fn zero_gradient_only_damps() {
        let (mut params, id) = scalar_setup(3.0, 0.0);
        let mut fromage = Fromage::new([ParamGroup::new([id])], 0.1, None).unwrap();

        fromage.step(&mut params, None).unwrap();

        assert!((value(&params, id)[0] - 3.0 / 1.01f32.sqrt()).abs() < 1e-6);
    }

    #[test]
    fn absent_gradient_is_a_no_op() {
        let mut params = ParamSet::new();
        let id = params.register(arr1(&[0.1f32, -7.25, 3.0]).into_dyn());
        let before = params.get(id).unwrap().clone();
        let mut fromage = Fromage::new([ParamGroup::new([id])], 0.1, Some(0.5)).unwrap();

        fromage.step(&mut params, None).unwrap();

        assert_eq!(params.get(id).unwrap(), &before);
        assert!(fromage.state(id).is_none());
    }

    #[test]
    fn sparse_gradient_is_rejected_untouched() {
        let (mut params, id) = scalar_setup(4.0, 2.0);
        let sparse = SparseGrad::new(vec![1], vec![0], vec![2.0]).unwrap();
        params.get_mut(id).unwrap().set_grad(Grad::Sparse(sparse));
        let mut fromage = Fromage::new([ParamGroup::new([id])], 0.1, Some(2.0)).unwrap();

        let err = fromage.step(&mut params, None).unwrap_err();

        assert!(matches!(
            err,
            OptimErr::UnsupportedGradient { optimizer: "Fromage" }
        ));
        assert_eq!(value(&params, id), [4.0]);
        assert!(fromage.state(id).is_none());
    }

    #[test]
    fn gradient_shape_must_match() {
        let (mut params, id) = scalar_setup(4.0, 2.0);
        params
            .get_mut(id)
            .unwrap()
            .set_grad(Grad::Dense(arr1(&[1.0, 2.0]).into_dyn()));
        let mut fromage = Fromage::new([ParamGroup::new([id])], 0.1, None).unwrap();

        assert!(matches!(
            fromage.step(&mut params, None),
            Err(OptimErr::ShapeMismatch { got: 2, expected: 1, .. })
        ));
        assert_eq!(value(&params, id), [4.0]);
    }

    #[test]
    fn unknown_parameter() {
        let (mut params, id) = scalar_setup(4.0, 2.0);
        let mut fromage = Fromage::new([ParamGroup::new([id])], 0.1, None).unwrap();
        params.remove(id);

        assert!(matches!(
            fromage.step(&mut params, None),
            Err(OptimErr::UnknownParameter(missing)) if missing == id
        ));
        assert!(matches!(
            fromage.reset(&params),
            Err(OptimErr::UnknownParameter(_))
        ));
    }

    #[test]
    fn lazy_bound_uses_first_seen_norm() {
        let (mut params, id) = scalar_setup(1.0, 1.0);
        let mut fromage = Fromage::new([ParamGroup::new([id])], 0.1, Some(2.0)).unwrap();

        fromage.step(&mut params, None).unwrap();
        assert_eq!(fromage.state(id).unwrap().max_norm, Some(2.0));

        // A later step with a different norm keeps the first bound.
        params.get_mut(id).unwrap().value_mut()[0] = 1.5;
        fromage.step(&mut params, None).unwrap();
        assert_eq!(fromage.state(id).unwrap().max_norm, Some(2.0));
    }

    #[test]
    fn reset_overwrites_bound() {
        let (mut params, id) = scalar_setup(1.0, 1.0);
        let mut fromage = Fromage::new([ParamGroup::new([id])], 0.1, Some(2.0)).unwrap();
        fromage.step(&mut params, None).unwrap();

        params.get_mut(id).unwrap().value_mut()[0] = -4.0;
        fromage.reset(&params).unwrap();

        assert_eq!(fromage.state(id).unwrap().max_norm, Some(8.0));
    }

    #[test]
    fn reset_skips_unbounded_groups() {
        let (params, id) = scalar_setup(1.0, 1.0);
        let mut fromage = Fromage::new([ParamGroup::new([id])], 0.1, None).unwrap();

        fromage.reset(&params).unwrap();

        assert!(fromage.state(id).is_none());
    }

    #[test]
    fn projection_onto_bound() {
        let (mut params, id) = scalar_setup(1.0, 0.0);
        let mut fromage = Fromage::new([ParamGroup::new([id])], 1e-3, Some(2.0)).unwrap();
        fromage.reset(&params).unwrap();

        // The loop pushes the parameter well past its bound between steps.
        params.get_mut(id).unwrap().value_mut()[0] = -3.0;
        fromage.step(&mut params, None).unwrap();

        let after = value(&params, id)[0];
        assert!((after + 2.0).abs() < TOL);
    }

    #[test]
    fn closure_loss_is_returned() {
        let (mut params, id) = scalar_setup(4.0, 0.0);
        let mut fromage = Fromage::new([ParamGroup::new([id])], 0.1, None).unwrap();

        let mut closure = |params: &mut ParamSet| {
            let param = params.get_mut(id).unwrap();
            let w = param.value()[0];
            param.set_grad(Grad::Dense(arr1(&[2.0 * w]).into_dyn()));
            w * w
        };
        let loss = fromage.step(&mut params, Some(&mut closure)).unwrap();

        assert_eq!(loss, Some(16.0));
        // The closure's gradient (8.0) was the one applied.
        assert!((value(&params, id)[0] - 3.582134).abs() < TOL);
    }

    #[test]
    fn group_overrides_apply() {
        let mut params = ParamSet::new();
        let a = params.register(arr1(&[4.0f32]).into_dyn());
        let b = params.register(arr1(&[4.0f32]).into_dyn());
        for id in [a, b] {
            params
                .get_mut(id)
                .unwrap()
                .set_grad(Grad::Dense(arr1(&[2.0]).into_dyn()));
        }

        let groups = [ParamGroup::new([a]), ParamGroup::new([b]).with_lr(0.5)];
        let mut fromage = Fromage::new(groups, 0.1, None).unwrap();
        fromage.step(&mut params, None).unwrap();

        assert!((value(&params, a)[0] - 3.6 / 1.01f32.sqrt()).abs() < TOL);
        assert!((value(&params, b)[0] - 2.0 / 1.25f32.sqrt()).abs() < TOL);
    }

    #[test]
    fn set_lr() {
        let (_, id) = scalar_setup(1.0, 1.0);
        let groups = [ParamGroup::new([id]).with_lr(0.5)];
        let mut fromage = Fromage::new(groups, 0.1, None).unwrap();

        fromage.set_lr(0.01).unwrap();
        assert_eq!(fromage.lr(), 0.01);
        assert_eq!(fromage.param_groups()[0].config.lr, 0.01);

        assert!(fromage.set_lr(0.0).is_err());
        assert_eq!(fromage.lr(), 0.01);
    }

    #[test]
    fn zero_grad_clears_tracked_gradients() {
        let (mut params, id) = scalar_setup(1.0, 1.0);
        let fromage = Fromage::new([ParamGroup::new([id])], 0.1, None).unwrap();

        fromage.zero_grad(&mut params);

        assert!(params.get(id).unwrap().grad().is_none());
    }

    #[test]
    fn load_state_dict_requires_same_layout() {
        let (_, id) = scalar_setup(1.0, 1.0);
        let fromage = Fromage::new([ParamGroup::new([id])], 0.1, Some(2.0)).unwrap();
        let dict = fromage.state_dict();

        let mut other = Fromage::new(Vec::<ParamGroup>::new(), 0.1, Some(2.0)).unwrap();
        assert!(matches!(
            other.load_state_dict(dict),
            Err(OptimErr::StateMismatch { what: "parameter groups", got: 1, expected: 0 })
        ));
    }

    #[test]
    fn load_state_dict_rejects_invalid_bounds() {
        let (mut params, id) = scalar_setup(1.0, 0.0);
        let mut fromage = Fromage::new([ParamGroup::new([id])], 0.1, Some(2.0)).unwrap();

        for max_norm in [-2.0, f32::NAN, f32::INFINITY] {
            let mut dict = fromage.state_dict();
            dict.state = vec![(id, ParamState { max_norm: Some(max_norm) })];

            assert!(matches!(
                fromage.load_state_dict(dict),
                Err(OptimErr::InvalidConfig { what: "max_norm", .. })
            ));
        }

        // The rejected bounds were never installed, so the sign survives.
        fromage.step(&mut params, None).unwrap();
        assert!(value(&params, id)[0] > 0.0);
        assert_eq!(fromage.state(id).unwrap().max_norm, Some(2.0));
    }

    #[test]
    fn load_state_dict_rejects_bound_on_unbounded_group() {
        let (_, id) = scalar_setup(1.0, 0.0);
        let mut fromage = Fromage::new([ParamGroup::new([id])], 0.1, None).unwrap();

        let mut dict = fromage.state_dict();
        dict.state = vec![(id, ParamState { max_norm: Some(2.0) })];

        assert!(matches!(
            fromage.load_state_dict(dict),
            Err(OptimErr::InvalidConfig { what: "max_norm", value }) if value == 2.0
        ));
    }

    #[test]
    fn forget_drops_state() {
        let (mut params, id) = scalar_setup(1.0, 1.0);
        let mut fromage = Fromage::new([ParamGroup::new([id])], 0.1, Some(2.0)).unwrap();
        fromage.step(&mut params, None).unwrap();

        assert!(fromage.forget(id).is_some());
        assert!(fromage.state(id).is_none());
    }
}
