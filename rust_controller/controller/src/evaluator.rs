use serde::Deserialize;

use control_model::{ControlModel, ReferenceCurve, StateField, NI, NS};
use crate::config::{CostWeights, MpcConfig};
use crate::layout::Layout;
use nlp::Evaluate;
use prelude::*;

const REF_CTE: float = 0.0;
const REF_EPSI: float = 0.0;

/// Variables one transition residual depends on: the state and input at step t.
const NX: usize = NS + NI;

/// How exact derivatives are propagated through the cost and constraints.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DerivativeMode {
    /// Seed every decision variable in turn and evaluate the whole problem.
    Dense,
    /// Seed only the handful of variables each cost term or transition depends on.
    Sparse,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CostBreakdown {
    /// Cross track, heading and speed error.
    pub tracking: float,
    /// Actuator magnitude.
    pub effort: float,
    /// Change in actuation between consecutive steps.
    pub smoothness: float,
}

impl CostBreakdown {
    pub fn total(&self) -> float {
        self.tracking + self.effort + self.smoothness
    }
}

/// Cost and constraint residuals of one solve as functions of the decision vector.
pub struct Evaluator<'a, M: 'a + ControlModel> {
    layout: &'a Layout,
    model: &'a M,
    curve: &'a ReferenceCurve,
    weights: &'a CostWeights,
    dt: float,
    ref_v: float,
    mode: DerivativeMode,
}

impl<'a, M: ControlModel> Evaluator<'a, M> {
    pub fn new(
        layout: &'a Layout,
        model: &'a M,
        curve: &'a ReferenceCurve,
        config: &'a MpcConfig,
    ) -> Evaluator<'a, M> {
        Evaluator {
            layout,
            model,
            curve,
            weights: &config.weights,
            dt: config.dt,
            ref_v: config.ref_v,
            mode: config.solver.derivatives,
        }
    }

    pub fn with_mode(mut self, mode: DerivativeMode) -> Evaluator<'a, M> {
        self.mode = mode;
        self
    }

    fn tracking_cost<T: Real>(&self, cte: T, epsi: T, v: T) -> T {
        let w = self.weights;
        square(cte - REF_CTE) * w.cte + square(epsi - REF_EPSI) * w.epsi + square(v - self.ref_v) * w.v
    }

    fn effort_cost<T: Real>(&self, delta: T, a: T) -> T {
        let w = self.weights;
        square(delta) * w.steering + square(a) * w.acceleration
    }

    fn smoothness_cost<T: Real>(&self, delta0: T, a0: T, delta1: T, a1: T) -> T {
        let w = self.weights;
        square(delta1 - delta0) * w.steering_rate + square(a1 - a0) * w.acceleration_rate
    }

    /// Returns `[tracking, effort, smoothness]`.
    fn cost_terms<T: Real>(&self, vars: &[T]) -> [T; 3] {
        let l = self.layout;
        let zero = T::from(0.0);
        let mut terms = [zero; 3];

        for t in 0..l.horizon() {
            terms[0] = terms[0] + self.tracking_cost(
                vars[l.state(StateField::Cte, t)],
                vars[l.state(StateField::Epsi, t)],
                vars[l.state(StateField::V, t)],
            );
        }

        for t in 0..l.n_controls() {
            terms[1] = terms[1] + self.effort_cost(vars[l.steering(t)], vars[l.acceleration(t)]);
        }

        for t in 0..l.n_controls() - 1 {
            terms[2] = terms[2] + self.smoothness_cost(
                vars[l.steering(t)],
                vars[l.acceleration(t)],
                vars[l.steering(t + 1)],
                vars[l.acceleration(t + 1)],
            );
        }

        terms
    }

    pub fn cost_of<T: Real>(&self, vars: &[T]) -> T {
        let [tracking, effort, smoothness] = self.cost_terms(vars);
        tracking + effort + smoothness
    }

    pub fn cost_breakdown(&self, vars: &[float]) -> CostBreakdown {
        let [tracking, effort, smoothness] = self.cost_terms(vars);
        CostBreakdown {
            tracking,
            effort,
            smoothness,
        }
    }

    /// Residuals: the initial state in block 0, then `x(t+1) - f(x(t), u(t))` for each step.
    pub fn constraints_of<T: Real>(&self, vars: &[T], g: &mut [T]) {
        let l = self.layout;
        debug_assert_eq!(g.len(), l.n_constraints());

        for &field in StateField::ALL.iter() {
            g[l.constraint(field, 0)] = vars[l.state(field, 0)];
        }

        for t in 0..l.n_controls() {
            let x0 = l.gather_state(vars, t);
            let u0 = l.gather_input(vars, t);
            let x1 = l.gather_state(vars, t + 1);
            let x1_model = self.model.step(self.dt, self.curve, &x0, &u0);
            for &field in StateField::ALL.iter() {
                let i = field.index();
                g[l.constraint(field, t + 1)] = x1[i] - x1_model[i];
            }
        }
    }

    fn cost_gradient_dense(&self, x: &[float], grad: &mut [float]) {
        let mut duals: Vec<Dual64> = x.iter().map(|&v| Dual64::from(v)).collect();
        for i in 0..x.len() {
            duals[i].eps = 1.0;
            grad[i] = self.cost_of(&duals).eps;
            duals[i].eps = 0.0;
        }
    }

    fn cost_gradient_sparse(&self, x: &[float], grad: &mut [float]) {
        let l = self.layout;
        grad.iter_mut().for_each(|g| *g = 0.0);

        for t in 0..l.horizon() {
            let indices = [
                l.state(StateField::Cte, t),
                l.state(StateField::Epsi, t),
                l.state(StateField::V, t),
            ];
            accumulate_gradient(x, &indices, grad, |z| self.tracking_cost(z[0], z[1], z[2]));
        }

        for t in 0..l.n_controls() {
            let indices = l.input_indices(t);
            accumulate_gradient(x, &indices, grad, |z| self.effort_cost(z[0], z[1]));
        }

        for t in 0..l.n_controls() - 1 {
            let indices = [
                l.steering(t),
                l.acceleration(t),
                l.steering(t + 1),
                l.acceleration(t + 1),
            ];
            accumulate_gradient(x, &indices, grad, |z| {
                self.smoothness_cost(z[0], z[1], z[2], z[3])
            });
        }
    }

    fn jacobian_product_dense(&self, x: &[float], d: &[float], out: &mut [float]) {
        let mut duals: Vec<Dual64> = x.iter().map(|&v| Dual64::from(v)).collect();
        let mut g = vec![Dual64::from(0.0); self.layout.n_constraints()];
        for i in 0..x.len() {
            duals[i].eps = 1.0;
            self.constraints_of(&duals, &mut g);
            out[i] = g.iter().zip(d).map(|(g, d)| g.eps * d).sum();
            duals[i].eps = 0.0;
        }
    }

    /// Jacobian of `f(x(t), u(t))` with respect to `[x(t), u(t)]`.
    pub fn transition_jacobian(&self, x: &[float], t: usize) -> Matrix<NS, NX> {
        let l = self.layout;
        let x0 = l.gather_state(x, t).map(Dual64::from);
        let u0 = l.gather_input(x, t).map(Dual64::from);

        let mut jac = Matrix::<NS, NX>::zeros();
        for k in 0..NX {
            let (mut xs, mut us) = (x0, u0);
            if k < NS {
                xs[k].eps = 1.0;
            } else {
                us[k - NS].eps = 1.0;
            }
            let x1 = self.model.step(self.dt, self.curve, &xs, &us);
            for j in 0..NS {
                jac[(j, k)] = x1[j].eps;
            }
        }
        jac
    }

    fn jacobian_product_sparse(&self, x: &[float], d: &[float], out: &mut [float]) {
        let l = self.layout;
        out.iter_mut().for_each(|o| *o = 0.0);

        // Initial state block is the identity
        for &field in StateField::ALL.iter() {
            out[l.state(field, 0)] += d[l.constraint(field, 0)];
        }

        for t in 0..l.n_controls() {
            let d_t: Vector<NS> =
                Vector::<NS>::from_fn(|j, _| d[l.constraint(StateField::ALL[j], t + 1)]);

            // x(t+1) enters its residual with unit coefficient
            for (&i, &d_j) in l.state_indices(t + 1).iter().zip(d_t.iter()) {
                out[i] += d_j;
            }

            let jac_t_d = self.transition_jacobian(x, t).transpose() * d_t;
            let state_indices = l.state_indices(t);
            let input_indices = l.input_indices(t);
            let local = state_indices.iter().chain(input_indices.iter());
            for (&i, &v) in local.zip(jac_t_d.iter()) {
                out[i] -= v;
            }
        }
    }
}

/// Adds the gradient of `f` with respect to the variables at `indices` into `grad`.
fn accumulate_gradient<const K: usize, F>(
    x: &[float],
    indices: &[usize; K],
    grad: &mut [float],
    f: F,
) where
    F: Fn(&[Dual64; K]) -> Dual64,
{
    let mut z = indices.map(|i| Dual64::from(x[i]));
    for k in 0..K {
        z[k].eps = 1.0;
        grad[indices[k]] += f(&z).eps;
        z[k].eps = 0.0;
    }
}

impl<'a, M: ControlModel> Evaluate for Evaluator<'a, M> {
    fn n_vars(&self) -> usize {
        self.layout.n_vars()
    }

    fn n_constraints(&self) -> usize {
        self.layout.n_constraints()
    }

    fn cost(&self, x: &[float]) -> float {
        self.cost_of(x)
    }

    fn cost_gradient(&self, x: &[float], grad: &mut [float]) {
        match self.mode {
            DerivativeMode::Dense => self.cost_gradient_dense(x, grad),
            DerivativeMode::Sparse => self.cost_gradient_sparse(x, grad),
        }
    }

    fn constraints(&self, x: &[float], g: &mut [float]) {
        self.constraints_of(x, g)
    }

    fn constraints_jacobian_transpose_product(&self, x: &[float], d: &[float], out: &mut [float]) {
        match self.mode {
            DerivativeMode::Dense => self.jacobian_product_dense(x, d, out),
            DerivativeMode::Sparse => self.jacobian_product_sparse(x, d, out),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use control_model::{InputVector, KinematicBicycle, StateVector, VehicleState};

    fn model(config: &MpcConfig) -> KinematicBicycle {
        KinematicBicycle::new(
            config.lf,
            config.bounds.max_steering(),
            config.bounds.max_acceleration,
        )
    }

    /// A decision vector with arbitrary but smooth values in every slot.
    fn wiggly_vars(layout: &Layout) -> Vec<float> {
        (0..layout.n_vars())
            .map(|i| 0.3 * (i as float * 0.7).sin() + 0.05 * i as float)
            .collect()
    }

    /// States rolled out through the model from `state` under the given controls.
    fn rollout(
        layout: &Layout,
        model: &KinematicBicycle,
        curve: &ReferenceCurve,
        dt: float,
        state: &VehicleState,
        controls: &[(float, float)],
    ) -> Vec<float> {
        let mut vars = vec![0.0; layout.n_vars()];
        let mut x = state.to_vector();
        for t in 0..layout.horizon() {
            for (&i, &v) in layout.state_indices(t).iter().zip(x.iter()) {
                vars[i] = v;
            }
            if t < layout.n_controls() {
                let (delta, a) = controls[t];
                vars[layout.steering(t)] = delta;
                vars[layout.acceleration(t)] = a;
                x = model.step(dt, curve, &x, &InputVector::new(delta, a));
            }
        }
        vars
    }

    #[test]
    fn cost_is_zero_on_reference_at_target_speed() {
        let config = MpcConfig::default();
        let layout = Layout::new(config.horizon).unwrap();
        let model = model(&config);
        let curve = ReferenceCurve::straight();
        let evaluator = Evaluator::new(&layout, &model, &curve, &config);

        let state = VehicleState {
            v: config.ref_v,
            ..VehicleState::default()
        };
        let controls = vec![(0.0, 0.0); layout.n_controls()];
        let vars = rollout(&layout, &model, &curve, config.dt, &state, &controls);

        assert_eq!(evaluator.cost(&vars), 0.0);
        let mut grad = vec![1.0; layout.n_vars()];
        evaluator.cost_gradient(&vars, &mut grad);
        assert!(grad.iter().all(|&g| g == 0.0), "{:?}", grad);
    }

    #[test]
    fn cost_terms_match_hand_computation() {
        let mut config = MpcConfig::default();
        config.horizon = 3;
        let layout = Layout::new(3).unwrap();
        let model = model(&config);
        let curve = ReferenceCurve::straight();
        let evaluator = Evaluator::new(&layout, &model, &curve, &config);

        let mut vars = vec![0.0; layout.n_vars()];
        vars[layout.state(StateField::Cte, 1)] = 0.5;
        vars[layout.state(StateField::Epsi, 2)] = -0.1;
        vars[layout.state(StateField::V, 0)] = 48.0;
        vars[layout.steering(0)] = 0.1;
        vars[layout.steering(1)] = 0.3;
        vars[layout.acceleration(1)] = -0.5;

        let w = &config.weights;
        let tracking = w.cte * 0.25
            + w.epsi * 0.01
            + w.v * (4.0 + 2.0 * config.ref_v * config.ref_v);
        let effort = w.steering * (0.01 + 0.09) + w.acceleration * 0.25;
        let smoothness = w.steering_rate * 0.04 + w.acceleration_rate * 0.25;

        let breakdown = evaluator.cost_breakdown(&vars);
        assert!((breakdown.tracking - tracking).abs() < 1e-9, "{:?}", breakdown);
        assert!((breakdown.effort - effort).abs() < 1e-9, "{:?}", breakdown);
        assert!((breakdown.smoothness - smoothness).abs() < 1e-9, "{:?}", breakdown);
        assert!((evaluator.cost(&vars) - breakdown.total()).abs() < 1e-9);
    }

    #[test]
    fn scaling_tracking_weights_scales_tracking_cost() {
        let config = MpcConfig::default();
        let mut heavy = config.clone();
        heavy.weights.cte *= 3.0;
        heavy.weights.epsi *= 3.0;
        heavy.weights.v *= 3.0;

        let layout = Layout::new(config.horizon).unwrap();
        let model = model(&config);
        let curve = ReferenceCurve::new([0.2, 0.1, 0.01, 0.0]);
        let vars = wiggly_vars(&layout);

        let base = Evaluator::new(&layout, &model, &curve, &config).cost_breakdown(&vars);
        let scaled = Evaluator::new(&layout, &model, &curve, &heavy).cost_breakdown(&vars);

        assert!((scaled.tracking - 3.0 * base.tracking).abs() < 1e-6 * base.tracking);
        assert_eq!(scaled.effort, base.effort);
        assert_eq!(scaled.smoothness, base.smoothness);
    }

    #[test]
    fn rolled_out_trajectory_satisfies_dynamics() {
        let config = MpcConfig::default();
        let layout = Layout::new(config.horizon).unwrap();
        let model = model(&config);
        let curve = ReferenceCurve::new([0.5, -0.1, 0.02, -0.001]);
        let evaluator = Evaluator::new(&layout, &model, &curve, &config);

        let state = VehicleState {
            x: 1.0,
            y: 0.3,
            psi: 0.05,
            v: 20.0,
            cte: 0.2,
            epsi: -0.02,
        };
        let controls: Vec<_> = (0..layout.n_controls())
            .map(|t| (0.05 * (t as float).cos(), 0.3 - 0.1 * t as float))
            .collect();
        let vars = rollout(&layout, &model, &curve, config.dt, &state, &controls);

        let mut g = vec![0.0; layout.n_constraints()];
        evaluator.constraints(&vars, &mut g);

        for &field in StateField::ALL.iter() {
            assert_eq!(g[layout.constraint(field, 0)], state.get(field));
            for t in 1..layout.horizon() {
                let r = g[layout.constraint(field, t)];
                assert!(r.abs() < 1e-9, "{} at {}: {}", field.name(), t, r);
            }
        }
    }

    #[test]
    fn perturbed_state_shows_up_in_its_residual() {
        let config = MpcConfig::default();
        let layout = Layout::new(config.horizon).unwrap();
        let model = model(&config);
        let curve = ReferenceCurve::straight();
        let evaluator = Evaluator::new(&layout, &model, &curve, &config);

        let state = VehicleState {
            v: 10.0,
            ..VehicleState::default()
        };
        let controls = vec![(0.0, 0.0); layout.n_controls()];
        let mut vars = rollout(&layout, &model, &curve, config.dt, &state, &controls);
        vars[layout.state(StateField::Y, 4)] += 0.25;

        let mut g = vec![0.0; layout.n_constraints()];
        evaluator.constraints(&vars, &mut g);

        assert!((g[layout.constraint(StateField::Y, 4)] - 0.25).abs() < 1e-12);
        // y(4) feeds y(5) and cte(5) through the model
        assert!((g[layout.constraint(StateField::Y, 5)] + 0.25).abs() < 1e-12);
        assert!((g[layout.constraint(StateField::Cte, 5)] - 0.25).abs() < 1e-12);
    }

    #[test]
    fn dense_and_sparse_cost_gradients_agree() {
        let config = MpcConfig::default();
        let layout = Layout::new(config.horizon).unwrap();
        let model = model(&config);
        let curve = ReferenceCurve::new([0.1, 0.2, -0.03, 0.004]);
        let vars = wiggly_vars(&layout);

        let dense = Evaluator::new(&layout, &model, &curve, &config).with_mode(DerivativeMode::Dense);
        let sparse = Evaluator::new(&layout, &model, &curve, &config).with_mode(DerivativeMode::Sparse);

        let mut grad_dense = vec![0.0; layout.n_vars()];
        let mut grad_sparse = vec![1.0; layout.n_vars()];
        dense.cost_gradient(&vars, &mut grad_dense);
        sparse.cost_gradient(&vars, &mut grad_sparse);

        for i in 0..layout.n_vars() {
            let scale = max(1.0, grad_dense[i].abs());
            assert!(
                (grad_dense[i] - grad_sparse[i]).abs() < 1e-9 * scale,
                "index {}: dense {} sparse {}",
                i,
                grad_dense[i],
                grad_sparse[i]
            );
        }
    }

    #[test]
    fn cost_gradient_matches_analytic_derivative() {
        let config = MpcConfig::default();
        let layout = Layout::new(config.horizon).unwrap();
        let model = model(&config);
        let curve = ReferenceCurve::straight();
        let evaluator = Evaluator::new(&layout, &model, &curve, &config);
        let vars = wiggly_vars(&layout);

        let mut grad = vec![0.0; layout.n_vars()];
        evaluator.cost_gradient(&vars, &mut grad);

        let w = &config.weights;
        let cte = layout.state(StateField::Cte, 3);
        assert!((grad[cte] - 2.0 * w.cte * vars[cte]).abs() < 1e-9);
        let v = layout.state(StateField::V, 5);
        assert!((grad[v] - 2.0 * w.v * (vars[v] - config.ref_v)).abs() < 1e-9);
        // Only the state components in the cost have a gradient
        assert_eq!(grad[layout.state(StateField::X, 2)], 0.0);
        assert_eq!(grad[layout.state(StateField::Psi, 2)], 0.0);

        // Last steering: effort plus one smoothness term
        let n = layout.n_controls();
        let (d0, d1) = (vars[layout.steering(n - 2)], vars[layout.steering(n - 1)]);
        let expected = 2.0 * w.steering * d1 + 2.0 * w.steering_rate * (d1 - d0);
        let actual = grad[layout.steering(n - 1)];
        assert!((actual - expected).abs() < 1e-9 * max(1.0, expected.abs()));
    }

    #[test]
    fn dense_and_sparse_jacobian_products_agree() {
        let config = MpcConfig::default();
        let layout = Layout::new(config.horizon).unwrap();
        let model = model(&config);
        let curve = ReferenceCurve::new([0.3, -0.2, 0.05, -0.002]);
        let vars = wiggly_vars(&layout);
        let d: Vec<float> = (0..layout.n_constraints())
            .map(|i| (i as float * 1.3).cos())
            .collect();

        let dense = Evaluator::new(&layout, &model, &curve, &config).with_mode(DerivativeMode::Dense);
        let sparse = Evaluator::new(&layout, &model, &curve, &config).with_mode(DerivativeMode::Sparse);

        let mut out_dense = vec![0.0; layout.n_vars()];
        let mut out_sparse = vec![1.0; layout.n_vars()];
        dense.constraints_jacobian_transpose_product(&vars, &d, &mut out_dense);
        sparse.constraints_jacobian_transpose_product(&vars, &d, &mut out_sparse);

        for i in 0..layout.n_vars() {
            assert!(
                (out_dense[i] - out_sparse[i]).abs() < 1e-9 * max(1.0, out_dense[i].abs()),
                "index {}: dense {} sparse {}",
                i,
                out_dense[i],
                out_sparse[i]
            );
        }
    }

    #[test]
    fn transition_jacobian_matches_model_partials() {
        let config = MpcConfig::default();
        let layout = Layout::new(config.horizon).unwrap();
        let model = model(&config);
        let curve = ReferenceCurve::straight();
        let evaluator = Evaluator::new(&layout, &model, &curve, &config);

        let mut vars = vec![0.0; layout.n_vars()];
        let psi = 0.3;
        let v = 12.0;
        vars[layout.state(StateField::Psi, 2)] = psi;
        vars[layout.state(StateField::V, 2)] = v;

        let jac = evaluator.transition_jacobian(&vars, 2);
        let dt = config.dt;
        // dx1/dpsi, dx1/dv
        assert!((jac[(0, 2)] + v * psi.sin() * dt).abs() < 1e-12);
        assert!((jac[(0, 3)] - psi.cos() * dt).abs() < 1e-12);
        // dpsi1/ddelta
        assert!((jac[(2, NS)] - v * dt / config.lf).abs() < 1e-12);
        // dv1/da
        assert!((jac[(3, NS + 1)] - dt).abs() < 1e-12);
        // cte1 = f(x) - y + ...: dcte1/dy
        assert!((jac[(4, 1)] + 1.0).abs() < 1e-12);

        let x = StateVector::new(0.0, 0.0, psi, v, 0.0, 0.0);
        let x1 = model.step(dt, &curve, &x, &InputVector::new(0.0, 0.0));
        assert!((x1[0] - v * psi.cos() * dt).abs() < 1e-12);
    }
}
