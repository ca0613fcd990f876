use log::Level;
use std::time::{Duration, Instant};

use control_model::{
    Control, ControlModel, InputVector, KinematicBicycle, ReferenceCurve, StateField, VehicleState,
};
use crate::config::{InitialGuess, MpcConfig};
use crate::error::MpcError;
use crate::evaluator::{CostBreakdown, Evaluator};
use crate::layout::Layout;
use nlp::{AlmSolver, Failure, NlpSolver, Problem, Status};
use prelude::flame;
use prelude::*;

/// Slack allowed on the actuator bounds before a command is considered degenerate.
const BOUND_TOLERANCE: float = 1e-6;

#[derive(Clone, Debug, PartialEq)]
pub enum SolveStatus {
    /// The solver reached a feasible optimum.
    Converged,
    /// The solver stopped early. The command is its best iterate and may be suboptimal.
    NotConverged(Failure),
    /// The iterate was unusable (non-finite, or outside the actuator bounds). The command is the
    /// safe `Control::default()`. Carries what the solver reported.
    Degenerate(Status),
}

impl SolveStatus {
    pub fn is_converged(&self) -> bool {
        *self == SolveStatus::Converged
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SolveStats {
    pub outer_iterations: usize,
    pub inner_iterations: usize,
    pub solve_time: Duration,
}

#[derive(Clone, Debug)]
pub struct SolveResult {
    /// Command for the next step, with the configured steering convention applied.
    pub control: Control,
    pub status: SolveStatus,
    /// Predicted `(x, y)` for horizon steps `1..N`. Diagnostic only.
    pub predicted: Vec<(float, float)>,
    pub cost: float,
    pub breakdown: CostBreakdown,
    pub stats: SolveStats,
    /// Raw solution vector, indexed by `NonlinearMpc::layout()`.
    pub decision: Vec<float>,
}

/// Builds a reference curve from the coefficient sequence produced by the path fit, lowest order
/// first.
pub fn curve_from_coefficients(coeffs: &[float]) -> Result<ReferenceCurve, MpcError> {
    let curve = ReferenceCurve::from_coefficients(coeffs).ok_or(MpcError::CoefficientCount {
        expected: ReferenceCurve::NUM_COEFFS,
        actual: coeffs.len(),
    })?;
    if !curve.is_finite() {
        return Err(MpcError::NonFiniteCurve);
    }
    Ok(curve)
}

/// Single shot nonlinear MPC. Each call to `solve` is a cold start from the supplied state; no
/// solver state is carried between calls.
pub struct NonlinearMpc<M: ControlModel = KinematicBicycle, S: NlpSolver = AlmSolver> {
    config: MpcConfig,
    layout: Layout,
    model: M,
    solver: S,
}

impl NonlinearMpc {
    pub fn new(config: MpcConfig) -> Result<NonlinearMpc, MpcError> {
        NonlinearMpc::with_solver(config, AlmSolver)
    }
}

impl<S: NlpSolver> NonlinearMpc<KinematicBicycle, S> {
    pub fn with_solver(config: MpcConfig, solver: S) -> Result<NonlinearMpc<KinematicBicycle, S>, MpcError> {
        let model = KinematicBicycle::new(
            config.lf,
            config.bounds.max_steering(),
            config.bounds.max_acceleration,
        );
        NonlinearMpc::from_parts(config, model, solver)
    }
}

impl<M: ControlModel, S: NlpSolver> NonlinearMpc<M, S> {
    pub fn from_parts(config: MpcConfig, model: M, solver: S) -> Result<NonlinearMpc<M, S>, MpcError> {
        config.validate()?;
        let layout = Layout::new(config.horizon)?;
        debug!(
            "{} mpc: horizon {}, {} variables, {} constraints",
            M::name(),
            layout.horizon(),
            layout.n_vars(),
            layout.n_constraints()
        );
        Ok(NonlinearMpc {
            config,
            layout,
            model,
            solver,
        })
    }

    pub fn config(&self) -> &MpcConfig {
        &self.config
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    /// Every predicted state set to `state`, every control zero.
    pub fn initial_guess(&self, state: &VehicleState) -> Vec<float> {
        let mut x = vec![0.0; self.layout.n_vars()];
        for t in 0..self.layout.horizon() {
            for &field in StateField::ALL.iter() {
                x[self.layout.state(field, t)] = state.get(field);
            }
        }
        x
    }

    /// Predicted states from rolling the model forward from `state` with zero controls, every
    /// control zero. The dynamics constraints hold exactly at this point.
    pub fn rollout_guess(&self, state: &VehicleState, curve: &ReferenceCurve) -> Vec<float> {
        let l = &self.layout;
        let bound = self.config.state_bound;
        let mut x = vec![0.0; l.n_vars()];
        let u = InputVector::<float>::zeros();
        let mut s = state.to_vector();
        for t in 0..l.horizon() {
            if t > 0 {
                s = self.model.step(self.config.dt, curve, &s, &u);
            }
            for &field in StateField::ALL.iter() {
                x[l.state(field, t)] = min(max(s[field.index()], -bound), bound);
            }
        }
        x
    }

    pub fn variable_bounds(&self) -> (Vec<float>, Vec<float>) {
        let l = &self.layout;
        let mut x_min = vec![-self.config.state_bound; l.n_vars()];
        let mut x_max = vec![self.config.state_bound; l.n_vars()];

        let (u_min, u_max) = self.model.input_bounds();
        for t in 0..l.n_controls() {
            for (k, &i) in l.input_indices(t).iter().enumerate() {
                x_min[i] = u_min[k];
                x_max[i] = u_max[k];
            }
        }

        (x_min, x_max)
    }

    /// Zero width intervals: the measured state for block 0, zero for every dynamics residual.
    pub fn constraint_bounds(&self, state: &VehicleState) -> (Vec<float>, Vec<float>) {
        let mut g = vec![0.0; self.layout.n_constraints()];
        for &field in StateField::ALL.iter() {
            g[self.layout.constraint(field, 0)] = state.get(field);
        }
        (g.clone(), g)
    }

    pub fn solve(&self, state: &VehicleState, curve: &ReferenceCurve) -> Result<SolveResult, MpcError> {
        self.solve_within(state, curve, self.config.solver.time_limit())
    }

    /// As `solve`, with the time budget also capped at `deadline`. A deadline already passed
    /// still returns a command.
    pub fn solve_with_deadline(
        &self,
        state: &VehicleState,
        curve: &ReferenceCurve,
        deadline: Instant,
    ) -> Result<SolveResult, MpcError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let time_limit = min(self.config.solver.time_limit(), remaining);
        self.solve_within(state, curve, time_limit)
    }

    fn solve_within(
        &self,
        state: &VehicleState,
        curve: &ReferenceCurve,
        time_limit: Duration,
    ) -> Result<SolveResult, MpcError> {
        let _guard = flame::start_guard("controller step");

        if let Some(field) = state.non_finite_field() {
            return Err(MpcError::NonFiniteState { field: field.name() });
        }
        if !curve.is_finite() {
            return Err(MpcError::NonFiniteCurve);
        }

        let guard = flame::start_guard("mpc setup");
        let evaluator = Evaluator::new(&self.layout, &self.model, curve, &self.config);
        let mut x = match self.config.solver.initial_guess {
            InitialGuess::Broadcast => self.initial_guess(state),
            InitialGuess::Rollout => self.rollout_guess(state, curve),
        };
        let (x_min, x_max) = self.variable_bounds();
        let (g_min, g_max) = self.constraint_bounds(state);
        let problem = Problem::new(&evaluator, &x_min, &x_max, &g_min, &g_max);
        let settings = nlp::Settings {
            cost_scale: self.config.weights.cost_scale(),
            ..self.config.solver.settings(time_limit)
        };
        guard.end();

        let guard = flame::start_guard("mpc solve");
        let outcome = self.solver.solve(&problem, &settings, &mut x);
        guard.end();

        let _guard = flame::start_guard("mpc extract");
        let l = &self.layout;
        let command = Control {
            steering_angle: x[l.steering(0)],
            acceleration: x[l.acceleration(0)],
        };

        let (u_min, u_max) = self.model.input_bounds();
        let unusable = if !command.is_finite() {
            Some("non-finite")
        } else if !command.within(&u_min, &u_max, BOUND_TOLERANCE) {
            debug_assert!(
                !outcome.status.is_converged(),
                "converged solve outside the variable bounds"
            );
            Some("out of bounds")
        } else {
            None
        };

        let (control, status) = match unusable {
            Some(reason) => {
                error!(
                    "{} command {:?} ({:?}), actuator bounds [{:?}, {:?}], using safe command",
                    reason,
                    command,
                    outcome.status,
                    u_min.as_slice(),
                    u_max.as_slice()
                );
                (Control::default(), SolveStatus::Degenerate(outcome.status))
            }
            None => {
                let control = Control {
                    steering_angle: self.config.steering_convention.apply(command.steering_angle),
                    acceleration: command.acceleration,
                };
                match outcome.status {
                    Status::Converged => (control, SolveStatus::Converged),
                    Status::NotConverged(failure) => {
                        warn!("mpc solve not converged ({}), using best iterate", failure);
                        (control, SolveStatus::NotConverged(failure))
                    }
                }
            }
        };

        let predicted = (1..l.horizon())
            .map(|t| (x[l.state(StateField::X, t)], x[l.state(StateField::Y, t)]))
            .collect();
        let breakdown = evaluator.cost_breakdown(&x);
        let cost = breakdown.total();

        let level = if self.config.solver.verbose {
            Level::Info
        } else {
            Level::Debug
        };
        log!(
            level,
            "mpc: {:?}, cost {:.4} ({:?}), command ({:.4}, {:.4}), {} outer / {} inner iterations in {:?}",
            status,
            cost,
            breakdown,
            control.steering_angle,
            control.acceleration,
            outcome.outer_iterations,
            outcome.inner_iterations,
            outcome.solve_time
        );

        Ok(SolveResult {
            control,
            status,
            predicted,
            cost,
            breakdown,
            stats: SolveStats {
                outer_iterations: outcome.outer_iterations,
                inner_iterations: outcome.inner_iterations,
                solve_time: outcome.solve_time,
            },
            decision: x,
        })
    }
}
