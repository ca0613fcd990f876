//! Boundary to the general nonlinear constrained solver.
//!
//! Problems have the form
//!
//! ```text
//! minimise    f(x)
//! subject to  x_min <= x    <= x_max
//!             g_min <= g(x) <= g_max
//! ```
//!
//! An equality `g_i(x) = c` is a zero width interval `g_min_i = g_max_i = c`. The solver only
//! calls back into an `Evaluate` implementation and never sees how the problem was built.

#[macro_use]
extern crate log;
extern crate optimization_engine;
extern crate prelude;

use optimization_engine::constraints::Rectangle;
use optimization_engine::core::{ExitStatus, Optimizer, SolverStatus};
use optimization_engine::panoc::{PANOCCache, PANOCOptimizer};
use optimization_engine::SolverError;
use std::time::{Duration, Instant};
use thiserror::Error;

use prelude::flame;
use prelude::*;

type FunctionCallResult = Result<(), SolverError>;

/// Lagrange multipliers are clamped to this magnitude.
const LAGRANGE_MULTIPLIER_BOUND: float = 1e12;

const MAX_PENALTY: float = 1e12;

/// Inner problems are solved loosely at first and tightened towards `Settings::tolerance`.
const INITIAL_INNER_TOLERANCE: float = 1e-2;
const INNER_TOLERANCE_UPDATE: float = 0.1;

/// The penalty is raised unless the constraint violation shrinks by at least this factor.
const SUFFICIENT_DECREASE: float = 0.25;

/// Cost and constraint callbacks with exact first derivatives.
pub trait Evaluate {
    fn n_vars(&self) -> usize;

    fn n_constraints(&self) -> usize;

    fn cost(&self, x: &[float]) -> float;

    fn cost_gradient(&self, x: &[float], grad: &mut [float]);

    fn constraints(&self, x: &[float], g: &mut [float]);

    /// Writes `J(x)^T d` to `out` where `J` is the jacobian of `constraints`.
    fn constraints_jacobian_transpose_product(&self, x: &[float], d: &[float], out: &mut [float]);
}

pub struct Problem<'a, E: 'a + Evaluate> {
    pub evaluator: &'a E,
    pub x_min: &'a [float],
    pub x_max: &'a [float],
    pub g_min: &'a [float],
    pub g_max: &'a [float],
}

impl<'a, E: Evaluate> Problem<'a, E> {
    pub fn new(
        evaluator: &'a E,
        x_min: &'a [float],
        x_max: &'a [float],
        g_min: &'a [float],
        g_max: &'a [float],
    ) -> Problem<'a, E> {
        assert_eq!(x_min.len(), evaluator.n_vars());
        assert_eq!(x_max.len(), evaluator.n_vars());
        assert_eq!(g_min.len(), evaluator.n_constraints());
        assert_eq!(g_max.len(), evaluator.n_constraints());
        Problem {
            evaluator,
            x_min,
            x_max,
            g_min,
            g_max,
        }
    }

    /// Largest distance of any constraint value from its interval.
    pub fn constraint_violation(&self, g: &[float]) -> float {
        g.iter()
            .zip(self.g_min.iter().zip(self.g_max.iter()))
            .map(|(&g, (&lo, &hi))| max(lo - g, max(g - hi, 0.0)))
            .fold(0.0, max)
    }

    /// `w = z - proj(z)` with `z = g + y / c`, the shifted distance to the constraint intervals.
    fn shifted_residual(&self, g: &[float], y: &[float], c: float, w: &mut [float]) {
        for i in 0..g.len() {
            let z = g[i] + y[i] / c;
            w[i] = z - min(max(z, self.g_min[i]), self.g_max[i]);
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Settings {
    /// Stationarity tolerance of the inner problems.
    pub tolerance: float,
    /// Maximum allowed violation of any single constraint.
    pub constraint_tolerance: float,
    pub lbfgs_memory: usize,
    pub max_outer_iterations: usize,
    pub max_inner_iterations: usize,
    pub initial_penalty: float,
    pub penalty_update_factor: float,
    /// The solver minimises `cost_scale * cost`. Brings the cost to roughly unit curvature without
    /// moving the minimiser.
    pub cost_scale: float,
    /// Wall clock cap for one solve. The best iterate is returned once it runs out.
    pub time_limit: Duration,
}

impl Default for Settings {
    fn default() -> Settings {
        Settings {
            tolerance: 1e-4,
            constraint_tolerance: 1e-4,
            lbfgs_memory: 10,
            max_outer_iterations: 50,
            max_inner_iterations: 2000,
            initial_penalty: 10.0,
            penalty_update_factor: 5.0,
            cost_scale: 1.0,
            time_limit: Duration::from_millis(500),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Error)]
pub enum Failure {
    #[error("time limit reached")]
    OutOfTime,
    #[error("iteration limit reached")]
    OutOfIterations,
    #[error("solver error: {0}")]
    Solver(String),
}

#[derive(Clone, Debug, PartialEq)]
pub enum Status {
    Converged,
    NotConverged(Failure),
}

impl Status {
    pub fn is_converged(&self) -> bool {
        *self == Status::Converged
    }
}

#[derive(Clone, Debug)]
pub struct Outcome {
    pub status: Status,
    pub outer_iterations: usize,
    pub inner_iterations: usize,
    pub solve_time: Duration,
}

pub trait NlpSolver {
    /// Solves `problem` starting from `x`, leaving the best iterate in `x` whatever the status.
    ///
    /// `x` is always finite and within the variable bounds on return if it was on entry.
    fn solve<E: Evaluate>(&self, problem: &Problem<E>, settings: &Settings, x: &mut [float])
        -> Outcome;
}

/// Augmented Lagrangian method with PANOC inner solves from `optimization_engine`.
///
/// Each outer iteration minimises
///
/// ```text
/// psi(x) = s f(x) + c/2 dist(g(x) + y/c, [g_min, g_max])^2
/// ```
///
/// over the variable bounds, then updates the multipliers `y` and raises the penalty `c` if the
/// constraint violation did not shrink enough.
#[derive(Clone, Copy, Debug, Default)]
pub struct AlmSolver;

impl NlpSolver for AlmSolver {
    fn solve<E: Evaluate>(
        &self,
        problem: &Problem<E>,
        settings: &Settings,
        x: &mut [float],
    ) -> Outcome {
        let _guard = flame::start_guard("alm solve");
        let solve_start = Instant::now();

        let evaluator = problem.evaluator;
        let n1 = evaluator.n_constraints();
        assert_eq!(x.len(), evaluator.n_vars());

        let mut y = vec![0.0; n1];
        let mut g = vec![0.0; n1];
        let mut w = vec![0.0; n1];
        let mut c = settings.initial_penalty;
        let mut inner_tolerance = max(settings.tolerance, INITIAL_INNER_TOLERANCE);
        let mut last_violation = INFINITY;
        let mut x_good = x.to_vec();
        let mut outer_iterations = 0;
        let mut inner_iterations = 0;

        let status = loop {
            if outer_iterations >= settings.max_outer_iterations {
                break Status::NotConverged(Failure::OutOfIterations);
            }
            let remaining = settings.time_limit.saturating_sub(solve_start.elapsed());
            if remaining.is_zero() {
                break Status::NotConverged(Failure::OutOfTime);
            }
            outer_iterations += 1;

            let inner = solve_inner(problem, settings, &y, c, inner_tolerance, remaining, x);
            let inner = match inner {
                Ok(inner) if x.iter().all(|v| v.is_finite()) => inner,
                Ok(_) => {
                    x.copy_from_slice(&x_good);
                    break Status::NotConverged(Failure::Solver("non-finite iterate".to_string()));
                }
                Err(e) => {
                    x.copy_from_slice(&x_good);
                    break Status::NotConverged(Failure::Solver(format!("{:?}", e)));
                }
            };
            inner_iterations += inner.iterations();
            x_good.copy_from_slice(x);

            evaluator.constraints(x, &mut g);
            problem.shifted_residual(&g, &y, c, &mut w);
            for (y, &w) in y.iter_mut().zip(w.iter()) {
                *y = min(max(c * w, -LAGRANGE_MULTIPLIER_BOUND), LAGRANGE_MULTIPLIER_BOUND);
            }
            let violation = problem.constraint_violation(&g);
            trace!(
                "alm outer {}: violation {:e}, penalty {:e}, inner {:?} after {} iterations",
                outer_iterations,
                violation,
                c,
                inner.exit_status(),
                inner.iterations()
            );

            let inner_tight = inner.has_converged()
                && (inner_tolerance <= settings.tolerance || inner.norm_fpr() <= settings.tolerance);
            if inner_tight && violation <= settings.constraint_tolerance {
                break Status::Converged;
            }
            if matches!(inner.exit_status(), ExitStatus::NotConvergedOutOfTime) {
                break Status::NotConverged(Failure::OutOfTime);
            }

            if violation > SUFFICIENT_DECREASE * last_violation {
                c = min(c * settings.penalty_update_factor, MAX_PENALTY);
            }
            last_violation = violation;
            inner_tolerance = max(settings.tolerance, inner_tolerance * INNER_TOLERANCE_UPDATE);
        };

        let outcome = Outcome {
            status,
            outer_iterations,
            inner_iterations,
            solve_time: solve_start.elapsed(),
        };

        debug!(
            "alm solve: {:?} after {} outer / {} inner iterations in {:?}",
            outcome.status, outcome.outer_iterations, outcome.inner_iterations, outcome.solve_time
        );

        outcome
    }
}

/// Minimises the augmented Lagrangian for fixed multipliers `y` and penalty `c`, starting from
/// and updating `x`.
fn solve_inner<E: Evaluate>(
    problem: &Problem<E>,
    settings: &Settings,
    y: &[float],
    c: float,
    tolerance: float,
    time_limit: Duration,
    x: &mut [float],
) -> Result<SolverStatus, SolverError> {
    let evaluator = problem.evaluator;
    let n = evaluator.n_vars();
    let n1 = evaluator.n_constraints();
    let scale = settings.cost_scale;

    let psi = |u: &[f64], cost: &mut f64| -> FunctionCallResult {
        let mut g = vec![0.0; n1];
        let mut w = vec![0.0; n1];
        evaluator.constraints(u, &mut g);
        problem.shifted_residual(&g, y, c, &mut w);
        let penalty: float = w.iter().map(|w| w * w).sum();
        *cost = scale * evaluator.cost(u) + 0.5 * c * penalty;
        if cost.is_finite() {
            Ok(())
        } else {
            Err(SolverError::NotFiniteComputation)
        }
    };

    let psi_gradient = |u: &[f64], grad: &mut [f64]| -> FunctionCallResult {
        let mut g = vec![0.0; n1];
        let mut w = vec![0.0; n1];
        let mut jtw = vec![0.0; n];
        evaluator.constraints(u, &mut g);
        problem.shifted_residual(&g, y, c, &mut w);
        w.iter_mut().for_each(|w| *w *= c);
        evaluator.constraints_jacobian_transpose_product(u, &w, &mut jtw);
        evaluator.cost_gradient(u, grad);
        for (grad, &jtw) in grad.iter_mut().zip(jtw.iter()) {
            *grad = scale * *grad + jtw;
        }
        if grad.iter().all(|g| g.is_finite()) {
            Ok(())
        } else {
            Err(SolverError::NotFiniteComputation)
        }
    };

    let bounds = Rectangle::new(Some(problem.x_min), Some(problem.x_max));
    let inner_problem = optimization_engine::Problem::new(&bounds, psi_gradient, psi);
    let mut cache = PANOCCache::new(n, tolerance, settings.lbfgs_memory);
    let mut panoc = PANOCOptimizer::new(inner_problem, &mut cache)
        .with_max_iter(settings.max_inner_iterations)
        .with_max_duration(time_limit);
    panoc.solve(x)
}
