use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::{ConfigError, MpcError};
use crate::evaluator::DerivativeMode;
use prelude::*;

/// Controller configuration, normally read from `controller.toml`.
///
/// Every field has a default so a file only needs to name what it changes.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct MpcConfig {
    /// Time step between horizon points, seconds.
    pub dt: float,
    /// Number of predicted states, N. There are N - 1 controls.
    pub horizon: usize,
    /// Steering to yaw rate gain, see `KinematicBicycle`.
    pub lf: float,
    /// Target cruising speed.
    pub ref_v: float,
    /// Bound on every state variable. Practically unbounded for the default horizon and dt,
    /// revisit if either changes materially.
    pub state_bound: float,
    pub steering_convention: SteeringConvention,
    pub weights: CostWeights,
    pub bounds: ActuatorBounds,
    pub solver: SolverConfig,
}

impl Default for MpcConfig {
    fn default() -> MpcConfig {
        MpcConfig {
            dt: 0.1,
            horizon: 10,
            lf: 2.67,
            ref_v: 50.0,
            state_bound: 1.0e6,
            steering_convention: SteeringConvention::Inverted,
            weights: CostWeights::default(),
            bounds: ActuatorBounds::default(),
            solver: SolverConfig::default(),
        }
    }
}

/// Cost weights. Smoothness and effort dominate raw tracking with the defaults, favouring ride
/// comfort over tracking aggressiveness. Calibrate per vehicle.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct CostWeights {
    pub cte: float,
    pub epsi: float,
    pub v: float,
    pub steering: float,
    pub acceleration: float,
    pub steering_rate: float,
    pub acceleration_rate: float,
}

impl Default for CostWeights {
    fn default() -> CostWeights {
        CostWeights {
            cte: 500.0,
            epsi: 6000.0,
            v: 1.0,
            steering: 15000.0,
            acceleration: 10.0,
            steering_rate: 5000.0,
            acceleration_rate: 10000.0,
        }
    }
}

impl CostWeights {
    /// Scale that brings the largest weight to one. The solver minimises the scaled cost so the
    /// penalty on the dynamics is not swamped by the raw weights.
    pub fn cost_scale(&self) -> float {
        let largest = [
            self.cte,
            self.epsi,
            self.v,
            self.steering,
            self.acceleration,
            self.steering_rate,
            self.acceleration_rate,
        ]
        .iter()
        .cloned()
        .fold(0.0, max);
        if largest > 0.0 {
            1.0 / largest
        } else {
            1.0
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ActuatorBounds {
    pub max_steering_deg: float,
    /// Normalised throttle/brake.
    pub max_acceleration: float,
}

impl ActuatorBounds {
    pub fn max_steering(&self) -> float {
        deg_to_rad(self.max_steering_deg)
    }
}

impl Default for ActuatorBounds {
    fn default() -> ActuatorBounds {
        ActuatorBounds {
            max_steering_deg: 25.0,
            max_acceleration: 1.0,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct SolverConfig {
    /// Wall clock cap for a single solve, seconds.
    pub max_cpu_time: float,
    pub derivatives: DerivativeMode,
    pub initial_guess: InitialGuess,
    /// Log every solve summary at info rather than debug level.
    pub verbose: bool,
    pub tolerance: float,
    pub constraint_tolerance: float,
    pub lbfgs_memory: usize,
    pub max_outer_iterations: usize,
    pub max_inner_iterations: usize,
    pub initial_penalty: float,
    pub penalty_update_factor: float,
}

impl SolverConfig {
    pub fn time_limit(&self) -> Duration {
        Duration::from_secs_f64(self.max_cpu_time)
    }

    pub fn settings(&self, time_limit: Duration) -> nlp::Settings {
        nlp::Settings {
            tolerance: self.tolerance,
            constraint_tolerance: self.constraint_tolerance,
            lbfgs_memory: self.lbfgs_memory,
            max_outer_iterations: self.max_outer_iterations,
            max_inner_iterations: self.max_inner_iterations,
            initial_penalty: self.initial_penalty,
            penalty_update_factor: self.penalty_update_factor,
            cost_scale: 1.0,
            time_limit,
        }
    }
}

impl Default for SolverConfig {
    fn default() -> SolverConfig {
        let settings = nlp::Settings::default();
        SolverConfig {
            max_cpu_time: 0.5,
            derivatives: DerivativeMode::Sparse,
            initial_guess: InitialGuess::Rollout,
            verbose: false,
            tolerance: settings.tolerance,
            constraint_tolerance: settings.constraint_tolerance,
            lbfgs_memory: settings.lbfgs_memory,
            max_outer_iterations: settings.max_outer_iterations,
            max_inner_iterations: settings.max_inner_iterations,
            initial_penalty: settings.initial_penalty,
            penalty_update_factor: settings.penalty_update_factor,
        }
    }
}

/// Starting point handed to the solver.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InitialGuess {
    /// Every predicted state equal to the measured state, see `NonlinearMpc::initial_guess`.
    Broadcast,
    /// The model rolled forward from the measured state with zero controls, see
    /// `NonlinearMpc::rollout_guess`. Satisfies the dynamics exactly.
    Rollout,
}

/// Relation between the model's steering angle and the actuator's.
///
/// The model turns left (positive yaw) for positive `delta`. The default `Inverted` negates the
/// command for actuators where positive steering turns right. Verify against the actuator before
/// changing it: the wrong choice steers away from the path.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SteeringConvention {
    Model,
    Inverted,
}

impl SteeringConvention {
    pub fn apply(self, delta: float) -> float {
        match self {
            SteeringConvention::Model => delta,
            SteeringConvention::Inverted => -delta,
        }
    }
}

impl MpcConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<MpcConfig, ConfigError> {
        let config_str = fs::read_to_string(path)?;
        MpcConfig::from_toml_str(&config_str)
    }

    pub fn from_toml_str(config_str: &str) -> Result<MpcConfig, ConfigError> {
        Ok(toml::from_str(config_str)?)
    }

    pub fn validate(&self) -> Result<(), MpcError> {
        if self.horizon < 2 {
            return Err(MpcError::InvalidHorizon(self.horizon));
        }

        positive("dt", self.dt)?;
        positive("lf", self.lf)?;
        positive("state_bound", self.state_bound)?;
        finite("ref_v", self.ref_v)?;
        positive("bounds.max_steering_deg", self.bounds.max_steering_deg)?;
        positive("bounds.max_acceleration", self.bounds.max_acceleration)?;

        let w = &self.weights;
        non_negative("weights.cte", w.cte)?;
        non_negative("weights.epsi", w.epsi)?;
        non_negative("weights.v", w.v)?;
        non_negative("weights.steering", w.steering)?;
        non_negative("weights.acceleration", w.acceleration)?;
        non_negative("weights.steering_rate", w.steering_rate)?;
        non_negative("weights.acceleration_rate", w.acceleration_rate)?;

        let s = &self.solver;
        non_negative("solver.max_cpu_time", s.max_cpu_time)?;
        positive("solver.tolerance", s.tolerance)?;
        positive("solver.constraint_tolerance", s.constraint_tolerance)?;
        positive("solver.lbfgs_memory", s.lbfgs_memory as float)?;
        positive("solver.max_outer_iterations", s.max_outer_iterations as float)?;
        positive("solver.max_inner_iterations", s.max_inner_iterations as float)?;
        positive("solver.initial_penalty", s.initial_penalty)?;
        if !(s.penalty_update_factor.is_finite() && s.penalty_update_factor > 1.0) {
            return Err(MpcError::InvalidParameter {
                name: "solver.penalty_update_factor",
                value: s.penalty_update_factor,
            });
        }

        Ok(())
    }
}

fn finite(name: &'static str, value: float) -> Result<(), MpcError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(MpcError::InvalidParameter { name, value })
    }
}

fn positive(name: &'static str, value: float) -> Result<(), MpcError> {
    finite(name, value)?;
    if value > 0.0 {
        Ok(())
    } else {
        Err(MpcError::InvalidParameter { name, value })
    }
}

fn non_negative(name: &'static str, value: float) -> Result<(), MpcError> {
    finite(name, value)?;
    if value >= 0.0 {
        Ok(())
    } else {
        Err(MpcError::InvalidParameter { name, value })
    }
}
