//! Nonlinear model predictive controller for path following.
//!
//! Each tick, `NonlinearMpc::solve` takes the measured `VehicleState` and a cubic
//! `ReferenceCurve` in vehicle-local coordinates, predicts the horizon with the kinematic bicycle
//! model and returns the steering and acceleration command for the next step.

extern crate control_model;
#[macro_use]
extern crate log;
extern crate nlp;
extern crate prelude;

mod config;
pub use config::{
    ActuatorBounds, CostWeights, InitialGuess, MpcConfig, SolverConfig, SteeringConvention,
};

mod error;
pub use error::{ConfigError, MpcError};

mod evaluator;
pub use evaluator::{CostBreakdown, DerivativeMode, Evaluator};

mod layout;
pub use layout::Layout;

mod nonlinear_mpc;
pub use nonlinear_mpc::{curve_from_coefficients, NonlinearMpc, SolveResult, SolveStats, SolveStatus};

pub use control_model::{Control, ControlModel, KinematicBicycle, ReferenceCurve, StateField, VehicleState};
pub use nlp::{AlmSolver, Failure, NlpSolver, Status};
