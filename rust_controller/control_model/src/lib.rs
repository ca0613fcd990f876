extern crate prelude;

use prelude::nalgebra::SVector;
use prelude::*;

mod kinematic_bicycle;
pub use kinematic_bicycle::KinematicBicycle;

mod reference_curve;
pub use reference_curve::ReferenceCurve;

/// Number of state components.
pub const NS: usize = 6;
/// Number of actuator inputs.
pub const NI: usize = 2;

pub type StateVector<T> = SVector<T, NS>;
pub type InputVector<T> = SVector<T, NI>;

/// State components in the order they are stored in a `StateVector`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StateField {
    X,
    Y,
    Psi,
    V,
    Cte,
    Epsi,
}

impl StateField {
    pub const ALL: [StateField; NS] = [
        StateField::X,
        StateField::Y,
        StateField::Psi,
        StateField::V,
        StateField::Cte,
        StateField::Epsi,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            StateField::X => "x",
            StateField::Y => "y",
            StateField::Psi => "psi",
            StateField::V => "v",
            StateField::Cte => "cte",
            StateField::Epsi => "epsi",
        }
    }
}

/// Measured vehicle state in the vehicle-local frame of the reference curve.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct VehicleState {
    pub x: float,
    pub y: float,
    /// Heading, radians.
    pub psi: float,
    pub v: float,
    /// Cross track error.
    pub cte: float,
    /// Heading error, radians.
    pub epsi: float,
}

impl VehicleState {
    pub fn get(&self, field: StateField) -> float {
        match field {
            StateField::X => self.x,
            StateField::Y => self.y,
            StateField::Psi => self.psi,
            StateField::V => self.v,
            StateField::Cte => self.cte,
            StateField::Epsi => self.epsi,
        }
    }

    pub fn to_vector(&self) -> StateVector<float> {
        StateVector::from_fn(|i, _| self.get(StateField::ALL[i]))
    }

    pub fn from_vector(x: &StateVector<float>) -> VehicleState {
        VehicleState {
            x: x[0],
            y: x[1],
            psi: x[2],
            v: x[3],
            cte: x[4],
            epsi: x[5],
        }
    }

    /// Returns the first component that is NaN or infinite.
    pub fn non_finite_field(&self) -> Option<StateField> {
        StateField::ALL
            .iter()
            .cloned()
            .find(|&field| !self.get(field).is_finite())
    }
}

/// Actuator command.
///
/// `steering_angle` is in radians and `acceleration` is a normalised throttle/brake value in
/// [-1, 1]. The default command (zero steering, zero acceleration) is the safe command.
///
/// The sign of `steering_angle` as returned by the controller depends on its configured steering
/// convention; in the model frame positive steering turns left.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Control {
    pub steering_angle: float,
    pub acceleration: float,
}

impl Control {
    pub fn is_finite(&self) -> bool {
        self.steering_angle.is_finite() && self.acceleration.is_finite()
    }

    /// Returns true if both inputs lie within `[min, max]`, widened by `tol`.
    pub fn within(&self, min: &Vector<NI>, max: &Vector<NI>, tol: float) -> bool {
        let u = [self.steering_angle, self.acceleration];
        u.iter()
            .zip(min.iter().zip(max.iter()))
            .all(|(&u, (&u_min, &u_max))| u >= u_min - tol && u <= u_max + tol)
    }
}

pub trait ControlModel {
    fn name() -> &'static str
    where
        Self: Sized;

    /// Returns the state one time step `dt` after `x` with input `u` held constant.
    ///
    /// Input order is `[delta, a]`. Generic over `Real` so the transition can be evaluated with
    /// dual numbers for exact derivatives.
    fn step<T: Real>(
        &self,
        dt: float,
        curve: &ReferenceCurve,
        x: &StateVector<T>,
        u: &InputVector<T>,
    ) -> StateVector<T>
    where
        Self: Sized;

    /// Returns the minimum and maximum allowable input values.
    fn input_bounds(&self) -> (Vector<NI>, Vector<NI>);
}
