// Discrete kinematic bicycle model with path error states.
//
// x = [x, y, psi, v, cte, epsi], u = [delta, a]

use prelude::*;
use crate::{ControlModel, InputVector, ReferenceCurve, StateVector, NI};

pub struct KinematicBicycle {
    /// Distance from the front axle to the centre of gravity. Sets the yaw rate produced by a
    /// steering angle at a given speed.
    lf: float,
    max_steering: float,
    max_acceleration: float,
}

impl KinematicBicycle {
    pub fn new(lf: float, max_steering: float, max_acceleration: float) -> KinematicBicycle {
        KinematicBicycle {
            lf,
            max_steering,
            max_acceleration,
        }
    }

    pub fn lf(&self) -> float {
        self.lf
    }
}

impl ControlModel for KinematicBicycle {
    fn name() -> &'static str {
        "kinematic_bicycle"
    }

    fn step<T: Real>(
        &self,
        dt: float,
        curve: &ReferenceCurve,
        x: &StateVector<T>,
        u: &InputVector<T>,
    ) -> StateVector<T> {
        let [px, py, psi, v, _cte, epsi] = unpack(x);
        let (delta, a) = (u[0], u[1]);

        let yaw = v * delta * (dt / self.lf);
        let psi_des = curve.heading(px);

        StateVector::new(
            px + v * psi.cos() * dt,
            py + v * psi.sin() * dt,
            psi + yaw,
            v + a * dt,
            (curve.eval(px) - py) + v * epsi.sin() * dt,
            (psi - psi_des) + yaw,
        )
    }

    fn input_bounds(&self) -> (Vector<NI>, Vector<NI>) {
        let min = Vector::<NI>::new(-self.max_steering, -self.max_acceleration);
        let max = Vector::<NI>::new(self.max_steering, self.max_acceleration);
        (min, max)
    }
}

#[inline(always)]
fn unpack<T: Real>(x: &StateVector<T>) -> [T; 6] {
    [x[0], x[1], x[2], x[3], x[4], x[5]]
}
