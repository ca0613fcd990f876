use prelude::*;

/// Cubic polynomial `y = c0 + c1 x + c2 x^2 + c3 x^3` fitted to the waypoints ahead of the car,
/// in vehicle-local coordinates.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ReferenceCurve {
    coeffs: [float; ReferenceCurve::NUM_COEFFS],
}

impl ReferenceCurve {
    pub const DEGREE: usize = 3;
    pub const NUM_COEFFS: usize = ReferenceCurve::DEGREE + 1;

    /// Coefficients are ordered from the constant term upwards.
    pub fn new(coeffs: [float; ReferenceCurve::NUM_COEFFS]) -> ReferenceCurve {
        ReferenceCurve { coeffs }
    }

    /// Returns `None` unless exactly `NUM_COEFFS` coefficients are given.
    pub fn from_coefficients(coeffs: &[float]) -> Option<ReferenceCurve> {
        if coeffs.len() != ReferenceCurve::NUM_COEFFS {
            return None;
        }
        let mut c = [0.0; ReferenceCurve::NUM_COEFFS];
        c.copy_from_slice(coeffs);
        Some(ReferenceCurve::new(c))
    }

    /// A straight line along the x axis.
    pub fn straight() -> ReferenceCurve {
        ReferenceCurve::new([0.0; ReferenceCurve::NUM_COEFFS])
    }

    pub fn coefficients(&self) -> &[float] {
        &self.coeffs
    }

    pub fn is_finite(&self) -> bool {
        self.coeffs.iter().all(|c| c.is_finite())
    }

    /// Lateral position of the curve at `x`.
    pub fn eval<T: Real>(&self, x: T) -> T {
        self.coeffs
            .iter()
            .rev()
            .fold(T::from(0.0), |acc, &c| acc * x + c)
    }

    /// First derivative dy/dx at `x`.
    pub fn slope<T: Real>(&self, x: T) -> T {
        self.coeffs
            .iter()
            .enumerate()
            .skip(1)
            .rev()
            .fold(T::from(0.0), |acc, (i, &c)| acc * x + c * i as float)
    }

    /// Tangent heading of the curve at `x`, radians.
    pub fn heading<T: Real>(&self, x: T) -> T {
        self.slope(x).atan()
    }
}
