pub extern crate flame;
pub extern crate nalgebra;
pub extern crate num_dual;

#[allow(non_camel_case_types)]
pub type float = f64;
pub use std::f64::consts::PI;
pub use std::f64::{INFINITY, NAN};

pub use num_dual::{Dual64, DualNum};

/// Scalar type the models are written against.
///
/// Implemented by `float` for plain evaluation and by `Dual64` for exact first derivatives.
pub trait Real: DualNum<float> + nalgebra::Scalar + Copy {}

impl<T: DualNum<float> + nalgebra::Scalar + Copy> Real for T {}

pub fn min<T: Copy + PartialOrd>(a: T, b: T) -> T {
    if b < a {
        b
    } else {
        a
    }
}

pub fn max<T: Copy + PartialOrd>(a: T, b: T) -> T {
    if b > a {
        b
    } else {
        a
    }
}

#[inline(always)]
pub fn square<T: Real>(a: T) -> T {
    a * a
}

pub fn deg_to_rad(deg: float) -> float {
    deg * PI / 180.0
}

pub type Matrix<const R: usize, const C: usize> = nalgebra::SMatrix<float, R, C>;
pub type Vector<const N: usize> = nalgebra::SVector<float, N>;
