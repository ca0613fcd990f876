use std::ops::Range;

use control_model::{InputVector, StateField, StateVector, NI, NS};
use crate::error::MpcError;
use prelude::*;

/// Positions of the states and controls within the flat decision vector.
///
/// Each state component occupies a contiguous block of `horizon` values, followed by a block of
/// `horizon - 1` steering angles and then `horizon - 1` accelerations:
///
/// ```text
/// [x_0..x_N-1 | y | psi | v | cte | epsi | delta_0..delta_N-2 | a_0..a_N-2]
/// ```
///
/// Constraint residuals use the same block order as the states: one block of `horizon` values per
/// state component, the first entry of each block pinning the initial state.
///
/// The cost, constraints and bounds must all index through the same `Layout`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Layout {
    horizon: usize,
    state_start: [usize; NS],
    delta_start: usize,
    a_start: usize,
    n_vars: usize,
}

impl Layout {
    pub fn new(horizon: usize) -> Result<Layout, MpcError> {
        if horizon < 2 {
            return Err(MpcError::InvalidHorizon(horizon));
        }

        let mut state_start = [0; NS];
        for (i, start) in state_start.iter_mut().enumerate() {
            *start = i * horizon;
        }
        let delta_start = NS * horizon;
        let a_start = delta_start + horizon - 1;
        let n_vars = a_start + horizon - 1;

        Ok(Layout {
            horizon,
            state_start,
            delta_start,
            a_start,
            n_vars,
        })
    }

    pub fn horizon(&self) -> usize {
        self.horizon
    }

    pub fn n_controls(&self) -> usize {
        self.horizon - 1
    }

    /// `NS * N + NI * (N - 1)`
    pub fn n_vars(&self) -> usize {
        self.n_vars
    }

    pub fn n_constraints(&self) -> usize {
        NS * self.horizon
    }

    #[inline]
    pub fn state(&self, field: StateField, t: usize) -> usize {
        debug_assert!(t < self.horizon);
        self.state_start[field.index()] + t
    }

    #[inline]
    pub fn steering(&self, t: usize) -> usize {
        debug_assert!(t < self.n_controls());
        self.delta_start + t
    }

    #[inline]
    pub fn acceleration(&self, t: usize) -> usize {
        debug_assert!(t < self.n_controls());
        self.a_start + t
    }

    /// Index of the residual for `field` at horizon step `t`.
    #[inline]
    pub fn constraint(&self, field: StateField, t: usize) -> usize {
        debug_assert!(t < self.horizon);
        field.index() * self.horizon + t
    }

    pub fn states(&self) -> Range<usize> {
        0..self.delta_start
    }

    pub fn steerings(&self) -> Range<usize> {
        self.delta_start..self.a_start
    }

    pub fn accelerations(&self) -> Range<usize> {
        self.a_start..self.n_vars
    }

    /// Decision vector indices of the state at step `t`, in `StateVector` order.
    pub fn state_indices(&self, t: usize) -> [usize; NS] {
        StateField::ALL.map(|field| self.state(field, t))
    }

    /// Decision vector indices of the input at step `t`, in `InputVector` order.
    pub fn input_indices(&self, t: usize) -> [usize; NI] {
        [self.steering(t), self.acceleration(t)]
    }

    pub fn gather_state<T: Real>(&self, vars: &[T], t: usize) -> StateVector<T> {
        let indices = self.state_indices(t);
        StateVector::from_fn(|i, _| vars[indices[i]])
    }

    pub fn gather_input<T: Real>(&self, vars: &[T], t: usize) -> InputVector<T> {
        InputVector::new(vars[self.steering(t)], vars[self.acceleration(t)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_for_default_horizon() {
        let layout = Layout::new(10).unwrap();
        assert_eq!(layout.n_vars(), 6 * 10 + 2 * 9);
        assert_eq!(layout.n_constraints(), 60);
        assert_eq!(layout.state(StateField::X, 0), 0);
        assert_eq!(layout.state(StateField::Y, 0), 10);
        assert_eq!(layout.state(StateField::Psi, 0), 20);
        assert_eq!(layout.state(StateField::V, 0), 30);
        assert_eq!(layout.state(StateField::Cte, 0), 40);
        assert_eq!(layout.state(StateField::Epsi, 9), 59);
        assert_eq!(layout.steering(0), 60);
        assert_eq!(layout.acceleration(0), 69);
        assert_eq!(layout.acceleration(8), 77);
    }

    #[test]
    fn segments_tile_the_decision_vector() {
        for horizon in 2..20 {
            let layout = Layout::new(horizon).unwrap();
            let mut seen = vec![0; layout.n_vars()];
            for t in 0..horizon {
                for &i in layout.state_indices(t).iter() {
                    seen[i] += 1;
                }
            }
            for t in 0..layout.n_controls() {
                for &i in layout.input_indices(t).iter() {
                    seen[i] += 1;
                }
            }
            assert!(seen.iter().all(|&n| n == 1), "horizon {}: {:?}", horizon, seen);

            assert_eq!(layout.states().len(), NS * horizon);
            assert_eq!(layout.steerings().len(), horizon - 1);
            assert_eq!(layout.accelerations().len(), horizon - 1);
            assert_eq!(layout.accelerations().end, layout.n_vars());
        }
    }

    #[test]
    fn constraint_blocks_follow_state_blocks() {
        let layout = Layout::new(7).unwrap();
        for &field in StateField::ALL.iter() {
            for t in 0..7 {
                assert_eq!(layout.constraint(field, t), layout.state(field, t));
            }
        }
    }

    #[test]
    fn gather_reads_the_right_slots() {
        let layout = Layout::new(4).unwrap();
        let vars: Vec<float> = (0..layout.n_vars()).map(|i| i as float).collect();
        let x = layout.gather_state(&vars, 2);
        let u = layout.gather_input(&vars, 1);
        assert_eq!(x, StateVector::new(2.0, 6.0, 10.0, 14.0, 18.0, 22.0));
        assert_eq!(u, InputVector::new(25.0, 28.0));
    }

    #[test]
    fn rejects_short_horizon() {
        assert!(matches!(Layout::new(0), Err(MpcError::InvalidHorizon(0))));
        assert!(matches!(Layout::new(1), Err(MpcError::InvalidHorizon(1))));
    }
}
