// boreas_core/src/models/dynamics.rs

use dyn_clone::DynClone;
use nalgebra::{DMatrix, DVector};
use std::fmt::Debug;

// --- DYNAMICS MODEL TRAIT ---
// Represents the forward model of the system: `x_{k+1} = M(x_k, t, dt)`.
/// The dynamic-model adapter consumed by the harness.
///
/// Propagation is batched: the input matrix holds one member per column and
/// implementations must accept a single column (the truth trajectory goes
/// through the same entry point as the ensemble). The function must be pure;
/// model-error noise (`Q`) is drawn and added by the caller so that each
/// member provably receives an independent draw.
pub trait DynamicsModel: Debug + Send + Sync + DynClone {
    /// Length of the state vector this model propagates.
    fn state_dim(&self) -> usize;

    /// Advances every column of `members` from `t` to `t + dt` in place.
    fn step(&self, members: &mut DMatrix<f64>, t: f64, dt: f64);
}

dyn_clone::clone_trait_object!(DynamicsModel);

// --- Linear dynamics ---
// `x_{k+1} = M x_k`. The identity case is the random-walk/persistence model
// that most of the analytic test scenarios are built on.
#[derive(Debug, Clone)]
pub struct LinearDynamics {
    matrix: DMatrix<f64>,
}

impl LinearDynamics {
    pub fn new(matrix: DMatrix<f64>) -> Self {
        assert_eq!(
            matrix.nrows(),
            matrix.ncols(),
            "dynamics matrix must be square"
        );
        LinearDynamics { matrix }
    }

    /// Persistence model: `x_{k+1} = x_k`.
    pub fn identity(state_dim: usize) -> Self {
        LinearDynamics::new(DMatrix::identity(state_dim, state_dim))
    }

    /// Uniform damping/growth: `x_{k+1} = factor * x_k`.
    pub fn scaling(state_dim: usize, factor: f64) -> Self {
        LinearDynamics::new(DMatrix::identity(state_dim, state_dim) * factor)
    }

    pub fn matrix(&self) -> &DMatrix<f64> {
        &self.matrix
    }
}

impl DynamicsModel for LinearDynamics {
    fn state_dim(&self) -> usize {
        self.matrix.nrows()
    }

    fn step(&self, members: &mut DMatrix<f64>, _t: f64, _dt: f64) {
        let propagated = &self.matrix * &*members;
        members.copy_from(&propagated);
    }
}

// --- Member-wise adapter ---
/// Wraps a per-state step function into the batched contract, for models
/// that are naturally written one state vector at a time.
#[derive(Clone)]
pub struct StepWise<F> {
    state_dim: usize,
    step_fn: F,
}

impl<F> StepWise<F>
where
    F: Fn(&DVector<f64>, f64, f64) -> DVector<f64> + Send + Sync + Clone,
{
    pub fn new(state_dim: usize, step_fn: F) -> Self {
        StepWise { state_dim, step_fn }
    }
}

impl<F> Debug for StepWise<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepWise")
            .field("state_dim", &self.state_dim)
            .finish()
    }
}

impl<F> DynamicsModel for StepWise<F>
where
    F: Fn(&DVector<f64>, f64, f64) -> DVector<f64> + Send + Sync + Clone,
{
    fn state_dim(&self) -> usize {
        self.state_dim
    }

    fn step(&self, members: &mut DMatrix<f64>, t: f64, dt: f64) {
        for mut col in members.column_iter_mut() {
            let next = (self.step_fn)(&col.clone_owned(), t, dt);
            col.copy_from(&next);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn identity_is_persistence() {
        let model = LinearDynamics::identity(2);
        let mut members = DMatrix::from_row_slice(2, 3, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let before = members.clone();
        model.step(&mut members, 0.0, 0.1);
        assert_relative_eq!(members, before);
    }

    #[test]
    fn accepts_single_member() {
        let model = LinearDynamics::scaling(2, 0.5);
        let mut members = DMatrix::from_column_slice(2, 1, &[2.0, 4.0]);
        model.step(&mut members, 0.0, 0.1);
        assert_relative_eq!(members[(0, 0)], 1.0);
        assert_relative_eq!(members[(1, 0)], 2.0);
    }

    #[test]
    fn step_wise_matches_batched_equivalent() {
        let batched = LinearDynamics::scaling(2, 2.0);
        let member_wise = StepWise::new(2, |x: &DVector<f64>, _t: f64, _dt: f64| x * 2.0);

        let mut a = DMatrix::from_row_slice(2, 3, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let mut b = a.clone();
        batched.step(&mut a, 0.0, 0.1);
        member_wise.step(&mut b, 0.0, 0.1);
        assert_relative_eq!(a, b);
    }
}
