// boreas_core/src/types.rs

use nalgebra::{DMatrix, DVector};

// --- Core Type Aliases ---
pub type State = DVector<f64>;
pub type Obs = DVector<f64>;
pub type Cov = DMatrix<f64>;

/// Index into the full time grid (`0..=num_steps`).
pub type StepIndex = usize;
/// Index into the observation subsequence (`0..num_obs`).
pub type ObsIndex = usize;

/// Terminal status of one experiment run.
///
/// A `Diverged` or `Cancelled` run is not an error: its statistics remain
/// valid up to the step recorded here, and sibling experiments in a batch
/// are unaffected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    Diverged { step: StepIndex },
    Cancelled { step: StepIndex },
}

impl RunStatus {
    pub fn is_completed(&self) -> bool {
        matches!(self, RunStatus::Completed)
    }
}
