// boreas_core/src/models/observation.rs

use dyn_clone::DynClone;
use nalgebra::{DMatrix, DVector};
use std::fmt::Debug;

// --- OBSERVATION MODEL TRAIT ---
// Represents the forward observation operator `y = h(x, t)` (noise-free;
// the observation-error covariance `R` lives on the HMM as a noise model).
pub trait ObservationModel: Debug + Send + Sync + DynClone {
    fn state_dim(&self) -> usize;
    fn obs_dim(&self) -> usize;

    /// Noise-free observation of a single state.
    fn observe(&self, state: &DVector<f64>, t: f64) -> DVector<f64>;

    /// Batched observation: one member per column in, one observation per
    /// column out. The default maps `observe` over the columns.
    fn observe_matrix(&self, members: &DMatrix<f64>, t: f64) -> DMatrix<f64> {
        let mut out = DMatrix::zeros(self.obs_dim(), members.ncols());
        for (j, col) in members.column_iter().enumerate() {
            out.column_mut(j).copy_from(&self.observe(&col.into_owned(), t));
        }
        out
    }

    /// 1-D grid coordinate of each observed component, when the operator has
    /// a meaningful spatial footprint. Local filters need this to compute
    /// observation-to-gridpoint distances; returning `None` disables
    /// localization for this operator.
    fn obs_sites(&self) -> Option<Vec<f64>> {
        None
    }
}

dyn_clone::clone_trait_object!(ObservationModel);

// --- Linear observation operator ---
// `y = H x`. Covers the identity and partial/subsampled observation cases
// used throughout the tests and linear scenarios.
#[derive(Debug, Clone)]
pub struct LinearObservation {
    h: DMatrix<f64>,
    sites: Option<Vec<f64>>,
}

impl LinearObservation {
    pub fn new(h: DMatrix<f64>) -> Self {
        LinearObservation { h, sites: None }
    }

    /// Observes every state component directly.
    pub fn identity(state_dim: usize) -> Self {
        LinearObservation {
            h: DMatrix::identity(state_dim, state_dim),
            sites: Some((0..state_dim).map(|i| i as f64).collect()),
        }
    }

    /// Observes the listed state components, in the given order.
    pub fn partial(state_dim: usize, indices: &[usize]) -> Self {
        assert!(
            indices.iter().all(|&i| i < state_dim),
            "observed index out of range"
        );
        let mut h = DMatrix::zeros(indices.len(), state_dim);
        for (row, &i) in indices.iter().enumerate() {
            h[(row, i)] = 1.0;
        }
        LinearObservation {
            h,
            sites: Some(indices.iter().map(|&i| i as f64).collect()),
        }
    }

    /// Attaches grid coordinates to the observed components (for general
    /// `H` matrices whose rows still have a location).
    pub fn with_sites(mut self, sites: Vec<f64>) -> Self {
        assert_eq!(sites.len(), self.h.nrows());
        self.sites = Some(sites);
        self
    }

    pub fn matrix(&self) -> &DMatrix<f64> {
        &self.h
    }
}

impl ObservationModel for LinearObservation {
    fn state_dim(&self) -> usize {
        self.h.ncols()
    }

    fn obs_dim(&self) -> usize {
        self.h.nrows()
    }

    fn observe(&self, state: &DVector<f64>, _t: f64) -> DVector<f64> {
        &self.h * state
    }

    fn observe_matrix(&self, members: &DMatrix<f64>, _t: f64) -> DMatrix<f64> {
        &self.h * members
    }

    fn obs_sites(&self) -> Option<Vec<f64>> {
        self.sites.clone()
    }
}
