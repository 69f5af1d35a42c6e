// boreas_core/src/ensemble.rs

use nalgebra::{DMatrix, DVector};
use rand::Rng;

use crate::models::GaussianRv;
use crate::utils::linalg;

/// The N-member approximation of the state distribution, members stored as
/// the columns of an `nx x n` matrix.
///
/// The ensemble is the one piece of mutable run state: the harness forecasts
/// it in place and the analysis algorithms rewrite it. Particle methods
/// additionally attach importance weights; everything else treats the
/// members as equally weighted.
#[derive(Debug, Clone)]
pub struct Ensemble {
    members: DMatrix<f64>,
    /// Normalized importance weights. `None` means uniform `1/N`.
    weights: Option<DVector<f64>>,
}

impl Ensemble {
    pub fn new(members: DMatrix<f64>) -> Self {
        assert!(members.ncols() > 0, "an ensemble needs at least one member");
        Ensemble {
            members,
            weights: None,
        }
    }

    /// Draws `n` i.i.d. members from a Gaussian initial distribution.
    pub fn from_gaussian(init: &GaussianRv, n: usize, rng: &mut impl Rng) -> Self {
        Ensemble::new(init.sample_matrix(n, rng))
    }

    // --- Shape & access ---

    pub fn state_dim(&self) -> usize {
        self.members.nrows()
    }

    pub fn num_members(&self) -> usize {
        self.members.ncols()
    }

    pub fn members(&self) -> &DMatrix<f64> {
        &self.members
    }

    pub fn members_mut(&mut self) -> &mut DMatrix<f64> {
        &mut self.members
    }

    pub fn set_members(&mut self, members: DMatrix<f64>) {
        debug_assert_eq!(members.nrows(), self.members.nrows());
        self.members = members;
    }

    // --- Weights (particle methods) ---

    /// Importance weights; uniform if none have been set.
    pub fn weights(&self) -> DVector<f64> {
        match &self.weights {
            Some(w) => w.clone(),
            None => DVector::from_element(
                self.num_members(),
                1.0 / self.num_members() as f64,
            ),
        }
    }

    pub fn set_weights(&mut self, weights: DVector<f64>) {
        debug_assert_eq!(weights.len(), self.num_members());
        self.weights = Some(weights);
    }

    /// Back to equal weighting (e.g. right after resampling).
    pub fn reset_weights(&mut self) {
        self.weights = None;
    }

    pub fn has_weights(&self) -> bool {
        self.weights.is_some()
    }

    // --- Moments ---

    /// Ensemble mean; the weighted mean when importance weights are present.
    pub fn mean(&self) -> DVector<f64> {
        match &self.weights {
            Some(w) => linalg::weighted_mean(&self.members, w),
            None => self.members.column_mean(),
        }
    }

    /// Anomalies: each member minus the (possibly weighted) mean.
    pub fn anomalies(&self) -> DMatrix<f64> {
        let mean = self.mean();
        let mut anomalies = self.members.clone();
        for mut col in anomalies.column_iter_mut() {
            col -= &mean;
        }
        anomalies
    }

    pub fn mean_and_anomalies(&self) -> (DVector<f64>, DMatrix<f64>) {
        let mean = self.mean();
        let mut anomalies = self.members.clone();
        for mut col in anomalies.column_iter_mut() {
            col -= &mean;
        }
        (mean, anomalies)
    }

    /// Sample covariance `A A^T / (N - 1)`.
    pub fn sample_cov(&self) -> DMatrix<f64> {
        let a = self.anomalies();
        let n1 = (self.num_members().max(2) - 1) as f64;
        &a * a.transpose() / n1
    }

    /// Root-mean variance over state components: `sqrt(trace(P) / nx)`.
    /// The scalar "how wide is this ensemble" diagnostic.
    pub fn spread(&self) -> f64 {
        let a = self.anomalies();
        let n1 = (self.num_members().max(2) - 1) as f64;
        let total_var = a.iter().map(|v| v * v).sum::<f64>() / n1;
        (total_var / self.state_dim() as f64).sqrt()
    }

    /// Overwrites the ensemble as `mean + anomalies`, column by column.
    pub fn set_from_mean_anomalies(&mut self, mean: &DVector<f64>, anomalies: &DMatrix<f64>) {
        debug_assert_eq!(anomalies.ncols(), self.num_members());
        for (j, mut col) in self.members.column_iter_mut().enumerate() {
            col.copy_from(&(mean + anomalies.column(j)));
        }
    }

    // --- In-place transforms ---

    /// Multiplicative inflation: scales anomalies about the mean by
    /// `factor`, so the spread scales by exactly `factor`.
    pub fn inflate(&mut self, factor: f64) {
        if (factor - 1.0).abs() < f64::EPSILON {
            return;
        }
        let (mean, anomalies) = self.mean_and_anomalies();
        let inflated = anomalies * factor;
        self.set_from_mean_anomalies(&mean, &inflated);
    }

    /// Random mean-preserving rotation of the anomalies. Leaves the mean and
    /// the sample covariance unchanged while randomizing the subspace, which
    /// counters the rank deficiency that repeated deterministic updates
    /// build up.
    pub fn rotate(&mut self, rng: &mut impl Rng) {
        let n = self.num_members();
        if n < 3 {
            return;
        }
        let (mean, anomalies) = self.mean_and_anomalies();
        let rotation = linalg::mean_preserving_rotation(n, rng);
        let rotated = anomalies * rotation;
        self.set_from_mean_anomalies(&mean, &rotated);
    }

    /// Adds an independent draw from `noise` to every member.
    pub fn add_noise(&mut self, noise: &GaussianRv, rng: &mut impl Rng) {
        for mut col in self.members.column_iter_mut() {
            col += noise.sample(rng);
        }
    }

    // --- Divergence checks ---

    pub fn is_finite(&self) -> bool {
        self.members.iter().all(|v| v.is_finite())
    }

    pub fn max_abs(&self) -> f64 {
        self.members
            .iter()
            .map(|v| v.abs())
            .fold(0.0_f64, f64::max)
    }
}
