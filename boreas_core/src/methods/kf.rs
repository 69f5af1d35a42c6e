// boreas_core/src/methods/kf.rs
//
// Closed-form Kalman filter for linear-Gaussian models. Not part of the
// ensemble method family: it is the exact reference the convergence tests
// (and scenario scoring) compare the ensemble filters against.

use nalgebra::{DMatrix, DVector};

use crate::utils::linalg;

/// Exact mean/covariance recursion for `x' = M x + q`, `y = H x + r`.
#[derive(Debug, Clone)]
pub struct KalmanFilter {
    mean: DVector<f64>,
    cov: DMatrix<f64>,
}

impl KalmanFilter {
    pub fn new(mean: DVector<f64>, cov: DMatrix<f64>) -> Self {
        assert_eq!(mean.len(), cov.nrows());
        assert_eq!(cov.nrows(), cov.ncols());
        KalmanFilter { mean, cov }
    }

    pub fn mean(&self) -> &DVector<f64> {
        &self.mean
    }

    pub fn cov(&self) -> &DMatrix<f64> {
        &self.cov
    }

    /// Forecast through the linear dynamics `M` with model error `Q`.
    pub fn forecast(&mut self, m: &DMatrix<f64>, q: Option<&DMatrix<f64>>) {
        self.mean = m * &self.mean;
        self.cov = m * &self.cov * m.transpose();
        if let Some(q) = q {
            self.cov += q;
        }
    }

    /// Analysis with observation `y`, operator `H` and error covariance `R`.
    pub fn analyse(&mut self, h: &DMatrix<f64>, r: &DMatrix<f64>, y: &DVector<f64>) {
        let s = h * &self.cov * h.transpose() + r;
        let (s_inv, _) = linalg::robust_spd_inverse(&s);
        let gain = &self.cov * h.transpose() * s_inv;

        let innovation = y - h * &self.mean;
        self.mean += &gain * innovation;

        let identity = DMatrix::identity(self.mean.len(), self.mean.len());
        self.cov = (identity - gain * h) * &self.cov;
        // Symmetrize against numerical drift.
        self.cov = (&self.cov + self.cov.transpose()) * 0.5;
    }
}
