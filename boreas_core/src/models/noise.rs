// boreas_core/src/models/noise.rs

use nalgebra::{Cholesky, DMatrix, DVector};
use rand::Rng;
use rand_distr::StandardNormal;

use crate::errors::ConfigError;
use crate::utils::linalg;

/// A Gaussian random vector `N(mean, cov)` with a precomputed square-root
/// factor, used for the initial distribution and for the model-error (`Q`)
/// and observation-error (`R`) noise.
///
/// A zero covariance is allowed and degenerates to "always return the mean";
/// that is how a perfect-model truth run is expressed.
#[derive(Debug, Clone, PartialEq)]
pub struct GaussianRv {
    mean: DVector<f64>,
    cov: DMatrix<f64>,
    /// Lower factor `L` with `L L^T = cov`.
    sqrt: DMatrix<f64>,
}

impl GaussianRv {
    pub fn new(mean: DVector<f64>, cov: DMatrix<f64>) -> Result<Self, ConfigError> {
        let dim = mean.len();
        if dim == 0 {
            return Err(ConfigError::hyper(
                "gaussian",
                "dimension must be at least 1",
            ));
        }
        if cov.nrows() != cov.ncols() {
            return Err(ConfigError::DimensionMismatch {
                what: "covariance matrix (must be square)",
                expected: cov.nrows(),
                got: cov.ncols(),
            });
        }
        if cov.nrows() != dim {
            return Err(ConfigError::DimensionMismatch {
                what: "covariance vs mean",
                expected: dim,
                got: cov.nrows(),
            });
        }
        if mean.iter().chain(cov.iter()).any(|v| !v.is_finite()) {
            return Err(ConfigError::hyper(
                "gaussian",
                "mean/covariance entries must be finite",
            ));
        }
        let asym = (&cov - cov.transpose()).abs().max();
        let scale = cov.abs().max().max(1.0);
        if asym > 1e-8 * scale {
            return Err(ConfigError::hyper(
                "covariance",
                "matrix is not symmetric",
            ));
        }

        let sqrt = if cov.iter().all(|v| *v == 0.0) {
            DMatrix::zeros(dim, dim)
        } else if let Some(chol) = Cholesky::new(cov.clone()) {
            chol.l()
        } else {
            // Positive semi-definite but singular: eigen square root.
            linalg::symmetric_sqrt(&cov)
        };

        Ok(GaussianRv { mean, cov, sqrt })
    }

    /// `N(mean, var * I)`.
    pub fn isotropic(mean: DVector<f64>, var: f64) -> Result<Self, ConfigError> {
        if var < 0.0 || !var.is_finite() {
            return Err(ConfigError::hyper(
                "variance",
                format!("must be non-negative and finite, got {var}"),
            ));
        }
        let dim = mean.len();
        GaussianRv::new(mean, DMatrix::identity(dim, dim) * var)
    }

    /// Zero-mean `N(0, var * I)` in `dim` dimensions.
    pub fn centered(dim: usize, var: f64) -> Result<Self, ConfigError> {
        GaussianRv::isotropic(DVector::zeros(dim), var)
    }

    pub fn dim(&self) -> usize {
        self.mean.len()
    }

    pub fn mean(&self) -> &DVector<f64> {
        &self.mean
    }

    pub fn cov(&self) -> &DMatrix<f64> {
        &self.cov
    }

    /// True when the covariance is identically zero.
    pub fn is_degenerate(&self) -> bool {
        self.cov.iter().all(|v| *v == 0.0)
    }

    /// One draw: `mean + L z`, `z ~ N(0, I)`.
    pub fn sample(&self, rng: &mut impl Rng) -> DVector<f64> {
        if self.is_degenerate() {
            return self.mean.clone();
        }
        let z = DVector::from_fn(self.dim(), |_, _| rng.sample::<f64, _>(StandardNormal));
        &self.mean + &self.sqrt * z
    }

    /// `n` independent draws as the columns of a matrix.
    pub fn sample_matrix(&self, n: usize, rng: &mut impl Rng) -> DMatrix<f64> {
        let mut out = DMatrix::zeros(self.dim(), n);
        for mut col in out.column_iter_mut() {
            col.copy_from(&self.sample(rng));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rng::filter_stream;
    use approx::assert_relative_eq;

    #[test]
    fn rejects_mismatched_dimensions() {
        let mean = DVector::zeros(2);
        let cov = DMatrix::identity(3, 3);
        assert!(GaussianRv::new(mean, cov).is_err());
    }

    #[test]
    fn rejects_negative_variance() {
        assert!(GaussianRv::centered(2, -1.0).is_err());
    }

    #[test]
    fn degenerate_returns_mean() {
        let mean = DVector::from_vec(vec![1.0, -2.0]);
        let rv = GaussianRv::isotropic(mean.clone(), 0.0).unwrap();
        let mut rng = filter_stream(0);
        assert_relative_eq!(rv.sample(&mut rng), mean);
        assert!(rv.is_degenerate());
    }

    #[test]
    fn sample_statistics_are_roughly_right() {
        let rv = GaussianRv::centered(1, 4.0).unwrap();
        let mut rng = filter_stream(1);
        let n = 20_000;
        let draws = rv.sample_matrix(n, &mut rng);
        let mean = draws.column_mean()[0];
        let var = draws.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / (n - 1) as f64;
        assert!(mean.abs() < 0.1, "sample mean {mean}");
        assert!((var - 4.0).abs() < 0.3, "sample var {var}");
    }

    #[test]
    fn singular_covariance_still_samples() {
        // Rank-one covariance: perfectly correlated components.
        let cov = DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 1.0, 1.0]);
        let rv = GaussianRv::new(DVector::zeros(2), cov).unwrap();
        let mut rng = filter_stream(2);
        let x = rv.sample(&mut rng);
        assert_relative_eq!(x[0], x[1], epsilon = 1e-9);
    }
}
