// boreas_core/src/utils/linalg.rs
//
// Numerically defensive building blocks shared by the analysis algorithms:
// centering, symmetric square roots, regularized SPD inversion, and random
// orthogonal matrices. Near-singular input is always recovered locally (the
// caller is told regularization fired); nothing in here panics on bad
// conditioning.

use nalgebra::{Cholesky, DMatrix, DVector, SymmetricEigen};
use rand::Rng;
use rand_distr::StandardNormal;
use tracing::debug;

/// Relative jitter used as the first regularization attempt on a Cholesky
/// failure. Grows by 10x per retry.
const JITTER_REL: f64 = 1e-8;
const JITTER_ATTEMPTS: usize = 4;

/// Splits a members-as-columns matrix into its column mean and anomalies
/// (each column minus the mean).
pub fn center(members: &DMatrix<f64>) -> (DVector<f64>, DMatrix<f64>) {
    let mean = members.column_mean();
    let mut anomalies = members.clone();
    for mut col in anomalies.column_iter_mut() {
        col -= &mean;
    }
    (mean, anomalies)
}

/// Mean of the columns of `members` under the given normalized weights.
pub fn weighted_mean(members: &DMatrix<f64>, weights: &DVector<f64>) -> DVector<f64> {
    members * weights
}

/// Eigendecomposition of the symmetric part of `m`, with eigenvalues clamped
/// to be non-negative. Returns `(eigenvalues, eigenvectors)`.
pub fn symmetric_eigen_clamped(m: &DMatrix<f64>) -> (DVector<f64>, DMatrix<f64>) {
    let n = m.nrows();
    let sym = (m + m.transpose()) * 0.5;
    match SymmetricEigen::try_new(sym, f64::EPSILON, 0) {
        Some(eig) => (eig.eigenvalues.map(|l| l.max(0.0)), eig.eigenvectors),
        // Unreachable with max_niter = 0, but the API is fallible.
        None => (DVector::zeros(n), DMatrix::identity(n, n)),
    }
}

/// Symmetric positive semi-definite square root, `B` such that `B B = M`.
pub fn symmetric_sqrt(m: &DMatrix<f64>) -> DMatrix<f64> {
    let (vals, vecs) = symmetric_eigen_clamped(m);
    let sqrt_diag = DMatrix::from_diagonal(&vals.map(|l| l.sqrt()));
    &vecs * sqrt_diag * vecs.transpose()
}

/// Symmetric inverse square root with a relative eigenvalue floor.
///
/// Returns the matrix and whether any eigenvalue had to be floored
/// (a recovered near-singularity, surfaced as a numerical warning upstream).
pub fn symmetric_inv_sqrt(m: &DMatrix<f64>) -> (DMatrix<f64>, bool) {
    let (vals, vecs) = symmetric_eigen_clamped(m);
    let max = vals.max();
    let floor = max.max(f64::MIN_POSITIVE) * 1e-12;
    let mut regularized = false;
    let inv_sqrt_diag = DMatrix::from_diagonal(&vals.map(|l| {
        if l < floor {
            regularized = true;
            1.0 / floor.sqrt()
        } else {
            1.0 / l.sqrt()
        }
    }));
    (&vecs * inv_sqrt_diag * vecs.transpose(), regularized)
}

/// Inverse of a symmetric positive definite matrix.
///
/// Tries a plain Cholesky first; on failure adds growing multiples of
/// `mean(diag) * I` and retries, falling back to a floored eigendecomposition
/// if the matrix is hopeless. The boolean reports that regularization fired.
pub fn robust_spd_inverse(m: &DMatrix<f64>) -> (DMatrix<f64>, bool) {
    if let Some(chol) = Cholesky::new(m.clone()) {
        return (chol.inverse(), false);
    }

    let n = m.nrows();
    let scale = (m.diagonal().iter().map(|d| d.abs()).sum::<f64>() / n as f64)
        .max(f64::MIN_POSITIVE);
    let mut jitter = scale * JITTER_REL;
    for _ in 0..JITTER_ATTEMPTS {
        let mut reg = m.clone();
        for i in 0..n {
            reg[(i, i)] += jitter;
        }
        if let Some(chol) = Cholesky::new(reg) {
            debug!(jitter, "regularized a near-singular SPD inversion");
            return (chol.inverse(), true);
        }
        jitter *= 10.0;
    }

    // Hopeless by Cholesky standards; invert through floored eigenvalues.
    let (vals, vecs) = symmetric_eigen_clamped(m);
    let floor = vals.max().max(f64::MIN_POSITIVE) * 1e-12;
    let inv_diag = DMatrix::from_diagonal(&vals.map(|l| 1.0 / l.max(floor)));
    (&vecs * inv_diag * vecs.transpose(), true)
}

/// Log-density of a zero-mean Gaussian with covariance `cov` evaluated at
/// `innovation`. Regularizes instead of failing on a bad covariance.
pub fn gaussian_logpdf(innovation: &DVector<f64>, cov: &DMatrix<f64>) -> f64 {
    let k = innovation.len() as f64;
    match Cholesky::new(cov.clone()) {
        Some(chol) => {
            let log_det = 2.0 * chol.l().diagonal().iter().map(|d| d.ln()).sum::<f64>();
            let maha = innovation.dot(&chol.solve(innovation));
            -0.5 * (maha + log_det + k * (2.0 * std::f64::consts::PI).ln())
        }
        None => {
            let (inv, _) = robust_spd_inverse(cov);
            let (vals, _) = symmetric_eigen_clamped(cov);
            let floor = vals.max().max(f64::MIN_POSITIVE) * 1e-12;
            let log_det = vals.iter().map(|l| l.max(floor).ln()).sum::<f64>();
            let maha = innovation.dot(&(&inv * innovation));
            -0.5 * (maha + log_det + k * (2.0 * std::f64::consts::PI).ln())
        }
    }
}

/// Random orthogonal matrix (Haar-distributed) via QR of a Gaussian matrix
/// with the usual sign fix on the diagonal of `R`.
pub fn random_orthogonal(n: usize, rng: &mut impl Rng) -> DMatrix<f64> {
    let g = DMatrix::from_fn(n, n, |_, _| rng.sample::<f64, _>(StandardNormal));
    let (mut q, r) = g.qr().unpack();
    for j in 0..n {
        if r[(j, j)] < 0.0 {
            q.column_mut(j).neg_mut();
        }
    }
    q
}

/// Random orthogonal matrix that leaves the ones vector invariant.
///
/// Right-multiplying anomalies by this matrix randomizes the ensemble
/// subspace while preserving both the mean (rows still sum to zero) and the
/// sample covariance exactly.
pub fn mean_preserving_rotation(n: usize, rng: &mut impl Rng) -> DMatrix<f64> {
    if n < 2 {
        return DMatrix::identity(n, n);
    }
    // Orthonormal basis of the complement of the ones vector: QR of a matrix
    // whose first column is the ones vector.
    let mut seed = DMatrix::zeros(n, n);
    seed.column_mut(0).fill(1.0);
    for j in 1..n {
        seed[(j, j)] = 1.0;
    }
    let (q, _) = seed.qr().unpack();
    let v = q.columns(1, n - 1).into_owned();

    let inner = random_orthogonal(n - 1, rng);
    let ones_projector = DMatrix::from_element(n, n, 1.0 / n as f64);
    &v * inner * v.transpose() + ones_projector
}

/// True if every off-diagonal entry is negligible relative to the diagonal.
pub fn is_effectively_diagonal(m: &DMatrix<f64>) -> bool {
    let scale = m
        .diagonal()
        .iter()
        .map(|d| d.abs())
        .fold(0.0_f64, f64::max)
        .max(f64::MIN_POSITIVE);
    for i in 0..m.nrows() {
        for j in 0..m.ncols() {
            if i != j && m[(i, j)].abs() > scale * 1e-12 {
                return false;
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn center_removes_mean() {
        let m = DMatrix::from_row_slice(2, 3, &[1.0, 2.0, 3.0, 4.0, 6.0, 8.0]);
        let (mean, anom) = center(&m);
        assert_relative_eq!(mean[0], 2.0);
        assert_relative_eq!(mean[1], 6.0);
        for i in 0..2 {
            let row_sum: f64 = (0..3).map(|j| anom[(i, j)]).sum();
            assert_relative_eq!(row_sum, 0.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn symmetric_sqrt_squares_back() {
        let m = DMatrix::from_row_slice(2, 2, &[4.0, 1.0, 1.0, 3.0]);
        let s = symmetric_sqrt(&m);
        assert_relative_eq!(&s * &s, m, epsilon = 1e-10);
    }

    #[test]
    fn robust_inverse_matches_plain_inverse_when_well_conditioned() {
        let m = DMatrix::from_row_slice(2, 2, &[4.0, 1.0, 1.0, 3.0]);
        let (inv, regularized) = robust_spd_inverse(&m);
        assert!(!regularized);
        assert_relative_eq!(&m * inv, DMatrix::identity(2, 2), epsilon = 1e-10);
    }

    #[test]
    fn robust_inverse_regularizes_singular_input() {
        // Rank-one, hence singular.
        let m = DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 1.0, 1.0]);
        let (inv, regularized) = robust_spd_inverse(&m);
        assert!(regularized);
        assert!(inv.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn rotation_is_orthogonal_and_mean_preserving() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let n = 7;
        let om = mean_preserving_rotation(n, &mut rng);
        assert_relative_eq!(&om * om.transpose(), DMatrix::identity(n, n), epsilon = 1e-10);
        let ones = DVector::from_element(n, 1.0);
        assert_relative_eq!(&om * &ones, ones, epsilon = 1e-10);
    }

    #[test]
    fn logpdf_matches_scalar_formula() {
        let d = DVector::from_element(1, 0.5);
        let cov = DMatrix::from_element(1, 1, 2.0);
        let expected = -0.5 * (0.25 / 2.0 + 2.0_f64.ln() + (2.0 * std::f64::consts::PI).ln());
        assert_relative_eq!(gaussian_logpdf(&d, &cov), expected, epsilon = 1e-12);
    }
}
