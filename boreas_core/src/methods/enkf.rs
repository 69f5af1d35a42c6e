// boreas_core/src/methods/enkf.rs
//
// The ensemble Kalman filter family: the stochastic perturbed-observation
// update and the two deterministic flavors (symmetric square-root ETKF and
// Sakov's DEnKF). All three share the same observed-anomaly algebra; they
// differ only in how the analysis spread is realized.

use nalgebra::{DMatrix, DVector};
use serde::Deserialize;

use super::{obs_space, post_process, validate_inflation, AnalysisContext, AnalysisOutcome};
use crate::ensemble::Ensemble;
use crate::errors::{ConfigError, MethodError};
use crate::utils::linalg;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnKfVariant {
    /// Stochastic update with (centered) perturbed observations.
    PertObs,
    /// Symmetric square-root transform of the anomalies (ETKF).
    Sqrt,
    /// Deterministic EnKF: exact Kalman mean, half-gain anomaly update.
    DEnKf,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnKfConfig {
    pub variant: EnKfVariant,
    /// Post-analysis multiplicative inflation, `>= 1`.
    #[serde(default = "default_infl")]
    pub infl: f64,
    /// Random mean-preserving rotation after the update.
    #[serde(default)]
    pub rotate: bool,
}

fn default_infl() -> f64 {
    1.0
}

impl EnKfConfig {
    pub fn sqrt() -> Self {
        EnKfConfig {
            variant: EnKfVariant::Sqrt,
            infl: 1.0,
            rotate: false,
        }
    }

    pub fn pert_obs() -> Self {
        EnKfConfig {
            variant: EnKfVariant::PertObs,
            infl: 1.0,
            rotate: false,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_inflation(self.infl)
    }
}

pub(super) fn analyse(
    config: &EnKfConfig,
    ens: &mut Ensemble,
    obs: &DVector<f64>,
    ctx: &mut AnalysisContext,
) -> Result<AnalysisOutcome, MethodError> {
    let mut outcome = AnalysisOutcome::default();
    let space = obs_space(ens, obs, ctx.hmm, ctx.t);

    match config.variant {
        EnKfVariant::PertObs => {
            outcome.regularized = pert_obs_update(ens, &space.y_anom, &space.innovation, ctx)?;
        }
        EnKfVariant::Sqrt => {
            outcome.regularized = sqrt_update(ens, &space.y_anom, &space.innovation, ctx)?;
        }
        EnKfVariant::DEnKf => {
            outcome.regularized = denkf_update(ens, &space.y_anom, &space.innovation, ctx)?;
        }
    }

    post_process(ens, config.infl, config.rotate, ctx.rng);
    Ok(outcome)
}

/// Kalman gain from observed anomalies: `K = A Y^T (Y Y^T + (N-1) R)^-1`.
/// Returns the gain and whether the inversion had to be regularized.
fn ensemble_gain(
    anomalies: &DMatrix<f64>,
    y_anom: &DMatrix<f64>,
    r: &DMatrix<f64>,
    n1: f64,
) -> (DMatrix<f64>, bool) {
    let c = y_anom * y_anom.transpose() + r * n1;
    let (c_inv, regularized) = linalg::robust_spd_inverse(&c);
    (anomalies * y_anom.transpose() * c_inv, regularized)
}

fn pert_obs_update(
    ens: &mut Ensemble,
    y_anom: &DMatrix<f64>,
    innovation: &DVector<f64>,
    ctx: &mut AnalysisContext,
) -> Result<bool, MethodError> {
    let n = ens.num_members();
    let n1 = (n - 1).max(1) as f64;
    let anomalies = ens.anomalies();
    let (gain, regularized) = ensemble_gain(&anomalies, y_anom, ctx.hmm.r(), n1);

    // Perturbed observations, centered so the update stays unbiased, and
    // rescaled so their sample covariance is unbiased for R.
    let draws = ctx.hmm.obs_noise.sample_matrix(n, ctx.rng);
    let (_, mut perturbations) = linalg::center(&draws);
    perturbations *= (n as f64 / n1).sqrt();

    // Each member is nudged toward its own perturbed copy of the obs:
    // E_j += K (d + D_j - Y_j).
    let mut obs_incr = perturbations - y_anom;
    for mut col in obs_incr.column_iter_mut() {
        col += innovation;
    }
    *ens.members_mut() += gain * obs_incr;
    Ok(regularized)
}

fn sqrt_update(
    ens: &mut Ensemble,
    y_anom: &DMatrix<f64>,
    innovation: &DVector<f64>,
    ctx: &mut AnalysisContext,
) -> Result<bool, MethodError> {
    let n = ens.num_members();
    let n1 = (n - 1).max(1) as f64;
    let (mean, anomalies) = ens.mean_and_anomalies();

    let (r_inv_sqrt, regularized) = linalg::symmetric_inv_sqrt(ctx.hmm.r());
    let s = &r_inv_sqrt * y_anom;
    let delta = &r_inv_sqrt * innovation;

    // Ensemble-space posterior: Pa = (n1 I + S^T S)^-1, via eigen pairs of
    // S^T S so the symmetric square root comes for free.
    let sts = s.transpose() * &s;
    let (vals, vecs) = linalg::symmetric_eigen_clamped(&sts);

    let rhs = vecs.transpose() * (s.transpose() * delta);
    let scaled = DVector::from_fn(n, |i, _| rhs[i] / (n1 + vals[i]));
    let w_mean = &vecs * scaled;

    let sqrt_diag = DMatrix::from_diagonal(&vals.map(|l| (n1 / (n1 + l)).sqrt()));
    let mut transform = &vecs * sqrt_diag * vecs.transpose();
    for mut col in transform.column_iter_mut() {
        col += &w_mean;
    }

    let new_anomalies = &anomalies * transform;
    ens.set_from_mean_anomalies(&mean, &new_anomalies);
    Ok(regularized)
}

fn denkf_update(
    ens: &mut Ensemble,
    y_anom: &DMatrix<f64>,
    innovation: &DVector<f64>,
    ctx: &mut AnalysisContext,
) -> Result<bool, MethodError> {
    let n1 = (ens.num_members() - 1).max(1) as f64;
    let (mean, anomalies) = ens.mean_and_anomalies();
    let (gain, regularized) = ensemble_gain(&anomalies, y_anom, ctx.hmm.r(), n1);

    let new_mean = mean + &gain * innovation;
    // Half-gain anomaly update approximates the square-root contraction
    // without perturbing observations.
    let new_anomalies = &anomalies - (gain * y_anom) * 0.5;
    ens.set_from_mean_anomalies(&new_mean, &new_anomalies);
    Ok(regularized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::methods::testkit::{analyse_once, gaussian_ensemble, identity_hmm, scalar_kalman};
    use crate::methods::Method;
    use approx::assert_relative_eq;
    use nalgebra::DVector;

    fn scalar_sample_stats(ens: &Ensemble) -> (f64, f64) {
        let mean = ens.mean()[0];
        let n1 = (ens.num_members() - 1) as f64;
        let var = ens
            .members()
            .iter()
            .map(|v| (v - mean) * (v - mean))
            .sum::<f64>()
            / n1;
        (mean, var)
    }

    #[test]
    fn sqrt_update_matches_scalar_kalman_exactly() {
        let hmm = identity_hmm(1, 0.5);
        let mut ens = gaussian_ensemble(1, 20, 7);
        let (m_f, v_f) = scalar_sample_stats(&ens);
        let y = DVector::from_element(1, 1.3);

        let method = Method::EnKf(EnKfConfig::sqrt());
        analyse_once(&method, &mut ens, &y, &hmm, 1);

        let (expected_mean, expected_var) = scalar_kalman(m_f, v_f, 1.3, 0.5);
        let (m_a, v_a) = scalar_sample_stats(&ens);
        assert_relative_eq!(m_a, expected_mean, epsilon = 1e-10);
        assert_relative_eq!(v_a, expected_var, epsilon = 1e-10);
    }

    #[test]
    fn sqrt_anomalies_are_mean_zero() {
        for n in [2, 3, 5, 40] {
            let hmm = identity_hmm(3, 1.0);
            let mut ens = gaussian_ensemble(3, n, 11);
            let y = DVector::from_element(3, 0.4);
            let method = Method::EnKf(EnKfConfig::sqrt());
            analyse_once(&method, &mut ens, &y, &hmm, 2);

            let anomalies = ens.anomalies();
            for i in 0..3 {
                let row_sum: f64 = (0..n).map(|j| anomalies[(i, j)]).sum();
                assert_relative_eq!(row_sum, 0.0, epsilon = 1e-9);
            }
        }
    }

    #[test]
    fn denkf_mean_matches_scalar_kalman() {
        let hmm = identity_hmm(1, 2.0);
        let mut ens = gaussian_ensemble(1, 30, 3);
        let (m_f, v_f) = scalar_sample_stats(&ens);
        let y = DVector::from_element(1, -0.7);

        let method = Method::EnKf(EnKfConfig {
            variant: EnKfVariant::DEnKf,
            infl: 1.0,
            rotate: false,
        });
        analyse_once(&method, &mut ens, &y, &hmm, 4);

        let (expected_mean, _) = scalar_kalman(m_f, v_f, -0.7, 2.0);
        assert_relative_eq!(ens.mean()[0], expected_mean, epsilon = 1e-10);
    }

    #[test]
    fn pert_obs_update_is_unbiased_in_the_mean() {
        // Centered perturbations make the mean update exactly Kalman.
        let hmm = identity_hmm(1, 1.0);
        let mut ens = gaussian_ensemble(1, 200, 5);
        let (m_f, v_f) = scalar_sample_stats(&ens);
        let y = DVector::from_element(1, 0.9);

        let method = Method::EnKf(EnKfConfig::pert_obs());
        analyse_once(&method, &mut ens, &y, &hmm, 6);

        let (expected_mean, _) = scalar_kalman(m_f, v_f, 0.9, 1.0);
        assert_relative_eq!(ens.mean()[0], expected_mean, epsilon = 1e-10);
    }

    #[test]
    fn inflation_is_applied_after_update() {
        let hmm = identity_hmm(1, 0.5);
        let y = DVector::from_element(1, 0.0);

        let mut plain = gaussian_ensemble(1, 15, 9);
        let mut inflated = plain.clone();
        analyse_once(&Method::EnKf(EnKfConfig::sqrt()), &mut plain, &y, &hmm, 1);
        let method = Method::EnKf(EnKfConfig {
            variant: EnKfVariant::Sqrt,
            infl: 1.25,
            rotate: false,
        });
        analyse_once(&method, &mut inflated, &y, &hmm, 1);

        assert_relative_eq!(inflated.spread(), 1.25 * plain.spread(), epsilon = 1e-10);
        assert_relative_eq!(inflated.mean()[0], plain.mean()[0], epsilon = 1e-10);
    }

    #[test]
    fn rejects_deflating_inflation() {
        let config = EnKfConfig {
            variant: EnKfVariant::Sqrt,
            infl: 0.9,
            rotate: false,
        };
        assert!(config.validate().is_err());
    }
}
