// boreas_core/src/methods/ienks.rs
//
// Iterative ensemble smoothers over the cycle window. Both methods treat
// the ensemble at the window start (right after the previous analysis) as
// the control variable and re-run the window forecast while assimilating
// the observation at the window end:
//
// - iEnKS: Gauss-Newton iterations in ensemble space, with the sensitivity
//   estimated either by finite differences across a scaled-down ensemble
//   ("bundle") or through the current square-root transform ("transform").
// - ES-MDA: multiple-data-assimilation smoother; a fixed number of
//   perturbed-observation sweeps with the observation-error covariance
//   inflated so the sweeps jointly assimilate the observation once.

use nalgebra::{Cholesky, DMatrix, DVector};
use serde::Deserialize;

use super::{post_process, validate_inflation, AnalysisContext, AnalysisOutcome};
use crate::ensemble::Ensemble;
use crate::errors::{ConfigError, MethodError};
use crate::utils::linalg;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensitivityVariant {
    /// Finite differences across members scaled by `bundle_eps`.
    Bundle,
    /// Ensemble linearization through the current transform matrix.
    Transform,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IEnKsConfig {
    #[serde(default = "default_variant")]
    pub variant: SensitivityVariant,
    #[serde(default = "default_max_iters")]
    pub max_iters: usize,
    /// Gauss-Newton stop: `|dw| <= tol`.
    #[serde(default = "default_tol")]
    pub tol: f64,
    /// Member scaling for the bundle finite differences.
    #[serde(default = "default_bundle_eps")]
    pub bundle_eps: f64,
    #[serde(default = "default_infl")]
    pub infl: f64,
    #[serde(default)]
    pub rotate: bool,
}

fn default_variant() -> SensitivityVariant {
    SensitivityVariant::Transform
}

fn default_max_iters() -> usize {
    10
}

fn default_tol() -> f64 {
    1e-4
}

fn default_bundle_eps() -> f64 {
    1e-4
}

fn default_infl() -> f64 {
    1.0
}

impl Default for IEnKsConfig {
    fn default() -> Self {
        IEnKsConfig {
            variant: default_variant(),
            max_iters: default_max_iters(),
            tol: default_tol(),
            bundle_eps: default_bundle_eps(),
            infl: 1.0,
            rotate: false,
        }
    }
}

impl IEnKsConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_inflation(self.infl)?;
        if self.max_iters == 0 {
            return Err(ConfigError::hyper("max_iters", "must be at least 1"));
        }
        if !(self.tol.is_finite() && self.tol > 0.0) {
            return Err(ConfigError::hyper(
                "tol",
                format!("must be positive, got {}", self.tol),
            ));
        }
        if !(self.bundle_eps.is_finite() && self.bundle_eps > 0.0 && self.bundle_eps <= 1.0) {
            return Err(ConfigError::hyper(
                "bundle_eps",
                format!("must be in (0, 1], got {}", self.bundle_eps),
            ));
        }
        Ok(())
    }
}

pub(super) fn analyse(
    config: &IEnKsConfig,
    ens: &mut Ensemble,
    obs: &DVector<f64>,
    ctx: &mut AnalysisContext,
) -> Result<AnalysisOutcome, MethodError> {
    let mut outcome = AnalysisOutcome::default();
    let n = ctx.window_start.num_members();
    let n1 = (n - 1).max(1) as f64;

    let (mean0, anom0) = ctx.window_start.mean_and_anomalies();

    let (r_inv_sqrt, regularized) = linalg::symmetric_inv_sqrt(ctx.hmm.r());
    outcome.regularized = regularized;

    let mut w = DVector::zeros(n);
    // Current square-root transform of the control anomalies (transform
    // variant); starts at the identity.
    let mut transform = DMatrix::identity(n, n);
    let mut hessian = DMatrix::identity(n, n) * n1;
    let mut converged = false;

    for iter in 0..config.max_iters {
        outcome.iterations = iter + 1;

        // Control ensemble for this iteration: mean shifted by A0 w, with
        // anomalies scaled per the sensitivity variant.
        let control_anoms = match config.variant {
            SensitivityVariant::Bundle => &anom0 * config.bundle_eps,
            SensitivityVariant::Transform => &anom0 * &transform,
        };
        let shift = &anom0 * &w;
        let mut control = ctx.window_start.clone();
        control.set_from_mean_anomalies(&(&mean0 + shift), &control_anoms);

        // Deterministic window forecast for the linearization.
        let forecast = ctx.forecast_window(&control, false);
        let observed = ctx.hmm.observation.observe_matrix(forecast.members(), ctx.t);
        let (z_mean, z_anom) = linalg::center(&observed);

        // Sensitivity of the observed mean w.r.t. w, back in the original
        // ensemble coordinates.
        let y_sens = match config.variant {
            SensitivityVariant::Bundle => &z_anom / config.bundle_eps,
            SensitivityVariant::Transform => {
                // Z T^-1, via the symmetric positive definite transform.
                match Cholesky::new(transform.clone()) {
                    Some(chol) => chol.solve(&z_anom.transpose()).transpose(),
                    None => {
                        let (t_inv, reg) = linalg::robust_spd_inverse(&transform);
                        outcome.regularized |= reg;
                        &z_anom * t_inv
                    }
                }
            }
        };

        let s = &r_inv_sqrt * &y_sens;
        let delta = &r_inv_sqrt * (obs - &z_mean);

        let gradient = &w * n1 - s.transpose() * &delta;
        hessian = s.transpose() * &s;
        for i in 0..n {
            hessian[(i, i)] += n1;
        }

        let dw = match Cholesky::new(hessian.clone()) {
            Some(chol) => chol.solve(&(-&gradient)),
            None => {
                let (h_inv, reg) = linalg::robust_spd_inverse(&hessian);
                outcome.regularized |= reg;
                h_inv * (-gradient)
            }
        };
        w += &dw;

        if let SensitivityVariant::Transform = config.variant {
            let (h_inv, reg) = linalg::robust_spd_inverse(&hessian);
            outcome.regularized |= reg;
            transform = linalg::symmetric_sqrt(&(h_inv * n1));
        }

        if dw.norm() <= config.tol {
            converged = true;
            break;
        }
    }
    // The cap is a hard stop, not an error.
    outcome.hit_iteration_cap = !converged;

    // Final anomaly transform from the last Hessian, then one noisy window
    // forecast carries the analysis to the current time.
    let (h_inv, reg) = linalg::robust_spd_inverse(&hessian);
    outcome.regularized |= reg;
    let t_final = linalg::symmetric_sqrt(&(h_inv * n1));

    let shift = &anom0 * &w;
    let mut analysis0 = ctx.window_start.clone();
    analysis0.set_from_mean_anomalies(&(&mean0 + shift), &(&anom0 * t_final));
    let analysis = ctx.forecast_window(&analysis0, true);
    ens.set_members(analysis.members().clone());

    post_process(ens, config.infl, config.rotate, ctx.rng);
    Ok(outcome)
}

// --- ES-MDA ---

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EsMdaConfig {
    /// Number of data-assimilation sweeps; `R` is inflated by this factor in
    /// each sweep so that `sum(1/alpha) = 1`.
    #[serde(default = "default_sweeps")]
    pub sweeps: usize,
    #[serde(default = "default_infl")]
    pub infl: f64,
}

fn default_sweeps() -> usize {
    4
}

impl Default for EsMdaConfig {
    fn default() -> Self {
        EsMdaConfig {
            sweeps: default_sweeps(),
            infl: 1.0,
        }
    }
}

impl EsMdaConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_inflation(self.infl)?;
        if self.sweeps == 0 {
            return Err(ConfigError::hyper("sweeps", "must be at least 1"));
        }
        Ok(())
    }
}

pub(super) fn analyse_mda(
    config: &EsMdaConfig,
    ens: &mut Ensemble,
    obs: &DVector<f64>,
    ctx: &mut AnalysisContext,
) -> Result<AnalysisOutcome, MethodError> {
    let mut outcome = AnalysisOutcome::default();
    let n = ctx.window_start.num_members();
    let n1 = (n - 1).max(1) as f64;
    let alpha = config.sweeps as f64;

    // Smoother update of the window-start ensemble, one sweep at a time.
    let mut current = ctx.window_start.clone();
    for sweep in 0..config.sweeps {
        outcome.iterations = sweep + 1;

        let forecast = ctx.forecast_window(&current, true);
        let observed = ctx.hmm.observation.observe_matrix(forecast.members(), ctx.t);
        let (z_mean, z_anom) = linalg::center(&observed);
        let innovation = obs - z_mean;

        let (_, a_cur) = current.mean_and_anomalies();
        let c = &z_anom * z_anom.transpose() + ctx.hmm.r() * (n1 * alpha);
        let (c_inv, reg) = linalg::robust_spd_inverse(&c);
        outcome.regularized |= reg;
        let gain = &a_cur * z_anom.transpose() * c_inv;

        // Perturbed observations with the sweep-inflated R.
        let draws = ctx.hmm.obs_noise.sample_matrix(n, ctx.rng);
        let (_, mut perturbations) = linalg::center(&draws);
        perturbations *= (alpha * n as f64 / n1).sqrt();

        let mut obs_incr = perturbations - z_anom;
        for mut col in obs_incr.column_iter_mut() {
            col += &innovation;
        }
        *current.members_mut() += gain * obs_incr;
        if !current.is_finite() {
            return Err(MethodError::Diverged("non-finite member in ES-MDA sweep"));
        }
    }

    let analysis = ctx.forecast_window(&current, true);
    ens.set_members(analysis.members().clone());

    post_process(ens, config.infl, false, ctx.rng);
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::methods::enkf::EnKfConfig;
    use crate::methods::testkit::{gaussian_ensemble, identity_hmm};
    use crate::methods::{AnalysisContext, Method};
    use crate::rng::filter_stream;
    use approx::assert_relative_eq;

    /// Runs a method with an explicit window: start ensemble plus one
    /// identity forecast step.
    fn analyse_with_window(
        method: &Method,
        window_start: &Ensemble,
        ens: &mut Ensemble,
        obs: &DVector<f64>,
        hmm: &crate::hmm::Hmm,
    ) -> AnalysisOutcome {
        let mut rng = filter_stream(99);
        let mut ctx = AnalysisContext {
            hmm,
            t: 0.1,
            window_start,
            window_times: &[0.0],
            rng: &mut rng,
        };
        method.analyse(ens, obs, &mut ctx).expect("analysis failed")
    }

    #[test]
    fn linear_model_converges_to_etkf_in_two_iterations() {
        // Identity dynamics, no Q: the window forecast is the identity, so
        // the Gauss-Newton problem is exactly the ETKF one and the second
        // iteration's update must vanish.
        let hmm = identity_hmm(2, 0.7);
        let window_start = gaussian_ensemble(2, 15, 41);
        let y = DVector::from_vec(vec![0.5, -0.2]);

        let mut ienks_ens = window_start.clone();
        let ienks = Method::IEnKs(IEnKsConfig::default());
        let outcome = analyse_with_window(&ienks, &window_start, &mut ienks_ens, &y, &hmm);
        assert!(outcome.iterations <= 2, "took {} iterations", outcome.iterations);
        assert!(!outcome.hit_iteration_cap);

        let mut etkf_ens = window_start.clone();
        let etkf = Method::EnKf(EnKfConfig::sqrt());
        analyse_with_window(&etkf, &window_start, &mut etkf_ens, &y, &hmm);

        assert_relative_eq!(ienks_ens.mean(), etkf_ens.mean(), epsilon = 1e-6);
    }

    #[test]
    fn bundle_and_transform_agree_on_linear_models() {
        let hmm = identity_hmm(2, 1.0);
        let window_start = gaussian_ensemble(2, 12, 43);
        let y = DVector::from_vec(vec![-0.4, 0.9]);

        let mut bundle_ens = window_start.clone();
        let mut transform_ens = window_start.clone();
        let bundle = Method::IEnKs(IEnKsConfig {
            variant: SensitivityVariant::Bundle,
            ..IEnKsConfig::default()
        });
        let transform = Method::IEnKs(IEnKsConfig::default());
        analyse_with_window(&bundle, &window_start, &mut bundle_ens, &y, &hmm);
        analyse_with_window(&transform, &window_start, &mut transform_ens, &y, &hmm);

        assert_relative_eq!(bundle_ens.mean(), transform_ens.mean(), epsilon = 1e-5);
    }

    #[test]
    fn iteration_cap_is_flagged_not_fatal() {
        let hmm = identity_hmm(1, 1.0);
        let window_start = gaussian_ensemble(1, 8, 47);
        let y = DVector::from_element(1, 3.0);

        let mut ens = window_start.clone();
        let method = Method::IEnKs(IEnKsConfig {
            max_iters: 1,
            tol: 1e-15,
            ..IEnKsConfig::default()
        });
        let outcome = analyse_with_window(&method, &window_start, &mut ens, &y, &hmm);
        assert!(outcome.hit_iteration_cap);
        assert!(ens.is_finite());
    }

    #[test]
    fn esmda_mean_approaches_kalman_for_linear_models() {
        // For linear-Gaussian problems ES-MDA is consistent with the single
        // Kalman update in expectation; with many members the means agree
        // to sampling accuracy.
        let hmm = identity_hmm(1, 1.0);
        let window_start = gaussian_ensemble(1, 400, 53);
        let y = DVector::from_element(1, 1.0);

        let mut mda_ens = window_start.clone();
        let mda = Method::EsMda(EsMdaConfig::default());
        analyse_with_window(&mda, &window_start, &mut mda_ens, &y, &hmm);

        let mut etkf_ens = window_start.clone();
        let etkf = Method::EnKf(EnKfConfig::sqrt());
        analyse_with_window(&etkf, &window_start, &mut etkf_ens, &y, &hmm);

        assert_relative_eq!(mda_ens.mean()[0], etkf_ens.mean()[0], epsilon = 0.12);
    }

    #[test]
    fn rejects_bad_hyperparameters() {
        assert!(IEnKsConfig {
            max_iters: 0,
            ..IEnKsConfig::default()
        }
        .validate()
        .is_err());
        assert!(IEnKsConfig {
            bundle_eps: 0.0,
            ..IEnKsConfig::default()
        }
        .validate()
        .is_err());
        assert!(EsMdaConfig {
            sweeps: 0,
            ..EsMdaConfig::default()
        }
        .validate()
        .is_err());
    }
}
