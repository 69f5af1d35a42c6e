// boreas_core/src/methods/enkf_n.rs
//
// Finite-size EnKF (EnKF-N): instead of a hand-tuned inflation factor, the
// analysis infers the effective prior weight from the innovation itself.
// The ETKF ensemble-space algebra is kept, but the `(N-1)` prior precision
// is replaced by a scalar dual variable `zeta` solved by a one-dimensional
// fixed-point iteration per analysis step. `zeta < N-1` acts as inflation,
// `zeta > N-1` as (mild) deflation of the prior weight.

use nalgebra::{DMatrix, DVector};
use serde::Deserialize;

use super::{obs_space, post_process, validate_inflation, AnalysisContext, AnalysisOutcome};
use crate::ensemble::Ensemble;
use crate::errors::{ConfigError, MethodError};
use crate::utils::linalg;

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnKfNConfig {
    /// Extra fixed inflation applied on top of the adaptive factor.
    #[serde(default = "default_infl")]
    pub infl: f64,
    #[serde(default)]
    pub rotate: bool,
    /// Cap on the scalar fixed-point iteration. Hitting it is flagged, not
    /// an error.
    #[serde(default = "default_max_iters")]
    pub max_iters: usize,
    /// Relative tolerance on `zeta` between iterates.
    #[serde(default = "default_tol")]
    pub tol: f64,
}

fn default_infl() -> f64 {
    1.0
}

fn default_max_iters() -> usize {
    20
}

fn default_tol() -> f64 {
    1e-6
}

impl Default for EnKfNConfig {
    fn default() -> Self {
        EnKfNConfig {
            infl: 1.0,
            rotate: false,
            max_iters: default_max_iters(),
            tol: default_tol(),
        }
    }
}

impl EnKfNConfig {
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
        Ok(())
    }
}

pub(super) fn analyse(
    config: &EnKfNConfig,
    ens: &mut Ensemble,
    obs: &DVector<f64>,
    ctx: &mut AnalysisContext,
) -> Result<AnalysisOutcome, MethodError> {
    let mut outcome = AnalysisOutcome::default();
    let n = ens.num_members();
    let n1 = (n - 1).max(1) as f64;
    // Hyperprior constant of the finite-size filter.
    let e_n = 1.0 + 1.0 / n as f64;

    let space = obs_space(ens, obs, ctx.hmm, ctx.t);
    let (mean, anomalies) = ens.mean_and_anomalies();

    let (r_inv_sqrt, regularized) = linalg::symmetric_inv_sqrt(ctx.hmm.r());
    outcome.regularized = regularized;
    let s = &r_inv_sqrt * &space.y_anom;
    let delta = &r_inv_sqrt * &space.innovation;

    let sts = s.transpose() * &s;
    let (vals, vecs) = linalg::symmetric_eigen_clamped(&sts);
    let rhs = vecs.transpose() * (s.transpose() * &delta);

    // Fixed point: w(zeta) minimizes the quadratic part, then
    // zeta = N / (e_N + |w|^2) from the gradient of the log prior term.
    let mut zeta = n1;
    let mut converged = false;
    for iter in 0..config.max_iters {
        outcome.iterations = iter + 1;
        let w_sq = (0..n)
            .map(|i| {
                let wi = rhs[i] / (zeta + vals[i]);
                wi * wi
            })
            .sum::<f64>();
        let next = n as f64 / (e_n + w_sq);
        let delta_zeta = (next - zeta).abs();
        zeta = next;
        if delta_zeta <= config.tol * zeta.max(1.0) {
            converged = true;
            break;
        }
    }
    outcome.hit_iteration_cap = !converged;

    let scaled = DVector::from_fn(n, |i, _| rhs[i] / (zeta + vals[i]));
    let w_mean = &vecs * scaled;

    // Anomaly transform: the ETKF square root with (N-1) -> zeta on the
    // prior precision, keeping the (N-1) normalization of the anomalies.
    let sqrt_diag = DMatrix::from_diagonal(&vals.map(|l| (n1 / (zeta + l)).sqrt()));
    let mut transform = &vecs * sqrt_diag * vecs.transpose();
    for mut col in transform.column_iter_mut() {
        col += &w_mean;
    }
    let new_anomalies = &anomalies * transform;
    ens.set_from_mean_anomalies(&mean, &new_anomalies);

    outcome.effective_inflation = Some((n1 / zeta).sqrt());
    post_process(ens, config.infl, config.rotate, ctx.rng);
    Ok(outcome)
}
