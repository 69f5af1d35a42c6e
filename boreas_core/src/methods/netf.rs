// boreas_core/src/methods/netf.rs
//
// Nonlinear ensemble transform filter. Like a particle filter it weights
// members by their observation likelihood, but instead of resampling it
// rebuilds the ensemble deterministically: the weighted mean becomes the
// analysis mean, and the anomalies are transformed by the symmetric square
// root of `N (diag(w) - w w^T)` so the analysis covariance matches the
// weighted sample covariance exactly.

use nalgebra::{DMatrix, DVector};
use serde::Deserialize;

use super::{post_process, validate_inflation, AnalysisContext, AnalysisOutcome};
use crate::ensemble::Ensemble;
use crate::errors::{ConfigError, MethodError};
use crate::utils::linalg;

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetfConfig {
    #[serde(default = "default_infl")]
    pub infl: f64,
    /// Random rotation after the transform. Customary for the NETF, where
    /// repeated symmetric transforms otherwise bias the subspace.
    #[serde(default = "default_rotate")]
    pub rotate: bool,
}

fn default_infl() -> f64 {
    1.0
}

fn default_rotate() -> bool {
    true
}

impl Default for NetfConfig {
    fn default() -> Self {
        NetfConfig {
            infl: 1.0,
            rotate: true,
        }
    }
}

impl NetfConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_inflation(self.infl)
    }
}

pub(super) fn analyse(
    config: &NetfConfig,
    ens: &mut Ensemble,
    obs: &DVector<f64>,
    ctx: &mut AnalysisContext,
) -> Result<AnalysisOutcome, MethodError> {
    let mut outcome = AnalysisOutcome::default();
    let n = ens.num_members();

    let observed = ctx.hmm.observation.observe_matrix(ens.members(), ctx.t);
    let (r_inv, regularized) = linalg::robust_spd_inverse(ctx.hmm.r());
    outcome.regularized = regularized;

    // Likelihood weights, log-sum-exp normalized.
    let mut log_w = DVector::zeros(n);
    for j in 0..n {
        let innovation = obs - observed.column(j);
        log_w[j] = -0.5 * innovation.dot(&(&r_inv * &innovation));
    }
    let max_log = log_w.max();
    if !max_log.is_finite() {
        return Err(MethodError::Diverged("non-finite likelihood in NETF"));
    }
    let mut weights = log_w.map(|lw| (lw - max_log).exp());
    let total: f64 = weights.iter().sum();
    weights /= total;

    let (mean, anomalies) = ens.mean_and_anomalies();
    let analysis_mean = &mean + &anomalies * &weights;

    // W = sqrtm( N (diag(w) - w w^T) ); positive semi-definite by
    // construction, clamped in the eigen square root.
    let mut inner = DMatrix::from_diagonal(&weights);
    inner -= &weights * weights.transpose();
    let transform = linalg::symmetric_sqrt(&(inner * n as f64));

    let new_anomalies = &anomalies * transform;
    ens.set_from_mean_anomalies(&analysis_mean, &new_anomalies);

    post_process(ens, config.infl, config.rotate, ctx.rng);
    Ok(outcome)
}
