// boreas_core/src/methods/rhf.rs
//
// Serial rank-histogram filter (after Anderson). Each scalar observation is
// assimilated on its own: the observed ensemble defines a piecewise-uniform
// prior with mass 1/(N+1) between consecutive order statistics (flat tails
// one ensemble-sigma wide), the Gaussian likelihood reweights those regions,
// and the members move to the equal-mass quantiles of the resulting
// posterior. The scalar increments are then regressed linearly onto every
// state component. No Gaussian assumption is made about the prior itself.

use nalgebra::DVector;
use serde::Deserialize;

use super::{post_process, validate_inflation, AnalysisContext, AnalysisOutcome};
use crate::ensemble::Ensemble;
use crate::errors::{ConfigError, MethodError};
use crate::hmm::Hmm;
use crate::utils::linalg;

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RhfConfig {
    #[serde(default = "default_infl")]
    pub infl: f64,
}

fn default_infl() -> f64 {
    1.0
}

impl Default for RhfConfig {
    fn default() -> Self {
        RhfConfig { infl: 1.0 }
    }
}

impl RhfConfig {
    pub fn validate(&self, hmm: &Hmm) -> Result<(), ConfigError> {
        validate_inflation(self.infl)?;
        if !linalg::is_effectively_diagonal(hmm.r()) {
            return Err(ConfigError::MethodRequirement {
                method: "RHF",
                requirement: "a diagonal observation-error covariance".to_string(),
            });
        }
        if hmm.r().diagonal().iter().any(|v| *v <= 0.0) {
            return Err(ConfigError::MethodRequirement {
                method: "RHF",
                requirement: "strictly positive observation-error variances".to_string(),
            });
        }
        Ok(())
    }
}

pub(super) fn analyse(
    config: &RhfConfig,
    ens: &mut Ensemble,
    obs: &DVector<f64>,
    ctx: &mut AnalysisContext,
) -> Result<AnalysisOutcome, MethodError> {
    let n = ens.num_members();
    let n1 = (n - 1).max(1) as f64;
    let r_diag = ctx.hmm.r().diagonal();

    for j in 0..ctx.hmm.obs_dim() {
        // Re-observe after every scalar update: earlier components have
        // already shifted the ensemble.
        let observed = ctx.hmm.observation.observe_matrix(ens.members(), ctx.t);
        let z: Vec<f64> = (0..n).map(|m| observed[(j, m)]).collect();

        let increments = match rank_histogram_increments(&z, obs[j], r_diag[j]) {
            Some(incr) => incr,
            None => continue,
        };

        // Linear regression of the scalar increments onto the state:
        // dx = cov(x, z) / var(z) * dz, member by member.
        let z_mean = z.iter().sum::<f64>() / n as f64;
        let z_anom: Vec<f64> = z.iter().map(|v| v - z_mean).collect();
        let var_z: f64 = z_anom.iter().map(|v| v * v).sum::<f64>() / n1;
        if var_z <= f64::MIN_POSITIVE {
            continue;
        }

        let anomalies = ens.anomalies();
        let mut regression = DVector::zeros(ens.state_dim());
        for (m, za) in z_anom.iter().enumerate() {
            regression += anomalies.column(m) * *za;
        }
        regression /= var_z * n1;

        let members = ens.members_mut();
        for (m, dz) in increments.iter().enumerate() {
            for i in 0..regression.len() {
                members[(i, m)] += regression[i] * dz;
            }
        }
    }

    if !ens.is_finite() {
        return Err(MethodError::Diverged("non-finite member in RHF update"));
    }

    post_process(ens, config.infl, false, ctx.rng);
    Ok(AnalysisOutcome::default())
}

/// Posterior increments for one observed scalar. Returns `None` when the
/// ensemble carries no usable signal (collapsed or non-finite).
fn rank_histogram_increments(z: &[f64], y: f64, r: f64) -> Option<Vec<f64>> {
    let n = z.len();
    if n < 2 || z.iter().any(|v| !v.is_finite()) {
        return None;
    }

    // Sort once, remember the original member of each order statistic.
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| z[a].partial_cmp(&z[b]).unwrap());
    let sorted: Vec<f64> = order.iter().map(|&i| z[i]).collect();

    let mean = z.iter().sum::<f64>() / n as f64;
    let sigma = (z.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / (n - 1) as f64).sqrt();
    if sigma <= f64::MIN_POSITIVE {
        return None;
    }

    // Region boundaries: flat tails one ensemble-sigma wide on each side.
    let mut bounds = Vec::with_capacity(n + 2);
    bounds.push(sorted[0] - sigma);
    bounds.extend_from_slice(&sorted);
    bounds.push(sorted[n - 1] + sigma);

    // Likelihood, evaluated at the order statistics with the common
    // exponent removed so remote observations do not underflow everything.
    let exponents: Vec<f64> = sorted.iter().map(|s| -0.5 * (s - y) * (s - y) / r).collect();
    let max_exp = exponents.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let like: Vec<f64> = exponents.iter().map(|e| (e - max_exp).exp()).collect();

    // Posterior mass per region: prior 1/(N+1) each, reweighted by the
    // likelihood at the region edges (tails use their single edge).
    let mut masses = Vec::with_capacity(n + 1);
    masses.push(like[0]);
    for i in 0..n - 1 {
        masses.push(0.5 * (like[i] + like[i + 1]));
    }
    masses.push(like[n - 1]);
    let total: f64 = masses.iter().sum();
    if !(total > 0.0 && total.is_finite()) {
        return None;
    }
    for m in masses.iter_mut() {
        *m /= total;
    }

    // New order statistics: equal-mass posterior quantiles q_i = i/(N+1),
    // inverted through the piecewise-uniform density.
    let mut new_sorted = Vec::with_capacity(n);
    let mut region = 0;
    let mut cum_below = 0.0;
    for i in 1..=n {
        let q = i as f64 / (n + 1) as f64;
        while region < n && cum_below + masses[region] < q {
            cum_below += masses[region];
            region += 1;
        }
        let width = bounds[region + 1] - bounds[region];
        let position = if masses[region] > 0.0 && width > 0.0 {
            bounds[region] + (q - cum_below) / masses[region] * width
        } else {
            bounds[region]
        };
        new_sorted.push(position);
    }

    let mut increments = vec![0.0; n];
    for (rank, &member) in order.iter().enumerate() {
        increments[member] = new_sorted[rank] - sorted[rank];
    }
    Some(increments)
}
