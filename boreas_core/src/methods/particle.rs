// boreas_core/src/methods/particle.rs
//
// Bootstrap particle filter. The forecast is the common ensemble forecast;
// the analysis only reweights members by their observation likelihood and
// resamples when the effective sample size collapses. Weights live on the
// ensemble so they survive across cycles between resampling events.

use nalgebra::{DMatrix, DVector};
use rand::Rng;
use serde::Deserialize;

use super::{AnalysisContext, AnalysisOutcome};
use crate::ensemble::Ensemble;
use crate::errors::{ConfigError, MethodError};
use crate::utils::linalg;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResamplingScheme {
    /// N independent draws from the weight distribution.
    Multinomial,
    /// One uniform offset, N evenly spaced points. Lowest variance.
    Systematic,
    /// Deterministic integer copies, multinomial on the remainder.
    Residual,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PfConfig {
    #[serde(default = "default_scheme")]
    pub resampler: ResamplingScheme,
    /// Resample when `N_eff < threshold * N`. In `(0, 1]`.
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    /// Post-resampling jitter strength, as a multiple of the
    /// Silverman-bandwidth-scaled ensemble covariance square root.
    /// Zero disables regularization.
    #[serde(default)]
    pub jitter: f64,
}

fn default_scheme() -> ResamplingScheme {
    ResamplingScheme::Systematic
}

fn default_threshold() -> f64 {
    0.5
}

impl Default for PfConfig {
    fn default() -> Self {
        PfConfig {
            resampler: default_scheme(),
            threshold: default_threshold(),
            jitter: 0.0,
        }
    }
}

impl PfConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.threshold.is_finite() && self.threshold > 0.0 && self.threshold <= 1.0) {
            return Err(ConfigError::hyper(
                "threshold",
                format!("resampling threshold must be in (0, 1], got {}", self.threshold),
            ));
        }
        if !(self.jitter.is_finite() && self.jitter >= 0.0) {
            return Err(ConfigError::hyper(
                "jitter",
                format!("jitter must be non-negative, got {}", self.jitter),
            ));
        }
        Ok(())
    }
}

/// Effective sample size `1 / sum(w_i^2)` of normalized weights.
pub fn effective_sample_size(weights: &DVector<f64>) -> f64 {
    1.0 / weights.iter().map(|w| w * w).sum::<f64>()
}

pub(super) fn analyse(
    config: &PfConfig,
    ens: &mut Ensemble,
    obs: &DVector<f64>,
    ctx: &mut AnalysisContext,
) -> Result<AnalysisOutcome, MethodError> {
    let mut outcome = AnalysisOutcome::default();
    let n = ens.num_members();

    let observed = ctx.hmm.observation.observe_matrix(ens.members(), ctx.t);
    let (r_inv, regularized) = linalg::robust_spd_inverse(ctx.hmm.r());
    outcome.regularized = regularized;

    // Log-weight update from the Gaussian observation likelihood, folded
    // onto the incoming weights; normalized by log-sum-exp so a single
    // dominant particle cannot underflow the rest to zero prematurely.
    let prior = ens.weights();
    let mut log_w = DVector::zeros(n);
    for j in 0..n {
        let innovation = obs - observed.column(j);
        let maha = innovation.dot(&(&r_inv * &innovation));
        log_w[j] = prior[j].max(f64::MIN_POSITIVE).ln() - 0.5 * maha;
    }
    let max_log = log_w.max();
    if !max_log.is_finite() {
        return Err(MethodError::Diverged("particle weights are non-finite"));
    }
    let mut weights = log_w.map(|lw| (lw - max_log).exp());
    let total: f64 = weights.iter().sum();
    weights /= total;

    let n_eff = effective_sample_size(&weights);
    if n_eff < config.threshold * n as f64 {
        let indices = match config.resampler {
            ResamplingScheme::Multinomial => multinomial(&weights, ctx.rng),
            ResamplingScheme::Systematic => systematic(&weights, ctx.rng),
            ResamplingScheme::Residual => residual(&weights, ctx.rng),
        };
        resample_in_place(ens, &indices);
        if config.jitter > 0.0 {
            apply_jitter(ens, config.jitter, ctx.rng);
        }
        ens.reset_weights();
        outcome.resampled = true;
    } else {
        ens.set_weights(weights);
    }

    Ok(outcome)
}

fn resample_in_place(ens: &mut Ensemble, indices: &[usize]) {
    let picked: Vec<_> = indices
        .iter()
        .map(|&i| ens.members().column(i).into_owned())
        .collect();
    let members = DMatrix::from_columns(&picked);
    ens.set_members(members);
}

/// Regularization against particle collapse: adds a draw from the ensemble
/// covariance shrunk by the Silverman bandwidth and the jitter coefficient.
fn apply_jitter(ens: &mut Ensemble, jitter: f64, rng: &mut impl Rng) {
    use rand_distr::StandardNormal;

    let n = ens.num_members();
    let nx = ens.state_dim();
    let n1 = (n - 1).max(1) as f64;
    let bandwidth =
        (4.0 / (n as f64 * (nx as f64 + 2.0))).powf(1.0 / (nx as f64 + 4.0));
    let scale = jitter * bandwidth / n1.sqrt();

    let anomalies = ens.anomalies();
    let noise_coeffs = DMatrix::from_fn(n, n, |_, _| rng.sample::<f64, _>(StandardNormal));
    *ens.members_mut() += anomalies * noise_coeffs * scale;
}

// --- Resampling schemes ---
// All return exactly N indices into the current ensemble.

fn multinomial(weights: &DVector<f64>, rng: &mut impl Rng) -> Vec<usize> {
    let n = weights.len();
    let cdf = cumulative(weights);
    (0..n).map(|_| pick(&cdf, rng.gen::<f64>())).collect()
}

fn systematic(weights: &DVector<f64>, rng: &mut impl Rng) -> Vec<usize> {
    let n = weights.len();
    let cdf = cumulative(weights);
    let offset = rng.gen::<f64>() / n as f64;
    (0..n)
        .map(|i| pick(&cdf, offset + i as f64 / n as f64))
        .collect()
}

fn residual(weights: &DVector<f64>, rng: &mut impl Rng) -> Vec<usize> {
    let n = weights.len();
    let mut indices = Vec::with_capacity(n);
    let mut residuals = DVector::zeros(n);
    for i in 0..n {
        let expected = weights[i] * n as f64;
        let copies = expected.floor() as usize;
        indices.extend(std::iter::repeat(i).take(copies));
        residuals[i] = expected - copies as f64;
    }
    let remaining = n - indices.len();
    if remaining > 0 {
        let total: f64 = residuals.iter().sum();
        residuals /= total;
        let cdf = cumulative(&residuals);
        indices.extend((0..remaining).map(|_| pick(&cdf, rng.gen::<f64>())));
    }
    indices
}

fn cumulative(weights: &DVector<f64>) -> Vec<f64> {
    let mut cdf = Vec::with_capacity(weights.len());
    let mut acc = 0.0;
    for w in weights.iter() {
        acc += w;
        cdf.push(acc);
    }
    // Guard the last bin against rounding.
    if let Some(last) = cdf.last_mut() {
        *last = f64::INFINITY;
    }
    cdf
}

fn pick(cdf: &[f64], u: f64) -> usize {
    cdf.partition_point(|&c| c < u).min(cdf.len() - 1)
}
