// boreas_sim/src/stats.rs
//
// Incremental run diagnostics. Series are NaN-prefilled and written by time
// index, so a diverged or cancelled run simply leaves its tail at the
// sentinel value and every partial result stays retrievable. Forecast and
// analysis values are kept per observation time; a cheap "universal" series
// tracks every step.

use boreas_core::ensemble::Ensemble;
use boreas_core::chronology::Chronology;
use boreas_core::methods::AnalysisOutcome;
use boreas_core::types::{ObsIndex, RunStatus, StepIndex};
use boreas_core::utils::linalg;
use nalgebra::DVector;

/// A NaN-prefilled scalar time series.
#[derive(Debug, Clone, PartialEq)]
pub struct Series {
    values: Vec<f64>,
}

impl Series {
    pub fn new(len: usize) -> Self {
        Series {
            values: vec![f64::NAN; len],
        }
    }

    pub fn set(&mut self, index: usize, value: f64) {
        self.values[index] = value;
    }

    pub fn get(&self, index: usize) -> f64 {
        self.values[index]
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.values
    }

    /// Mean over an index range, skipping NaN sentinels. NaN if the range
    /// holds no finite value.
    pub fn mean_over(&self, range: std::ops::Range<usize>) -> f64 {
        let mut sum = 0.0;
        let mut count = 0;
        for &v in &self.values[range] {
            if v.is_finite() {
                sum += v;
                count += 1;
            }
        }
        if count == 0 {
            f64::NAN
        } else {
            sum / count as f64
        }
    }

    /// Mean over the trailing `fraction` of the series (skipping NaN).
    pub fn mean_over_last(&self, fraction: f64) -> f64 {
        let start = ((1.0 - fraction.clamp(0.0, 1.0)) * self.len() as f64).floor() as usize;
        self.mean_over(start..self.len())
    }
}

/// All per-run diagnostics, owned by the harness and append-only during the
/// cycle. O(1) extra memory per step: nothing of the ensemble is retained
/// beyond the scalars below.
#[derive(Debug, Clone)]
pub struct Stats {
    /// RMS error of the forecast ensemble mean at observation times.
    pub rmse_f: Series,
    /// RMS error of the analysis ensemble mean at observation times.
    pub rmse_a: Series,
    pub spread_f: Series,
    pub spread_a: Series,
    /// Log-likelihood of each observation under the forecast ensemble.
    pub obs_loglik: Series,
    /// Adaptive inflation factor, when the method infers one.
    pub effective_inflation: Series,
    /// Every-step RMS error / spread (overwritten by the analysis values at
    /// observation steps).
    pub rmse_u: Series,
    pub spread_u: Series,

    pub status: RunStatus,
    /// Count of analyses where regularization fired (numerical warnings).
    pub regularized_events: usize,
    /// Count of analyses stopped by their iteration cap.
    pub iteration_cap_events: usize,
    /// Count of particle resampling events.
    pub resample_events: usize,
}

impl Stats {
    pub fn new(chronology: &Chronology) -> Self {
        let num_obs = chronology.num_obs();
        Stats {
            rmse_f: Series::new(num_obs),
            rmse_a: Series::new(num_obs),
            spread_f: Series::new(num_obs),
            spread_a: Series::new(num_obs),
            obs_loglik: Series::new(num_obs),
            effective_inflation: Series::new(num_obs),
            rmse_u: Series::new(chronology.num_steps + 1),
            spread_u: Series::new(chronology.num_steps + 1),
            status: RunStatus::Completed,
            regularized_events: 0,
            iteration_cap_events: 0,
            resample_events: 0,
        }
    }

    /// RMS distance between the ensemble mean and the truth. NaN when the
    /// ensemble has diverged, which is exactly what the series should hold.
    pub fn rmse(ensemble: &Ensemble, truth: &DVector<f64>) -> f64 {
        let diff = ensemble.mean() - truth;
        (diff.norm_squared() / truth.len() as f64).sqrt()
    }

    pub fn record_universal(&mut self, k: StepIndex, ensemble: &Ensemble, truth: &DVector<f64>) {
        self.rmse_u.set(k, Self::rmse(ensemble, truth));
        self.spread_u.set(k, ensemble.spread());
    }

    pub fn record_forecast(
        &mut self,
        ko: ObsIndex,
        ensemble: &Ensemble,
        truth: &DVector<f64>,
        loglik: f64,
    ) {
        self.rmse_f.set(ko, Self::rmse(ensemble, truth));
        self.spread_f.set(ko, ensemble.spread());
        self.obs_loglik.set(ko, loglik);
    }

    pub fn record_analysis(
        &mut self,
        ko: ObsIndex,
        ensemble: &Ensemble,
        truth: &DVector<f64>,
        outcome: &AnalysisOutcome,
    ) {
        self.rmse_a.set(ko, Self::rmse(ensemble, truth));
        self.spread_a.set(ko, ensemble.spread());
        if let Some(infl) = outcome.effective_inflation {
            self.effective_inflation.set(ko, infl);
        }
        if outcome.regularized {
            self.regularized_events += 1;
        }
        if outcome.hit_iteration_cap {
            self.iteration_cap_events += 1;
        }
        if outcome.resampled {
            self.resample_events += 1;
        }
    }

    pub fn mark_diverged(&mut self, k: StepIndex) {
        self.status = RunStatus::Diverged { step: k };
    }

    pub fn mark_cancelled(&mut self, k: StepIndex) {
        self.status = RunStatus::Cancelled { step: k };
    }

    /// Observation log-likelihood under the Gaussian forecast predictive
    /// distribution `N(mean(h(E)), Y Y^T / (N-1) + R)`.
    pub fn forecast_loglik(
        ensemble: &Ensemble,
        observed: &nalgebra::DMatrix<f64>,
        obs: &DVector<f64>,
        r: &nalgebra::DMatrix<f64>,
    ) -> f64 {
        let (z_mean, y_anom) = linalg::center(observed);
        let n1 = (ensemble.num_members() - 1).max(1) as f64;
        let predictive = &y_anom * y_anom.transpose() / n1 + r;
        linalg::gaussian_logpdf(&(obs - z_mean), &predictive)
    }
}
