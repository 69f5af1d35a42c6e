// boreas_sim/src/runner.rs
//
// The forecast/analysis cycle. One `TwinExperiment` owns everything a run
// needs (the HMM, the method, the drawn truth and observations) and walks
// the chronology strictly in order: INIT, then FORECAST to each observation
// time, ANALYSIS there, RECORD around it, until DONE (or a divergence or
// cancellation cuts the run short, leaving truncated-but-valid stats).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use boreas_core::ensemble::Ensemble;
use boreas_core::errors::{ConfigError, MethodError};
use boreas_core::hmm::{Hmm, Observations, Truth};
use boreas_core::methods::{AnalysisContext, Method};
use boreas_core::rng;
use boreas_core::types::RunStatus;
use tracing::{debug, info_span, warn};

use crate::diagnostics::{DiagnosticsSink, Phase, StepSnapshot};
use crate::stats::Stats;

/// Run-level knobs that are not part of the HMM or the method.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunOptions {
    pub seed: u64,
    pub n_members: usize,
    /// `max |member|` beyond which the run is declared diverged.
    pub divergence_bound: f64,
    /// Offset into the per-instance RNG streams; parallel experiments with
    /// the same seed must use distinct ids to stay uncorrelated.
    pub instance_id: u64,
}

impl RunOptions {
    pub fn new(seed: u64, n_members: usize) -> Self {
        RunOptions {
            seed,
            n_members,
            divergence_bound: 1e9,
            instance_id: 0,
        }
    }

    pub fn with_instance(mut self, instance_id: u64) -> Self {
        self.instance_id = instance_id;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.n_members < 2 {
            return Err(ConfigError::hyper(
                "n_members",
                format!("an ensemble needs at least 2 members, got {}", self.n_members),
            ));
        }
        if !(self.divergence_bound.is_finite() && self.divergence_bound > 0.0) {
            return Err(ConfigError::hyper(
                "divergence_bound",
                format!("must be positive and finite, got {}", self.divergence_bound),
            ));
        }
        Ok(())
    }
}

/// Cooperative cancellation, checked between cycle phases.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Everything a finished (or truncated) run hands back.
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub stats: Stats,
    pub status: RunStatus,
}

/// One twin experiment: synthetic truth plus a DA run against it.
#[derive(Debug, Clone)]
pub struct TwinExperiment {
    hmm: Hmm,
    method: Method,
    options: RunOptions,
    truth: Truth,
    observations: Observations,
}

impl TwinExperiment {
    /// Validates the configuration and draws the truth/observation pair.
    /// All failures happen here; `run` itself cannot error.
    pub fn new(hmm: Hmm, method: Method, options: RunOptions) -> Result<Self, ConfigError> {
        options.validate()?;
        method.validate(&hmm)?;
        let (truth, observations) = hmm.simulate(options.seed);
        Ok(TwinExperiment {
            hmm,
            method,
            options,
            truth,
            observations,
        })
    }

    pub fn hmm(&self) -> &Hmm {
        &self.hmm
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    pub fn truth(&self) -> &Truth {
        &self.truth
    }

    pub fn observations(&self) -> &Observations {
        &self.observations
    }

    fn is_diverged(&self, ensemble: &Ensemble) -> bool {
        !ensemble.is_finite() || ensemble.max_abs() > self.options.divergence_bound
    }

    /// Runs the full cycle. Never panics, never aborts siblings: divergence
    /// and cancellation are terminal stats markers, not errors.
    pub fn run(&self, sink: &dyn DiagnosticsSink, cancel: &CancelToken) -> RunRecord {
        let span = info_span!("run", method = self.method.name(), seed = self.options.seed);
        let _guard = span.enter();

        let chronology = &self.hmm.chronology;
        let dt = chronology.dt;
        let mut stats = Stats::new(chronology);

        // INIT: the ensemble stream is independent of the truth stream.
        let mut rng = rng::instance_stream(self.options.seed, self.options.instance_id);
        let mut ensemble = Ensemble::from_gaussian(&self.hmm.init, self.options.n_members, &mut rng);
        stats.record_universal(0, &ensemble, self.truth.at(0));

        // Window bookkeeping for the iterative smoothers.
        let mut window_start = ensemble.clone();
        let mut window_times: Vec<f64> = Vec::new();

        for tick in chronology.steps() {
            if cancel.is_cancelled() {
                debug!(step = tick.k, "cancelled between cycle phases");
                stats.mark_cancelled(tick.k - 1);
                let status = stats.status;
                return RunRecord { stats, status };
            }

            // FORECAST: one model step, each member with its own Q draw.
            let t0 = tick.t - dt;
            self.hmm.dynamics.step(ensemble.members_mut(), t0, dt);
            if let Some(q) = &self.hmm.model_noise {
                ensemble.add_noise(q, &mut rng);
            }
            window_times.push(t0);

            if self.is_diverged(&ensemble) {
                warn!(step = tick.k, "ensemble diverged during forecast");
                stats.mark_diverged(tick.k);
                let status = stats.status;
                return RunRecord { stats, status };
            }
            stats.record_universal(tick.k, &ensemble, self.truth.at(tick.k));

            // ANALYSIS: exactly at observation indices, never skipped or
            // reordered.
            if let Some(ko) = tick.obs {
                let obs = self.observations.at(ko);
                let observed = self
                    .hmm
                    .observation
                    .observe_matrix(ensemble.members(), tick.t);
                let loglik = Stats::forecast_loglik(&ensemble, &observed, obs, self.hmm.r());
                stats.record_forecast(ko, &ensemble, self.truth.at(tick.k), loglik);
                sink.emit(self.snapshot(&ensemble, &stats, tick.k, Some(ko), tick.t, Phase::Forecast));

                let mut ctx = AnalysisContext {
                    hmm: &self.hmm,
                    t: tick.t,
                    window_start: &window_start,
                    window_times: &window_times,
                    rng: &mut rng,
                };
                match self.method.analyse(&mut ensemble, obs, &mut ctx) {
                    Ok(outcome) => {
                        stats.record_analysis(ko, &ensemble, self.truth.at(tick.k), &outcome);
                    }
                    Err(MethodError::Diverged(reason)) => {
                        warn!(step = tick.k, reason, "analysis diverged");
                        stats.mark_diverged(tick.k);
                        let status = stats.status;
                        return RunRecord { stats, status };
                    }
                }

                if self.is_diverged(&ensemble) {
                    warn!(step = tick.k, "ensemble diverged after analysis");
                    stats.mark_diverged(tick.k);
                    let status = stats.status;
                    return RunRecord { stats, status };
                }

                // The universal series keeps the freshest value at this
                // step, which is now the analysis.
                stats.record_universal(tick.k, &ensemble, self.truth.at(tick.k));
                sink.emit(self.snapshot(&ensemble, &stats, tick.k, Some(ko), tick.t, Phase::Analysis));

                // RECORD done; the next window starts from this analysis.
                window_start = ensemble.clone();
                window_times.clear();
            }
        }

        debug!("run complete");
        let status = stats.status;
        RunRecord { stats, status }
    }

    fn snapshot(
        &self,
        ensemble: &Ensemble,
        stats: &Stats,
        k: usize,
        ko: Option<usize>,
        t: f64,
        phase: Phase,
    ) -> StepSnapshot {
        StepSnapshot {
            k,
            ko,
            t,
            phase,
            ensemble_mean: ensemble.mean(),
            spread: ensemble.spread(),
            rmse: stats.rmse_u.get(k),
        }
    }
}
