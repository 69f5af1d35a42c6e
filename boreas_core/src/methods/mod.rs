// boreas_core/src/methods/mod.rs
//
// The analysis-update engine: a closed set of tagged method variants, all
// implementing the same contract `(forecast ensemble, observation, context)
// -> updated ensemble`. Selection is pure data (the configuration enum); the
// harness never needs to know which algebra runs underneath.

use nalgebra::{DMatrix, DVector};
use rand_chacha::ChaCha8Rng;

use crate::ensemble::Ensemble;
use crate::errors::{ConfigError, MethodError};
use crate::hmm::Hmm;
use crate::utils::linalg;

pub mod enkf;
pub mod enkf_n;
pub mod ienks;
pub mod kf;
pub mod letkf;
pub mod netf;
pub mod particle;
pub mod rhf;

pub use enkf::{EnKfConfig, EnKfVariant};
pub use enkf_n::EnKfNConfig;
pub use ienks::{EsMdaConfig, IEnKsConfig, SensitivityVariant};
pub use kf::KalmanFilter;
pub use letkf::LetkfConfig;
pub use netf::NetfConfig;
pub use particle::{PfConfig, ResamplingScheme};
pub use rhf::RhfConfig;

/// Everything an analysis update may need beyond the forecast ensemble and
/// the observation itself: the experiment spec (for `R`, the observation
/// operator and, for iterative smoothers, the dynamics over the window),
/// the ensemble as it stood at the window start, and the filter RNG.
pub struct AnalysisContext<'a> {
    pub hmm: &'a Hmm,
    /// Time of the analysis step.
    pub t: f64,
    /// Ensemble right after the previous analysis (or the initial ensemble),
    /// i.e. at the start of the forecast window ending now.
    pub window_start: &'a Ensemble,
    /// Start times of the forecast steps composing the window, in order.
    pub window_times: &'a [f64],
    pub rng: &'a mut ChaCha8Rng,
}

impl AnalysisContext<'_> {
    /// Re-runs the window forecast on a candidate ensemble. Iterative
    /// smoothers use this to re-linearize around updated control variables;
    /// `with_noise` selects whether `Q` draws are injected (the final pass
    /// does, the Gauss-Newton iterations do not).
    pub fn forecast_window(&mut self, start: &Ensemble, with_noise: bool) -> Ensemble {
        let dt = self.hmm.chronology.dt;
        let mut ens = start.clone();
        for &t0 in self.window_times {
            self.hmm.dynamics.step(ens.members_mut(), t0, dt);
            if with_noise {
                if let Some(q) = &self.hmm.model_noise {
                    ens.add_noise(q, self.rng);
                }
            }
        }
        ens
    }
}

/// Soft per-analysis flags. None of these are errors: they are recorded in
/// the run statistics so batches stay comparable.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnalysisOutcome {
    /// A near-singular matrix was regularized somewhere in the update.
    pub regularized: bool,
    /// Iterations used by an iterative method (0 for one-shot updates).
    pub iterations: usize,
    /// The iteration cap stopped an iterative method before its tolerance.
    pub hit_iteration_cap: bool,
    /// A particle method resampled at this step.
    pub resampled: bool,
    /// Inflation factor inferred by an adaptive method.
    pub effective_inflation: Option<f64>,
}

/// The closed family of analysis-update algorithms.
#[derive(Debug, Clone, PartialEq)]
pub enum Method {
    EnKf(EnKfConfig),
    EnKfN(EnKfNConfig),
    Letkf(LetkfConfig),
    IEnKs(IEnKsConfig),
    EsMda(EsMdaConfig),
    ParticleFilter(PfConfig),
    Netf(NetfConfig),
    Rhf(RhfConfig),
}

impl Method {
    pub fn name(&self) -> &'static str {
        match self {
            Method::EnKf(c) => match c.variant {
                EnKfVariant::PertObs => "EnKF",
                EnKfVariant::Sqrt => "ETKF",
                EnKfVariant::DEnKf => "DEnKF",
            },
            Method::EnKfN(_) => "EnKF-N",
            Method::Letkf(_) => "LETKF",
            Method::IEnKs(_) => "iEnKS",
            Method::EsMda(_) => "ES-MDA",
            Method::ParticleFilter(_) => "PF",
            Method::Netf(_) => "NETF",
            Method::Rhf(_) => "RHF",
        }
    }

    /// Eager hyperparameter and compatibility validation; nothing here is
    /// deferred to run time.
    pub fn validate(&self, hmm: &Hmm) -> Result<(), ConfigError> {
        match self {
            Method::EnKf(c) => c.validate(),
            Method::EnKfN(c) => c.validate(),
            Method::Letkf(c) => c.validate(hmm),
            Method::IEnKs(c) => c.validate(),
            Method::EsMda(c) => c.validate(),
            Method::ParticleFilter(c) => c.validate(),
            Method::Netf(c) => c.validate(),
            Method::Rhf(c) => c.validate(hmm),
        }
    }

    /// The shared analysis contract: consumes the forecast ensemble in
    /// place, producing the analysis ensemble for this observation.
    pub fn analyse(
        &self,
        ens: &mut Ensemble,
        obs: &DVector<f64>,
        ctx: &mut AnalysisContext,
    ) -> Result<AnalysisOutcome, MethodError> {
        ensure_finite(ens, "forecast")?;
        let outcome = match self {
            Method::EnKf(c) => enkf::analyse(c, ens, obs, ctx),
            Method::EnKfN(c) => enkf_n::analyse(c, ens, obs, ctx),
            Method::Letkf(c) => letkf::analyse(c, ens, obs, ctx),
            Method::IEnKs(c) => ienks::analyse(c, ens, obs, ctx),
            Method::EsMda(c) => ienks::analyse_mda(c, ens, obs, ctx),
            Method::ParticleFilter(c) => particle::analyse(c, ens, obs, ctx),
            Method::Netf(c) => netf::analyse(c, ens, obs, ctx),
            Method::Rhf(c) => rhf::analyse(c, ens, obs, ctx),
        }?;
        ensure_finite(ens, "analysis")?;
        Ok(outcome)
    }
}

/// Forecast ensemble seen through the observation operator: observed mean,
/// observed anomalies and the innovation `y - mean(h(E))`.
pub(crate) struct ObsSpace {
    pub y_anom: DMatrix<f64>,
    pub innovation: DVector<f64>,
}

pub(crate) fn obs_space(ens: &Ensemble, obs: &DVector<f64>, hmm: &Hmm, t: f64) -> ObsSpace {
    let observed = hmm.observation.observe_matrix(ens.members(), t);
    let (z_mean, y_anom) = linalg::center(&observed);
    ObsSpace {
        y_anom,
        innovation: obs - z_mean,
    }
}

/// Shared post-analysis processing: multiplicative inflation (factor >= 1,
/// enforced at validation) followed by an optional random mean-preserving
/// rotation of the anomalies.
pub(crate) fn post_process(
    ens: &mut Ensemble,
    infl: f64,
    rotate: bool,
    rng: &mut ChaCha8Rng,
) {
    ens.inflate(infl);
    if rotate {
        ens.rotate(rng);
    }
}

pub(crate) fn ensure_finite(ens: &Ensemble, stage: &'static str) -> Result<(), MethodError> {
    if ens.is_finite() {
        Ok(())
    } else {
        Err(MethodError::Diverged(match stage {
            "forecast" => "non-finite member entering analysis",
            _ => "non-finite member after analysis update",
        }))
    }
}

pub(crate) fn validate_inflation(infl: f64) -> Result<(), ConfigError> {
    if !(infl.is_finite() && infl >= 1.0) {
        return Err(ConfigError::hyper(
            "infl",
            format!("inflation factor must be >= 1, got {infl}"),
        ));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod testkit {
    //! Small builders shared by the method unit tests.

    use super::*;
    use crate::chronology::Chronology;
    use crate::models::{GaussianRv, LinearDynamics, LinearObservation};
    use crate::rng::filter_stream;

    /// Identity model, identity observation, `nx`-dimensional, `R = r * I`.
    pub fn identity_hmm(nx: usize, r_var: f64) -> Hmm {
        Hmm::new(
            Chronology::new(0.1, 1, 10).unwrap(),
            Box::new(LinearDynamics::identity(nx)),
            Box::new(LinearObservation::identity(nx)),
            GaussianRv::centered(nx, 1.0).unwrap(),
            None,
            GaussianRv::centered(nx, r_var).unwrap(),
            Some(crate::localize::StateGrid::line(nx)),
        )
        .unwrap()
    }

    /// Gaussian ensemble with a fixed seed.
    pub fn gaussian_ensemble(nx: usize, n: usize, seed: u64) -> Ensemble {
        let init = GaussianRv::centered(nx, 1.0).unwrap();
        let mut rng = filter_stream(seed);
        Ensemble::from_gaussian(&init, n, &mut rng)
    }

    /// Runs `method` once against `obs` on a fresh context.
    pub fn analyse_once(
        method: &Method,
        ens: &mut Ensemble,
        obs: &DVector<f64>,
        hmm: &Hmm,
        seed: u64,
    ) -> AnalysisOutcome {
        let window_start = ens.clone();
        let mut rng = filter_stream(seed);
        let mut ctx = AnalysisContext {
            hmm,
            t: 0.1,
            window_start: &window_start,
            window_times: &[0.0],
            rng: &mut rng,
        };
        method.analyse(ens, obs, &mut ctx).expect("analysis failed")
    }

    /// Scalar Kalman analysis: posterior mean/variance for prior `(m, v)`,
    /// observation `y` with variance `r`, identity operator.
    pub fn scalar_kalman(m: f64, v: f64, y: f64, r: f64) -> (f64, f64) {
        let gain = v / (v + r);
        (m + gain * (y - m), (1.0 - gain) * v)
    }
}
