// boreas_core/src/hmm.rs

use nalgebra::{DMatrix, DVector};

use crate::chronology::Chronology;
use crate::errors::ConfigError;
use crate::localize::StateGrid;
use crate::models::{DynamicsModel, GaussianRv, ObservationModel};
use crate::rng;
use crate::types::{ObsIndex, StepIndex};

/// The immutable description of one twin experiment: the hidden Markov model
/// tying together the time grid, the dynamic and observation models, the
/// initial distribution, and the two noise models.
///
/// Built once, validated once, then shared read-only by the truth generator
/// and the DA harness for the whole run.
#[derive(Debug, Clone)]
pub struct Hmm {
    pub chronology: Chronology,
    pub dynamics: Box<dyn DynamicsModel>,
    pub observation: Box<dyn ObservationModel>,
    /// Initial state distribution, for both the truth draw and the initial
    /// ensemble (independent streams).
    pub init: GaussianRv,
    /// Model error `Q`; `None` for a perfect model.
    pub model_noise: Option<GaussianRv>,
    /// Observation error `R`. Never absent: noise-free observations make the
    /// analysis algebra singular.
    pub obs_noise: GaussianRv,
    /// Grid coordinates of the state components, required by local methods.
    pub grid: Option<StateGrid>,
}

/// One realization of the hidden truth, a state per grid time point.
#[derive(Debug, Clone, PartialEq)]
pub struct Truth(pub Vec<DVector<f64>>);

impl Truth {
    pub fn at(&self, k: StepIndex) -> &DVector<f64> {
        &self.0[k]
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// The noisy observation series, one vector per observation time.
#[derive(Debug, Clone, PartialEq)]
pub struct Observations(pub Vec<DVector<f64>>);

impl Observations {
    pub fn at(&self, ko: ObsIndex) -> &DVector<f64> {
        &self.0[ko]
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Hmm {
    pub fn new(
        chronology: Chronology,
        dynamics: Box<dyn DynamicsModel>,
        observation: Box<dyn ObservationModel>,
        init: GaussianRv,
        model_noise: Option<GaussianRv>,
        obs_noise: GaussianRv,
        grid: Option<StateGrid>,
    ) -> Result<Self, ConfigError> {
        chronology.validate()?;

        let nx = dynamics.state_dim();
        if observation.state_dim() != nx {
            return Err(ConfigError::DimensionMismatch {
                what: "observation operator state dimension",
                expected: nx,
                got: observation.state_dim(),
            });
        }
        if init.dim() != nx {
            return Err(ConfigError::DimensionMismatch {
                what: "initial distribution",
                expected: nx,
                got: init.dim(),
            });
        }
        if let Some(q) = &model_noise {
            if q.dim() != nx {
                return Err(ConfigError::DimensionMismatch {
                    what: "model noise Q",
                    expected: nx,
                    got: q.dim(),
                });
            }
        }
        if obs_noise.dim() != observation.obs_dim() {
            return Err(ConfigError::DimensionMismatch {
                what: "observation noise R",
                expected: observation.obs_dim(),
                got: obs_noise.dim(),
            });
        }
        if let Some(grid) = &grid {
            if grid.len != nx {
                return Err(ConfigError::DimensionMismatch {
                    what: "state grid",
                    expected: nx,
                    got: grid.len,
                });
            }
        }

        Ok(Hmm {
            chronology,
            dynamics,
            observation,
            init,
            model_noise,
            obs_noise,
            grid,
        })
    }

    pub fn state_dim(&self) -> usize {
        self.dynamics.state_dim()
    }

    pub fn obs_dim(&self) -> usize {
        self.observation.obs_dim()
    }

    /// Observation-error covariance.
    pub fn r(&self) -> &DMatrix<f64> {
        self.obs_noise.cov()
    }

    /// Draws one `(truth, observations)` realization.
    ///
    /// Uses the dedicated truth RNG stream: a fixed seed reproduces the pair
    /// bit-for-bit, and the filter's own stream never overlaps with it.
    pub fn simulate(&self, seed: u64) -> (Truth, Observations) {
        let mut rng = rng::truth_stream(seed);
        let dt = self.chronology.dt;

        let mut x = self.init.sample(&mut rng);
        let mut truth = Vec::with_capacity(self.chronology.num_steps + 1);
        truth.push(x.clone());
        let mut observations = Vec::with_capacity(self.chronology.num_obs());

        for tick in self.chronology.steps() {
            let t_prev = tick.t - dt;
            let mut col = DMatrix::from_column_slice(self.state_dim(), 1, x.as_slice());
            self.dynamics.step(&mut col, t_prev, dt);
            x = col.column(0).into_owned();
            if let Some(q) = &self.model_noise {
                x += q.sample(&mut rng);
            }
            truth.push(x.clone());

            if tick.obs.is_some() {
                let y = self.observation.observe(&x, tick.t) + self.obs_noise.sample(&mut rng);
                observations.push(y);
            }
        }

        (Truth(truth), Observations(observations))
    }
}
