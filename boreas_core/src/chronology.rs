// boreas_core/src/chronology.rs

use crate::errors::ConfigError;
use crate::types::{ObsIndex, StepIndex};
use serde::Deserialize;

/// The discrete time grid shared by the truth, the observations and the
/// method for one run: `num_steps` uniform steps of size `dt`, with an
/// observation/analysis at every `dk_obs`-th step.
///
/// Observation indices therefore form a strictly increasing subsequence of
/// the step indices, which is the invariant the whole forecast/analysis
/// cycle leans on.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Chronology {
    /// Step size, in model time units. Strictly positive.
    pub dt: f64,
    /// Steps between consecutive observations. At least 1.
    pub dk_obs: usize,
    /// Total number of steps; the grid is `t_0 .. t_num_steps`.
    pub num_steps: usize,
}

/// One entry of the time grid as visited by the cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tick {
    /// Step index in `1..=num_steps` (step 0 is the initial condition).
    pub k: StepIndex,
    /// Time at the *end* of this step.
    pub t: f64,
    /// Set when this step carries an observation/analysis.
    pub obs: Option<ObsIndex>,
}

impl Chronology {
    pub fn new(dt: f64, dk_obs: usize, num_steps: usize) -> Result<Self, ConfigError> {
        let chrono = Chronology {
            dt,
            dk_obs,
            num_steps,
        };
        chrono.validate()?;
        Ok(chrono)
    }

    /// Builds the grid from durations: total run length and the time between
    /// observations. `obs_interval` must be a positive integer multiple of
    /// `dt` (within a relative tolerance), otherwise the grid would drift
    /// off the observation times.
    pub fn from_duration(dt: f64, obs_interval: f64, duration: f64) -> Result<Self, ConfigError> {
        if dt <= 0.0 || !dt.is_finite() {
            return Err(ConfigError::Chronology(format!(
                "step size must be positive and finite, got {dt}"
            )));
        }
        if duration <= 0.0 || !duration.is_finite() {
            return Err(ConfigError::Chronology(format!(
                "duration must be positive and finite, got {duration}"
            )));
        }
        let ratio = obs_interval / dt;
        let dk_obs = ratio.round();
        if dk_obs < 1.0 || ((ratio - dk_obs).abs() > 1e-9 * ratio.abs().max(1.0)) {
            return Err(ConfigError::Chronology(format!(
                "observation interval {obs_interval} is not a positive multiple of dt {dt}"
            )));
        }
        let num_steps = (duration / dt).round() as usize;
        Chronology::new(dt, dk_obs as usize, num_steps)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dt <= 0.0 || !self.dt.is_finite() {
            return Err(ConfigError::Chronology(format!(
                "step size must be positive and finite, got {}",
                self.dt
            )));
        }
        if self.dk_obs == 0 {
            return Err(ConfigError::Chronology(
                "dk_obs must be at least 1".to_string(),
            ));
        }
        if self.num_steps == 0 {
            return Err(ConfigError::Chronology(
                "chronology must contain at least one step".to_string(),
            ));
        }
        if self.num_steps < self.dk_obs {
            return Err(ConfigError::Chronology(format!(
                "no observation fits: num_steps {} < dk_obs {}",
                self.num_steps, self.dk_obs
            )));
        }
        Ok(())
    }

    /// Number of observation/analysis times in the grid.
    pub fn num_obs(&self) -> usize {
        self.num_steps / self.dk_obs
    }

    /// Time at step `k`.
    pub fn time(&self, k: StepIndex) -> f64 {
        k as f64 * self.dt
    }

    /// Total duration covered by the grid.
    pub fn duration(&self) -> f64 {
        self.time(self.num_steps)
    }

    /// Observation index carried by step `k`, if any.
    pub fn obs_index(&self, k: StepIndex) -> Option<ObsIndex> {
        if k > 0 && k % self.dk_obs == 0 && k / self.dk_obs <= self.num_obs() {
            Some(k / self.dk_obs - 1)
        } else {
            None
        }
    }

    /// Step index carrying observation `ko`.
    pub fn step_of_obs(&self, ko: ObsIndex) -> StepIndex {
        (ko + 1) * self.dk_obs
    }

    /// Iterates the forecast steps `k = 1..=num_steps` in order.
    pub fn steps(&self) -> impl Iterator<Item = Tick> + '_ {
        (1..=self.num_steps).map(move |k| Tick {
            k,
            t: self.time(k),
            obs: self.obs_index(k),
        })
    }
}
