// boreas_sim/src/scenario.rs
//
// Scenario files: the TOML surface describing one twin experiment. Loading
// goes through figment (so tests can feed strings and the CLI can feed
// files), deserializes into the specs below with unknown fields rejected,
// and `build` validates everything eagerly into core types. A scenario that
// builds cannot fail at run time for configuration reasons.

use std::path::Path;

use figment::providers::{Format, Toml};
use figment::Figment;
use nalgebra::{DMatrix, DVector};
use serde::Deserialize;
use thiserror::Error;
use tracing::info;

use boreas_core::chronology::Chronology;
use boreas_core::errors::ConfigError;
use boreas_core::hmm::Hmm;
use boreas_core::localize::StateGrid;
use boreas_core::methods::{
    EnKfConfig, EnKfNConfig, EnKfVariant, EsMdaConfig, IEnKsConfig, LetkfConfig, Method,
    NetfConfig, PfConfig, RhfConfig,
};
use boreas_core::models::{
    DynamicsModel, GaussianRv, LinearDynamics, LinearObservation, ObservationModel,
};

use crate::runner::{RunOptions, TwinExperiment};

#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("failed to load scenario: {0}")]
    Load(#[from] figment::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Root of a scenario TOML file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Scenario {
    /// Free-form label used in batch summaries. Defaults to the method kind.
    pub name: Option<String>,
    pub chronology: Chronology,
    pub model: ModelSpec,
    pub observation: ObservationSpec,
    pub initial: InitialSpec,
    #[serde(default)]
    pub grid: Option<GridSpec>,
    pub method: MethodSpec,
    pub run: RunSpec,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelSpec {
    /// Persistence dynamics `x' = x` (the random walk when `noise_var > 0`).
    RandomWalk {
        state_dim: usize,
        #[serde(default)]
        noise_var: f64,
    },
    /// Uniform damping/growth `x' = factor * x`.
    Scaling {
        state_dim: usize,
        factor: f64,
        #[serde(default)]
        noise_var: f64,
    },
    /// Dense linear dynamics, row-major.
    Linear {
        matrix: Vec<Vec<f64>>,
        #[serde(default)]
        noise_var: f64,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ObservationSpec {
    /// Observe every component.
    Identity { noise_var: f64 },
    /// Observe the listed components.
    Partial {
        indices: Vec<usize>,
        noise_var: f64,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InitialSpec {
    /// Defaults to the origin.
    pub mean: Option<Vec<f64>>,
    pub var: f64,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GridSpec {
    #[serde(default)]
    pub periodic: bool,
}

/// Method selection: a pure data value, one tag per algorithm variant.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MethodSpec {
    Enkf {
        #[serde(default = "default_infl")]
        infl: f64,
        #[serde(default)]
        rotate: bool,
    },
    Etkf {
        #[serde(default = "default_infl")]
        infl: f64,
        #[serde(default)]
        rotate: bool,
    },
    Denkf {
        #[serde(default = "default_infl")]
        infl: f64,
        #[serde(default)]
        rotate: bool,
    },
    EnkfN(EnKfNConfig),
    Letkf(LetkfConfig),
    Ienks(IEnKsConfig),
    EsMda(EsMdaConfig),
    Pf(PfConfig),
    Netf(NetfConfig),
    Rhf(RhfConfig),
}

fn default_infl() -> f64 {
    1.0
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunSpec {
    #[serde(default)]
    pub seed: u64,
    pub n_members: usize,
    #[serde(default = "default_divergence_bound")]
    pub divergence_bound: f64,
}

fn default_divergence_bound() -> f64 {
    1e9
}

impl Scenario {
    pub fn from_file(path: &Path) -> Result<Self, ScenarioError> {
        info!(path = %path.display(), "loading scenario");
        Ok(Figment::new().merge(Toml::file(path)).extract()?)
    }

    pub fn from_toml_str(source: &str) -> Result<Self, ScenarioError> {
        Ok(Figment::new().merge(Toml::string(source)).extract()?)
    }

    pub fn label(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.method_kind().to_string())
    }

    fn method_kind(&self) -> &'static str {
        match &self.method {
            MethodSpec::Enkf { .. } => "enkf",
            MethodSpec::Etkf { .. } => "etkf",
            MethodSpec::Denkf { .. } => "denkf",
            MethodSpec::EnkfN(_) => "enkf_n",
            MethodSpec::Letkf(_) => "letkf",
            MethodSpec::Ienks(_) => "ienks",
            MethodSpec::EsMda(_) => "es_mda",
            MethodSpec::Pf(_) => "pf",
            MethodSpec::Netf(_) => "netf",
            MethodSpec::Rhf(_) => "rhf",
        }
    }

    /// Validates and assembles the runnable experiment.
    pub fn build(&self) -> Result<TwinExperiment, ScenarioError> {
        let (dynamics, model_noise, state_dim) = self.build_model()?;
        let (observation, obs_noise) = self.build_observation(state_dim)?;

        let mean = match &self.initial.mean {
            Some(values) => {
                if values.len() != state_dim {
                    return Err(ConfigError::DimensionMismatch {
                        what: "initial mean",
                        expected: state_dim,
                        got: values.len(),
                    }
                    .into());
                }
                DVector::from_vec(values.clone())
            }
            None => DVector::zeros(state_dim),
        };
        let init = GaussianRv::isotropic(mean, self.initial.var)?;

        let grid = Some(StateGrid {
            len: state_dim,
            periodic: self.grid.map(|g| g.periodic).unwrap_or(false),
        });

        let hmm = Hmm::new(
            self.chronology.clone(),
            dynamics,
            observation,
            init,
            model_noise,
            obs_noise,
            grid,
        )?;

        let mut options = RunOptions::new(self.run.seed, self.run.n_members);
        options.divergence_bound = self.run.divergence_bound;

        Ok(TwinExperiment::new(hmm, self.build_method(), options)?)
    }

    fn build_model(
        &self,
    ) -> Result<(Box<LinearDynamics>, Option<GaussianRv>, usize), ScenarioError> {
        let (dynamics, noise_var) = match &self.model {
            ModelSpec::RandomWalk {
                state_dim,
                noise_var,
            } => (LinearDynamics::identity(*state_dim), *noise_var),
            ModelSpec::Scaling {
                state_dim,
                factor,
                noise_var,
            } => (LinearDynamics::scaling(*state_dim, *factor), *noise_var),
            ModelSpec::Linear { matrix, noise_var } => {
                let rows = matrix.len();
                if rows == 0 || matrix.iter().any(|r| r.len() != rows) {
                    return Err(ConfigError::hyper(
                        "model.matrix",
                        "dynamics matrix must be square and non-empty",
                    )
                    .into());
                }
                let flat: Vec<f64> = matrix.iter().flatten().copied().collect();
                (
                    LinearDynamics::new(DMatrix::from_row_slice(rows, rows, &flat)),
                    *noise_var,
                )
            }
        };
        let state_dim = dynamics.state_dim();
        let model_noise = if noise_var > 0.0 {
            Some(GaussianRv::centered(state_dim, noise_var)?)
        } else if noise_var < 0.0 {
            return Err(ConfigError::hyper(
                "model.noise_var",
                format!("must be non-negative, got {noise_var}"),
            )
            .into());
        } else {
            None
        };
        Ok((Box::new(dynamics), model_noise, state_dim))
    }

    fn build_observation(
        &self,
        state_dim: usize,
    ) -> Result<(Box<LinearObservation>, GaussianRv), ScenarioError> {
        let (operator, noise_var) = match &self.observation {
            ObservationSpec::Identity { noise_var } => {
                (LinearObservation::identity(state_dim), *noise_var)
            }
            ObservationSpec::Partial { indices, noise_var } => {
                if indices.is_empty() {
                    return Err(ConfigError::hyper(
                        "observation.indices",
                        "must observe at least one component",
                    )
                    .into());
                }
                if let Some(&bad) = indices.iter().find(|&&i| i >= state_dim) {
                    return Err(ConfigError::DimensionMismatch {
                        what: "observed component index",
                        expected: state_dim,
                        got: bad,
                    }
                    .into());
                }
                (LinearObservation::partial(state_dim, indices), *noise_var)
            }
        };
        if noise_var <= 0.0 {
            return Err(ConfigError::hyper(
                "observation.noise_var",
                format!("must be positive, got {noise_var}"),
            )
            .into());
        }
        let obs_noise = GaussianRv::centered(operator.obs_dim(), noise_var)?;
        Ok((Box::new(operator), obs_noise))
    }

    fn build_method(&self) -> Method {
        match &self.method {
            MethodSpec::Enkf { infl, rotate } => Method::EnKf(EnKfConfig {
                variant: EnKfVariant::PertObs,
                infl: *infl,
                rotate: *rotate,
            }),
            MethodSpec::Etkf { infl, rotate } => Method::EnKf(EnKfConfig {
                variant: EnKfVariant::Sqrt,
                infl: *infl,
                rotate: *rotate,
            }),
            MethodSpec::Denkf { infl, rotate } => Method::EnKf(EnKfConfig {
                variant: EnKfVariant::DEnKf,
                infl: *infl,
                rotate: *rotate,
            }),
            MethodSpec::EnkfN(config) => Method::EnKfN(*config),
            MethodSpec::Letkf(config) => Method::Letkf(*config),
            MethodSpec::Ienks(config) => Method::IEnKs(*config),
            MethodSpec::EsMda(config) => Method::EsMda(*config),
            MethodSpec::Pf(config) => Method::ParticleFilter(*config),
            MethodSpec::Netf(config) => Method::Netf(*config),
            MethodSpec::Rhf(config) => Method::Rhf(*config),
        }
    }
}
