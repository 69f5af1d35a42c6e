// boreas_core/src/errors.rs

use thiserror::Error;

/// Setup-time failures. Everything here is raised while an experiment is
/// being assembled (chronology, HMM, method configuration); a run that has
/// started never produces a `ConfigError`.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("invalid chronology: {0}")]
    Chronology(String),

    #[error("dimension mismatch in {what}: expected {expected}, got {got}")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("invalid hyperparameter `{name}`: {reason}")]
    Hyperparameter { name: &'static str, reason: String },

    #[error("method `{method}` requires {requirement}")]
    MethodRequirement {
        method: &'static str,
        requirement: String,
    },
}

impl ConfigError {
    pub fn hyper(name: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Hyperparameter {
            name,
            reason: reason.into(),
        }
    }
}

/// Runtime failure of a single analysis step.
///
/// Near-singular matrices are regularized locally and reported through
/// `AnalysisOutcome::regularized`, so the only hard failure left is genuine
/// divergence: non-finite members, or a factorization that fails even after
/// regularization. The harness turns this into a terminal stats marker for
/// the affected run; it never aborts sibling experiments.
#[derive(Debug, Clone, Error)]
pub enum MethodError {
    #[error("ensemble diverged: {0}")]
    Diverged(&'static str),
}
