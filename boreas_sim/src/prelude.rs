// boreas_sim/src/prelude.rs

pub use crate::batch::{run_batch, BatchEntry};
pub use crate::diagnostics::{ChannelSink, DiagnosticsSink, NullSink, Phase, StepSnapshot};
pub use crate::runner::{CancelToken, RunOptions, RunRecord, TwinExperiment};
pub use crate::scenario::{Scenario, ScenarioError};
pub use crate::stats::Stats;

pub use boreas_core::prelude::*;
