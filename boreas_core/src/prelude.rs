// boreas_core/src/prelude.rs

// --- Core Abstractions (The main contracts of the library) ---
pub use crate::models::{DynamicsModel, GaussianRv, ObservationModel};

// --- Core Data Structures (The "nouns" of the library) ---
pub use crate::chronology::{Chronology, Tick};
pub use crate::ensemble::Ensemble;
pub use crate::errors::{ConfigError, MethodError};
pub use crate::hmm::{Hmm, Observations, Truth};
pub use crate::localize::{Localization, StateGrid, Taper};
pub use crate::types::{Obs, ObsIndex, RunStatus, State, StepIndex};

// --- The DA Method Engine ---
pub use crate::methods::{
    AnalysisContext, AnalysisOutcome, EnKfConfig, EnKfNConfig, EnKfVariant, EsMdaConfig,
    IEnKsConfig, KalmanFilter, LetkfConfig, Method, NetfConfig, PfConfig, ResamplingScheme,
    RhfConfig, SensitivityVariant,
};

// --- Concrete Model Implementations (Export common ones for convenience) ---
pub use crate::models::{LinearDynamics, LinearObservation, StepWise};
