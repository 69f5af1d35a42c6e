// boreas_core/src/models/mod.rs

pub mod dynamics;
pub mod noise;
pub mod observation;

pub use dynamics::{DynamicsModel, LinearDynamics, StepWise};
pub use noise::GaussianRv;
pub use observation::{LinearObservation, ObservationModel};
