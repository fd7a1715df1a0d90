//! Shared types for the voxel message substrate.

mod types;

pub use types::{CorrelationId, Environment, ParseEnvironmentError, now_millis};
