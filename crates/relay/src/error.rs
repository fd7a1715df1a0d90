use std::time::Duration;
use voxel_bus::BusError;
use voxel_kernel::{EntityError, WorldError};

/// Errors from the relay, the worker, and the client link.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Entity(#[from] EntityError),

    #[error(transparent)]
    World(#[from] WorldError),

    #[error("failed to spawn server worker: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("no '{response}' answered '{request}' within {timeout:?}")]
    Timeout {
        request: &'static str,
        response: &'static str,
        timeout: Duration,
    },

    #[error("server worker panicked")]
    ThreadPanic,

    #[error("server setup failed: {0}")]
    Setup(String),
}
