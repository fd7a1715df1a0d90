//! Events both sides register so the relay can signal readiness and startup.

use serde::{Deserialize, Serialize};
use voxel_bus::{BusError, EventBus, Payload};
use voxel_kernel::SerializedWorld;

/// Published by the worker once its bus is set up and its relay attached.
/// Clients wait for it before sending requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerReady;

impl Payload for ServerReady {
    const TYPE: &'static str = "Server.Ready";
}

/// Asks the server to start a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientStart {
    /// Optional player name to spawn the session with.
    #[serde(default)]
    pub player: Option<String>,
}

impl Payload for ClientStart {
    const TYPE: &'static str = "Client.Start";
}

/// Reply to [`ClientStart`] carrying the server's world snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerStarted {
    pub world: SerializedWorld,
}

impl Payload for ServerStarted {
    const TYPE: &'static str = "Server.Started";
}

/// Register the lifecycle events on `bus`, skipping any already registered.
pub fn register_lifecycle_events(bus: &EventBus) -> Result<(), BusError> {
    if !bus.is_registered(ServerReady::TYPE) {
        bus.register_event_type::<ServerReady>()?;
    }
    if !bus.is_registered(ClientStart::TYPE) {
        bus.register_event_type::<ClientStart>()?;
    }
    if !bus.is_registered(ServerStarted::TYPE) {
        bus.register_event_type::<ServerStarted>()?;
    }
    Ok(())
}
