use serde::{Deserialize, Serialize};
use voxel_bus::{BusError, EventBus, Payload};

use crate::entities::Chunk;

/// Latency probe sent by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    /// Client clock, milliseconds since the Unix epoch.
    pub sent_at: u64,
}

impl Payload for Ping {
    const TYPE: &'static str = "Client.Ping";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pong {
    /// Echo of [`Ping::sent_at`].
    pub sent_at: u64,
    /// Server tick when the ping was answered.
    pub tick: u64,
}

impl Payload for Pong {
    const TYPE: &'static str = "Server.Pong";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestChunk {
    pub x: i32,
    pub z: i32,
}

impl Payload for RequestChunk {
    const TYPE: &'static str = "Client.RequestChunk";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseChunk {
    pub chunk: Chunk,
}

impl Payload for ResponseChunk {
    const TYPE: &'static str = "Server.ResponseChunk";
}

/// Register the game's event types. Both sides call this once at startup.
pub fn register_events(bus: &EventBus) -> Result<(), BusError> {
    bus.register_event_type::<Ping>()?;
    bus.register_event_type::<Pong>()?;
    bus.register_event_type::<RequestChunk>()?;
    bus.register_event_type::<ResponseChunk>()?;
    Ok(())
}
