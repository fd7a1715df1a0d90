//! Reference consumers of the bus and world: the entities and events of a
//! small voxel game and the authoritative server that answers them.
//!
//! # Invariants
//! - The server's [`voxel_kernel::World`] lives on the worker; clients only
//!   ever see it serialized.
//! - Chunk contents are a pure function of the world seed and coordinates.

pub mod entities;
pub mod events;
pub mod server;

pub use entities::{Chunk, Player, entity_registry};
pub use events::{Ping, Pong, RequestChunk, ResponseChunk, register_events};
pub use server::{GameConfig, GameError, GameServer, TICK_INTERVAL};
