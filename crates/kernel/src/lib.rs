//! World Kernel: entity model, serialization tags, indexed world store, queries.
//!
//! # Invariants
//! - Every concrete entity type is registered once before it is serialized or
//!   deserialized; registration requires both `Serialize` and `DeserializeOwned`.
//! - The type index is always consistent with the primary entity map.
//! - A world is owned by exactly one execution context; state crosses the
//!   worker boundary only in its serialized form.

pub mod entity;
pub mod query;
pub mod world;

pub use entity::{AsAny, Entity, EntityError, EntityRegistry, TAG_KEY};
pub use query::{QueryEntry, WorldQuery};
pub use world::{SerializedWorld, World, WorldError};
