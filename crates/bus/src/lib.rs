//! Event Bus: typed pub/sub, wildcard subscriptions, cancellation, before-publish
//! hooks, request/response correlation, and declarative handler binding.
//!
//! # Invariants
//! - Publishing or subscribing to an unregistered type fails immediately.
//! - Handlers run in registration order; wildcard handlers after type-specific ones.
//! - Once an event is canceled, no further handler runs for that publish.
//! - A bus belongs to one execution context. Its types are `!Send`; only
//!   [`WireMessage`] values cross threads.

mod binding;
mod bus;
mod error;
mod event;
mod registry;
mod wire;

pub use binding::{Bindings, EventHandlers, HandlerTable, bind_handlers};
pub use bus::{EventBus, HandlerFuture, Subscription, WeakEventBus};
pub use error::BusError;
pub use event::{AnyEvent, Event, Metadata, Payload, WILDCARD};
pub use registry::EventRegistry;
pub use wire::{WireMessage, WireMetadata};

pub use voxel_common::{CorrelationId, Environment};
