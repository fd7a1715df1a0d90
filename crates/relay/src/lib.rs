//! Cross-boundary relay between the main-thread client bus and the worker
//! server bus.
//!
//! Each side owns one [`voxel_bus::EventBus`]. A [`Relay`] forwards the local
//! events its [`ForwardPolicy`] accepts over the host message channel and
//! republishes what arrives from the peer, marked as forwarded.
//!
//! # Invariants
//! - Only [`voxel_bus::WireMessage`] values cross threads.
//! - An event that arrived through a relay is never sent back.
//! - Messages whose type the receiver has not registered are logged and
//!   dropped; there is no buffering or retry.

pub mod client;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod relay;
pub mod worker;

pub use client::ClientLink;
pub use config::{ClientConfig, RelayConfig};
pub use error::RelayError;
pub use lifecycle::{ClientStart, ServerReady, ServerStarted, register_lifecycle_events};
pub use relay::{ForwardPolicy, Port, Relay, message_channel};
pub use worker::{WorkerHandle, spawn_server};
