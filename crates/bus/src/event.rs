use serde::Serialize;
use serde::de::DeserializeOwned;
use std::any::Any;
use std::cell::Cell;
use std::fmt;
use std::rc::Rc;
use voxel_common::{CorrelationId, Environment, now_millis};

use crate::error::BusError;
use crate::wire::{WireMessage, WireMetadata};

/// Subscription token matching every event type.
pub const WILDCARD: &str = "*";

/// Data carried by a concrete event type.
///
/// `TYPE` is the stable, registered type name, namespaced by origin:
/// `"Client.<Verb>"` or `"Server.<Verb>"`.
pub trait Payload: Serialize + DeserializeOwned + fmt::Debug + 'static {
    const TYPE: &'static str;
}

/// Event metadata. Hooks and handlers share the event, so mutable fields use
/// interior mutability.
pub struct Metadata {
    timestamp: u64,
    correlation_id: Cell<Option<CorrelationId>>,
    origin: Cell<Option<Environment>>,
    forwarded: Cell<bool>,
    canceled: Cell<bool>,
}

impl Metadata {
    fn new(timestamp: u64) -> Self {
        Self {
            timestamp,
            correlation_id: Cell::new(None),
            origin: Cell::new(None),
            forwarded: Cell::new(false),
            canceled: Cell::new(false),
        }
    }

    /// Creation time in milliseconds since the Unix epoch.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn correlation_id(&self) -> Option<CorrelationId> {
        self.correlation_id.get()
    }

    pub fn set_correlation_id(&self, id: Option<CorrelationId>) {
        self.correlation_id.set(id);
    }

    pub fn origin(&self) -> Option<Environment> {
        self.origin.get()
    }

    pub fn set_origin(&self, origin: Environment) {
        self.origin.set(Some(origin));
    }

    /// True once a relay has carried this event across the worker boundary.
    pub fn is_forwarded(&self) -> bool {
        self.forwarded.get()
    }

    pub fn mark_forwarded(&self) {
        self.forwarded.set(true);
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.get()
    }

    /// Stop the remaining handlers of the current publish pass.
    pub fn cancel(&self) {
        self.canceled.set(true);
    }

    fn to_wire(&self) -> WireMetadata {
        WireMetadata {
            timestamp: self.timestamp,
            correlation_id: self.correlation_id(),
            origin: self.origin(),
        }
    }

    fn from_wire(wire: WireMetadata) -> Self {
        let meta = Self::new(wire.timestamp);
        meta.set_correlation_id(wire.correlation_id);
        meta.origin.set(wire.origin);
        meta
    }
}

impl fmt::Debug for Metadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Metadata")
            .field("timestamp", &self.timestamp)
            .field("correlation_id", &self.correlation_id())
            .field("origin", &self.origin())
            .field("forwarded", &self.is_forwarded())
            .field("canceled", &self.is_canceled())
            .finish()
    }
}

/// A typed message: a payload plus metadata.
#[derive(Debug)]
pub struct Event<P> {
    meta: Metadata,
    payload: P,
}

impl<P: Payload> Event<P> {
    pub fn new(payload: P) -> Self {
        Self {
            meta: Metadata::new(now_millis()),
            payload,
        }
    }

    /// Set the correlation id up front, e.g. to pair with a known request.
    pub fn with_correlation(self, id: CorrelationId) -> Self {
        self.meta.set_correlation_id(Some(id));
        self
    }

    pub fn payload(&self) -> &P {
        &self.payload
    }

    pub fn into_payload(self) -> P {
        self.payload
    }

    pub fn meta(&self) -> &Metadata {
        &self.meta
    }

    pub fn correlation_id(&self) -> Option<CorrelationId> {
        self.meta.correlation_id()
    }

    pub fn cancel(&self) {
        self.meta.cancel();
    }

    pub fn is_canceled(&self) -> bool {
        self.meta.is_canceled()
    }

    pub(crate) fn from_wire(message: WireMessage) -> Result<Self, BusError> {
        let payload = serde_json::from_value(message.payload).map_err(|source| BusError::Codec {
            event_type: message.event_type,
            source,
        })?;
        Ok(Self {
            meta: Metadata::from_wire(message.metadata),
            payload,
        })
    }
}

/// Type-erased view of an [`Event`], used by wildcard handlers, hooks and the relay.
pub trait AnyEvent: fmt::Debug + 'static {
    fn event_type(&self) -> &'static str;
    fn meta(&self) -> &Metadata;
    /// Encode type, metadata and payload for the worker channel.
    fn to_wire(&self) -> Result<WireMessage, BusError>;
    fn as_any(&self) -> &dyn Any;
    fn into_any(self: Rc<Self>) -> Rc<dyn Any>;
}

impl<P: Payload> AnyEvent for Event<P> {
    fn event_type(&self) -> &'static str {
        P::TYPE
    }

    fn meta(&self) -> &Metadata {
        &self.meta
    }

    fn to_wire(&self) -> Result<WireMessage, BusError> {
        let payload = serde_json::to_value(&self.payload).map_err(|source| BusError::Codec {
            event_type: P::TYPE.to_owned(),
            source,
        })?;
        Ok(WireMessage {
            event_type: P::TYPE.to_owned(),
            metadata: self.meta.to_wire(),
            payload,
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Rc<Self>) -> Rc<dyn Any> {
        self
    }
}

impl dyn AnyEvent {
    pub fn is<P: Payload>(&self) -> bool {
        self.as_any().is::<Event<P>>()
    }

    pub fn downcast_ref<P: Payload>(&self) -> Option<&Event<P>> {
        self.as_any().downcast_ref::<Event<P>>()
    }

    /// Recover the typed event behind a shared handle.
    pub fn downcast<P: Payload>(self: Rc<Self>) -> Option<Rc<Event<P>>> {
        self.into_any().downcast::<Event<P>>().ok()
    }

    pub fn cancel(&self) {
        self.meta().cancel();
    }

    pub fn is_canceled(&self) -> bool {
        self.meta().is_canceled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Jump {
        height: f32,
    }

    impl Payload for Jump {
        const TYPE: &'static str = "Client.Jump";
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Land;

    impl Payload for Land {
        const TYPE: &'static str = "Server.Land";
    }

    #[test]
    fn new_event_has_fresh_metadata() {
        let event = Event::new(Jump { height: 1.5 });
        assert!(event.meta().timestamp() > 0);
        assert_eq!(event.correlation_id(), None);
        assert_eq!(event.meta().origin(), None);
        assert!(!event.meta().is_forwarded());
        assert!(!event.is_canceled());
    }

    #[test]
    fn cancel_is_sticky() {
        let event = Event::new(Land);
        event.cancel();
        assert!(event.is_canceled());
    }

    #[test]
    fn wire_roundtrip_keeps_payload_and_metadata() {
        let id = CorrelationId::new();
        let event = Event::new(Jump { height: 2.25 }).with_correlation(id);
        event.meta().set_origin(Environment::Client);
        event.cancel();

        let wire = event.to_wire().unwrap();
        assert_eq!(wire.event_type, "Client.Jump");
        let decoded = Event::<Jump>::from_wire(wire).unwrap();
        assert_eq!(decoded.payload(), &Jump { height: 2.25 });
        assert_eq!(decoded.correlation_id(), Some(id));
        assert_eq!(decoded.meta().origin(), Some(Environment::Client));
        assert_eq!(decoded.meta().timestamp(), event.meta().timestamp());
        // Cancellation is local to a publish pass and does not travel.
        assert!(!decoded.is_canceled());
        assert!(!decoded.meta().is_forwarded());
    }

    #[test]
    fn unit_payload_encodes_as_null() {
        let wire = Event::new(Land).to_wire().unwrap();
        assert_eq!(wire.payload, serde_json::Value::Null);
    }

    #[test]
    fn payload_mismatch_is_a_codec_error() {
        let mut wire = Event::new(Jump { height: 1.0 }).to_wire().unwrap();
        wire.payload = serde_json::json!({ "height": "tall" });
        let err = Event::<Jump>::from_wire(wire).unwrap_err();
        assert!(matches!(err, BusError::Codec { event_type, .. } if event_type == "Client.Jump"));
    }

    #[test]
    fn downcast_through_trait_object() {
        let erased: Rc<dyn AnyEvent> = Rc::new(Event::new(Jump { height: 3.0 }));
        assert!(erased.is::<Jump>());
        assert!(!erased.is::<Land>());
        assert!(erased.clone().downcast::<Land>().is_none());
        let typed = erased.downcast::<Jump>().unwrap();
        assert_eq!(typed.payload().height, 3.0);
    }
}
