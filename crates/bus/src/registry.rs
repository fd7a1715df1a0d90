use std::collections::HashMap;
use std::rc::Rc;

use crate::error::BusError;
use crate::event::{AnyEvent, Event, Payload, WILDCARD};
use crate::wire::WireMessage;

type DecodeFn = fn(WireMessage) -> Result<Rc<dyn AnyEvent>, BusError>;

/// Table of known event types and how to rebuild them from the wire.
///
/// Populated once at startup, before any publish or subscribe of the types it
/// lists. Decoders are plain function pointers, so a registry can be built on
/// one thread and handed to a bus on another.
#[derive(Debug, Clone, Default)]
pub struct EventRegistry {
    decoders: HashMap<&'static str, DecodeFn>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<P: Payload>(&mut self) -> Result<(), BusError> {
        if P::TYPE == WILDCARD {
            return Err(BusError::ReservedType(P::TYPE.to_owned()));
        }
        if self.decoders.contains_key(P::TYPE) {
            return Err(BusError::AlreadyRegistered(P::TYPE.to_owned()));
        }
        self.decoders.insert(P::TYPE, decode_as::<P>);
        Ok(())
    }

    pub fn contains(&self, event_type: &str) -> bool {
        self.decoders.contains_key(event_type)
    }

    /// Registered type names, in no particular order.
    pub fn types(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.decoders.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.decoders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }

    /// Accepts registered type names and the wildcard token.
    pub(crate) fn ensure_subscribable(&self, key: &str) -> Result<(), BusError> {
        if key == WILDCARD {
            return Ok(());
        }
        self.ensure_registered(key)
    }

    pub(crate) fn ensure_registered(&self, event_type: &str) -> Result<(), BusError> {
        if self.contains(event_type) {
            Ok(())
        } else {
            Err(BusError::Unregistered(event_type.to_owned()))
        }
    }

    /// Rebuild a live event from its wire form. Fails fast for unknown types.
    pub fn decode(&self, message: WireMessage) -> Result<Rc<dyn AnyEvent>, BusError> {
        let decode = self
            .decoders
            .get(message.event_type.as_str())
            .ok_or_else(|| BusError::Unregistered(message.event_type.clone()))?;
        decode(message)
    }
}

fn decode_as<P: Payload>(message: WireMessage) -> Result<Rc<dyn AnyEvent>, BusError> {
    Ok(Rc::new(Event::<P>::from_wire(message)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize)]
    struct Hello {
        name: String,
    }

    impl Payload for Hello {
        const TYPE: &'static str = "Client.Hello";
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Everything;

    impl Payload for Everything {
        const TYPE: &'static str = "*";
    }

    #[test]
    fn register_and_decode() {
        let mut registry = EventRegistry::new();
        registry.register::<Hello>().unwrap();
        assert!(registry.contains("Client.Hello"));

        let wire = Event::new(Hello {
            name: "steve".into(),
        })
        .to_wire()
        .unwrap();
        let decoded = registry.decode(wire).unwrap();
        assert_eq!(decoded.event_type(), "Client.Hello");
        assert_eq!(decoded.downcast_ref::<Hello>().unwrap().payload().name, "steve");
    }

    #[test]
    fn duplicate_registration_fails() {
        let mut registry = EventRegistry::new();
        registry.register::<Hello>().unwrap();
        assert!(matches!(
            registry.register::<Hello>(),
            Err(BusError::AlreadyRegistered(_))
        ));
    }

    #[test]
    fn wildcard_cannot_be_registered() {
        let mut registry = EventRegistry::new();
        assert!(matches!(
            registry.register::<Everything>(),
            Err(BusError::ReservedType(_))
        ));
    }

    #[test]
    fn decode_unknown_type_fails_fast() {
        let registry = EventRegistry::new();
        let wire = Event::new(Hello { name: "x".into() }).to_wire().unwrap();
        assert!(matches!(
            registry.decode(wire),
            Err(BusError::Unregistered(t)) if t == "Client.Hello"
        ));
    }

    #[test]
    fn wildcard_is_subscribable_but_not_publishable() {
        let registry = EventRegistry::new();
        assert!(registry.ensure_subscribable(WILDCARD).is_ok());
        assert!(registry.ensure_registered(WILDCARD).is_err());
    }
}
