use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Reserved key under which the registered type tag is embedded in an
/// entity's serialized form.
pub const TAG_KEY: &str = "__t";

/// Upcast helper so `dyn Entity` can be downcast to its concrete type.
pub trait AsAny: Any {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// A serializable unit of world state.
///
/// The only intrinsic attribute is the world id, which must be unique within
/// a [`World`](crate::World). Concrete entity types are registered with an
/// [`EntityRegistry`] before they are stored in a serialized world.
pub trait Entity: AsAny + fmt::Debug + 'static {
    /// Stable id of this entity, e.g. `"chunk_3_-2"` or a player UUID.
    fn world_id(&self) -> String;
}

impl dyn Entity {
    pub fn is<T: Entity>(&self) -> bool {
        self.as_any().is::<T>()
    }

    pub fn downcast_ref<T: Entity>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    pub fn downcast_mut<T: Entity>(&mut self) -> Option<&mut T> {
        self.as_any_mut().downcast_mut::<T>()
    }

    /// Runtime type of the concrete entity behind the trait object.
    pub fn concrete_type_id(&self) -> TypeId {
        self.as_any().type_id()
    }
}

/// Errors from entity registration and (de)serialization.
#[derive(Debug, thiserror::Error)]
pub enum EntityError {
    #[error("entity type {type_name} is already registered as '{tag}'")]
    TypeAlreadyRegistered { type_name: &'static str, tag: String },
    #[error("entity tag '{0}' is already taken by another type")]
    TagTaken(String),
    #[error("entity '{0}' has a type that was never registered")]
    UnregisteredType(String),
    #[error("serialized entity has no '__t' tag")]
    MissingTag,
    #[error("unknown entity tag '{0}'")]
    UnknownTag(String),
    #[error("entity tagged '{0}' does not serialize to an object")]
    NotAnObject(String),
    #[error("entity tagged '{0}' declares a field named '__t'")]
    ReservedField(String),
    #[error("codec error for entity tagged '{tag}': {source}")]
    Codec {
        tag: String,
        #[source]
        source: serde_json::Error,
    },
}

type EncodeFn = fn(&dyn Entity) -> Result<Value, serde_json::Error>;
type DecodeFn = fn(Value) -> Result<Box<dyn Entity>, serde_json::Error>;

#[derive(Debug)]
struct Registration {
    tag: String,
    type_name: &'static str,
    encode: EncodeFn,
    decode: DecodeFn,
}

/// Table of serialization tags for concrete entity types.
///
/// Populated once at startup, before any entity of a registered type is
/// serialized or deserialized. Registration requires the type to implement
/// both `Serialize` and `DeserializeOwned`, so a type lacking either is
/// rejected at compile time rather than on first use. Cloning is cheap; the
/// registry can be handed to another thread.
#[derive(Debug, Clone, Default)]
pub struct EntityRegistry {
    by_type: HashMap<TypeId, Arc<Registration>>,
    by_tag: HashMap<String, Arc<Registration>>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `T` under its own type name.
    pub fn register<T>(&mut self) -> Result<(), EntityError>
    where
        T: Entity + Serialize + DeserializeOwned,
    {
        self.register_as::<T>(short_type_name::<T>())
    }

    /// Register `T` under an explicit tag. The tag is permanent for the
    /// lifetime of the registry.
    pub fn register_as<T>(&mut self, tag: impl Into<String>) -> Result<(), EntityError>
    where
        T: Entity + Serialize + DeserializeOwned,
    {
        let tag = tag.into();
        if let Some(existing) = self.by_type.get(&TypeId::of::<T>()) {
            return Err(EntityError::TypeAlreadyRegistered {
                type_name: existing.type_name,
                tag: existing.tag.clone(),
            });
        }
        if self.by_tag.contains_key(&tag) {
            return Err(EntityError::TagTaken(tag));
        }

        let registration = Arc::new(Registration {
            tag: tag.clone(),
            type_name: std::any::type_name::<T>(),
            encode: encode_as::<T>,
            decode: decode_as::<T>,
        });
        self.by_type.insert(TypeId::of::<T>(), registration.clone());
        self.by_tag.insert(tag.clone(), registration);
        tracing::debug!(tag = %tag, type_name = std::any::type_name::<T>(), "registered entity type");
        Ok(())
    }

    /// Tag registered for `T`, if any.
    pub fn tag_of<T: Entity>(&self) -> Option<&str> {
        self.by_type
            .get(&TypeId::of::<T>())
            .map(|r| r.tag.as_str())
    }

    /// Tag registered for the concrete type behind `entity`, if any.
    pub fn tag_for(&self, entity: &dyn Entity) -> Option<&str> {
        self.by_type
            .get(&entity.concrete_type_id())
            .map(|r| r.tag.as_str())
    }

    pub fn is_registered(&self, tag: &str) -> bool {
        self.by_tag.contains_key(tag)
    }

    pub fn len(&self) -> usize {
        self.by_tag.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_tag.is_empty()
    }

    /// Serialize an entity to its tagged object form: `{ ...fields, "__t": tag }`.
    pub fn encode(&self, entity: &dyn Entity) -> Result<Value, EntityError> {
        let registration = self
            .by_type
            .get(&entity.concrete_type_id())
            .ok_or_else(|| EntityError::UnregisteredType(entity.world_id()))?;

        let value = (registration.encode)(entity).map_err(|source| EntityError::Codec {
            tag: registration.tag.clone(),
            source,
        })?;
        let Value::Object(mut fields) = value else {
            return Err(EntityError::NotAnObject(registration.tag.clone()));
        };
        if fields.contains_key(TAG_KEY) {
            return Err(EntityError::ReservedField(registration.tag.clone()));
        }
        fields.insert(TAG_KEY.to_owned(), Value::String(registration.tag.clone()));
        Ok(Value::Object(fields))
    }

    /// Reconstruct a concrete entity from its tagged object form.
    pub fn decode(&self, value: Value) -> Result<Box<dyn Entity>, EntityError> {
        let mut fields: Map<String, Value> = match value {
            Value::Object(fields) => fields,
            _ => return Err(EntityError::MissingTag),
        };
        let tag = match fields.remove(TAG_KEY) {
            Some(Value::String(tag)) => tag,
            _ => return Err(EntityError::MissingTag),
        };
        let registration = self
            .by_tag
            .get(&tag)
            .ok_or_else(|| EntityError::UnknownTag(tag.clone()))?;

        (registration.decode)(Value::Object(fields))
            .map_err(|source| EntityError::Codec { tag, source })
    }
}

fn encode_as<T: Entity + Serialize>(entity: &dyn Entity) -> Result<Value, serde_json::Error> {
    match entity.downcast_ref::<T>() {
        Some(concrete) => serde_json::to_value(concrete),
        // Registrations are keyed by TypeId, so the lookup guarantees the type.
        None => Err(serde::ser::Error::custom("entity type does not match its registration")),
    }
}

fn decode_as<T: Entity + DeserializeOwned>(value: Value) -> Result<Box<dyn Entity>, serde_json::Error> {
    let entity: T = serde_json::from_value(value)?;
    Ok(Box::new(entity))
}

/// Last path segment of the type name, e.g. `Player` for `voxel_game::Player`.
fn short_type_name<T>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}
