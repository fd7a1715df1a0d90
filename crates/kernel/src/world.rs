use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::TypeId;
use std::collections::{BTreeMap, HashMap};

use crate::entity::{Entity, EntityError, EntityRegistry};
use crate::query::WorldQuery;

/// Errors from world operations.
#[derive(Debug, thiserror::Error)]
pub enum WorldError {
    #[error("entity '{0}' not found")]
    EntityNotFound(String),
    #[error("query executed without selecting any entity type")]
    EmptySelection,
}

/// Plain serialized form of a [`World`]: tagged entity payloads in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SerializedWorld {
    pub entities: Vec<Value>,
}

impl SerializedWorld {
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

/// A stored entity together with its insertion sequence number.
#[derive(Debug)]
pub(crate) struct Slot {
    pub(crate) seq: u64,
    pub(crate) entity: Box<dyn Entity>,
}

/// In-memory store of entities, indexed by world id and by concrete type.
///
/// The primary map owns every entity. The type index maps each concrete type
/// to the ids stored under it; both are updated together on every insert and
/// removal, so an id appears under type `T` exactly when the stored entity is a
/// `T`. Ids are ordered by a monotonically increasing insertion sequence, which
/// gives serialization and queries insertion order. Overwriting an id keeps its
/// original position.
#[derive(Debug, Default)]
pub struct World {
    entities: HashMap<String, Slot>,
    order: BTreeMap<u64, String>,
    pub(crate) by_type: HashMap<TypeId, BTreeMap<u64, String>>,
    next_seq: u64,
}

impl World {
    /// Create an empty world.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entities in the world.
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entities.contains_key(id)
    }

    /// Insert an entity under its world id.
    ///
    /// Last write wins: an existing entity with the same id is replaced and
    /// returned.
    pub fn add_entity<E: Entity>(&mut self, entity: E) -> Option<Box<dyn Entity>> {
        self.add_boxed(Box::new(entity))
    }

    /// Insert an already boxed entity. See [`World::add_entity`].
    pub fn add_boxed(&mut self, entity: Box<dyn Entity>) -> Option<Box<dyn Entity>> {
        let id = entity.world_id();
        let type_id = entity.as_ref().concrete_type_id();

        let (seq, replaced) = match self.entities.remove(&id) {
            Some(old) => {
                self.unindex_type(old.entity.as_ref().concrete_type_id(), old.seq);
                (old.seq, Some(old.entity))
            }
            None => {
                let seq = self.next_seq;
                self.next_seq += 1;
                self.order.insert(seq, id.clone());
                (seq, None)
            }
        };

        if replaced.is_some() {
            tracing::trace!(id = %id, "replaced entity");
        }
        self.by_type
            .entry(type_id)
            .or_default()
            .insert(seq, id.clone());
        self.entities.insert(id, Slot { seq, entity });
        replaced
    }

    /// Bulk insert in iteration order.
    pub fn add_entities<I>(&mut self, entities: I)
    where
        I: IntoIterator<Item = Box<dyn Entity>>,
    {
        for entity in entities {
            self.add_boxed(entity);
        }
    }

    /// Look up an entity by id.
    pub fn get_entity(&self, id: &str) -> Option<&dyn Entity> {
        self.entities.get(id).map(|slot| slot.entity.as_ref())
    }

    /// Look up an entity by id, requiring it to be a `T`. A type mismatch is
    /// reported as absent, not as an error.
    pub fn get<T: Entity>(&self, id: &str) -> Option<&T> {
        self.get_entity(id)?.downcast_ref::<T>()
    }

    /// Mutable typed lookup.
    ///
    /// The entity stays keyed under `id` whatever is done through this
    /// reference: the key is not re-validated against [`Entity::world_id`].
    /// Use [`World::update`] for edits that may change the world id.
    pub fn get_mut<T: Entity>(&mut self, id: &str) -> Option<&mut T> {
        self.entities
            .get_mut(id)
            .and_then(|slot| slot.entity.as_mut().downcast_mut::<T>())
    }

    /// Edit the `T` stored under `id`, then re-key it if its world id changed.
    ///
    /// A re-keyed entity is inserted as by [`World::add_boxed`]: it replaces
    /// and takes the position of an entity already stored under the new id,
    /// or goes to the end of insertion order. Returns `None` when there is no
    /// `T` under `id`.
    pub fn update<T: Entity, R>(&mut self, id: &str, edit: impl FnOnce(&mut T) -> R) -> Option<R> {
        let entity = self.get_mut::<T>(id)?;
        let result = edit(entity);
        let new_id = entity.world_id();
        if new_id != id {
            if let Ok(moved) = self.remove_entity(id) {
                self.add_boxed(moved);
            }
            tracing::trace!(from = %id, to = %new_id, "re-keyed entity");
        }
        Some(result)
    }

    /// Remove an entity, returning it.
    pub fn remove_entity(&mut self, id: &str) -> Result<Box<dyn Entity>, WorldError> {
        let slot = self
            .entities
            .remove(id)
            .ok_or_else(|| WorldError::EntityNotFound(id.to_owned()))?;
        self.order.remove(&slot.seq);
        self.unindex_type(slot.entity.as_ref().concrete_type_id(), slot.seq);
        Ok(slot.entity)
    }

    /// Entity ids in insertion order.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.order.values().map(String::as_str)
    }

    /// Entities in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &dyn Entity)> {
        self.order.values().filter_map(|id| {
            self.entities
                .get(id)
                .map(|slot| (id.as_str(), slot.entity.as_ref()))
        })
    }

    /// Number of stored entities of type `T`.
    pub fn count_of<T: Entity>(&self) -> usize {
        self.by_type
            .get(&TypeId::of::<T>())
            .map_or(0, BTreeMap::len)
    }

    /// Start a query bound to this world.
    pub fn query(&self) -> WorldQuery<'_> {
        WorldQuery::new(self)
    }

    /// Serialize every entity to its tagged form, in insertion order.
    pub fn serialize(&self, registry: &EntityRegistry) -> Result<SerializedWorld, EntityError> {
        let entities = self
            .iter()
            .map(|(_, entity)| registry.encode(entity))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(SerializedWorld { entities })
    }

    /// Rebuild a world from its serialized form.
    pub fn deserialize(
        registry: &EntityRegistry,
        data: SerializedWorld,
    ) -> Result<Self, EntityError> {
        let mut world = Self::new();
        for value in data.entities {
            world.add_boxed(registry.decode(value)?);
        }
        tracing::debug!(entities = world.len(), "deserialized world");
        Ok(world)
    }

    pub(crate) fn slot(&self, id: &str) -> Option<&Slot> {
        self.entities.get(id)
    }

    fn unindex_type(&mut self, type_id: TypeId, seq: u64) {
        if let Some(ids) = self.by_type.get_mut(&type_id) {
            ids.remove(&seq);
            if ids.is_empty() {
                self.by_type.remove(&type_id);
            }
        }
    }
}
