use std::any::TypeId;

use crate::entity::Entity;
use crate::world::{World, WorldError};

type EntityFilter<'w> = Box<dyn Fn(&dyn Entity) -> bool + 'w>;
type IdFilter<'w> = Box<dyn Fn(&str) -> bool + 'w>;

/// One result of a query: the matching entity and its world id.
#[derive(Debug, Clone, Copy)]
pub struct QueryEntry<'w> {
    pub id: &'w str,
    pub entity: &'w dyn Entity,
}

impl<'w> QueryEntry<'w> {
    /// View the entity as one of the selected concrete types.
    pub fn downcast<T: Entity>(&self) -> Option<&'w T> {
        self.entity.downcast_ref::<T>()
    }
}

/// Chainable query over a borrowed [`World`].
///
/// Selected types form a union; filters are conjunctive and run in the order
/// they were added, id filters before entity filters. The world cannot change
/// while a query borrows it.
pub struct WorldQuery<'w> {
    world: &'w World,
    types: Vec<TypeId>,
    entity_filters: Vec<EntityFilter<'w>>,
    id_filters: Vec<IdFilter<'w>>,
}

impl<'w> WorldQuery<'w> {
    pub(crate) fn new(world: &'w World) -> Self {
        Self {
            world,
            types: Vec::new(),
            entity_filters: Vec::new(),
            id_filters: Vec::new(),
        }
    }

    /// Add `T` to the set of types to union over.
    pub fn select<T: Entity>(mut self) -> Self {
        let type_id = TypeId::of::<T>();
        if !self.types.contains(&type_id) {
            self.types.push(type_id);
        }
        self
    }

    /// Keep only entities matching `predicate`.
    pub fn filter(mut self, predicate: impl Fn(&dyn Entity) -> bool + 'w) -> Self {
        self.entity_filters.push(Box::new(predicate));
        self
    }

    /// Keep only `T` entities matching `predicate`. Entities of other selected
    /// types are rejected by this filter.
    pub fn filter_as<T: Entity>(self, predicate: impl Fn(&T) -> bool + 'w) -> Self {
        self.filter(move |entity| entity.downcast_ref::<T>().is_some_and(&predicate))
    }

    /// Keep only ids matching `predicate`.
    pub fn filter_id(mut self, predicate: impl Fn(&str) -> bool + 'w) -> Self {
        self.id_filters.push(Box::new(predicate));
        self
    }

    /// Run the query.
    ///
    /// Returns a lazy iterator in type-then-insertion order; calling `execute`
    /// again starts over. Fails when no type was selected: there is no
    /// "all entities" query.
    pub fn execute(&self) -> Result<impl Iterator<Item = QueryEntry<'w>> + '_, WorldError> {
        if self.types.is_empty() {
            return Err(WorldError::EmptySelection);
        }
        let world = self.world;

        let candidates = self
            .types
            .iter()
            .filter_map(move |type_id| world.by_type.get(type_id))
            .flat_map(|ids| ids.values());

        Ok(candidates.filter_map(move |id| {
            if !self.id_filters.iter().all(|accept| accept(id)) {
                return None;
            }
            let entity = world.slot(id)?.entity.as_ref();
            self.entity_filters
                .iter()
                .all(|accept| accept(entity))
                .then_some(QueryEntry {
                    id: id.as_str(),
                    entity,
                })
        }))
    }

    /// Convenience: collect the matching ids.
    pub fn ids(&self) -> Result<Vec<&'w str>, WorldError> {
        Ok(self.execute()?.map(|entry| entry.id).collect())
    }
}
