//! Identity of a managed record.

use std::fmt;
use std::hash::{Hash, Hasher};
use unitwork_core::{Entity, EntityType, Value};

/// `(entity type, identifier)` pair identifying one record within a session.
///
/// The identifier is stored in canonical form (see [`Value::canonical`]) so
/// an id bound as `i32` and read back as `i64` maps to the same key.
#[derive(Clone)]
pub struct EntityKey {
    entity: EntityType,
    id: Value,
}

impl EntityKey {
    pub fn new(entity: EntityType, id: Value) -> Self {
        Self {
            entity,
            id: id.canonical(),
        }
    }

    /// Key for entity type `E` with the given identifier.
    pub fn of<E: Entity>(id: impl Into<Value>) -> Self {
        Self::new(EntityType::of::<E>(), id.into())
    }

    pub fn entity_type(&self) -> EntityType {
        self.entity
    }

    pub fn id(&self) -> &Value {
        &self.id
    }
}

impl PartialEq for EntityKey {
    fn eq(&self, other: &Self) -> bool {
        self.entity == other.entity && self.id == other.id
    }
}

// Identifiers are never NaN in practice; keys are used as map keys only.
impl Eq for EntityKey {}

impl Hash for EntityKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.entity.hash(state);
        self.id.hash_into(state);
    }
}

impl fmt::Debug for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{:?}", self.entity.name(), self.id)
    }
}
