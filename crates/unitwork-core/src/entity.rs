//! The `Entity` trait and its type-erased counterparts.
//!
//! Entities are plain structs. Their mapping is explicit: the derive macro
//! generates [`Entity::fields`] plus a `read_field`/`write_field` pair that
//! moves values in and out of named fields, so the runtime never needs
//! reflection.
//!
//! Inside a session every managed record is shared as an [`EntityRef`]
//! (`Rc<RefCell<E>>`). The session works on records of many types at once
//! through [`ManagedRecord`], which `RefCell<E>` implements for every entity.

use crate::Result;
use crate::error::{Error, TypeError};
use crate::lazy::LazyList;
use crate::metadata::FieldDeclaration;
use crate::row::FromValue;
use crate::value::Value;
use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

/// Shared handle to a managed record.
///
/// A session hands out one `EntityRef` per identity; clones of the handle are
/// the same instance. Not `Send`: a session and its records belong to one
/// thread.
pub type EntityRef<E> = Rc<RefCell<E>>;

/// Wrap an entity value in a fresh [`EntityRef`].
pub fn entity_ref<E: Entity>(entity: E) -> EntityRef<E> {
    Rc::new(RefCell::new(entity))
}

/// A struct mapped to a table.
///
/// Usually derived:
///
/// ```ignore
/// #[derive(Entity, Debug, Default)]
/// #[entity(table = "persons")]
/// struct Person {
///     #[entity(id)]
///     id: i64,
///     first_name: String,
///     last_name: String,
///     notes: LazyList<Note>,
/// }
/// ```
pub trait Entity: Default + 'static {
    /// Type name, used as the table name when no override is declared.
    const NAME: &'static str;

    /// Declared table name override.
    const TABLE_NAME: Option<&'static str> = None;

    /// Declared fields in declaration order.
    fn fields() -> Vec<FieldDeclaration>;

    /// Read a field by name.
    #[allow(clippy::result_large_err)]
    fn read_field(&self, field: &str) -> Result<FieldValue>;

    /// Assign a field by name.
    #[allow(clippy::result_large_err)]
    fn write_field(&mut self, field: &str, value: FieldValue) -> Result<()>;
}

/// Runtime handle for an entity type.
///
/// Carries what the runtime needs to resolve metadata and to allocate a
/// zero-initialised instance without knowing the static type.
#[derive(Clone, Copy)]
pub struct EntityType {
    type_id: TypeId,
    name: &'static str,
    table_name: Option<&'static str>,
    fields: fn() -> Vec<FieldDeclaration>,
    instantiate: fn() -> Rc<dyn ManagedRecord>,
}

fn instantiate<E: Entity>() -> Rc<dyn ManagedRecord> {
    Rc::new(RefCell::new(E::default()))
}

impl EntityType {
    pub fn of<E: Entity>() -> Self {
        Self {
            type_id: TypeId::of::<E>(),
            name: E::NAME,
            table_name: E::TABLE_NAME,
            fields: E::fields,
            instantiate: instantiate::<E>,
        }
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn table_name(&self) -> Option<&'static str> {
        self.table_name
    }

    pub fn fields(&self) -> Vec<FieldDeclaration> {
        (self.fields)()
    }

    /// Allocate a default-valued record of this type.
    pub fn instantiate(&self) -> Rc<dyn ManagedRecord> {
        (self.instantiate)()
    }

    pub fn is<E: Entity>(&self) -> bool {
        self.type_id == TypeId::of::<E>()
    }
}

impl PartialEq for EntityType {
    fn eq(&self, other: &Self) -> bool {
        self.type_id == other.type_id
    }
}

impl Eq for EntityType {}

impl Hash for EntityType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.type_id.hash(state);
    }
}

impl fmt::Debug for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Type-erased view of a managed record.
pub trait ManagedRecord: 'static {
    fn entity_type(&self) -> EntityType;

    #[allow(clippy::result_large_err)]
    fn read_field(&self, field: &str) -> Result<FieldValue>;

    #[allow(clippy::result_large_err)]
    fn write_field(&self, field: &str, value: FieldValue) -> Result<()>;

    /// Upcast for downcasting back to `RefCell<E>`.
    fn into_any(self: Rc<Self>) -> Rc<dyn Any>;
}

impl fmt::Debug for dyn ManagedRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ManagedRecord")
            .field(&self.entity_type())
            .finish()
    }
}

fn borrow_conflict(entity: &'static str, field: &str) -> Error {
    Error::Custom(format!(
        "{entity}.{field} cannot be accessed while the record is borrowed elsewhere"
    ))
}

impl<E: Entity> ManagedRecord for RefCell<E> {
    fn entity_type(&self) -> EntityType {
        EntityType::of::<E>()
    }

    fn read_field(&self, field: &str) -> Result<FieldValue> {
        let entity = self
            .try_borrow()
            .map_err(|_| borrow_conflict(E::NAME, field))?;
        entity.read_field(field)
    }

    fn write_field(&self, field: &str, value: FieldValue) -> Result<()> {
        let mut entity = self
            .try_borrow_mut()
            .map_err(|_| borrow_conflict(E::NAME, field))?;
        entity.write_field(field, value)
    }

    fn into_any(self: Rc<Self>) -> Rc<dyn Any> {
        self
    }
}

/// Erase an entity handle.
pub fn erase<E: Entity>(record: &EntityRef<E>) -> Rc<dyn ManagedRecord> {
    Rc::clone(record) as Rc<dyn ManagedRecord>
}

/// Recover a typed handle from an erased record.
#[allow(clippy::result_large_err)]
pub fn downcast_record<E: Entity>(record: Rc<dyn ManagedRecord>) -> Result<EntityRef<E>> {
    let actual = record.entity_type().name();
    record.into_any().downcast::<RefCell<E>>().map_err(|_| {
        Error::Type(TypeError {
            expected: E::NAME,
            actual: actual.to_string(),
            column: None,
            rust_type: Some(std::any::type_name::<E>()),
        })
    })
}

/// Loader producing the records of a one-to-many relation.
pub type CollectionLoader = Box<dyn Fn() -> Result<Vec<Rc<dyn ManagedRecord>>>>;

/// A field value moved through `read_field`/`write_field`.
pub enum FieldValue {
    /// A plain column value.
    Scalar(Value),
    /// A to-one reference; `None` when the foreign key is NULL.
    Reference(Option<Rc<dyn ManagedRecord>>),
    /// A deferred to-many collection.
    Collection(CollectionLoader),
}

impl FieldValue {
    pub fn scalar(value: impl Into<Value>) -> Self {
        FieldValue::Scalar(value.into())
    }

    pub fn reference<E: Entity>(record: Option<&EntityRef<E>>) -> Self {
        FieldValue::Reference(record.map(erase))
    }

    fn kind(&self) -> &'static str {
        match self {
            FieldValue::Scalar(_) => "scalar value",
            FieldValue::Reference(_) => "entity reference",
            FieldValue::Collection(_) => "collection loader",
        }
    }

    fn wrong_kind(&self, expected: &'static str, field: &str) -> Error {
        Error::Type(TypeError {
            expected,
            actual: self.kind().to_string(),
            column: Some(field.to_string()),
            rust_type: None,
        })
    }

    /// Borrow the scalar value, if this is one.
    pub fn as_scalar(&self) -> Option<&Value> {
        match self {
            FieldValue::Scalar(v) => Some(v),
            _ => None,
        }
    }

    /// Convert into a typed scalar for `field`.
    #[allow(clippy::result_large_err)]
    pub fn into_scalar<T: FromValue>(self, field: &str) -> Result<T> {
        match self {
            FieldValue::Scalar(v) => T::from_value(&v).map_err(|e| match e {
                Error::Type(mut te) => {
                    te.column = Some(field.to_string());
                    Error::Type(te)
                }
                e => e,
            }),
            other => Err(other.wrong_kind("scalar value", field)),
        }
    }

    /// Convert into a typed to-one reference for `field`.
    #[allow(clippy::result_large_err)]
    pub fn into_reference<E: Entity>(self, field: &str) -> Result<Option<EntityRef<E>>> {
        match self {
            FieldValue::Reference(None) | FieldValue::Scalar(Value::Null) => Ok(None),
            FieldValue::Reference(Some(record)) => downcast_record::<E>(record).map(Some),
            other => Err(other.wrong_kind("entity reference", field)),
        }
    }

    /// Convert into a typed lazy collection for `field`.
    #[allow(clippy::result_large_err)]
    pub fn into_collection<E: Entity>(self, field: &str) -> Result<LazyList<E>> {
        match self {
            FieldValue::Collection(loader) => Ok(LazyList::new(move || {
                loader()?
                    .into_iter()
                    .map(downcast_record::<E>)
                    .collect::<Result<Vec<_>>>()
            })),
            other => Err(other.wrong_kind("collection loader", field)),
        }
    }
}

impl fmt::Debug for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Scalar(v) => f.debug_tuple("Scalar").field(v).finish(),
            FieldValue::Reference(Some(r)) => {
                write!(f, "Reference({})", r.entity_type().name())
            }
            FieldValue::Reference(None) => f.write_str("Reference(None)"),
            FieldValue::Collection(_) => f.write_str("Collection(..)"),
        }
    }
}
