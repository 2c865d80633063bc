//! Entity metadata: field declarations and the resolver that turns them into
//! table/column descriptors.
//!
//! Resolution runs once per entity type; [`MetadataRegistry`] caches the
//! result for every session opened from the same factory.

use crate::Result;
use crate::entity::EntityType;
use crate::error::{Error, RelatedFieldError};
use std::any::TypeId;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Declared shape of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldShape {
    /// Any non-relational value.
    Scalar,
    /// A direct reference to another entity.
    Reference(EntityType),
    /// An ordered collection of another entity. `None` when the element type
    /// could not be determined.
    Collection(Option<EntityType>),
}

/// One declared field of an entity, as produced by `#[derive(Entity)]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldDeclaration {
    pub name: &'static str,
    /// Column name override.
    pub column: Option<&'static str>,
    /// Marks the identifier field.
    pub id: bool,
    pub shape: FieldShape,
    /// For collections: the back-reference field on the element type.
    pub mapped_by: Option<&'static str>,
}

impl FieldDeclaration {
    pub fn scalar(name: &'static str) -> Self {
        Self {
            name,
            column: None,
            id: false,
            shape: FieldShape::Scalar,
            mapped_by: None,
        }
    }

    pub fn reference(name: &'static str, related: EntityType) -> Self {
        Self {
            shape: FieldShape::Reference(related),
            ..Self::scalar(name)
        }
    }

    pub fn collection(name: &'static str, element: Option<EntityType>) -> Self {
        Self {
            shape: FieldShape::Collection(element),
            ..Self::scalar(name)
        }
    }

    #[must_use]
    pub fn id(mut self) -> Self {
        self.id = true;
        self
    }

    #[must_use]
    pub fn column(mut self, column: &'static str) -> Self {
        self.column = Some(column);
        self
    }

    #[must_use]
    pub fn mapped_by(mut self, field: &'static str) -> Self {
        self.mapped_by = Some(field);
        self
    }

    /// Column name: the override, else the field name.
    pub fn column_name(&self) -> &'static str {
        self.column.unwrap_or(self.name)
    }
}

/// How a column participates in persistence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    /// Stored as-is.
    Simple,
    /// Stored as the related entity's identifier in a foreign-key column.
    ToOne { related: EntityType },
    /// Not stored on this table; loaded through `inverse_field` on `related`.
    ToMany {
        related: EntityType,
        inverse_field: &'static str,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnDescriptor {
    pub field: &'static str,
    pub column: &'static str,
    pub kind: ColumnKind,
}

impl ColumnDescriptor {
    /// Simple and to-one columns are written; to-many are not.
    pub fn is_insertable(&self) -> bool {
        !matches!(self.kind, ColumnKind::ToMany { .. })
    }
}

/// Resolved mapping of one entity type.
#[derive(Debug, Clone)]
pub struct EntityMetadata {
    entity: EntityType,
    table: &'static str,
    columns: Vec<ColumnDescriptor>,
    id_index: usize,
}

impl EntityMetadata {
    /// Resolve the mapping of `entity` from its declared fields.
    #[allow(clippy::result_large_err)]
    pub fn resolve(entity: EntityType) -> Result<Self> {
        let owner = entity.name();
        let declared = entity.fields();

        let ids: Vec<usize> = declared
            .iter()
            .enumerate()
            .filter(|(_, f)| f.id)
            .map(|(i, _)| i)
            .collect();
        let id_index = match ids.as_slice() {
            [only] => *only,
            [] => return Err(Error::metadata(owner, "no field is marked as the identifier")),
            many => {
                let names: Vec<&str> = many.iter().map(|&i| declared[i].name).collect();
                return Err(Error::metadata(
                    owner,
                    format!("several identifier fields: {}", names.join(", ")),
                ));
            }
        };
        if declared[id_index].shape != FieldShape::Scalar {
            return Err(Error::metadata(
                owner,
                format!(
                    "identifier field '{}' must be a plain column",
                    declared[id_index].name
                ),
            ));
        }

        let columns = declared
            .iter()
            .map(|field| {
                let kind = match field.shape {
                    FieldShape::Scalar => ColumnKind::Simple,
                    FieldShape::Reference(related) => ColumnKind::ToOne { related },
                    FieldShape::Collection(None) => {
                        return Err(Error::metadata(
                            owner,
                            format!(
                                "cannot determine the element type of collection '{}'",
                                field.name
                            ),
                        ));
                    }
                    FieldShape::Collection(Some(related)) => ColumnKind::ToMany {
                        related,
                        inverse_field: resolve_inverse_field(entity, field, related)?,
                    },
                };
                Ok(ColumnDescriptor {
                    field: field.name,
                    column: field.column_name(),
                    kind,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let table = entity.table_name().unwrap_or(owner);
        tracing::debug!(
            entity = owner,
            table = table,
            columns = columns.len(),
            "Resolved entity metadata"
        );

        Ok(Self {
            entity,
            table,
            columns,
            id_index,
        })
    }

    pub fn entity_type(&self) -> EntityType {
        self.entity
    }

    pub fn name(&self) -> &'static str {
        self.entity.name()
    }

    pub fn table_name(&self) -> &'static str {
        self.table
    }

    /// All columns in declaration order.
    pub fn columns(&self) -> &[ColumnDescriptor] {
        &self.columns
    }

    pub fn identifier(&self) -> &ColumnDescriptor {
        &self.columns[self.id_index]
    }

    /// Simple and to-one columns in declaration order, identifier included.
    pub fn insertable(&self) -> impl Iterator<Item = &ColumnDescriptor> {
        self.columns.iter().filter(|c| c.is_insertable())
    }

    /// Insertable columns without the identifier.
    pub fn updatable(&self) -> impl Iterator<Item = &ColumnDescriptor> {
        let id = self.identifier().field;
        self.insertable().filter(move |c| c.field != id)
    }

    /// Look up a column by its field name.
    #[allow(clippy::result_large_err)]
    pub fn field(&self, name: &str) -> Result<&ColumnDescriptor> {
        self.columns
            .iter()
            .find(|c| c.field == name)
            .ok_or_else(|| Error::unknown_field(self.name(), name))
    }
}

/// Find the field on `related` that refers back to `owner`.
#[allow(clippy::result_large_err)]
fn resolve_inverse_field(
    owner: EntityType,
    field: &FieldDeclaration,
    related: EntityType,
) -> Result<&'static str> {
    let back_refs_owner = |f: &FieldDeclaration| f.shape == FieldShape::Reference(owner);
    let candidates = related.fields();
    let found = match field.mapped_by {
        Some(name) => candidates
            .iter()
            .find(|f| f.name == name && back_refs_owner(f)),
        None => candidates.iter().find(|f| back_refs_owner(f)),
    };
    found.map(|f| f.name).ok_or_else(|| {
        Error::RelatedFieldNotFound(RelatedFieldError {
            owner: owner.name(),
            field: field.name,
            related: related.name(),
            mapped_by: field.mapped_by,
        })
    })
}

/// Cache of resolved metadata, shared by all sessions of a factory.
#[derive(Debug, Default)]
pub struct MetadataRegistry {
    cache: RwLock<HashMap<TypeId, Arc<EntityMetadata>>>,
}

impl MetadataRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolved metadata for `entity`, resolving on first use.
    #[allow(clippy::result_large_err)]
    pub fn get(&self, entity: EntityType) -> Result<Arc<EntityMetadata>> {
        {
            let cache = self.cache.read().map_err(|_| poisoned())?;
            if let Some(found) = cache.get(&entity.type_id()) {
                return Ok(Arc::clone(found));
            }
        }

        let resolved = Arc::new(EntityMetadata::resolve(entity)?);
        let mut cache = self.cache.write().map_err(|_| poisoned())?;
        Ok(Arc::clone(
            cache.entry(entity.type_id()).or_insert(resolved),
        ))
    }

    /// Number of resolved entity types.
    pub fn len(&self) -> usize {
        self.cache.read().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned() -> Error {
    Error::Custom("metadata registry lock poisoned".to_string())
}
