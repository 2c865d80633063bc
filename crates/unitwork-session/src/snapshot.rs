//! Column values read off a record, for binding and dirty checking.

use std::rc::Rc;
use unitwork_core::{
    ColumnDescriptor, ColumnKind, EntityMetadata, Error, FieldValue, ManagedRecord,
    MetadataRegistry, Result, Value,
};

/// Identifiers of records a session already tracks, looked up by instance.
///
/// A tracked record's identifier is known without borrowing the record, so
/// references to it resolve even while the caller holds it mutably.
pub(crate) trait TrackedIds {
    fn tracked_id(&self, record: &Rc<dyn ManagedRecord>) -> Option<Value>;
}

/// Identifier value of `record`, in canonical form.
#[allow(clippy::result_large_err)]
pub(crate) fn identifier_of(record: &dyn ManagedRecord, metadata: &EntityMetadata) -> Result<Value> {
    let id = metadata.identifier();
    scalar_field(record, metadata.name(), id.field).map(Value::canonical)
}

#[allow(clippy::result_large_err)]
fn scalar_field(record: &dyn ManagedRecord, entity: &'static str, field: &str) -> Result<Value> {
    match record.read_field(field)? {
        FieldValue::Scalar(value) => Ok(value),
        other => Err(Error::Custom(format!(
            "{entity}.{field} is mapped as a column but produced {other:?}"
        ))),
    }
}

/// Value stored in `column` for `record`.
///
/// Simple columns yield the field value; to-one columns yield the related
/// record's identifier, or `Null` when the reference is absent. A tracked
/// target contributes the identifier it is tracked under.
#[allow(clippy::result_large_err)]
pub(crate) fn column_value(
    record: &dyn ManagedRecord,
    metadata: &EntityMetadata,
    column: &ColumnDescriptor,
    registry: &MetadataRegistry,
    tracked: &dyn TrackedIds,
) -> Result<Value> {
    match column.kind {
        ColumnKind::Simple => scalar_field(record, metadata.name(), column.field),
        ColumnKind::ToOne { related } => match record.read_field(column.field)? {
            FieldValue::Reference(Some(target)) => match tracked.tracked_id(&target) {
                Some(id) => Ok(id),
                None => identifier_of(target.as_ref(), &*registry.get(related)?),
            },
            FieldValue::Reference(None) | FieldValue::Scalar(Value::Null) => Ok(Value::Null),
            other => Err(Error::Custom(format!(
                "{}.{} is mapped as a reference but produced {other:?}",
                metadata.name(),
                column.field
            ))),
        },
        ColumnKind::ToMany { .. } => Err(Error::Custom(format!(
            "{}.{} is a collection and has no column value",
            metadata.name(),
            column.field
        ))),
    }
}

/// Insertable column values of a record at one point in time.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct EntitySnapshot {
    values: Vec<Value>,
}

impl EntitySnapshot {
    #[allow(clippy::result_large_err)]
    pub(crate) fn capture(
        record: &dyn ManagedRecord,
        metadata: &EntityMetadata,
        registry: &MetadataRegistry,
        tracked: &dyn TrackedIds,
    ) -> Result<Self> {
        let values = metadata
            .insertable()
            .map(|column| {
                column_value(record, metadata, column, registry, tracked).map(Value::canonical)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { values })
    }

    #[cfg(test)]
    pub(crate) fn values(&self) -> &[Value] {
        &self.values
    }
}
