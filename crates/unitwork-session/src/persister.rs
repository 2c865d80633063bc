//! SQL generation, statement execution and hydration.
//!
//! The persister turns metadata into the four statement shapes the runtime
//! needs and turns result rows back into managed records. Every record it
//! produces passes through the session's [`PersistenceContext`], so a key
//! already tracked always resolves to the tracked instance.

use crate::context::PersistenceContext;
use crate::key::EntityKey;
use crate::snapshot::column_value;
use std::cell::{Cell, Ref, RefCell, RefMut};
use std::rc::{Rc, Weak};
use std::sync::Arc;
use unitwork_core::error::{CardinalityError, MetadataError};
use unitwork_core::{
    ColumnDescriptor, ColumnKind, DataSource, EntityMetadata, EntityType, Error, FieldValue,
    ManagedRecord, MetadataRegistry, Result, Row, Value, with_connection,
};

/// State shared by a session and everything that outlives a single call
/// into it (lazy collection loaders).
pub(crate) struct SessionState {
    context: RefCell<PersistenceContext>,
    open: Cell<bool>,
}

impl SessionState {
    pub(crate) fn new(registry: Arc<MetadataRegistry>) -> Self {
        Self {
            context: RefCell::new(PersistenceContext::new(registry)),
            open: Cell::new(true),
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.open.get()
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.open.get() {
            Ok(())
        } else {
            Err(Error::SessionClosed)
        }
    }

    pub(crate) fn mark_closed(&self) {
        self.open.set(false);
    }

    #[allow(clippy::result_large_err)]
    pub(crate) fn context(&self) -> Result<Ref<'_, PersistenceContext>> {
        self.context.try_borrow().map_err(|_| context_busy())
    }

    #[allow(clippy::result_large_err)]
    pub(crate) fn context_mut(&self) -> Result<RefMut<'_, PersistenceContext>> {
        self.context.try_borrow_mut().map_err(|_| context_busy())
    }
}

fn context_busy() -> Error {
    Error::Custom("persistence context is already in use".to_string())
}

/// Builds and runs statements for managed records.
#[derive(Clone)]
pub struct EntityPersister {
    data_source: Arc<dyn DataSource>,
    registry: Arc<MetadataRegistry>,
    state: Rc<SessionState>,
    max_fetch_depth: usize,
}

/// Handle kept by lazy loaders; does not keep the session alive.
#[derive(Clone)]
struct WeakPersister {
    data_source: Arc<dyn DataSource>,
    registry: Arc<MetadataRegistry>,
    state: Weak<SessionState>,
    max_fetch_depth: usize,
}

impl WeakPersister {
    #[allow(clippy::result_large_err)]
    fn upgrade(&self) -> Result<EntityPersister> {
        let state = self.state.upgrade().ok_or(Error::SessionClosed)?;
        state.ensure_open()?;
        Ok(EntityPersister {
            data_source: Arc::clone(&self.data_source),
            registry: Arc::clone(&self.registry),
            state,
            max_fetch_depth: self.max_fetch_depth,
        })
    }
}

impl EntityPersister {
    pub(crate) fn new(
        data_source: Arc<dyn DataSource>,
        registry: Arc<MetadataRegistry>,
        state: Rc<SessionState>,
        max_fetch_depth: usize,
    ) -> Self {
        Self {
            data_source,
            registry,
            state,
            max_fetch_depth,
        }
    }

    fn downgrade(&self) -> WeakPersister {
        WeakPersister {
            data_source: Arc::clone(&self.data_source),
            registry: Arc::clone(&self.registry),
            state: Rc::downgrade(&self.state),
            max_fetch_depth: self.max_fetch_depth,
        }
    }

    #[allow(clippy::result_large_err)]
    fn metadata(&self, entity: EntityType) -> Result<Arc<EntityMetadata>> {
        self.registry.get(entity)
    }

    #[allow(clippy::result_large_err)]
    fn bind_columns<'a>(
        &self,
        record: &dyn ManagedRecord,
        metadata: &EntityMetadata,
        columns: impl Iterator<Item = &'a ColumnDescriptor>,
    ) -> Result<(Vec<&'static str>, Vec<Value>)> {
        let context = self.state.context()?;
        let mut names = Vec::new();
        let mut params = Vec::new();
        for column in columns {
            names.push(column.column);
            params.push(column_value(record, metadata, column, &self.registry, &*context)?);
        }
        Ok((names, params))
    }

    #[allow(clippy::result_large_err)]
    fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        tracing::debug!(sql = %sql, params = params.len(), "Executing statement");
        let affected = with_connection(self.data_source.as_ref(), |conn| conn.execute(sql, params))?;
        tracing::trace!(rows = affected, "Statement complete");
        Ok(affected)
    }

    /// `INSERT INTO <table>(<cols>) VALUES(?,...)` over the insertable columns.
    #[allow(clippy::result_large_err)]
    pub fn insert(&self, record: &dyn ManagedRecord) -> Result<u64> {
        let metadata = self.metadata(record.entity_type())?;
        let (columns, params) = self.bind_columns(record, &metadata, metadata.insertable())?;
        let sql = insert_sql(metadata.table_name(), &columns);
        self.execute(&sql, &params)
    }

    /// `UPDATE <table> SET c1=?,... WHERE <id> = ?` over the updatable columns.
    ///
    /// The row is addressed by the managed key. An entity with no updatable
    /// columns issues no statement.
    #[allow(clippy::result_large_err)]
    pub fn update(&self, key: &EntityKey, record: &dyn ManagedRecord) -> Result<u64> {
        let metadata = self.metadata(key.entity_type())?;
        let (columns, mut params) = self.bind_columns(record, &metadata, metadata.updatable())?;
        if columns.is_empty() {
            tracing::debug!(entity = metadata.name(), "No updatable columns; skipping update");
            return Ok(0);
        }
        params.push(key.id().clone());
        let sql = update_sql(metadata.table_name(), &columns, metadata.identifier().column);
        self.execute(&sql, &params)
    }

    /// `DELETE FROM <table> WHERE <id> = ?`.
    #[allow(clippy::result_large_err)]
    pub fn delete(&self, key: &EntityKey) -> Result<u64> {
        let metadata = self.metadata(key.entity_type())?;
        let sql = delete_sql(metadata.table_name(), metadata.identifier().column);
        self.execute(&sql, &[key.id().clone()])
    }

    /// Tracked instance for `(entity, id)`, loading it on a cache miss.
    #[allow(clippy::result_large_err)]
    pub fn find_by_id(&self, entity: EntityType, id: Value) -> Result<Rc<dyn ManagedRecord>> {
        self.find_by_id_at(entity, id, 0)
    }

    #[allow(clippy::result_large_err)]
    fn find_by_id_at(
        &self,
        entity: EntityType,
        id: Value,
        depth: usize,
    ) -> Result<Rc<dyn ManagedRecord>> {
        let key = EntityKey::new(entity, id);
        if let Some(found) = self.state.context()?.get(&key) {
            tracing::trace!(key = ?key, "Identity cache hit");
            return Ok(found);
        }
        if depth > self.max_fetch_depth {
            return Err(Error::FetchDepthExceeded {
                entity: entity.name(),
                depth,
            });
        }
        let metadata = self.metadata(entity)?;
        let rows = self.select(&metadata, metadata.identifier(), key.id())?;
        let row = exactly_one(&metadata, metadata.identifier(), key.id(), rows)?;
        self.hydrate(&metadata, &row, depth)
    }

    /// Every record whose `field` equals `value`. No match is an empty list.
    #[allow(clippy::result_large_err)]
    pub fn find_all_by(
        &self,
        entity: EntityType,
        field: &str,
        value: Value,
    ) -> Result<Vec<Rc<dyn ManagedRecord>>> {
        let metadata = self.metadata(entity)?;
        let column = queryable(&metadata, field)?;
        self.select(&metadata, column, &value)?
            .iter()
            .map(|row| self.hydrate(&metadata, row, 0))
            .collect()
    }

    /// The single record whose `field` equals `value`.
    ///
    /// Zero or several matching rows is a [`Error::Cardinality`].
    #[allow(clippy::result_large_err)]
    pub fn find_one_by(
        &self,
        entity: EntityType,
        field: &str,
        value: Value,
    ) -> Result<Rc<dyn ManagedRecord>> {
        let metadata = self.metadata(entity)?;
        let column = queryable(&metadata, field)?;
        let rows = self.select(&metadata, column, &value)?;
        let row = exactly_one(&metadata, column, &value, rows)?;
        self.hydrate(&metadata, &row, 0)
    }

    #[allow(clippy::result_large_err)]
    fn select(
        &self,
        metadata: &EntityMetadata,
        column: &ColumnDescriptor,
        value: &Value,
    ) -> Result<Vec<Row>> {
        let sql = select_sql(metadata.table_name(), column.column);
        tracing::debug!(sql = %sql, entity = metadata.name(), "Executing query");
        let params = [value.clone()];
        let rows = with_connection(self.data_source.as_ref(), |conn| conn.query(&sql, &params))?;
        tracing::trace!(rows = rows.len(), "Query complete");
        Ok(rows)
    }

    /// Build a record from `row`, or return the tracked instance with the
    /// same key.
    #[allow(clippy::result_large_err)]
    fn hydrate(
        &self,
        metadata: &EntityMetadata,
        row: &Row,
        depth: usize,
    ) -> Result<Rc<dyn ManagedRecord>> {
        let id_column = metadata.identifier();
        let id = row.require(id_column.column)?.clone().canonical();
        let key = EntityKey::new(metadata.entity_type(), id.clone());
        if let Some(found) = self.state.context()?.get(&key) {
            tracing::trace!(key = ?key, "Row resolves to a managed record");
            return Ok(found);
        }

        let record = metadata.entity_type().instantiate();
        for column in metadata.columns() {
            let value = match column.kind {
                ColumnKind::Simple => FieldValue::Scalar(row.require(column.column)?.clone()),
                ColumnKind::ToOne { related } => {
                    let fk = row.require(column.column)?;
                    if fk.is_null() {
                        FieldValue::Reference(None)
                    } else {
                        let target = self.find_by_id_at(related, fk.clone(), depth + 1)?;
                        FieldValue::Reference(Some(target))
                    }
                }
                ColumnKind::ToMany {
                    related,
                    inverse_field,
                } => self.collection_loader(related, inverse_field, id.clone()),
            };
            record.write_field(column.field, value)?;
        }

        tracing::trace!(key = ?key, "Hydrated record");
        self.state.context_mut()?.manage(record)
    }

    fn collection_loader(
        &self,
        related: EntityType,
        inverse_field: &'static str,
        owner_id: Value,
    ) -> FieldValue {
        let handle = self.downgrade();
        FieldValue::Collection(Box::new(move || {
            let persister = handle.upgrade()?;
            persister.find_all_by(related, inverse_field, owner_id.clone())
        }))
    }
}

impl std::fmt::Debug for EntityPersister {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityPersister")
            .field("max_fetch_depth", &self.max_fetch_depth)
            .field("open", &self.state.is_open())
            .finish_non_exhaustive()
    }
}

/// Column for `field`, which must be stored on the entity's own table.
#[allow(clippy::result_large_err)]
fn queryable<'m>(metadata: &'m EntityMetadata, field: &str) -> Result<&'m ColumnDescriptor> {
    let column = metadata.field(field)?;
    if column.is_insertable() {
        Ok(column)
    } else {
        Err(Error::Metadata(MetadataError {
            entity: metadata.name(),
            message: format!("'{field}' is a collection and cannot be queried by value"),
        }))
    }
}

#[allow(clippy::result_large_err)]
fn exactly_one(
    metadata: &EntityMetadata,
    column: &ColumnDescriptor,
    value: &Value,
    mut rows: Vec<Row>,
) -> Result<Row> {
    let found = rows.len();
    match (found, rows.pop()) {
        (1, Some(row)) => Ok(row),
        _ => Err(Error::Cardinality(CardinalityError {
            entity: metadata.name(),
            column: column.column.to_string(),
            value: value.clone(),
            found,
        })),
    }
}

fn insert_sql(table: &str, columns: &[&str]) -> String {
    let placeholders = vec!["?"; columns.len()].join(",");
    format!(
        "INSERT INTO {table}({}) VALUES({placeholders})",
        columns.join(",")
    )
}

fn update_sql(table: &str, columns: &[&str], id_column: &str) -> String {
    let assignments: Vec<String> = columns.iter().map(|c| format!("{c}=?")).collect();
    format!(
        "UPDATE {table} SET {} WHERE {id_column} = ?",
        assignments.join(",")
    )
}

fn delete_sql(table: &str, id_column: &str) -> String {
    format!("DELETE FROM {table} WHERE {id_column} = ?")
}

fn select_sql(table: &str, column: &str) -> String {
    format!("SELECT * FROM {table} WHERE {column} = ?")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Chain, MockDataSource, Note, Person, chain_row, note_row, person_row};
    use unitwork_core::{downcast_record, entity_ref, erase};

    fn persister(source: &MockDataSource) -> EntityPersister {
        persister_with_depth(source, 16)
    }

    fn persister_with_depth(source: &MockDataSource, depth: usize) -> EntityPersister {
        let registry = Arc::new(MetadataRegistry::new());
        EntityPersister::new(
            Arc::new(source.clone()),
            Arc::clone(&registry),
            Rc::new(SessionState::new(registry)),
            depth,
        )
    }

    #[test]
    fn statement_shapes() {
        assert_eq!(
            insert_sql("persons", &["id", "first_name", "last_name"]),
            "INSERT INTO persons(id,first_name,last_name) VALUES(?,?,?)"
        );
        assert_eq!(
            update_sql("persons", &["first_name", "last_name"], "id"),
            "UPDATE persons SET first_name=?,last_name=? WHERE id = ?"
        );
        assert_eq!(delete_sql("persons", "id"), "DELETE FROM persons WHERE id = ?");
        assert_eq!(
            select_sql("notes", "person_id"),
            "SELECT * FROM notes WHERE person_id = ?"
        );
    }

    #[test]
    fn insert_binds_in_column_order() {
        let source = MockDataSource::new();
        let p = persister(&source);
        let josh = entity_ref(Person {
            id: 6,
            first_name: "Josh".into(),
            last_name: "Long".into(),
            ..Person::default()
        });
        p.insert(erase(&josh).as_ref()).unwrap();

        let executed = source.executed();
        assert_eq!(
            executed,
            vec![(
                "INSERT INTO persons(id,first_name,last_name) VALUES(?,?,?)".to_string(),
                vec![
                    Value::BigInt(6),
                    Value::Text("Josh".into()),
                    Value::Text("Long".into())
                ]
            )]
        );
    }

    #[test]
    fn insert_writes_reference_as_foreign_key() {
        let source = MockDataSource::new();
        let p = persister(&source);
        let owner = entity_ref(Person {
            id: 2,
            ..Person::default()
        });
        let note = entity_ref(Note {
            id: 11,
            body: "hello".into(),
            person: Some(owner),
        });
        p.insert(erase(&note).as_ref()).unwrap();
        let executed = source.executed();
        assert_eq!(executed[0].0, "INSERT INTO notes(id,body,person_id) VALUES(?,?,?)");
        assert_eq!(executed[0].1[2], Value::BigInt(2));
    }

    #[test]
    fn update_and_delete_bind_identifier_last() {
        let source = MockDataSource::new();
        let p = persister(&source);
        let ada = entity_ref(Person {
            id: 1,
            first_name: "Ada".into(),
            last_name: "King".into(),
            ..Person::default()
        });
        let key = EntityKey::of::<Person>(1_i64);
        p.update(&key, erase(&ada).as_ref()).unwrap();
        p.delete(&key).unwrap();

        let executed = source.executed();
        assert_eq!(
            executed[0],
            (
                "UPDATE persons SET first_name=?,last_name=? WHERE id = ?".to_string(),
                vec![
                    Value::Text("Ada".into()),
                    Value::Text("King".into()),
                    Value::BigInt(1)
                ]
            )
        );
        assert_eq!(
            executed[1],
            (
                "DELETE FROM persons WHERE id = ?".to_string(),
                vec![Value::BigInt(1)]
            )
        );
    }

    #[test]
    fn update_addresses_row_by_managed_key() {
        let source = MockDataSource::new();
        let p = persister(&source);
        let grace = entity_ref(Person {
            id: 20,
            first_name: "Grace".into(),
            last_name: "Hopper".into(),
            ..Person::default()
        });
        p.update(&EntityKey::of::<Person>(2_i64), erase(&grace).as_ref())
            .unwrap();
        assert_eq!(source.executed()[0].1.last(), Some(&Value::BigInt(2)));
    }

    #[test]
    fn find_by_id_hydrates_and_caches() {
        let source = MockDataSource::new();
        source.insert_rows("persons", vec![person_row(1, "Ada", "Lovelace")]);
        let p = persister(&source);

        let first = p.find_by_id(EntityType::of::<Person>(), Value::Int(1)).unwrap();
        let second = p.find_by_id(EntityType::of::<Person>(), Value::BigInt(1)).unwrap();
        assert!(Rc::ptr_eq(&first, &second));
        assert_eq!(source.query_calls(), 1);
        assert_eq!(
            source.last_query(),
            Some(("SELECT * FROM persons WHERE id = ?".to_string(), vec![Value::BigInt(1)]))
        );

        let ada = downcast_record::<Person>(first).unwrap();
        assert_eq!(ada.borrow().first_name, "Ada");
        assert_eq!(ada.borrow().last_name, "Lovelace");
        assert!(!ada.borrow().notes.is_loaded());
    }

    #[test]
    fn cardinality_is_enforced() {
        let source = MockDataSource::new();
        let p = persister(&source);
        match p.find_by_id(EntityType::of::<Person>(), Value::BigInt(9)) {
            Err(Error::Cardinality(e)) => {
                assert_eq!(e.found, 0);
                assert_eq!(e.column, "id");
            }
            other => panic!("expected cardinality error, got {other:?}"),
        }

        source.insert_rows(
            "persons",
            vec![person_row(1, "Ada", "King"), person_row(2, "Ada", "Lovelace")],
        );
        match p.find_one_by(EntityType::of::<Person>(), "first_name", Value::from("Ada")) {
            Err(Error::Cardinality(e)) => assert_eq!(e.found, 2),
            other => panic!("expected cardinality error, got {other:?}"),
        }
    }

    #[test]
    fn find_all_by_empty_is_ok() {
        let source = MockDataSource::new();
        let p = persister(&source);
        let found = p
            .find_all_by(EntityType::of::<Person>(), "last_name", Value::from("Nobody"))
            .unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn querying_by_collection_field_fails() {
        let source = MockDataSource::new();
        let p = persister(&source);
        assert!(matches!(
            p.find_all_by(EntityType::of::<Person>(), "notes", Value::Null),
            Err(Error::Metadata(_))
        ));
        assert!(matches!(
            p.find_all_by(EntityType::of::<Person>(), "nickname", Value::Null),
            Err(Error::Metadata(_))
        ));
        assert_eq!(source.query_calls(), 0);
    }

    #[test]
    fn to_one_is_loaded_eagerly() {
        let source = MockDataSource::new();
        source.insert_rows("notes", vec![note_row(5, "first", Some(1))]);
        source.insert_rows("persons", vec![person_row(1, "Ada", "Lovelace")]);
        let p = persister(&source);

        let note = downcast_record::<Note>(
            p.find_by_id(EntityType::of::<Note>(), Value::BigInt(5)).unwrap(),
        )
        .unwrap();
        assert_eq!(source.query_calls(), 2);
        let owner = note.borrow().person.clone().unwrap();
        assert_eq!(owner.borrow().first_name, "Ada");

        let cached = p.find_by_id(EntityType::of::<Person>(), Value::BigInt(1)).unwrap();
        assert!(Rc::ptr_eq(&cached, &erase(&owner)));
        assert_eq!(source.query_calls(), 2);
    }

    #[test]
    fn null_foreign_key_is_absent() {
        let source = MockDataSource::new();
        source.insert_rows("notes", vec![note_row(5, "loose", None)]);
        let p = persister(&source);
        let note = downcast_record::<Note>(
            p.find_by_id(EntityType::of::<Note>(), Value::BigInt(5)).unwrap(),
        )
        .unwrap();
        assert!(note.borrow().person.is_none());
        assert_eq!(source.query_calls(), 1);
    }

    #[test]
    fn to_many_loads_once_on_access() {
        let source = MockDataSource::new();
        source.insert_rows("persons", vec![person_row(1, "Ada", "Lovelace")]);
        source.insert_rows(
            "notes",
            vec![note_row(10, "a", Some(1)), note_row(11, "b", Some(1))],
        );
        let p = persister(&source);
        let ada = downcast_record::<Person>(
            p.find_by_id(EntityType::of::<Person>(), Value::BigInt(1)).unwrap(),
        )
        .unwrap();
        assert_eq!(source.query_calls(), 1);

        let notes = ada.borrow().notes.to_vec().unwrap();
        assert_eq!(notes.len(), 2);
        assert_eq!(ada.borrow().notes.len().unwrap(), 2);
        assert_eq!(source.query_calls(), 2);
        assert_eq!(
            source.last_query(),
            Some((
                "SELECT * FROM notes WHERE person_id = ?".to_string(),
                vec![Value::BigInt(1)]
            ))
        );

        // The back-reference resolves to the already-managed owner.
        let back = notes[0].borrow().person.clone().unwrap();
        assert!(Rc::ptr_eq(&back, &ada));
    }

    #[test]
    fn lazy_load_after_session_state_is_gone() {
        let source = MockDataSource::new();
        source.insert_rows("persons", vec![person_row(1, "Ada", "Lovelace")]);
        let ada = {
            let p = persister(&source);
            downcast_record::<Person>(
                p.find_by_id(EntityType::of::<Person>(), Value::BigInt(1)).unwrap(),
            )
            .unwrap()
        };
        assert!(matches!(ada.borrow().notes.len(), Err(Error::SessionClosed)));
    }

    #[test]
    fn fetch_depth_is_bounded() {
        let source = MockDataSource::new();
        source.insert_rows(
            "chain",
            (1..=10)
                .map(|n| chain_row(n, (n < 10).then_some(n + 1)))
                .collect(),
        );
        let p = persister_with_depth(&source, 3);
        match p.find_by_id(EntityType::of::<Chain>(), Value::BigInt(1)) {
            Err(Error::FetchDepthExceeded { entity, depth }) => {
                assert_eq!(entity, "Chain");
                assert_eq!(depth, 4);
            }
            other => panic!("expected fetch depth error, got {other:?}"),
        }

        let deep = persister_with_depth(&source, 16);
        let head = deep.find_by_id(EntityType::of::<Chain>(), Value::BigInt(1)).unwrap();
        let head = downcast_record::<Chain>(head).unwrap();
        assert!(head.borrow().next.is_some());
    }

    #[test]
    fn backend_errors_propagate() {
        let source = MockDataSource::new();
        source.fail_next("backend unavailable");
        let p = persister(&source);
        let err = p
            .find_by_id(EntityType::of::<Person>(), Value::BigInt(1))
            .unwrap_err();
        assert!(err.is_backend());
    }
}
