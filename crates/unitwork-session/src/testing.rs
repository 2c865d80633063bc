//! Hand-mapped entities and a recording backend for unit tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use unitwork_core::error::{ConnectionError, ConnectionErrorKind};
use unitwork_core::{
    Connection, DataSource, Entity, EntityRef, EntityType, Error, FieldDeclaration, FieldValue,
    LazyList, Result, Row, Value,
};

#[derive(Debug, Default)]
pub(crate) struct Person {
    pub id: i64,
    pub first_name: String,
    pub last_name: String,
    pub notes: LazyList<Note>,
}

impl Entity for Person {
    const NAME: &'static str = "Person";
    const TABLE_NAME: Option<&'static str> = Some("persons");

    fn fields() -> Vec<FieldDeclaration> {
        vec![
            FieldDeclaration::scalar("id").id(),
            FieldDeclaration::scalar("first_name"),
            FieldDeclaration::scalar("last_name"),
            FieldDeclaration::collection("notes", Some(EntityType::of::<Note>())),
        ]
    }

    fn read_field(&self, field: &str) -> Result<FieldValue> {
        match field {
            "id" => Ok(FieldValue::scalar(self.id)),
            "first_name" => Ok(FieldValue::scalar(self.first_name.clone())),
            "last_name" => Ok(FieldValue::scalar(self.last_name.clone())),
            other => Err(Error::unknown_field(Self::NAME, other)),
        }
    }

    fn write_field(&mut self, field: &str, value: FieldValue) -> Result<()> {
        match field {
            "id" => self.id = value.into_scalar(field)?,
            "first_name" => self.first_name = value.into_scalar(field)?,
            "last_name" => self.last_name = value.into_scalar(field)?,
            "notes" => self.notes = value.into_collection(field)?,
            other => return Err(Error::unknown_field(Self::NAME, other)),
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub(crate) struct Note {
    pub id: i64,
    pub body: String,
    pub person: Option<EntityRef<Person>>,
}

impl Entity for Note {
    const NAME: &'static str = "Note";
    const TABLE_NAME: Option<&'static str> = Some("notes");

    fn fields() -> Vec<FieldDeclaration> {
        vec![
            FieldDeclaration::scalar("id").id(),
            FieldDeclaration::scalar("body"),
            FieldDeclaration::reference("person", EntityType::of::<Person>()).column("person_id"),
        ]
    }

    fn read_field(&self, field: &str) -> Result<FieldValue> {
        match field {
            "id" => Ok(FieldValue::scalar(self.id)),
            "body" => Ok(FieldValue::scalar(self.body.clone())),
            "person" => Ok(FieldValue::reference(self.person.as_ref())),
            other => Err(Error::unknown_field(Self::NAME, other)),
        }
    }

    fn write_field(&mut self, field: &str, value: FieldValue) -> Result<()> {
        match field {
            "id" => self.id = value.into_scalar(field)?,
            "body" => self.body = value.into_scalar(field)?,
            "person" => self.person = value.into_reference(field)?,
            other => return Err(Error::unknown_field(Self::NAME, other)),
        }
        Ok(())
    }
}

/// Self-referencing entity for fetch depth tests.
#[derive(Debug, Default)]
pub(crate) struct Chain {
    pub id: i64,
    pub next: Option<EntityRef<Chain>>,
}

impl Entity for Chain {
    const NAME: &'static str = "Chain";
    const TABLE_NAME: Option<&'static str> = Some("chain");

    fn fields() -> Vec<FieldDeclaration> {
        vec![
            FieldDeclaration::scalar("id").id(),
            FieldDeclaration::reference("next", EntityType::of::<Chain>()).column("next_id"),
        ]
    }

    fn read_field(&self, field: &str) -> Result<FieldValue> {
        match field {
            "id" => Ok(FieldValue::scalar(self.id)),
            "next" => Ok(FieldValue::reference(self.next.as_ref())),
            other => Err(Error::unknown_field(Self::NAME, other)),
        }
    }

    fn write_field(&mut self, field: &str, value: FieldValue) -> Result<()> {
        match field {
            "id" => self.id = value.into_scalar(field)?,
            "next" => self.next = value.into_reference(field)?,
            other => return Err(Error::unknown_field(Self::NAME, other)),
        }
        Ok(())
    }
}

/// Entity with no declared identifier.
#[derive(Debug, Default)]
pub(crate) struct Anonymous {
    pub name: String,
}

impl Entity for Anonymous {
    const NAME: &'static str = "Anonymous";

    fn fields() -> Vec<FieldDeclaration> {
        vec![FieldDeclaration::scalar("name")]
    }

    fn read_field(&self, field: &str) -> Result<FieldValue> {
        match field {
            "name" => Ok(FieldValue::scalar(self.name.clone())),
            other => Err(Error::unknown_field(Self::NAME, other)),
        }
    }

    fn write_field(&mut self, field: &str, value: FieldValue) -> Result<()> {
        match field {
            "name" => self.name = value.into_scalar(field)?,
            other => return Err(Error::unknown_field(Self::NAME, other)),
        }
        Ok(())
    }
}

fn int(id: i64) -> Value {
    // Backends narrow small integers; exercise key canonicalisation.
    i32::try_from(id).map_or(Value::BigInt(id), Value::Int)
}

pub(crate) fn person_row(id: i64, first: &str, last: &str) -> Row {
    Row::new(
        vec!["id".into(), "first_name".into(), "last_name".into()],
        vec![int(id), Value::from(first), Value::from(last)],
    )
}

pub(crate) fn note_row(id: i64, body: &str, person_id: Option<i64>) -> Row {
    Row::new(
        vec!["id".into(), "body".into(), "person_id".into()],
        vec![int(id), Value::from(body), person_id.map_or(Value::Null, int)],
    )
}

pub(crate) fn chain_row(id: i64, next: Option<i64>) -> Row {
    Row::new(
        vec!["id".into(), "next_id".into()],
        vec![int(id), next.map_or(Value::Null, int)],
    )
}

#[derive(Debug, Default)]
struct MockState {
    tables: HashMap<String, Vec<Row>>,
    connections: usize,
    query_calls: usize,
    last_query: Option<(String, Vec<Value>)>,
    execute_calls: usize,
    executed: Vec<(String, Vec<Value>)>,
    fail_next: Option<String>,
}

impl MockState {
    fn take_failure(&mut self) -> Result<()> {
        match self.fail_next.take() {
            Some(message) => Err(Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::Unavailable,
                message,
                source: None,
            })),
            None => Ok(()),
        }
    }
}

/// In-memory backend answering `SELECT * FROM t WHERE c = ?` from seeded
/// rows and recording every statement it is given.
#[derive(Debug, Clone, Default)]
pub(crate) struct MockDataSource {
    state: Arc<Mutex<MockState>>,
}

impl MockDataSource {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert_rows(&self, table: &str, rows: Vec<Row>) {
        let mut guard = self.state.lock().expect("lock poisoned");
        guard.tables.entry(table.to_string()).or_default().extend(rows);
    }

    /// Fail the next statement with a connection error.
    pub(crate) fn fail_next(&self, message: &str) {
        self.state.lock().expect("lock poisoned").fail_next = Some(message.to_string());
    }

    pub(crate) fn query_calls(&self) -> usize {
        self.state.lock().expect("lock poisoned").query_calls
    }

    pub(crate) fn execute_calls(&self) -> usize {
        self.state.lock().expect("lock poisoned").execute_calls
    }

    pub(crate) fn connections(&self) -> usize {
        self.state.lock().expect("lock poisoned").connections
    }

    pub(crate) fn last_query(&self) -> Option<(String, Vec<Value>)> {
        self.state.lock().expect("lock poisoned").last_query.clone()
    }

    pub(crate) fn executed(&self) -> Vec<(String, Vec<Value>)> {
        self.state.lock().expect("lock poisoned").executed.clone()
    }

    pub(crate) fn executed_sql(&self) -> Vec<String> {
        self.executed().into_iter().map(|(sql, _)| sql).collect()
    }
}

impl DataSource for MockDataSource {
    fn connection(&self) -> Result<Box<dyn Connection + '_>> {
        self.state.lock().expect("lock poisoned").connections += 1;
        Ok(Box::new(MockConnection {
            state: Arc::clone(&self.state),
        }))
    }
}

struct MockConnection {
    state: Arc<Mutex<MockState>>,
}

/// Split `SELECT * FROM <table> WHERE <column> = ?`.
fn parse_select(sql: &str) -> Option<(&str, &str)> {
    let rest = sql.strip_prefix("SELECT * FROM ")?;
    let (table, rest) = rest.split_once(" WHERE ")?;
    let column = rest.strip_suffix(" = ?")?;
    Some((table, column))
}

impl Connection for MockConnection {
    fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let mut guard = self.state.lock().expect("lock poisoned");
        guard.query_calls += 1;
        guard.last_query = Some((sql.to_string(), params.to_vec()));
        guard.take_failure()?;

        let (table, column) = parse_select(sql).expect("unexpected query shape");
        let wanted = params.first().cloned().unwrap_or(Value::Null).canonical();
        Ok(guard
            .tables
            .get(table)
            .map(|rows| {
                rows.iter()
                    .filter(|row| {
                        row.get_by_name(column)
                            .is_some_and(|v| v.clone().canonical() == wanted)
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        let mut guard = self.state.lock().expect("lock poisoned");
        guard.execute_calls += 1;
        guard.take_failure()?;
        guard.executed.push((sql.to_string(), params.to_vec()));
        Ok(1)
    }
}
