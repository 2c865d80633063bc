//! unitwork - a small unit-of-work ORM session.
//!
//! unitwork maps plain structs to tables and tracks them in a [`Session`]:
//!
//! - One live instance per persisted record (identity map)
//! - Dirty checking by snapshot comparison at flush time
//! - Deferred writes, run inserts first, then updates, then deletes
//! - Eager to-one references, lazy one-to-many collections
//!
//! Backends plug in through [`DataSource`]; see `unitwork-sqlite` for SQLite.
//!
//! # Quick Start
//!
//! ```ignore
//! use unitwork::prelude::*;
//! use unitwork_sqlite::SqliteConnection;
//!
//! #[derive(Entity, Debug, Default)]
//! #[entity(table = "persons")]
//! struct Person {
//!     #[entity(id)]
//!     id: i64,
//!     first_name: String,
//!     last_name: String,
//!     notes: LazyList<Note>,
//! }
//!
//! #[derive(Entity, Debug, Default)]
//! #[entity(table = "notes")]
//! struct Note {
//!     #[entity(id)]
//!     id: i64,
//!     body: String,
//!     #[entity(column = "person_id")]
//!     person: Option<EntityRef<Person>>,
//! }
//!
//! fn rename(conn: SqliteConnection) -> Result<()> {
//!     let factory = SessionFactory::new(conn);
//!     let mut session = factory.open_session();
//!
//!     let ada = session.find::<Person>(1)?;
//!     ada.borrow_mut().last_name = "King".to_string();
//!
//!     for note in ada.borrow().notes.to_vec()? {
//!         println!("{}", note.borrow().body);
//!     }
//!
//!     session.close() // flushes the UPDATE
//! }
//! ```

pub use unitwork_core::{
    ColumnDescriptor, ColumnInfo, ColumnKind, Connection, DataSource, Entity, EntityMetadata,
    EntityRef, EntityType, Error, FieldDeclaration, FieldValue, FromValue, LazyList,
    ManagedRecord, MetadataRegistry, Result, Row, Value, entity_ref, error, with_connection,
};
pub use unitwork_session::{
    ActionQueue, EntityAction, EntityKey, EntityPersister, FlushResult, PersistenceContext,
    Session, SessionConfig, SessionFactory,
};

/// Derive macro for [`Entity`].
pub use unitwork_macros::Entity;

/// Everything an application needs to map and persist entities.
pub mod prelude {
    pub use crate::{
        Connection, DataSource, Entity, EntityRef, Error, LazyList, Result, Row, Session,
        SessionConfig, SessionFactory, Value, entity_ref,
    };
}
