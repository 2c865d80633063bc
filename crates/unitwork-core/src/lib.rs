//! Core types and traits for unitwork.
//!
//! This crate holds everything the session runtime and the backends agree on:
//!
//! - [`Value`] and [`Row`] for parameters and results
//! - the [`Entity`] trait and its type-erased [`ManagedRecord`] form
//! - entity metadata resolution and caching ([`EntityMetadata`], [`MetadataRegistry`])
//! - [`LazyList`] for one-to-many relations
//! - the [`DataSource`]/[`Connection`] backend contract
//! - the shared [`Error`] type

pub mod connection;
pub mod entity;
pub mod error;
pub mod lazy;
pub mod metadata;
pub mod row;
pub mod value;

pub use connection::{Connection, DataSource, with_connection};
pub use entity::{
    CollectionLoader, Entity, EntityRef, EntityType, FieldValue, ManagedRecord, downcast_record,
    entity_ref, erase,
};
pub use error::{Error, Result};
pub use lazy::LazyList;
pub use metadata::{
    ColumnDescriptor, ColumnKind, EntityMetadata, FieldDeclaration, FieldShape, MetadataRegistry,
};
pub use row::{ColumnInfo, FromValue, Row};
pub use value::Value;
