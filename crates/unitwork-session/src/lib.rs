//! Session and unit of work for unitwork.
//!
//! `unitwork-session` is the **unit-of-work layer**. A [`Session`] keeps one
//! in-memory instance per persisted record, remembers what each record looked
//! like when it became managed, and turns the difference into SQL when asked
//! to flush.
//!
//! # Role In The Architecture
//!
//! - **Identity cache**: [`PersistenceContext`] maps every [`EntityKey`] to the
//!   single live instance of that record.
//! - **Dirty checking**: snapshots are compared by value at flush time.
//! - **Write ordering**: [`ActionQueue`] runs inserts, then updates, then
//!   deletes, each group in the order it was requested.
//! - **Loading**: [`EntityPersister`] issues the SQL and hydrates rows; to-one
//!   relations load eagerly, to-many relations on first access.
//!
//! # Threading
//!
//! A session and the records it hands out are single-threaded (`Rc`,
//! `RefCell`). The [`SessionFactory`] is `Send + Sync` and can open sessions
//! on any thread.
//!
//! # Example
//!
//! ```ignore
//! let factory = SessionFactory::new(SqliteConnection::open_memory()?);
//! let mut session = factory.open_session();
//!
//! let ada = session.find::<Person>(1)?;
//! ada.borrow_mut().last_name = "King".into();
//!
//! session.persist(&entity_ref(Person::new(6, "Josh", "Long")))?;
//! session.flush()?; // INSERT, then UPDATE
//! session.close()?;
//! ```

pub mod action;
pub mod context;
pub mod key;
pub mod persister;
mod snapshot;

#[cfg(test)]
mod testing;

pub use action::{ActionQueue, EntityAction};
pub use context::PersistenceContext;
pub use key::EntityKey;
pub use persister::EntityPersister;

use persister::SessionState;
use serde::{Deserialize, Serialize};
use std::rc::Rc;
use std::sync::Arc;
use unitwork_core::error::EntityStateError;
use unitwork_core::{
    DataSource, Entity, EntityRef, EntityType, Error, MetadataRegistry, Result, Value,
    downcast_record, erase,
};

// ============================================================================
// Session Configuration
// ============================================================================

/// Configuration for session behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Longest chain of eagerly loaded to-one references followed by a
    /// single lookup.
    pub max_fetch_depth: usize,
    /// Whether a record stops being managed once its delete has run.
    pub evict_on_delete: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_fetch_depth: 16,
            evict_on_delete: true,
        }
    }
}

impl SessionConfig {
    /// Create the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum eager fetch depth (builder pattern).
    #[must_use]
    pub fn max_fetch_depth(mut self, depth: usize) -> Self {
        self.max_fetch_depth = depth;
        self
    }

    /// Set whether deleted records are evicted (builder pattern).
    #[must_use]
    pub fn evict_on_delete(mut self, value: bool) -> Self {
        self.evict_on_delete = value;
        self
    }
}

// ============================================================================
// Flush Result
// ============================================================================

/// Result of a flush operation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushResult {
    /// Number of insert actions executed.
    pub inserted: usize,
    /// Number of update actions executed.
    pub updated: usize,
    /// Number of delete actions executed.
    pub deleted: usize,
}

impl FlushResult {
    /// Create a new empty result.
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of actions executed.
    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.deleted
    }
}

// ============================================================================
// Session Factory
// ============================================================================

/// Opens sessions over one data source.
///
/// Entity metadata resolved by any session is cached here and shared by
/// every session the factory opens.
#[derive(Clone)]
pub struct SessionFactory {
    data_source: Arc<dyn DataSource>,
    registry: Arc<MetadataRegistry>,
    config: SessionConfig,
}

impl SessionFactory {
    /// Create a factory with the default configuration.
    pub fn new(data_source: impl DataSource + 'static) -> Self {
        Self::with_config(data_source, SessionConfig::default())
    }

    pub fn with_config(data_source: impl DataSource + 'static, config: SessionConfig) -> Self {
        Self::from_arc(Arc::new(data_source), config)
    }

    /// Create a factory over an already shared data source.
    pub fn from_arc(data_source: Arc<dyn DataSource>, config: SessionConfig) -> Self {
        Self {
            data_source,
            registry: Arc::new(MetadataRegistry::new()),
            config,
        }
    }

    /// Open a new session.
    pub fn open_session(&self) -> Session {
        tracing::info!(
            max_fetch_depth = self.config.max_fetch_depth,
            evict_on_delete = self.config.evict_on_delete,
            "Opening session"
        );
        Session::new(
            Arc::clone(&self.data_source),
            Arc::clone(&self.registry),
            self.config.clone(),
        )
    }

    /// Metadata cache shared by this factory's sessions.
    pub fn metadata(&self) -> &Arc<MetadataRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }
}

impl std::fmt::Debug for SessionFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionFactory")
            .field("config", &self.config)
            .field("resolved_entities", &self.registry.len())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Session
// ============================================================================

/// A unit of work over one data source.
///
/// Every operation fails with [`Error::SessionClosed`] once [`Session::close`]
/// has succeeded, including a second `close`.
pub struct Session {
    state: Rc<SessionState>,
    persister: EntityPersister,
    queue: ActionQueue,
    config: SessionConfig,
}

impl Session {
    fn new(
        data_source: Arc<dyn DataSource>,
        registry: Arc<MetadataRegistry>,
        config: SessionConfig,
    ) -> Self {
        let state = Rc::new(SessionState::new(Arc::clone(&registry)));
        let persister = EntityPersister::new(
            data_source,
            registry,
            Rc::clone(&state),
            config.max_fetch_depth,
        );
        Self {
            state,
            persister,
            queue: ActionQueue::new(),
            config,
        }
    }

    pub fn is_open(&self) -> bool {
        self.state.is_open()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Number of actions waiting for the next flush.
    pub fn pending_actions(&self) -> usize {
        self.queue.len()
    }

    /// Number of records in the identity cache.
    pub fn managed_count(&self) -> usize {
        self.state.context().map_or(0, |ctx| ctx.len())
    }

    /// Start managing a new record; it is inserted on the next flush.
    ///
    /// Fails with [`Error::DuplicateEntity`] when a record with the same key
    /// is already managed.
    #[allow(clippy::result_large_err)]
    pub fn persist<E: Entity>(&mut self, entity: &EntityRef<E>) -> Result<()> {
        self.state.ensure_open()?;
        let record = erase(entity);
        let key = self.state.context_mut()?.add(Rc::clone(&record))?;
        tracing::info!(entity = E::NAME, id = ?key.id(), "Persisting entity");
        self.queue.enqueue(EntityAction::Insert { key, record });
        Ok(())
    }

    /// The managed instance of `E` with identifier `id`, loading it if needed.
    #[tracing::instrument(level = "debug", skip(self, id), fields(entity = E::NAME))]
    #[allow(clippy::result_large_err)]
    pub fn find<E: Entity>(&self, id: impl Into<Value>) -> Result<EntityRef<E>> {
        self.state.ensure_open()?;
        let id = id.into();
        tracing::info!(entity = E::NAME, id = ?id, "Finding entity");
        let record = self.persister.find_by_id(EntityType::of::<E>(), id)?;
        downcast_record(record)
    }

    /// Every record of `E` whose `field` equals `value`.
    #[allow(clippy::result_large_err)]
    pub fn find_all_by<E: Entity>(
        &self,
        field: &str,
        value: impl Into<Value>,
    ) -> Result<Vec<EntityRef<E>>> {
        self.state.ensure_open()?;
        let value = value.into();
        tracing::info!(entity = E::NAME, field = field, value = ?value, "Finding entities");
        self.persister
            .find_all_by(EntityType::of::<E>(), field, value)?
            .into_iter()
            .map(downcast_record)
            .collect()
    }

    /// The single record of `E` whose `field` equals `value`.
    ///
    /// Fails with [`Error::Cardinality`] unless exactly one row matches.
    #[allow(clippy::result_large_err)]
    pub fn find_one_by<E: Entity>(
        &self,
        field: &str,
        value: impl Into<Value>,
    ) -> Result<EntityRef<E>> {
        self.state.ensure_open()?;
        let value = value.into();
        tracing::info!(entity = E::NAME, field = field, value = ?value, "Finding entity");
        let record = self
            .persister
            .find_one_by(EntityType::of::<E>(), field, value)?;
        downcast_record(record)
    }

    /// Schedule a managed record for deletion on the next flush.
    ///
    /// The record stays managed until the delete has run. Fails with
    /// [`Error::NotManaged`] when no record with the same key is managed.
    #[allow(clippy::result_large_err)]
    pub fn remove<E: Entity>(&mut self, entity: &EntityRef<E>) -> Result<()> {
        self.state.ensure_open()?;
        let (key, record) = {
            let ctx = self.state.context()?;
            let key = ctx.key_of(erase(entity).as_ref())?;
            let record = ctx.get(&key).ok_or_else(|| {
                Error::NotManaged(EntityStateError {
                    entity: E::NAME,
                    id: key.id().clone(),
                })
            })?;
            (key, record)
        };
        tracing::info!(entity = E::NAME, id = ?key.id(), "Removing entity");
        if self
            .queue
            .pending_for(&key)
            .any(|action| matches!(action, EntityAction::Delete { .. }))
        {
            tracing::debug!(key = ?key, "Delete already scheduled");
            return Ok(());
        }
        self.queue.enqueue(EntityAction::Delete { key, record });
        Ok(())
    }

    /// Whether a record with the same key as `entity` is managed.
    #[allow(clippy::result_large_err)]
    pub fn contains<E: Entity>(&self, entity: &EntityRef<E>) -> Result<bool> {
        self.state.ensure_open()?;
        self.state.context()?.contains(erase(entity).as_ref())
    }

    /// Write every pending change.
    ///
    /// Dirty managed records get one update each, then the queue drains in
    /// priority order. A failing action aborts the flush and stays queued
    /// together with everything behind it.
    #[tracing::instrument(level = "debug", skip(self))]
    #[allow(clippy::result_large_err)]
    pub fn flush(&mut self) -> Result<FlushResult> {
        self.state.ensure_open()?;
        self.flush_pending()
    }

    #[allow(clippy::result_large_err)]
    fn flush_pending(&mut self) -> Result<FlushResult> {
        let dirty = self.state.context()?.dirty_entities()?;
        for (key, record) in dirty {
            // Pending inserts and updates write the current values anyway.
            let covered = self.queue.pending_for(&key).any(|action| {
                matches!(
                    action,
                    EntityAction::Insert { .. } | EntityAction::Update { .. }
                )
            });
            if !covered {
                self.queue.enqueue(EntityAction::Update { key, record });
            }
        }

        let mut result = FlushResult::new();
        tracing::debug!(pending = self.queue.len(), "Flushing actions");
        while let Some(action) = self.queue.peek().cloned() {
            if let Err(e) = action.execute(&self.persister) {
                tracing::warn!(
                    action = ?action,
                    remaining = self.queue.len(),
                    error = %e,
                    "Flush aborted"
                );
                return Err(e);
            }
            self.queue.pop();
            self.after_execute(&action, &mut result)?;
        }

        tracing::debug!(
            inserted = result.inserted,
            updated = result.updated,
            deleted = result.deleted,
            "Flush complete"
        );
        Ok(result)
    }

    #[allow(clippy::result_large_err)]
    fn after_execute(&self, action: &EntityAction, result: &mut FlushResult) -> Result<()> {
        let mut ctx = self.state.context_mut()?;
        match action {
            EntityAction::Insert { key, .. } => {
                result.inserted += 1;
                ctx.refresh_snapshot(key)?;
            }
            EntityAction::Update { key, .. } => {
                result.updated += 1;
                ctx.refresh_snapshot(key)?;
            }
            EntityAction::Delete { key, .. } => {
                result.deleted += 1;
                if self.config.evict_on_delete {
                    ctx.evict(key);
                }
            }
        }
        Ok(())
    }

    /// Flush, forget every managed record and close the session.
    ///
    /// If the flush fails the session stays open.
    #[allow(clippy::result_large_err)]
    pub fn close(&mut self) -> Result<()> {
        self.state.ensure_open()?;
        tracing::info!(pending = self.queue.len(), "Closing session");
        self.flush_pending()?;
        self.state.context_mut()?.clear();
        self.state.mark_closed();
        Ok(())
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("open", &self.is_open())
            .field("managed", &self.managed_count())
            .field("pending", &self.queue)
            .field("config", &self.config)
            .finish()
    }
}
