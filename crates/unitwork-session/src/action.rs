//! Pending write actions and the queue that orders them.

use crate::key::EntityKey;
use crate::persister::EntityPersister;
use std::collections::BTreeMap;
use std::rc::Rc;
use unitwork_core::{ManagedRecord, Result};

/// A write waiting for the next flush.
#[derive(Clone)]
pub enum EntityAction {
    Insert {
        key: EntityKey,
        record: Rc<dyn ManagedRecord>,
    },
    Update {
        key: EntityKey,
        record: Rc<dyn ManagedRecord>,
    },
    Delete {
        key: EntityKey,
        record: Rc<dyn ManagedRecord>,
    },
}

impl EntityAction {
    pub fn key(&self) -> &EntityKey {
        match self {
            EntityAction::Insert { key, .. }
            | EntityAction::Update { key, .. }
            | EntityAction::Delete { key, .. } => key,
        }
    }

    pub fn record(&self) -> &Rc<dyn ManagedRecord> {
        match self {
            EntityAction::Insert { record, .. }
            | EntityAction::Update { record, .. }
            | EntityAction::Delete { record, .. } => record,
        }
    }

    /// Execution priority; lower runs first.
    pub const fn priority(&self) -> u8 {
        match self {
            EntityAction::Insert { .. } => 1,
            EntityAction::Update { .. } => 2,
            EntityAction::Delete { .. } => 3,
        }
    }

    pub const fn kind(&self) -> &'static str {
        match self {
            EntityAction::Insert { .. } => "insert",
            EntityAction::Update { .. } => "update",
            EntityAction::Delete { .. } => "delete",
        }
    }

    /// Run the statement for this action. Returns the affected row count.
    #[allow(clippy::result_large_err)]
    pub fn execute(&self, persister: &EntityPersister) -> Result<u64> {
        tracing::debug!(action = self.kind(), key = ?self.key(), "Executing action");
        match self {
            EntityAction::Insert { record, .. } => persister.insert(record.as_ref()),
            EntityAction::Update { key, record } => persister.update(key, record.as_ref()),
            EntityAction::Delete { key, .. } => persister.delete(key),
        }
    }
}

impl std::fmt::Debug for EntityAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({:?})", self.kind(), self.key())
    }
}

/// Actions ordered by priority, then by enqueue order.
#[derive(Debug, Default)]
pub struct ActionQueue {
    actions: BTreeMap<(u8, u64), EntityAction>,
    next_seq: u64,
}

impl ActionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, action: EntityAction) {
        let seq = self.next_seq;
        self.next_seq += 1;
        tracing::trace!(action = ?action, seq = seq, "Enqueued action");
        self.actions.insert((action.priority(), seq), action);
    }

    /// Next action to run, left in place.
    pub fn peek(&self) -> Option<&EntityAction> {
        self.actions.first_key_value().map(|(_, action)| action)
    }

    /// Remove and return the next action.
    pub fn pop(&mut self) -> Option<EntityAction> {
        self.actions.pop_first().map(|(_, action)| action)
    }

    /// Waiting actions for `key`, in execution order.
    pub fn pending_for<'a>(&'a self, key: &'a EntityKey) -> impl Iterator<Item = &'a EntityAction> {
        self.actions.values().filter(move |action| action.key() == key)
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Actions in execution order.
    pub fn iter(&self) -> impl Iterator<Item = &EntityAction> {
        self.actions.values()
    }

    pub fn clear(&mut self) {
        self.actions.clear();
    }
}
