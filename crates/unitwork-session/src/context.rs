//! Identity cache and dirty checking for one session.
//!
//! The context maps every [`EntityKey`] to the single live instance of that
//! record plus the snapshot of its column values taken when it became
//! managed. Dirty checking recomputes the values and compares them with the
//! stored snapshot; it never updates the snapshot itself.

use crate::key::EntityKey;
use crate::snapshot::{EntitySnapshot, TrackedIds, identifier_of};
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;
use unitwork_core::error::EntityStateError;
use unitwork_core::{Error, ManagedRecord, MetadataRegistry, Result, Value};

struct ManagedEntry {
    record: Rc<dyn ManagedRecord>,
    snapshot: EntitySnapshot,
    /// Registration order.
    seq: u64,
}

/// Tracks managed records and their snapshots.
pub struct PersistenceContext {
    registry: Arc<MetadataRegistry>,
    entries: HashMap<EntityKey, ManagedEntry>,
    /// Key of each tracked instance by allocation address.
    by_instance: HashMap<*const (), EntityKey>,
    next_seq: u64,
}

fn instance_addr(record: &Rc<dyn ManagedRecord>) -> *const () {
    Rc::as_ptr(record).cast::<()>()
}

impl PersistenceContext {
    pub fn new(registry: Arc<MetadataRegistry>) -> Self {
        Self {
            registry,
            entries: HashMap::new(),
            by_instance: HashMap::new(),
            next_seq: 0,
        }
    }

    /// Key derived from the record's type and current identifier value.
    #[allow(clippy::result_large_err)]
    pub fn key_of(&self, record: &dyn ManagedRecord) -> Result<EntityKey> {
        let metadata = self.registry.get(record.entity_type())?;
        Ok(EntityKey::new(
            record.entity_type(),
            identifier_of(record, &metadata)?,
        ))
    }

    /// Register `record` unless an instance with the same key is already
    /// tracked. Returns whichever instance is tracked afterwards.
    #[allow(clippy::result_large_err)]
    pub fn manage(&mut self, record: Rc<dyn ManagedRecord>) -> Result<Rc<dyn ManagedRecord>> {
        let key = self.key_of(record.as_ref())?;
        if let Some(existing) = self.entries.get(&key) {
            tracing::trace!(key = ?key, "Record already managed");
            return Ok(Rc::clone(&existing.record));
        }
        self.insert_entry(key, Rc::clone(&record))?;
        Ok(record)
    }

    /// Register a new record, failing if its key is already tracked.
    #[allow(clippy::result_large_err)]
    pub fn add(&mut self, record: Rc<dyn ManagedRecord>) -> Result<EntityKey> {
        let key = self.key_of(record.as_ref())?;
        if self.entries.contains_key(&key) {
            return Err(Error::DuplicateEntity(EntityStateError {
                entity: key.entity_type().name(),
                id: key.id().clone(),
            }));
        }
        self.insert_entry(key.clone(), record)?;
        Ok(key)
    }

    #[allow(clippy::result_large_err)]
    fn insert_entry(&mut self, key: EntityKey, record: Rc<dyn ManagedRecord>) -> Result<()> {
        let metadata = self.registry.get(key.entity_type())?;
        let snapshot =
            EntitySnapshot::capture(record.as_ref(), &metadata, &self.registry, &*self)?;
        let seq = self.next_seq;
        self.next_seq += 1;
        tracing::trace!(key = ?key, seq = seq, "Managing record");
        self.by_instance.insert(instance_addr(&record), key.clone());
        self.entries.insert(
            key,
            ManagedEntry {
                record,
                snapshot,
                seq,
            },
        );
        Ok(())
    }

    pub fn get(&self, key: &EntityKey) -> Option<Rc<dyn ManagedRecord>> {
        self.entries.get(key).map(|entry| Rc::clone(&entry.record))
    }

    /// Whether a record with the same key as `record` is tracked.
    #[allow(clippy::result_large_err)]
    pub fn contains(&self, record: &dyn ManagedRecord) -> Result<bool> {
        Ok(self.entries.contains_key(&self.key_of(record)?))
    }

    pub fn contains_key(&self, key: &EntityKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Records whose current column values differ from their snapshot, in
    /// registration order.
    ///
    /// A tracked record whose identifier field no longer matches its key is
    /// an error; the identifier of a managed record is fixed.
    #[allow(clippy::result_large_err)]
    pub fn dirty_entities(&self) -> Result<Vec<(EntityKey, Rc<dyn ManagedRecord>)>> {
        let mut dirty = Vec::new();
        for (key, entry) in &self.entries {
            let metadata = self.registry.get(key.entity_type())?;
            let current =
                EntitySnapshot::capture(entry.record.as_ref(), &metadata, &self.registry, &*self)?;
            if current != entry.snapshot {
                let id = identifier_of(entry.record.as_ref(), &metadata)?;
                if id != *key.id() {
                    return Err(Error::Custom(format!(
                        "{key:?} identifier changed to {id:?} while managed"
                    )));
                }
                dirty.push((entry.seq, key.clone(), Rc::clone(&entry.record)));
            }
        }
        dirty.sort_by_key(|(seq, _, _)| *seq);
        tracing::debug!(count = dirty.len(), "Dirty check complete");
        Ok(dirty
            .into_iter()
            .map(|(_, key, record)| (key, record))
            .collect())
    }

    /// Re-capture the stored snapshot of a tracked record.
    #[allow(clippy::result_large_err)]
    pub fn refresh_snapshot(&mut self, key: &EntityKey) -> Result<()> {
        let metadata = self.registry.get(key.entity_type())?;
        let Some(entry) = self.entries.get(key) else {
            return Ok(());
        };
        let snapshot =
            EntitySnapshot::capture(entry.record.as_ref(), &metadata, &self.registry, &*self)?;
        if let Some(entry) = self.entries.get_mut(key) {
            entry.snapshot = snapshot;
        }
        Ok(())
    }

    /// Stop tracking a record.
    pub fn evict(&mut self, key: &EntityKey) -> Option<Rc<dyn ManagedRecord>> {
        let removed = self.entries.remove(key).map(|entry| entry.record);
        if let Some(record) = &removed {
            self.by_instance.remove(&instance_addr(record));
            tracing::trace!(key = ?key, "Evicted record");
        }
        removed
    }

    pub fn clear(&mut self) {
        tracing::debug!(count = self.entries.len(), "Clearing persistence context");
        self.entries.clear();
        self.by_instance.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl TrackedIds for PersistenceContext {
    fn tracked_id(&self, record: &Rc<dyn ManagedRecord>) -> Option<Value> {
        let key = self.by_instance.get(&instance_addr(record))?;
        // The address is only trusted while the tracked entry holds the allocation
        let entry = self.entries.get(key)?;
        Rc::ptr_eq(&entry.record, record).then(|| key.id().clone())
    }
}

impl std::fmt::Debug for PersistenceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceContext")
            .field("managed", &self.entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Note, Person};
    use unitwork_core::{EntityRef, entity_ref, erase};

    fn context() -> PersistenceContext {
        PersistenceContext::new(Arc::new(MetadataRegistry::new()))
    }

    fn person(id: i64, first: &str, last: &str) -> EntityRef<Person> {
        entity_ref(Person {
            id,
            first_name: first.into(),
            last_name: last.into(),
            ..Person::default()
        })
    }

    #[test]
    fn manage_keeps_first_instance() {
        let mut ctx = context();
        let first = person(1, "Ada", "Lovelace");
        let second = person(1, "Someone", "Else");

        let kept = ctx.manage(erase(&first)).unwrap();
        assert!(Rc::ptr_eq(&kept, &erase(&first)));
        let kept = ctx.manage(erase(&second)).unwrap();
        assert!(Rc::ptr_eq(&kept, &erase(&first)));
        assert_eq!(ctx.len(), 1);
    }

    #[test]
    fn add_rejects_tracked_key() {
        let mut ctx = context();
        ctx.add(erase(&person(6, "Josh", "Long"))).unwrap();
        let err = ctx.add(erase(&person(6, "Josh", "Long"))).unwrap_err();
        match err {
            Error::DuplicateEntity(e) => {
                assert_eq!(e.entity, "Person");
                assert_eq!(e.id, unitwork_core::Value::BigInt(6));
            }
            other => panic!("expected duplicate entity, got {other:?}"),
        }
    }

    #[test]
    fn get_and_contains() {
        let mut ctx = context();
        let ada = person(1, "Ada", "Lovelace");
        assert!(!ctx.contains(erase(&ada).as_ref()).unwrap());
        ctx.manage(erase(&ada)).unwrap();

        assert!(ctx.contains(erase(&ada).as_ref()).unwrap());
        assert!(ctx.contains_key(&EntityKey::of::<Person>(1_i32)));
        assert!(ctx.get(&EntityKey::of::<Person>(2_i64)).is_none());
        assert!(ctx.get(&EntityKey::of::<Note>(1_i64)).is_none());
    }

    #[test]
    fn dirty_entities_in_registration_order_without_refresh() {
        let mut ctx = context();
        let records: Vec<_> = (1..=5)
            .map(|id| person(id, "First", "Last"))
            .collect();
        for record in &records {
            ctx.manage(erase(record)).unwrap();
        }
        assert!(ctx.dirty_entities().unwrap().is_empty());

        records[4].borrow_mut().last_name = "Changed".into();
        records[1].borrow_mut().first_name = "Changed".into();
        records[3].borrow_mut().last_name = "Changed".into();

        let ids: Vec<_> = ctx
            .dirty_entities()
            .unwrap()
            .into_iter()
            .map(|(key, _)| key.id().clone())
            .collect();
        assert_eq!(
            ids,
            vec![
                unitwork_core::Value::BigInt(2),
                unitwork_core::Value::BigInt(4),
                unitwork_core::Value::BigInt(5)
            ]
        );
        // Dirty checking alone never refreshes.
        assert_eq!(ctx.dirty_entities().unwrap().len(), 3);

        ctx.refresh_snapshot(&EntityKey::of::<Person>(2_i64)).unwrap();
        assert_eq!(ctx.dirty_entities().unwrap().len(), 2);
    }

    #[test]
    fn unchanged_values_are_not_dirty() {
        let mut ctx = context();
        let ada = person(1, "Ada", "Lovelace");
        ctx.manage(erase(&ada)).unwrap();
        ada.borrow_mut().last_name = "King".into();
        ada.borrow_mut().last_name = "Lovelace".into();
        assert!(ctx.dirty_entities().unwrap().is_empty());
    }

    #[test]
    fn reference_change_is_dirty() {
        let mut ctx = context();
        let owner = person(1, "Ada", "Lovelace");
        let note = entity_ref(Note {
            id: 7,
            body: "engine".into(),
            person: Some(Rc::clone(&owner)),
        });
        ctx.manage(erase(&note)).unwrap();
        assert!(ctx.dirty_entities().unwrap().is_empty());

        note.borrow_mut().person = Some(person(2, "Grace", "Hopper"));
        assert_eq!(ctx.dirty_entities().unwrap().len(), 1);
    }

    #[test]
    fn evict_and_clear() {
        let mut ctx = context();
        ctx.manage(erase(&person(1, "A", "B"))).unwrap();
        ctx.manage(erase(&person(2, "C", "D"))).unwrap();

        assert!(ctx.evict(&EntityKey::of::<Person>(1_i64)).is_some());
        assert!(ctx.evict(&EntityKey::of::<Person>(1_i64)).is_none());
        assert_eq!(ctx.len(), 1);

        ctx.clear();
        assert!(ctx.is_empty());
    }

    #[test]
    fn tracked_reference_is_resolved_while_target_is_borrowed() {
        let mut ctx = context();
        let owner = person(1, "Ada", "Lovelace");
        ctx.manage(erase(&owner)).unwrap();

        let mut held = owner.borrow_mut();
        held.last_name = "King".into();
        let note = entity_ref(Note {
            id: 10,
            body: "engines".into(),
            person: Some(Rc::clone(&owner)),
        });
        ctx.manage(erase(&note)).unwrap();
        assert_eq!(ctx.len(), 2);
        drop(held);

        // Only the owner changed
        let dirty = ctx.dirty_entities().unwrap();
        assert_eq!(dirty.len(), 1);
        assert_eq!(dirty[0].0, EntityKey::of::<Person>(1_i64));
    }

    #[test]
    fn evicted_instance_is_no_longer_tracked_by_address() {
        let mut ctx = context();
        let owner = person(1, "Ada", "Lovelace");
        ctx.manage(erase(&owner)).unwrap();
        assert_eq!(ctx.tracked_id(&erase(&owner)), Some(unitwork_core::Value::BigInt(1)));

        ctx.evict(&EntityKey::of::<Person>(1_i64));
        assert_eq!(ctx.tracked_id(&erase(&owner)), None);
    }

    #[test]
    fn changed_identifier_is_rejected() {
        let mut ctx = context();
        let ada = person(1, "Ada", "Lovelace");
        ctx.manage(erase(&ada)).unwrap();

        ada.borrow_mut().id = 5;
        let err = ctx.dirty_entities().unwrap_err();
        assert!(matches!(err, Error::Custom(ref msg) if msg.contains("identifier changed")));

        ada.borrow_mut().id = 1;
        assert!(ctx.dirty_entities().unwrap().is_empty());
    }
}
