//! Deferred one-to-many collections.
//!
//! A [`LazyList`] starts either loaded (built by user code) or unloaded with a
//! loader (built by hydration). The first call that observes its size or
//! contents runs the loader; every later call reuses the loaded items.
//!
//! The list is single-threaded and not re-entrant: a loader that touches its
//! own list fails instead of recursing.

use crate::Result;
use crate::entity::{Entity, EntityRef};
use crate::error::Error;
use std::cell::RefCell;
use std::fmt;

type Loader<E> = Box<dyn Fn() -> Result<Vec<EntityRef<E>>>>;

enum LazyState<E: Entity> {
    Unloaded(Loader<E>),
    Loading,
    Loaded(Vec<EntityRef<E>>),
}

/// A to-many relation loaded on first access.
pub struct LazyList<E: Entity> {
    state: RefCell<LazyState<E>>,
}

impl<E: Entity> LazyList<E> {
    /// Create an unloaded list backed by `loader`.
    pub fn new(loader: impl Fn() -> Result<Vec<EntityRef<E>>> + 'static) -> Self {
        Self {
            state: RefCell::new(LazyState::Unloaded(Box::new(loader))),
        }
    }

    /// Create an already-loaded list.
    pub fn from_items(items: Vec<EntityRef<E>>) -> Self {
        Self {
            state: RefCell::new(LazyState::Loaded(items)),
        }
    }

    /// Whether the loader has already run successfully.
    pub fn is_loaded(&self) -> bool {
        matches!(
            self.state.try_borrow().as_deref(),
            Ok(LazyState::Loaded(_))
        )
    }

    #[allow(clippy::result_large_err)]
    fn ensure_loaded(&self) -> Result<()> {
        let loader = {
            let mut state = self.state.try_borrow_mut().map_err(|_| reentrant())?;
            match std::mem::replace(&mut *state, LazyState::Loading) {
                LazyState::Unloaded(loader) => loader,
                LazyState::Loading => return Err(reentrant()),
                loaded @ LazyState::Loaded(_) => {
                    *state = loaded;
                    return Ok(());
                }
            }
        };

        tracing::debug!(entity = E::NAME, "Loading lazy collection");
        let outcome = loader();
        let mut state = self.state.try_borrow_mut().map_err(|_| reentrant())?;
        match outcome {
            Ok(items) => {
                tracing::debug!(entity = E::NAME, count = items.len(), "Lazy collection loaded");
                *state = LazyState::Loaded(items);
                Ok(())
            }
            Err(e) => {
                // A failed load can be retried on the next access.
                *state = LazyState::Unloaded(loader);
                Err(e)
            }
        }
    }

    /// Number of items, loading first if needed.
    #[allow(clippy::result_large_err)]
    pub fn len(&self) -> Result<usize> {
        self.with_items(<[EntityRef<E>]>::len)
    }

    #[allow(clippy::result_large_err)]
    pub fn is_empty(&self) -> Result<bool> {
        self.with_items(<[EntityRef<E>]>::is_empty)
    }

    /// Item at `index`, loading first if needed.
    #[allow(clippy::result_large_err)]
    pub fn get(&self, index: usize) -> Result<Option<EntityRef<E>>> {
        self.with_items(|items| items.get(index).cloned())
    }

    /// All items as shared handles, loading first if needed.
    #[allow(clippy::result_large_err)]
    pub fn to_vec(&self) -> Result<Vec<EntityRef<E>>> {
        self.with_items(<[EntityRef<E>]>::to_vec)
    }

    /// Append an item. Loads first so the appended item is never lost behind a
    /// later load.
    ///
    /// This only changes the in-memory collection; the owning side of the
    /// relation is the to-one field on the item.
    #[allow(clippy::result_large_err)]
    pub fn push(&self, item: EntityRef<E>) -> Result<()> {
        self.ensure_loaded()?;
        let mut state = self.state.try_borrow_mut().map_err(|_| reentrant())?;
        if let LazyState::Loaded(items) = &mut *state {
            items.push(item);
        }
        Ok(())
    }

    #[allow(clippy::result_large_err)]
    fn with_items<T>(&self, f: impl FnOnce(&[EntityRef<E>]) -> T) -> Result<T> {
        self.ensure_loaded()?;
        let state = self.state.try_borrow().map_err(|_| reentrant())?;
        match &*state {
            LazyState::Loaded(items) => Ok(f(items)),
            _ => Err(reentrant()),
        }
    }
}

fn reentrant() -> Error {
    Error::Custom("lazy collection accessed while it is loading".to_string())
}

impl<E: Entity> Default for LazyList<E> {
    fn default() -> Self {
        Self::from_items(Vec::new())
    }
}

impl<E: Entity> fmt::Debug for LazyList<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.state.try_borrow().as_deref() {
            Ok(LazyState::Loaded(items)) => write!(f, "LazyList<{}>({} loaded)", E::NAME, items.len()),
            Ok(LazyState::Unloaded(_)) => write!(f, "LazyList<{}>(unloaded)", E::NAME),
            _ => write!(f, "LazyList<{}>(loading)", E::NAME),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{FieldValue, entity_ref};
    use crate::metadata::FieldDeclaration;
    use std::cell::Cell;
    use std::rc::Rc;

    #[derive(Debug, Default)]
    struct Item {
        id: i64,
    }

    impl Entity for Item {
        const NAME: &'static str = "Item";

        fn fields() -> Vec<FieldDeclaration> {
            vec![FieldDeclaration::scalar("id").id()]
        }

        fn read_field(&self, field: &str) -> Result<FieldValue> {
            match field {
                "id" => Ok(FieldValue::scalar(self.id)),
                other => Err(Error::unknown_field(Self::NAME, other)),
            }
        }

        fn write_field(&mut self, field: &str, value: FieldValue) -> Result<()> {
            match field {
                "id" => self.id = value.into_scalar(field)?,
                other => return Err(Error::unknown_field(Self::NAME, other)),
            }
            Ok(())
        }
    }

    fn counting_list(calls: &Rc<Cell<usize>>, ids: &[i64]) -> LazyList<Item> {
        let calls = Rc::clone(calls);
        let ids = ids.to_vec();
        LazyList::new(move || {
            calls.set(calls.get() + 1);
            Ok(ids.iter().map(|&id| entity_ref(Item { id })).collect())
        })
    }

    #[test]
    fn loads_once_on_first_access() {
        let calls = Rc::new(Cell::new(0));
        let list = counting_list(&calls, &[1, 2]);

        assert!(!list.is_loaded());
        assert_eq!(calls.get(), 0);

        assert_eq!(list.len().unwrap(), 2);
        assert!(list.is_loaded());
        assert_eq!(list.get(1).unwrap().unwrap().borrow().id, 2);
        assert_eq!(list.to_vec().unwrap().len(), 2);
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn failed_load_can_be_retried() {
        let attempts = Rc::new(Cell::new(0));
        let counter = Rc::clone(&attempts);
        let list: LazyList<Item> = LazyList::new(move || {
            counter.set(counter.get() + 1);
            if counter.get() == 1 {
                Err(Error::SessionClosed)
            } else {
                Ok(vec![entity_ref(Item { id: 5 })])
            }
        });

        assert!(matches!(list.len(), Err(Error::SessionClosed)));
        assert!(!list.is_loaded());
        assert_eq!(list.len().unwrap(), 1);
        assert_eq!(attempts.get(), 2);
    }

    #[test]
    fn push_loads_before_appending() {
        let calls = Rc::new(Cell::new(0));
        let list = counting_list(&calls, &[1]);
        list.push(entity_ref(Item { id: 7 })).unwrap();
        assert_eq!(calls.get(), 1);
        assert_eq!(list.len().unwrap(), 2);
    }

    #[test]
    fn default_is_empty_and_loaded() {
        let list = LazyList::<Item>::default();
        assert!(list.is_loaded());
        assert!(list.is_empty().unwrap());
        assert_eq!(format!("{list:?}"), "LazyList<Item>(0 loaded)");
    }

    #[test]
    fn reentrant_access_fails() {
        let slot: Rc<RefCell<Option<Rc<LazyList<Item>>>>> = Rc::new(RefCell::new(None));
        let inner = Rc::clone(&slot);
        let list = Rc::new(LazyList::new(move || {
            let list = inner.borrow().clone();
            match list {
                Some(list) => list.len().map(|_| Vec::new()),
                None => Ok(Vec::new()),
            }
        }));
        *slot.borrow_mut() = Some(Rc::clone(&list));

        assert!(list.len().is_err());
        slot.borrow_mut().take();
    }
}
