//! In-memory storage backing the reference engine.
//!
//! Rows are kept in a `BTreeMap` keyed by primary key, so a scan returns
//! rows in "store order". The store has no notion of sessions: it only holds
//! what has been flushed (or seeded) into it. It is shared between units of
//! work through an `Arc`.
//!
//! `set_available(false)` makes every operation fail with
//! `STORE_UNAVAILABLE`, which is how tests exercise failure propagation.

use crate::entity::Entity;
use crate::errors::{AccessError, AccessResult};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Persisted rows for one entity type.
pub struct MemoryStore<E: Entity> {
    rows: RwLock<BTreeMap<E::PrimaryKey, E>>,
    available: AtomicBool,
    version: AtomicU64,
}

impl<E: Entity> MemoryStore<E> {
    pub fn new() -> Self {
        Self {
            rows: RwLock::new(BTreeMap::new()),
            available: AtomicBool::new(true),
            version: AtomicU64::new(0),
        }
    }

    /// Create a store pre-populated with rows.
    pub fn with_rows(rows: impl IntoIterator<Item = E>) -> Self {
        let store = Self::new();
        {
            let mut map = store.rows.write();
            for row in rows {
                map.insert(row.primary_key(), row);
            }
        }
        store
    }

    /// Simulate losing (or regaining) the connection to storage.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn ensure_available(&self) -> AccessResult<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(AccessError::store_unavailable("Entity store is unavailable"))
        }
    }

    /// Number of committed write batches.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    pub fn get(&self, pk: &E::PrimaryKey) -> AccessResult<Option<E>> {
        self.ensure_available()?;
        Ok(self.rows.read().get(pk).cloned())
    }

    pub fn contains_key(&self, pk: &E::PrimaryKey) -> AccessResult<bool> {
        self.ensure_available()?;
        Ok(self.rows.read().contains_key(pk))
    }

    /// Find a row by domain identifier (full scan).
    pub fn find_by_id(&self, id: &E::Id) -> AccessResult<Option<E>> {
        self.ensure_available()?;
        Ok(self
            .rows
            .read()
            .values()
            .find(|row| &row.id() == id)
            .cloned())
    }

    /// Every row, in primary-key order.
    pub fn scan(&self) -> AccessResult<Vec<E>> {
        self.ensure_available()?;
        Ok(self.rows.read().values().cloned().collect())
    }

    /// Insert or replace a single row.
    pub fn insert(&self, row: E) -> AccessResult<()> {
        self.write_batch(vec![row], vec![])
    }

    /// Primary keys of every row carrying the domain identifier `id`.
    pub fn keys_with_id(&self, id: &E::Id) -> AccessResult<Vec<E::PrimaryKey>> {
        self.ensure_available()?;
        Ok(self
            .rows
            .read()
            .iter()
            .filter(|(_, row)| &row.id() == id)
            .map(|(pk, _)| pk.clone())
            .collect())
    }

    /// Apply upserts and deletes atomically.
    ///
    /// Fails with `ENTITY_EXISTS`, leaving the rows untouched, when the batch
    /// would leave two rows with the same domain identifier.
    pub fn write_batch(&self, upserts: Vec<E>, deletes: Vec<E::PrimaryKey>) -> AccessResult<()> {
        self.ensure_available()?;
        let mut rows = self.rows.write();
        ensure_unique_ids(&rows, &upserts, &deletes)?;
        for pk in &deletes {
            rows.remove(pk);
        }
        for row in upserts {
            rows.insert(row.primary_key(), row);
        }
        self.version.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }
}

impl<E: Entity> Default for MemoryStore<E> {
    fn default() -> Self {
        Self::new()
    }
}

fn ensure_unique_ids<E: Entity>(
    rows: &BTreeMap<E::PrimaryKey, E>,
    upserts: &[E],
    deletes: &[E::PrimaryKey],
) -> AccessResult<()> {
    let touched: HashSet<E::PrimaryKey> = upserts
        .iter()
        .map(|row| row.primary_key())
        .chain(deletes.iter().cloned())
        .collect();
    let mut holders: HashMap<E::Id, E::PrimaryKey> = rows
        .iter()
        .filter(|(pk, _)| !touched.contains(*pk))
        .map(|(pk, row)| (row.id(), pk.clone()))
        .collect();
    for row in upserts {
        if holders.insert(row.id(), row.primary_key()).is_some() {
            return Err(AccessError::entity_exists(row.id()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorCode;

    #[derive(Debug, Clone, PartialEq)]
    struct Item {
        code: &'static str,
        slot: u8,
    }

    impl Entity for Item {
        type Id = &'static str;
        type PrimaryKey = u8;

        fn id(&self) -> &'static str {
            self.code
        }

        fn primary_key(&self) -> u8 {
            self.slot
        }
    }

    #[test]
    fn test_scan_is_key_ordered() {
        let store = MemoryStore::with_rows([
            Item { code: "c", slot: 3 },
            Item { code: "a", slot: 1 },
            Item { code: "b", slot: 2 },
        ]);
        let codes: Vec<_> = store.scan().unwrap().into_iter().map(|i| i.code).collect();
        assert_eq!(codes, vec!["a", "b", "c"]);
        assert_eq!(store.find_by_id(&"b").unwrap().unwrap().slot, 2);
    }

    #[test]
    fn test_write_batch() {
        let store = MemoryStore::with_rows([Item { code: "a", slot: 1 }]);
        store
            .write_batch(vec![Item { code: "z", slot: 9 }], vec![1])
            .unwrap();
        assert_eq!(store.len(), 1);
        assert!(store.get(&9).unwrap().is_some());
        assert_eq!(store.version(), 1);
    }

    #[test]
    fn test_write_batch_keeps_ids_unique() {
        let store = MemoryStore::with_rows([
            Item { code: "a", slot: 1 },
            Item { code: "b", slot: 2 },
        ]);

        let err = store.insert(Item { code: "a", slot: 7 }).unwrap_err();
        assert_eq!(err.code, ErrorCode::EntityExists);
        assert_eq!(store.len(), 2);
        assert_eq!(store.version(), 0);

        // An identifier freed in the same batch can be taken over.
        store
            .write_batch(vec![Item { code: "a", slot: 7 }], vec![1])
            .unwrap();
        assert_eq!(store.keys_with_id(&"a").unwrap(), vec![7]);

        // Swapping identifiers between two rows is fine too.
        store
            .write_batch(
                vec![Item { code: "b", slot: 7 }, Item { code: "a", slot: 2 }],
                vec![],
            )
            .unwrap();
        assert_eq!(store.find_by_id(&"a").unwrap().unwrap().slot, 2);
    }

    #[test]
    fn test_unavailable_store_fails_every_call() {
        let store = MemoryStore::with_rows([Item { code: "a", slot: 1 }]);
        store.set_available(false);

        assert_eq!(store.scan().unwrap_err().code, ErrorCode::StoreUnavailable);
        assert_eq!(store.get(&1).unwrap_err().code, ErrorCode::StoreUnavailable);
        assert!(store.insert(Item { code: "b", slot: 2 }).is_err());

        store.set_available(true);
        assert_eq!(store.len(), 1);
    }
}
