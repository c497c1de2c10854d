//! The managed persistence context.
//!
//! A persistence context is the identity map of one unit of work: every
//! entity loaded, stored or persisted through a repository is *attached*
//! here, keyed by primary key, until the context is flushed or cleared.
//!
//! - **Flush** writes pending changes to storage and leaves entries attached
//!   and clean.
//! - **Clear** detaches everything. Pending changes are dropped and never
//!   reach storage.
//!
//! The context is not synchronized; repositories wrap it in a lock and use
//! one context per unit of work.

use crate::entity::Entity;
use crate::types::UniqueId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Unique identifier for a persistence context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContextId(pub UniqueId);

impl ContextId {
    /// Create a new random context ID
    pub fn new() -> Self {
        Self(UniqueId::new())
    }
}

impl Default for ContextId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ContextId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ctx_{}", self.0)
    }
}

/// Lifecycle state of an attached entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityState {
    /// Persisted in this unit of work, not yet in storage.
    New,
    /// Loaded from (or already flushed to) storage.
    Managed,
    /// Deletion pending until the next flush.
    Removed,
}

#[derive(Debug, Clone)]
struct ManagedEntry<E> {
    entity: E,
    state: EntityState,
    dirty: bool,
}

/// Summary information about a context
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextInfo {
    pub id: ContextId,
    pub opened_at: DateTime<Utc>,
    pub last_cleared_at: Option<DateTime<Utc>>,
    /// Entries in state `New` or `Managed`.
    pub attached: usize,
    /// Entries with changes not yet written.
    pub pending: usize,
    pub removed: usize,
}

/// Changes the next flush must apply to storage.
#[derive(Debug, Clone)]
pub struct PendingChanges<E: Entity> {
    pub upserts: Vec<E>,
    pub deletes: Vec<E::PrimaryKey>,
}

impl<E: Entity> PendingChanges<E> {
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.deletes.is_empty()
    }
}

/// Identity map of the entities attached to one unit of work.
#[derive(Debug)]
pub struct PersistenceContext<E: Entity> {
    id: ContextId,
    opened_at: DateTime<Utc>,
    last_cleared_at: Option<DateTime<Utc>>,
    entries: BTreeMap<E::PrimaryKey, ManagedEntry<E>>,
}

impl<E: Entity> PersistenceContext<E> {
    pub fn new() -> Self {
        Self {
            id: ContextId::new(),
            opened_at: Utc::now(),
            last_cleared_at: None,
            entries: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    /// The attached version of an entity; `None` if detached or removed.
    pub fn get(&self, pk: &E::PrimaryKey) -> Option<&E> {
        self.entries
            .get(pk)
            .filter(|e| e.state != EntityState::Removed)
            .map(|e| &e.entity)
    }

    pub fn state(&self, pk: &E::PrimaryKey) -> Option<EntityState> {
        self.entries.get(pk).map(|e| e.state)
    }

    pub fn is_removed(&self, pk: &E::PrimaryKey) -> bool {
        self.state(pk) == Some(EntityState::Removed)
    }

    /// Primary key of the entry whose domain identifier is `id`, if any.
    ///
    /// Includes removed entries so callers can tell "removed here" apart
    /// from "never loaded".
    pub fn key_of(&self, id: &E::Id) -> Option<E::PrimaryKey> {
        self.entries
            .iter()
            .find(|(_, e)| &e.entity.id() == id)
            .map(|(pk, _)| pk.clone())
    }

    /// Whether an attached entry other than `pk` carries the identifier `id`.
    pub fn holds_id_elsewhere(&self, id: &E::Id, pk: &E::PrimaryKey) -> bool {
        self.entries.iter().any(|(key, e)| {
            key != pk && e.state != EntityState::Removed && &e.entity.id() == id
        })
    }

    /// Whether the entity is attached (and not pending removal).
    pub fn contains(&self, pk: &E::PrimaryKey) -> bool {
        self.get(pk).is_some()
    }

    /// Attach a freshly loaded row. An already attached entry wins, so
    /// repeated loads keep returning the same (possibly modified) state.
    pub fn attach(&mut self, loaded: E) -> E {
        let pk = loaded.primary_key();
        let entry = self.entries.entry(pk).or_insert(ManagedEntry {
            entity: loaded,
            state: EntityState::Managed,
            dirty: false,
        });
        entry.entity.clone()
    }

    /// Copy `entity`'s state onto the attached instance and mark it dirty.
    ///
    /// `in_storage` decides whether an unknown entity becomes `Managed` or
    /// `New`. A removed entry is resurrected.
    pub fn merge(&mut self, entity: E, in_storage: bool) -> E {
        let pk = entity.primary_key();
        match self.entries.get_mut(&pk) {
            Some(entry) => {
                entry.entity = entity.clone();
                entry.dirty = true;
                if entry.state == EntityState::Removed {
                    entry.state = if in_storage {
                        EntityState::Managed
                    } else {
                        EntityState::New
                    };
                }
            }
            None => {
                let state = if in_storage {
                    EntityState::Managed
                } else {
                    EntityState::New
                };
                self.entries.insert(
                    pk,
                    ManagedEntry {
                        entity: entity.clone(),
                        state,
                        dirty: true,
                    },
                );
            }
        }
        entity
    }

    /// Modify an attached entity in place; returns the new state.
    pub fn modify<F>(&mut self, pk: &E::PrimaryKey, f: F) -> Option<E>
    where
        F: FnOnce(&mut E),
    {
        let entry = self
            .entries
            .get_mut(pk)
            .filter(|e| e.state != EntityState::Removed)?;
        f(&mut entry.entity);
        entry.dirty = true;
        Some(entry.entity.clone())
    }

    /// Schedule deletion. A `New` entry is simply dropped.
    pub fn mark_removed(&mut self, entity: E) {
        let pk = entity.primary_key();
        if self.state(&pk) == Some(EntityState::New) {
            self.entries.remove(&pk);
            return;
        }
        self.entries.insert(
            pk,
            ManagedEntry {
                entity,
                state: EntityState::Removed,
                dirty: true,
            },
        );
    }

    /// Replace an entry with its stored state, discarding pending changes.
    pub fn reset(&mut self, stored: E) -> E {
        let pk = stored.primary_key();
        self.entries.insert(
            pk,
            ManagedEntry {
                entity: stored.clone(),
                state: EntityState::Managed,
                dirty: false,
            },
        );
        stored
    }

    /// Detach a single entity without writing its changes.
    pub fn detach(&mut self, pk: &E::PrimaryKey) -> bool {
        self.entries.remove(pk).is_some()
    }

    /// Detach every entity; returns how many entries were dropped.
    pub fn clear(&mut self) -> usize {
        let detached = self.entries.len();
        self.entries.clear();
        self.last_cleared_at = Some(Utc::now());
        detached
    }

    /// Changes the next flush has to write, in primary-key order.
    pub fn pending(&self) -> PendingChanges<E> {
        let mut upserts = vec![];
        let mut deletes = vec![];
        for (pk, entry) in &self.entries {
            match entry.state {
                EntityState::Removed => deletes.push(pk.clone()),
                EntityState::New => upserts.push(entry.entity.clone()),
                EntityState::Managed if entry.dirty => upserts.push(entry.entity.clone()),
                EntityState::Managed => {}
            }
        }
        PendingChanges { upserts, deletes }
    }

    /// Record a successful flush: removed entries leave, the rest turn clean.
    pub fn mark_flushed(&mut self) {
        self.entries.retain(|_, e| e.state != EntityState::Removed);
        for entry in self.entries.values_mut() {
            entry.state = EntityState::Managed;
            entry.dirty = false;
        }
    }

    pub fn info(&self) -> ContextInfo {
        let removed = self
            .entries
            .values()
            .filter(|e| e.state == EntityState::Removed)
            .count();
        let pending = self.entries.values().filter(|e| e.dirty).count();
        ContextInfo {
            id: self.id,
            opened_at: self.opened_at,
            last_cleared_at: self.last_cleared_at,
            attached: self.entries.len() - removed,
            pending,
            removed,
        }
    }
}

impl<E: Entity> Default for PersistenceContext<E> {
    fn default() -> Self {
        Self::new()
    }
}

// ═══════════════════════════════════════════════════════════════════
// READ-ONLY SCOPE
// ═══════════════════════════════════════════════════════════════════

/// Guard for a read-only scope.
///
/// Entering increments a shared depth counter; dropping the guard
/// decrements it, on every exit path including unwinding. Scopes nest.
#[must_use = "the read-only scope closes as soon as the guard is dropped"]
#[derive(Debug)]
pub struct ReadOnlyScope<'a> {
    depth: &'a AtomicUsize,
}

impl<'a> ReadOnlyScope<'a> {
    pub fn enter(depth: &'a AtomicUsize) -> Self {
        depth.fetch_add(1, Ordering::SeqCst);
        Self { depth }
    }

    /// Whether any scope on this counter is open.
    pub fn is_active(depth: &AtomicUsize) -> bool {
        depth.load(Ordering::SeqCst) > 0
    }
}

impl Drop for ReadOnlyScope<'_> {
    fn drop(&mut self) {
        self.depth.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Note {
        key: u32,
        text: String,
    }

    impl Entity for Note {
        type Id = u32;
        type PrimaryKey = u32;

        fn id(&self) -> u32 {
            self.key
        }

        fn primary_key(&self) -> u32 {
            self.key
        }
    }

    fn note(key: u32, text: &str) -> Note {
        Note {
            key,
            text: text.into(),
        }
    }

    #[test]
    fn test_attach_keeps_existing_state() {
        let mut ctx = PersistenceContext::new();
        ctx.attach(note(1, "stored"));
        ctx.modify(&1, |n| n.text = "edited".into());

        let again = ctx.attach(note(1, "stored"));
        assert_eq!(again.text, "edited");
        assert_eq!(ctx.pending().upserts, vec![note(1, "edited")]);
    }

    #[test]
    fn test_clear_detaches_everything() {
        let mut ctx = PersistenceContext::new();
        ctx.attach(note(1, "a"));
        ctx.merge(note(2, "b"), false);
        assert_eq!(ctx.clear(), 2);
        assert_eq!(ctx.info().attached, 0);
        assert!(ctx.pending().is_empty());
        assert!(ctx.info().last_cleared_at.is_some());

        // Clearing an empty context is a no-op.
        assert_eq!(ctx.clear(), 0);
    }

    #[test]
    fn test_pending_and_flush() {
        let mut ctx = PersistenceContext::new();
        ctx.attach(note(1, "clean"));
        ctx.attach(note(2, "doomed"));
        ctx.merge(note(3, "fresh"), false);
        ctx.mark_removed(note(2, "doomed"));

        let pending = ctx.pending();
        assert_eq!(pending.upserts, vec![note(3, "fresh")]);
        assert_eq!(pending.deletes, vec![2]);
        assert_eq!(ctx.state(&3), Some(EntityState::New));

        ctx.mark_flushed();
        assert!(ctx.pending().is_empty());
        assert_eq!(ctx.state(&2), None);
        assert_eq!(ctx.state(&3), Some(EntityState::Managed));
    }

    #[test]
    fn test_removing_new_entity_forgets_it() {
        let mut ctx = PersistenceContext::new();
        ctx.merge(note(7, "draft"), false);
        ctx.mark_removed(note(7, "draft"));
        assert_eq!(ctx.state(&7), None);
        assert!(ctx.pending().is_empty());
    }

    #[test]
    fn test_removed_entries_are_hidden() {
        let mut ctx = PersistenceContext::new();
        ctx.attach(note(4, "x"));
        ctx.mark_removed(note(4, "x"));
        assert!(ctx.get(&4).is_none());
        assert!(ctx.is_removed(&4));
        assert_eq!(ctx.key_of(&4), Some(4));
        assert!(ctx.modify(&4, |n| n.text.clear()).is_none());
        assert_eq!(ctx.info().removed, 1);
    }

    #[test]
    fn test_read_only_scope_nests_and_closes() {
        let depth = AtomicUsize::new(0);
        {
            let _outer = ReadOnlyScope::enter(&depth);
            {
                let _inner = ReadOnlyScope::enter(&depth);
                assert_eq!(depth.load(Ordering::SeqCst), 2);
            }
            assert!(ReadOnlyScope::is_active(&depth));
        }
        assert!(!ReadOnlyScope::is_active(&depth));
    }

    #[test]
    fn test_read_only_scope_closes_on_panic() {
        let depth = AtomicUsize::new(0);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _scope = ReadOnlyScope::enter(&depth);
            panic!("query blew up");
        }));
        assert!(result.is_err());
        assert!(!ReadOnlyScope::is_active(&depth));
    }

    #[test]
    fn test_context_id_display() {
        let id = ContextId::new();
        assert!(id.to_string().starts_with("ctx_"));
        assert_ne!(id, ContextId::new());
    }
}
