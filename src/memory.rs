//! In-memory reference engine for the repository contracts.
//!
//! A [`MemoryRepository`] is one unit of work: it shares a [`MemoryStore`]
//! and a [`QueryCatalog`] with other units of work and owns a private
//! [`PersistenceContext`].
//!
//! # Query semantics
//!
//! Named queries are evaluated against *stored* rows, in primary-key order.
//! For every match that is attached to the context, the attached instance
//! is returned instead of the stored row, so unflushed modifications are
//! visible on the returned entities but do not change which rows match.
//! Entities persisted but not yet flushed are not visible to queries unless
//! the repository runs with [`FlushMode::Auto`].
//!
//! # Read-only scopes
//!
//! While a [`ReadOnlyScope`] is open (or the repository is configured
//! read-only) every write fails with `READ_ONLY_VIOLATION`, and rows loaded
//! by reads are returned without being attached. `refresh` inside a scope
//! returns the stored row and leaves the context as it was.
//!
//! # Identifiers
//!
//! A domain identifier belongs to at most one primary key. `persist` and
//! `store` reject an entity whose identifier is already held by another
//! attached or stored entity, and the store re-checks every flushed batch.

use crate::config::{FlushMode, MultipleResultPolicy, RepositoryConfig};
use crate::context::{ContextId, ContextInfo, EntityState, PersistenceContext, ReadOnlyScope};
use crate::entity::Entity;
use crate::errors::{AccessError, AccessResult};
use crate::events::{AccessEvent, EventEmitter, EventFilter, EventManager, EventReceiver};
use crate::query::{Bindings, NamedArgs, NamedQuery, QueryCatalog};
use crate::repository::{DatabaseRepository, EntityAccess, Repository};
use crate::store::MemoryStore;
use crate::types::QueryValue;
use parking_lot::Mutex;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// One unit of work over a shared in-memory store.
pub struct MemoryRepository<E: Entity> {
    store: Arc<MemoryStore<E>>,
    catalog: Arc<QueryCatalog<E>>,
    context: Mutex<PersistenceContext<E>>,
    read_only_depth: AtomicUsize,
    config: RepositoryConfig,
    events: EventManager,
}

impl<E: Entity> MemoryRepository<E> {
    pub fn new(store: Arc<MemoryStore<E>>, catalog: Arc<QueryCatalog<E>>) -> Self {
        Self::with_config(store, catalog, RepositoryConfig::default())
    }

    pub fn with_config(
        store: Arc<MemoryStore<E>>,
        catalog: Arc<QueryCatalog<E>>,
        config: RepositoryConfig,
    ) -> Self {
        let events = EventManager::new(config.event_capacity, config.max_recent_events);
        Self {
            store,
            catalog,
            context: Mutex::new(PersistenceContext::new()),
            read_only_depth: AtomicUsize::new(0),
            config,
            events,
        }
    }

    pub fn backing_store(&self) -> &Arc<MemoryStore<E>> {
        &self.store
    }

    pub fn catalog(&self) -> &Arc<QueryCatalog<E>> {
        &self.catalog
    }

    pub fn config(&self) -> &RepositoryConfig {
        &self.config
    }

    pub fn context_id(&self) -> ContextId {
        self.context.lock().id()
    }

    pub fn context_info(&self) -> ContextInfo {
        self.context.lock().info()
    }

    /// Open a read-only scope; it closes when the guard is dropped.
    pub fn read_only(&self) -> ReadOnlyScope<'_> {
        ReadOnlyScope::enter(&self.read_only_depth)
    }

    /// Run `f` inside a read-only scope.
    pub fn with_read_only<T, F>(&self, f: F) -> T
    where
        F: FnOnce(&Self) -> T,
    {
        let _scope = self.read_only();
        f(self)
    }

    /// Whether writes are currently rejected.
    pub fn is_read_only(&self) -> bool {
        self.config.read_only || ReadOnlyScope::is_active(&self.read_only_depth)
    }

    /// Modify an entity in place, loading and attaching it first if needed.
    ///
    /// The change is pending until the next flush.
    pub fn modify<F>(&self, pk: &E::PrimaryKey, f: F) -> AccessResult<E>
    where
        F: FnOnce(&mut E),
    {
        self.ensure_writable("modify")?;
        let mut ctx = self.context.lock();
        if !ctx.contains(pk) {
            if ctx.is_removed(pk) {
                return Err(AccessError::entity_not_found(pk));
            }
            let row = self
                .store
                .get(pk)?
                .ok_or_else(|| AccessError::entity_not_found(pk))?;
            ctx.attach(row);
        }
        ctx.modify(pk, f).ok_or_else(|| AccessError::entity_not_found(pk))
    }

    /// Detach one entity without writing its pending changes.
    pub fn detach(&self, pk: &E::PrimaryKey) -> bool {
        self.context.lock().detach(pk)
    }

    fn ensure_writable(&self, operation: &str) -> AccessResult<()> {
        if self.is_read_only() {
            return Err(AccessError::read_only_violation(operation));
        }
        Ok(())
    }

    /// Fail with `ENTITY_EXISTS` if another primary key holds `entity`'s
    /// identifier. Stored rows only count when this context has no entry for
    /// them.
    fn ensure_unique_id(&self, ctx: &PersistenceContext<E>, entity: &E) -> AccessResult<()> {
        let id = entity.id();
        let pk = entity.primary_key();
        let taken = ctx.holds_id_elsewhere(&id, &pk)
            || self
                .store
                .keys_with_id(&id)?
                .iter()
                .any(|key| key != &pk && ctx.state(key).is_none());
        if taken {
            return Err(AccessError::entity_exists(&id));
        }
        Ok(())
    }

    /// A stored row matched by identifier, unless this context has its own
    /// entry for that key (which then no longer carries the identifier).
    fn load_by_id(&self, ctx: &PersistenceContext<E>, id: &E::Id) -> AccessResult<Option<E>> {
        let stored = self.store.find_by_id(id)?;
        Ok(stored.filter(|row| ctx.state(&row.primary_key()).is_none()))
    }

    /// Attach a loaded row unless reads are currently read-only.
    fn track(&self, ctx: &mut PersistenceContext<E>, row: E) -> E {
        if self.is_read_only() {
            ctx.get(&row.primary_key()).cloned().unwrap_or(row)
        } else {
            ctx.attach(row)
        }
    }

    fn flush_context(&self, ctx: &mut PersistenceContext<E>) -> AccessResult<()> {
        let pending = ctx.pending();
        if pending.is_empty() {
            return Ok(());
        }

        let written = pending.upserts.len();
        let deleted = pending.deletes.len();
        self.store.write_batch(pending.upserts, pending.deletes)?;
        ctx.mark_flushed();

        debug!(
            target: "entity_access::context",
            context = %ctx.id(),
            written,
            deleted,
            "Persistence context flushed"
        );
        self.events.emit(AccessEvent::flushed(written, deleted).in_context(ctx.id()));
        Ok(())
    }

    fn execute<B>(&self, query_name: &str, bind: B) -> AccessResult<Vec<E>>
    where
        B: FnOnce(&NamedQuery<E>) -> AccessResult<Bindings>,
    {
        let started = Instant::now();
        let read_only = self.is_read_only();
        let result = self.run_query(query_name, bind, read_only);
        let context_id = self.context_id();

        match &result {
            Ok(rows) => {
                debug!(
                    target: "entity_access::query",
                    query = query_name,
                    rows = rows.len(),
                    read_only,
                    context = %context_id,
                    "Named query executed"
                );
                let event = AccessEvent::query_executed(
                    query_name,
                    rows.len(),
                    read_only,
                    started.elapsed(),
                );
                self.events.emit(event.in_context(context_id));
            }
            Err(e) => {
                debug!(
                    target: "entity_access::query",
                    query = query_name,
                    error = %e,
                    context = %context_id,
                    "Named query failed"
                );
                self.events
                    .emit(AccessEvent::query_failed(query_name, e).in_context(context_id));
            }
        }
        result
    }

    fn run_query<B>(&self, query_name: &str, bind: B, read_only: bool) -> AccessResult<Vec<E>>
    where
        B: FnOnce(&NamedQuery<E>) -> AccessResult<Bindings>,
    {
        let query = self.catalog.get(query_name)?;
        let bindings = bind(&query)?;

        if self.config.flush_mode == FlushMode::Auto && !read_only {
            let mut ctx = self.context.lock();
            self.flush_context(&mut ctx)?;
        }

        let rows = self.store.scan()?;
        let mut ctx = self.context.lock();
        let candidates: Vec<E> = rows
            .into_iter()
            .filter(|row| !ctx.is_removed(&row.primary_key()))
            .collect();

        let matched = query.apply(candidates, &bindings);
        let mut results = Vec::with_capacity(matched.len());
        for row in matched {
            results.push(self.track(&mut ctx, row));
        }
        Ok(results)
    }

    fn pick_instance(&self, query_name: &str, rows: Vec<E>) -> AccessResult<Option<E>> {
        match rows.len() {
            0 | 1 => Ok(rows.into_iter().next()),
            n => match self.config.multiple_results {
                MultipleResultPolicy::First => {
                    warn!(
                        target: "entity_access::query",
                        query = query_name,
                        rows = n,
                        "Single-instance lookup matched several rows; returning the first"
                    );
                    Ok(rows.into_iter().next())
                }
                MultipleResultPolicy::Reject => {
                    Err(AccessError::non_unique_result(query_name, n))
                }
            },
        }
    }
}

impl<E: Entity> Repository for MemoryRepository<E> {
    type Entity = E;

    fn find(&self, id: &E::Id) -> AccessResult<Option<E>> {
        let mut ctx = self.context.lock();
        if let Some(pk) = ctx.key_of(id) {
            return Ok(ctx.get(&pk).cloned());
        }
        let stored = self.load_by_id(&ctx, id)?;
        Ok(stored.map(|row| self.track(&mut ctx, row)))
    }

    fn find_all(&self) -> AccessResult<Vec<E>> {
        let rows = self.store.scan()?;
        let mut ctx = self.context.lock();
        let mut all = Vec::with_capacity(rows.len());
        for row in rows {
            if ctx.is_removed(&row.primary_key()) {
                continue;
            }
            all.push(self.track(&mut ctx, row));
        }
        Ok(all)
    }

    fn store(&self, entity: E) -> AccessResult<E> {
        self.ensure_writable("store")?;
        let pk = entity.primary_key();
        let mut ctx = self.context.lock();
        self.ensure_unique_id(&ctx, &entity)?;
        let in_storage = match ctx.state(&pk) {
            Some(EntityState::New) => false,
            Some(_) => true,
            None => self.store.contains_key(&pk)?,
        };
        Ok(ctx.merge(entity, in_storage))
    }

    fn remove(&self, id: &E::Id) -> AccessResult<()> {
        self.ensure_writable("remove")?;
        let mut ctx = self.context.lock();
        let entity = match ctx.key_of(id) {
            Some(pk) => ctx.get(&pk).cloned(),
            None => self.load_by_id(&ctx, id)?,
        }
        .ok_or_else(|| AccessError::entity_not_found(id))?;
        ctx.mark_removed(entity);
        Ok(())
    }

    fn contains(&self, entity: &E) -> AccessResult<bool> {
        Ok(self.context.lock().contains(&entity.primary_key()))
    }
}

impl<E: Entity> DatabaseRepository for MemoryRepository<E> {
    fn find_by_primary_key(&self, pk: &E::PrimaryKey) -> AccessResult<Option<E>> {
        let mut ctx = self.context.lock();
        if ctx.state(pk).is_some() {
            return Ok(ctx.get(pk).cloned());
        }
        let stored = self.store.get(pk)?;
        Ok(stored.map(|row| self.track(&mut ctx, row)))
    }

    fn remove_by_primary_key(&self, pk: &E::PrimaryKey) -> AccessResult<()> {
        self.ensure_writable("remove")?;
        let mut ctx = self.context.lock();
        let entity = if ctx.state(pk).is_some() {
            ctx.get(pk).cloned()
        } else {
            self.store.get(pk)?
        }
        .ok_or_else(|| AccessError::entity_not_found(pk))?;
        ctx.mark_removed(entity);
        Ok(())
    }

    fn persist(&self, entity: E) -> AccessResult<()> {
        self.ensure_writable("persist")?;
        let pk = entity.primary_key();
        let mut ctx = self.context.lock();
        match ctx.state(&pk) {
            Some(EntityState::Removed) => {
                self.ensure_unique_id(&ctx, &entity)?;
                ctx.merge(entity, true);
            }
            Some(_) => return Err(AccessError::entity_exists(&pk)),
            None => {
                if self.store.contains_key(&pk)? {
                    return Err(AccessError::entity_exists(&pk));
                }
                self.ensure_unique_id(&ctx, &entity)?;
                ctx.merge(entity, false);
            }
        }
        Ok(())
    }

    fn merge(&self, entity: E) -> AccessResult<E> {
        self.ensure_writable("merge")?;
        Repository::store(self, entity)
    }

    fn flush(&self) -> AccessResult<()> {
        self.ensure_writable("flush")?;
        let mut ctx = self.context.lock();
        self.flush_context(&mut ctx)
    }

    fn refresh(&self, pk: &E::PrimaryKey) -> AccessResult<E> {
        let stored = self.store.get(pk)?;
        if self.is_read_only() {
            return stored.ok_or_else(|| AccessError::entity_not_found(pk));
        }
        let mut ctx = self.context.lock();
        match stored {
            Some(row) => Ok(ctx.reset(row)),
            None => {
                ctx.detach(pk);
                Err(AccessError::entity_not_found(pk))
            }
        }
    }
}

impl<E: Entity> EntityAccess for MemoryRepository<E> {
    fn clear(&self) {
        let (detached, context_id) = {
            let mut ctx = self.context.lock();
            (ctx.clear(), ctx.id())
        };
        debug!(
            target: "entity_access::context",
            context = %context_id,
            detached,
            "Persistence context cleared"
        );
        self.events.emit(AccessEvent::context_cleared(detached).in_context(context_id));
    }

    fn find_by_named_query(
        &self,
        query_name: &str,
        args: &[QueryValue],
    ) -> AccessResult<Vec<E>> {
        self.execute(query_name, |q| q.bind_positional(args))
    }

    fn find_by_named_query_with(
        &self,
        query_name: &str,
        args: &NamedArgs,
    ) -> AccessResult<Vec<E>> {
        self.execute(query_name, |q| q.bind_named(args))
    }

    fn find_instance_by_named_query(
        &self,
        query_name: &str,
        args: &[QueryValue],
    ) -> AccessResult<Option<E>> {
        let rows = self.execute(query_name, |q| q.bind_positional(args))?;
        self.pick_instance(query_name, rows)
    }

    fn find_instance_by_named_query_with(
        &self,
        query_name: &str,
        args: &NamedArgs,
    ) -> AccessResult<Option<E>> {
        let _scope = self.read_only();
        let rows = self.execute(query_name, |q| q.bind_named(args))?;
        self.pick_instance(query_name, rows)
    }
}

impl<E: Entity> EventEmitter for MemoryRepository<E> {
    fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    fn recent_events(&self, filter: &EventFilter, limit: usize) -> Vec<AccessEvent> {
        self.events.recent(filter, limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorCode;
    use crate::query::ParamType;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq)]
    struct Task {
        key: u32,
        title: String,
        done: bool,
    }

    impl Entity for Task {
        type Id = String;
        type PrimaryKey = u32;

        fn id(&self) -> String {
            self.title.clone()
        }

        fn primary_key(&self) -> u32 {
            self.key
        }
    }

    fn task(key: u32, title: &str, done: bool) -> Task {
        Task {
            key,
            title: title.into(),
            done,
        }
    }

    fn repo_with(config: RepositoryConfig) -> MemoryRepository<Task> {
        let store = Arc::new(MemoryStore::with_rows([
            task(1, "write", false),
            task(2, "review", true),
            task(3, "ship", false),
        ]));
        let catalog = Arc::new(QueryCatalog::new());
        catalog
            .define(
                NamedQuery::builder("Task.byDone")
                    .param("done", ParamType::Boolean)
                    .filter(|t: &Task, b| b.get_bool("done") == Some(t.done)),
            )
            .unwrap();
        MemoryRepository::with_config(store, catalog, config)
    }

    fn repo() -> MemoryRepository<Task> {
        repo_with(RepositoryConfig::default())
    }

    #[test]
    fn test_query_results_are_attached() {
        let repo = repo();
        let open = repo
            .find_by_named_query("Task.byDone", &[json!(false)])
            .unwrap();
        assert_eq!(open.len(), 2);
        assert!(repo.contains(&open[0]).unwrap());
        assert_eq!(repo.context_info().attached, 2);
    }

    #[test]
    fn test_attached_state_is_returned_by_queries() {
        let repo = repo();
        repo.modify(&1, |t| t.title = "write docs".into()).unwrap();

        let open = repo
            .find_by_named_query("Task.byDone", &[json!(false)])
            .unwrap();
        assert_eq!(open[0].title, "write docs");

        // Storage is untouched until flush.
        assert_eq!(repo.backing_store().get(&1).unwrap().unwrap().title, "write");
    }

    #[test]
    fn test_read_only_scope_rejects_writes() {
        let repo = repo();
        let scope = repo.read_only();
        let err = repo.store(task(9, "nope", false)).unwrap_err();
        assert_eq!(err.code, ErrorCode::ReadOnlyViolation);
        assert_eq!(repo.flush().unwrap_err().code, ErrorCode::ReadOnlyViolation);

        // Reads in the scope do not attach.
        repo.find_all().unwrap();
        assert_eq!(repo.context_info().attached, 0);

        drop(scope);
        assert!(repo.store(task(9, "yes", false)).is_ok());
    }

    #[test]
    fn test_read_only_config() {
        let repo = repo_with(RepositoryConfig::new().read_only(true));
        assert!(repo.is_read_only());
        assert_eq!(
            repo.persist(task(4, "new", false)).unwrap_err().code,
            ErrorCode::ReadOnlyViolation
        );
    }

    #[test]
    fn test_auto_flush_makes_new_entities_queryable() {
        let manual = repo();
        manual.persist(task(4, "deploy", false)).unwrap();
        assert_eq!(
            manual
                .find_by_named_query("Task.byDone", &[json!(false)])
                .unwrap()
                .len(),
            2
        );

        let auto = repo_with(RepositoryConfig::new().flush_mode(FlushMode::Auto));
        auto.persist(task(4, "deploy", false)).unwrap();
        assert_eq!(
            auto.find_by_named_query("Task.byDone", &[json!(false)])
                .unwrap()
                .len(),
            3
        );
    }

    #[test]
    fn test_reject_policy() {
        let repo = repo_with(
            RepositoryConfig::new().multiple_results(MultipleResultPolicy::Reject),
        );
        let err = repo
            .find_instance_by_named_query("Task.byDone", &[json!(false)])
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::NonUniqueResult);

        let single = repo
            .find_instance_by_named_query("Task.byDone", &[json!(true)])
            .unwrap();
        assert_eq!(single.unwrap().title, "review");
    }

    #[test]
    fn test_removed_entities_disappear_from_reads() {
        let repo = repo();
        repo.remove(&"ship".to_string()).unwrap();
        assert!(repo.find(&"ship".to_string()).unwrap().is_none());
        assert_eq!(repo.find_all().unwrap().len(), 2);
        assert_eq!(
            repo.remove(&"ship".to_string()).unwrap_err().code,
            ErrorCode::EntityNotFound
        );

        repo.flush().unwrap();
        assert_eq!(repo.backing_store().len(), 2);
    }

    #[test]
    fn test_refresh_discards_changes() {
        let repo = repo();
        repo.modify(&2, |t| t.done = false).unwrap();
        let refreshed = repo.refresh(&2).unwrap();
        assert!(refreshed.done);
        assert_eq!(repo.context_info().pending, 0);

        assert_eq!(
            repo.refresh(&42).unwrap_err().code,
            ErrorCode::EntityNotFound
        );
    }

    #[test]
    fn test_refresh_in_read_only_scope_leaves_context_alone() {
        let repo = repo();
        repo.modify(&2, |t| t.done = false).unwrap();

        let stored = repo.with_read_only(|r| r.refresh(&2)).unwrap();
        assert!(stored.done);
        assert_eq!(repo.context_info().pending, 1);
        assert!(!repo.find_by_primary_key(&2).unwrap().unwrap().done);

        let err = repo.with_read_only(|r| r.refresh(&42)).unwrap_err();
        assert_eq!(err.code, ErrorCode::EntityNotFound);
    }

    #[test]
    fn test_store_rejects_identifier_held_elsewhere() {
        let repo = repo();
        let err = repo.store(task(9, "ship", false)).unwrap_err();
        assert_eq!(err.code, ErrorCode::EntityExists);

        // Renaming the holder in this context frees the identifier.
        repo.modify(&3, |t| t.title = "shipped".into()).unwrap();
        repo.store(task(9, "ship", false)).unwrap();
        repo.flush().unwrap();
        assert_eq!(repo.backing_store().keys_with_id(&"ship".to_string()).unwrap(), vec![9]);
    }

    #[test]
    fn test_events_are_recorded() {
        let repo = repo();
        repo.find_by_named_query("Task.byDone", &[json!(true)]).unwrap();
        let _ = repo.find_by_named_query("Task.nope", &[]);
        repo.clear();

        let all = repo.recent_events(&EventFilter::new(), 10);
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].event_type.name(), "context_cleared");

        let failures = repo.recent_events(&EventFilter::new().of_type("query_failed"), 10);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].context_id, Some(repo.context_id()));
    }
}
