//! Repository contracts.
//!
//! Three layers, each extending the previous one:
//!
//! - **Repository**: identity-based access to a collection of entities.
//! - **DatabaseRepository**: adds primary-key access and explicit control
//!   over the unit of work (persist, merge, flush, refresh).
//! - **EntityAccess**: adds named queries and `clear`.
//!
//! The three type roles are expressed as associated types:
//! `Repository::Entity`, and through it `Entity::Id` and
//! `Entity::PrimaryKey`. Use [`EntityId`] and [`PrimaryKeyOf`] to name them.
//!
//! None of these traits prescribe a storage engine. Implementations surface
//! every engine failure unchanged.

use crate::entity::Entity;
use crate::errors::AccessResult;
use crate::query::NamedArgs;
use crate::types::QueryValue;

/// Identifier type of a repository's entity.
pub type EntityId<R> = <<R as Repository>::Entity as Entity>::Id;

/// Primary-key type of a repository's entity.
pub type PrimaryKeyOf<R> = <<R as Repository>::Entity as Entity>::PrimaryKey;

/// Identity-based access to a collection of entities.
pub trait Repository {
    /// The entity type this repository manages.
    type Entity: Entity;

    /// Find an entity by its domain identifier.
    ///
    /// Attached state wins over stored state. Returns `None` if unknown or
    /// pending removal.
    fn find(&self, id: &<Self::Entity as Entity>::Id) -> AccessResult<Option<Self::Entity>>;

    /// Every entity, in store order.
    fn find_all(&self) -> AccessResult<Vec<Self::Entity>>;

    /// Add or update an entity in the unit of work.
    ///
    /// The change reaches storage on the next flush.
    fn store(&self, entity: Self::Entity) -> AccessResult<Self::Entity>;

    /// Schedule removal of the entity with this identifier.
    fn remove(&self, id: &<Self::Entity as Entity>::Id) -> AccessResult<()>;

    /// Whether the entity is attached to the current unit of work.
    fn contains(&self, entity: &Self::Entity) -> AccessResult<bool>;
}

/// Repository backed by a database with a managed unit of work.
pub trait DatabaseRepository: Repository {
    /// Find an entity by primary key.
    fn find_by_primary_key(
        &self,
        pk: &<Self::Entity as Entity>::PrimaryKey,
    ) -> AccessResult<Option<Self::Entity>>;

    /// Schedule removal of the entity stored under this key.
    fn remove_by_primary_key(
        &self,
        pk: &<Self::Entity as Entity>::PrimaryKey,
    ) -> AccessResult<()>;

    /// Register a new entity. Fails if the key or identifier is already taken.
    fn persist(&self, entity: Self::Entity) -> AccessResult<()>;

    /// Copy the entity's state onto its managed instance and return it.
    fn merge(&self, entity: Self::Entity) -> AccessResult<Self::Entity>;

    /// Write every pending change to storage.
    fn flush(&self) -> AccessResult<()>;

    /// Reload an entity from storage, discarding its unflushed changes.
    fn refresh(
        &self,
        pk: &<Self::Entity as Entity>::PrimaryKey,
    ) -> AccessResult<Self::Entity>;
}

/// Generic, query-driven access to one entity type.
///
/// Named queries are resolved against a catalog of pre-registered queries.
/// Arguments bind either positionally (declaration order) or by name.
pub trait EntityAccess: DatabaseRepository {
    /// Clear the persistence context, causing all managed entities to
    /// become detached.
    ///
    /// Changes made to entities that have not been flushed to storage will
    /// not be persisted. Clearing an empty context does nothing.
    fn clear(&self);

    /// Find every entity matching the named query, binding `args` to the
    /// declared parameters in order.
    ///
    /// Results come back in store order unless the query declares its own.
    /// No match is an empty vector, not an error.
    ///
    /// # Errors
    ///
    /// `QUERY_NOT_FOUND` for an unregistered name, `PARAMETER_MISMATCH` when
    /// the count or types of `args` do not fit, and any store failure.
    fn find_by_named_query(
        &self,
        query_name: &str,
        args: &[QueryValue],
    ) -> AccessResult<Vec<Self::Entity>>;

    /// Find every entity matching the named query, binding `args` by name.
    ///
    /// Keys must match the declared parameters exactly; extra or missing
    /// keys fail with `PARAMETER_MISMATCH`.
    fn find_by_named_query_with(
        &self,
        query_name: &str,
        args: &NamedArgs,
    ) -> AccessResult<Vec<Self::Entity>>;

    /// Find a single entity using the named query and positional arguments.
    ///
    /// Returns `None` if nothing matches. If several rows match, one of them
    /// is returned and no error is raised.
    fn find_instance_by_named_query(
        &self,
        query_name: &str,
        args: &[QueryValue],
    ) -> AccessResult<Option<Self::Entity>>;

    /// Find a single entity using the named query and named arguments.
    ///
    /// Same result semantics as [`find_instance_by_named_query`], executed in
    /// a read-only scope: no write may happen for the duration of the call.
    ///
    /// [`find_instance_by_named_query`]: EntityAccess::find_instance_by_named_query
    fn find_instance_by_named_query_with(
        &self,
        query_name: &str,
        args: &NamedArgs,
    ) -> AccessResult<Option<Self::Entity>>;
}
