//! # Entity Access Contracts
//!
//! Generic, query-driven data access over a persistence engine's managed
//! entity session.
//!
//! This crate defines:
//!
//! - **Entity trait**: the three type roles (entity, identifier, primary key)
//! - **Repository / DatabaseRepository / EntityAccess traits**: the access
//!   contracts, from identity lookups up to named queries and `clear`
//! - **QueryCatalog**: a typed registry of compiled named queries, validated
//!   at registration
//! - **PersistenceContext**: the identity map of one unit of work, with
//!   attach/detach semantics and a scoped read-only guard
//! - **MemoryStore / MemoryRepository**: an in-memory reference engine that
//!   satisfies the contracts
//! - **Events**: structured repository events for observability
//! - **Errors**: one error type with machine-readable codes
//!
//! ## Usage
//!
//! ```rust
//! use entity_access_contracts::prelude::*;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! #[derive(Debug, Clone)]
//! struct Person {
//!     pk: u64,
//!     last_name: String,
//! }
//!
//! impl Entity for Person {
//!     type Id = u64;
//!     type PrimaryKey = u64;
//!
//!     fn id(&self) -> u64 {
//!         self.pk
//!     }
//!
//!     fn primary_key(&self) -> u64 {
//!         self.pk
//!     }
//! }
//!
//! let store = Arc::new(MemoryStore::with_rows([
//!     Person { pk: 1, last_name: "Smith".into() },
//!     Person { pk: 2, last_name: "Jones".into() },
//! ]));
//! let catalog = Arc::new(QueryCatalog::new());
//! catalog
//!     .define(
//!         NamedQuery::builder("Person.byLastName")
//!             .param("lastName", ParamType::String)
//!             .filter(|p: &Person, b| b.get_str("lastName") == Some(p.last_name.as_str())),
//!     )
//!     .unwrap();
//!
//! let repo = MemoryRepository::new(store, catalog);
//! let smiths = repo
//!     .find_by_named_query("Person.byLastName", &[json!("Smith")])
//!     .unwrap();
//! assert_eq!(smiths.len(), 1);
//! ```
//!
//! ## Failure model
//!
//! Nothing here retries or masks errors. An unknown query name is
//! `QUERY_NOT_FOUND`, arguments that do not fit the declared parameters are
//! `PARAMETER_MISMATCH`, and store failures propagate unchanged.

pub mod config;
pub mod context;
pub mod entity;
pub mod errors;
pub mod events;
pub mod memory;
pub mod query;
pub mod repository;
pub mod store;
pub mod types;

// Re-export everything in prelude for convenience
pub mod prelude {
    pub use crate::config::*;
    pub use crate::context::*;
    pub use crate::entity::*;
    pub use crate::errors::*;
    pub use crate::events::*;
    pub use crate::memory::*;
    pub use crate::query::*;
    pub use crate::repository::*;
    pub use crate::store::*;
    pub use crate::types::*;
}

// Also re-export at crate root
pub use prelude::*;
