//! The entity abstraction every repository is parameterized over.
//!
//! An entity plays three roles at once:
//!
//! - **the entity type** itself (`Self`),
//! - **its identifier** (`Entity::Id`): the domain identity, unique in the store,
//! - **its primary key** (`Entity::PrimaryKey`): the storage key rows live under.
//!
//! Many entities use the same value for both; they are kept apart so a
//! surrogate key can back a natural identifier.

use std::fmt::Debug;
use std::hash::Hash;

/// A persisted domain object.
pub trait Entity: Clone + Send + Sync + 'static {
    /// Domain identifier, unique within the store.
    type Id: Clone + Eq + Hash + Debug + Send + Sync;

    /// Storage primary key. Ordering defines the store's natural row order.
    type PrimaryKey: Clone + Ord + Hash + Debug + Send + Sync;

    /// The domain identifier of this entity.
    fn id(&self) -> Self::Id;

    /// The key this entity is stored under.
    fn primary_key(&self) -> Self::PrimaryKey;

    /// Entities compare by identity, not by attributes.
    fn same_identity_as(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone)]
    struct Account {
        number: String,
        row: u32,
        balance: i64,
    }

    impl Entity for Account {
        type Id = String;
        type PrimaryKey = u32;

        fn id(&self) -> String {
            self.number.clone()
        }

        fn primary_key(&self) -> u32 {
            self.row
        }
    }

    #[test]
    fn test_identity_ignores_attributes() {
        let a = Account {
            number: "SE-1".into(),
            row: 1,
            balance: 10,
        };
        let mut b = a.clone();
        b.balance = 99;
        assert!(a.same_identity_as(&b));

        let c = Account {
            number: "SE-2".into(),
            row: 2,
            balance: 10,
        };
        assert!(!a.same_identity_as(&c));
    }
}
