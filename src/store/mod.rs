//! Balance Stores
//!
//! The exchange coordinator talks to each store through the [`BalanceStore`] trait.
//! Production uses [`PgBalanceStore`]; tests use the in-memory `MockStore`.

pub mod postgres;

pub use postgres::PgBalanceStore;

use async_trait::async_trait;

use crate::{
    error::StoreError,
    models::balance::{StoreId, UserKey},
};

/// Point operations on one store.
///
/// `debit` and `credit` each run in their own transaction and either commit a change
/// to exactly one row or leave the store untouched. Implementations bound every call
/// with a timeout and report it as [`StoreError::Timeout`].
#[async_trait]
pub trait BalanceStore: Send + Sync {
    /// Which store this is, for logging and error reporting
    fn id(&self) -> StoreId;

    /// Cheap connectivity check
    async fn ping(&self) -> Result<(), StoreError>;

    /// Current points, `None` if the user has no record here
    async fn get_points(&self, user_key: UserKey) -> Result<Option<i64>, StoreError>;

    /// Remove `amount` points and commit
    async fn debit(&self, user_key: UserKey, amount: i64) -> Result<(), StoreError>;

    /// Add `amount` points and commit
    ///
    /// Also used to refund a committed debit during compensation.
    async fn credit(&self, user_key: UserKey, amount: i64) -> Result<(), StoreError>;
}


#[cfg(test)]
pub use mock::MockStore;
