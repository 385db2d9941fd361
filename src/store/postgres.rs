//! PostgreSQL-backed balance store.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

use super::BalanceStore;
use crate::{
    db::StoreManager,
    error::StoreError,
    models::balance::{StoreId, UserKey},
    services::balance_service,
};

/// One side of the [`StoreManager`], with every call bounded by `timeout`.
///
/// When a call times out its future is dropped; an open transaction is rolled back
/// and the connection returns to the pool.
#[derive(Debug, Clone)]
pub struct PgBalanceStore {
    stores: StoreManager,
    id: StoreId,
    timeout: Duration,
}

impl PgBalanceStore {
    pub fn new(stores: StoreManager, id: StoreId, timeout: Duration) -> Self {
        Self {
            stores,
            id,
            timeout,
        }
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>> + Send,
    {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| StoreError::Timeout(self.timeout))?
    }
}

#[async_trait]
impl BalanceStore for PgBalanceStore {
    fn id(&self) -> StoreId {
        self.id
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.bounded(async {
            let mut conn = self.stores.acquire(self.id).await?;
            sqlx::query("SELECT 1").execute(&mut *conn).await?;
            Ok(())
        })
        .await
    }

    async fn get_points(&self, user_key: UserKey) -> Result<Option<i64>, StoreError> {
        self.bounded(self.stores.get_balance(self.id, user_key))
            .await
    }

    async fn debit(&self, user_key: UserKey, amount: i64) -> Result<(), StoreError> {
        self.bounded(async {
            let mut tx = self.stores.begin(self.id).await?;
            match balance_service::debit_points(&mut *tx, user_key, amount).await {
                Ok(()) => {
                    tx.commit().await?;
                    Ok(())
                }
                Err(e) => {
                    tx.rollback().await?;
                    Err(e)
                }
            }
        })
        .await
    }

    async fn credit(&self, user_key: UserKey, amount: i64) -> Result<(), StoreError> {
        self.bounded(async {
            let mut tx = self.stores.begin(self.id).await?;
            match balance_service::credit_points(&mut *tx, user_key, amount).await {
                Ok(()) => {
                    tx.commit().await?;
                    Ok(())
                }
                Err(e) => {
                    tx.rollback().await?;
                    Err(e)
                }
            }
        })
        .await
    }
}
