//! Store connection pools and their lifecycle.
//!
//! This module provides utilities for:
//! - Creating one PostgreSQL connection pool per store from its connection profile
//! - Scoped connection acquisition and transactional scopes
//! - Draining and closing both pools on shutdown

use std::time::Duration;

use sqlx::{
    Pool, Postgres, Transaction,
    pool::PoolConnection,
    postgres::{PgConnectOptions, PgPoolOptions},
};

use crate::{
    config::StoreConfig,
    error::{ConnectionError, StoreError},
    models::balance::{StoreId, UserKey},
    services::balance_service,
};

/// Type alias for PostgreSQL connection pool.
pub type DbPool = Pool<Postgres>;

/// Pool sizing shared by both stores.
#[derive(Debug, Clone, Copy)]
pub struct PoolSettings {
    /// Upper bound on simultaneous connections per store
    pub max_connections: u32,
    /// How long an acquire may queue when the pool is exhausted
    pub acquire_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 5,
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

/// Create a new PostgreSQL connection pool for one store.
///
/// The pool connects eagerly, so an unreachable server or bad credentials fail here
/// instead of on the first exchange.
///
/// # Errors
///
/// Returns an error if:
/// - Cannot connect to PostgreSQL server
/// - Database authentication fails
pub async fn create_pool(
    profile: &StoreConfig,
    settings: PoolSettings,
) -> Result<DbPool, sqlx::Error> {
    let options = PgConnectOptions::new()
        .host(&profile.host)
        .port(profile.port)
        .username(&profile.user)
        .password(&profile.password)
        .database(&profile.database);

    PgPoolOptions::new()
        .max_connections(settings.max_connections)
        .acquire_timeout(settings.acquire_timeout)
        .connect_with(options)
        .await
}

/// Owns the source and target pools.
///
/// Constructed once at startup and shared by reference; there is no global pool state.
/// Statements run in autocommit mode unless issued through [`StoreManager::begin`],
/// which is how debit and credit get explicit transaction control.
#[derive(Debug, Clone)]
pub struct StoreManager {
    source: DbPool,
    target: DbPool,
}

impl StoreManager {
    /// Open both pools.
    ///
    /// Fails if either store cannot be reached; the service must not run with only
    /// one usable store. If the target fails, the already-open source pool is closed.
    pub async fn initialize(
        source: &StoreConfig,
        target: &StoreConfig,
        settings: PoolSettings,
    ) -> Result<Self, ConnectionError> {
        let source_pool =
            create_pool(source, settings)
                .await
                .map_err(|e| ConnectionError {
                    store: StoreId::Source,
                    source: e,
                })?;
        tracing::info!(host = %source.host, database = %source.database, "Source pool created");

        let target_pool = match create_pool(target, settings).await {
            Ok(pool) => pool,
            Err(e) => {
                source_pool.close().await;
                return Err(ConnectionError {
                    store: StoreId::Target,
                    source: e,
                });
            }
        };
        tracing::info!(host = %target.host, database = %target.database, "Target pool created");

        Ok(Self::from_pools(source_pool, target_pool))
    }

    /// Wrap pools that were created elsewhere.
    pub fn from_pools(source: DbPool, target: DbPool) -> Self {
        Self { source, target }
    }

    pub fn pool(&self, store: StoreId) -> &DbPool {
        match store {
            StoreId::Source => &self.source,
            StoreId::Target => &self.target,
        }
    }

    /// Check out a connection; it goes back to the pool when dropped.
    pub async fn acquire(&self, store: StoreId) -> Result<PoolConnection<Postgres>, StoreError> {
        Ok(self.pool(store).acquire().await?)
    }

    /// Start a transaction; it rolls back on drop unless committed.
    pub async fn begin(&self, store: StoreId) -> Result<Transaction<'static, Postgres>, StoreError> {
        Ok(self.pool(store).begin().await?)
    }

    /// Current balance of `user_key` in `store`, `None` if the user has no record there.
    pub async fn get_balance(
        &self,
        store: StoreId,
        user_key: UserKey,
    ) -> Result<Option<i64>, StoreError> {
        balance_service::get_balance(self.pool(store), user_key).await
    }

    /// Close both pools, waiting for checked-out connections to come back.
    ///
    /// Safe to call more than once.
    pub async fn shutdown(&self) {
        for store in [StoreId::Source, StoreId::Target] {
            let pool = self.pool(store);
            if pool.is_closed() {
                continue;
            }
            pool.close().await;
            tracing::info!(store = %store, "Store pool closed");
        }
    }
}
