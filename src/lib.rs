//! Points Exchange Service
//!
//! Converts a user's points held in one Postgres store (the source) into points in a
//! second, independent store (the target) at a fixed integer rate. The two stores
//! share no transaction, so an exchange is a small saga: debit the source, credit the
//! target, and refund the source once if the credit fails.
//!
//! # Layout
//!
//! - [`config`]: environment configuration for the service and both store profiles
//! - [`db`]: connection pools and the store manager
//! - [`store`]: the `BalanceStore` seam the coordinator runs against
//! - [`services`]: exchange coordinator, per-user locks, SQL statements, notifier
//! - [`handlers`] / [`middleware`]: the HTTP surface

pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod state;
pub mod store;

pub use error::{AppError, ExchangeError, StoreError};
pub use services::exchange_service::{ExchangeCoordinator, ExchangeOutcome};
pub use state::AppState;
