//! Shared application state handed to every handler.

use std::sync::Arc;

use crate::services::{exchange_service::ExchangeCoordinator, notifier::Notifier};

/// Built once at startup and cloned into handlers by Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<ExchangeCoordinator>,
    pub notifier: Notifier,

    /// Source points per target point
    pub exchange_rate: i64,

    /// SHA-256 hex of the accepted bearer key; `None` disables authentication
    pub api_key_hash: Option<Arc<str>>,
}
