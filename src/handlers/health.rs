//! Health check endpoint for service monitoring.

use axum::{Json, extract::State, http::StatusCode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{error::StoreError, models::balance::StoreId, state::AppState};

/// Health check response.
///
/// Returns service status and connectivity of both stores.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// "healthy" when both stores answer, "degraded" otherwise
    pub status: String,

    /// Source store connection status
    pub source: String,

    /// Target store connection status
    pub target: String,

    /// Current server timestamp
    pub timestamp: DateTime<Utc>,
}

/// Health check handler.
///
/// # Response (200 OK)
///
/// ```json
/// {
///   "status": "healthy",
///   "source": "connected",
///   "target": "connected",
///   "timestamp": "2025-12-21T19:00:00Z"
/// }
/// ```
///
/// # Response (503 Service Unavailable)
///
/// Same body with `"status": "degraded"` and the failing store marked `"unreachable"`.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let (source, target) = tokio::join!(
        state.coordinator.ping(StoreId::Source),
        state.coordinator.ping(StoreId::Target),
    );

    let describe = |store: StoreId, result: &Result<(), StoreError>| match result {
        Ok(()) => "connected".to_string(),
        Err(e) => {
            tracing::warn!(store = %store, error = %e, "Health check failed");
            "unreachable".to_string()
        }
    };

    let healthy = source.is_ok() && target.is_ok();
    let body = HealthResponse {
        status: if healthy { "healthy" } else { "degraded" }.to_string(),
        source: describe(StoreId::Source, &source),
        target: describe(StoreId::Target, &target),
        timestamp: Utc::now(),
    };

    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}
