//! Exchange handler.
//!
//! - POST /api/v1/exchanges - convert source points into target points

use axum::{Json, extract::State};

use crate::{
    error::AppError,
    models::exchange::{CreateExchangeRequest, ExchangeRequest, ExchangeResponse},
    state::AppState,
};

/// Maximum accepted idempotency key length.
const MAX_IDEMPOTENCY_KEY_LEN: usize = 128;

/// Exchange source points at the configured rate.
///
/// # Request Body
///
/// ```json
/// {
///   "user_key": 123456789,
///   "source_amount": 100,
///   "idempotency_key": "tg-callback-8812"
/// }
/// ```
///
/// # Response (200)
///
/// ```json
/// {
///   "exchange_id": "770e8400-...",
///   "user_key": 123456789,
///   "debited": 100,
///   "credited": 20,
///   "completed_at": "2025-12-21T16:00:00Z"
/// }
/// ```
///
/// Failures return `{"error": {"code": ..., "message": ...}}`; see `ExchangeError`.
/// Completed exchanges are announced through the notifier. Failed compensations are
/// alerted by the coordinator itself, whether or not this request is still connected.
pub async fn create_exchange(
    State(state): State<AppState>,
    Json(request): Json<CreateExchangeRequest>,
) -> Result<Json<ExchangeResponse>, AppError> {
    if let Some(key) = &request.idempotency_key
        && (key.is_empty() || key.len() > MAX_IDEMPOTENCY_KEY_LEN)
    {
        return Err(AppError::InvalidRequest(format!(
            "idempotency_key must be 1 to {MAX_IDEMPOTENCY_KEY_LEN} characters"
        )));
    }

    let exchange = ExchangeRequest {
        user_key: request.user_key,
        source_amount: request.source_amount,
        rate: state.exchange_rate,
        idempotency_key: request.idempotency_key,
    };

    let receipt = state.coordinator.exchange(exchange).await?;
    if !receipt.replayed {
        state.notifier.exchange_completed(&receipt);
    }
    Ok(Json(receipt.into()))
}
