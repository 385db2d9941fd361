//! Balance lookup handler.
//!
//! - GET /api/v1/balances/{store}/{user_key} - points held in one store

use axum::{
    Json,
    extract::{Path, State},
};

use crate::{
    error::AppError,
    models::balance::{BalanceResponse, StoreId, UserKey},
    state::AppState,
};

/// Get a user's balance in one store.
///
/// # URL Parameters
///
/// - `store` - `source` or `target`
/// - `user_key` - the user's external id
///
/// # Response
///
/// - **Success (200 OK)**: `{"store": "source", "user_key": 42, "points": 1000}`
/// - **Error (404)**: user has no record in that store
/// - **Error (503)**: store unreachable or timed out
pub async fn get_balance(
    State(state): State<AppState>,
    Path((store, user_key)): Path<(StoreId, UserKey)>,
) -> Result<Json<BalanceResponse>, AppError> {
    let points = state
        .coordinator
        .balance(store, user_key)
        .await?
        .ok_or(AppError::UserNotFound(store))?;

    Ok(Json(BalanceResponse {
        store,
        user_key,
        points,
    }))
}
