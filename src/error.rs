//! Error types and HTTP error response handling.
//!
//! This module defines the error taxonomy of the exchange core and how errors
//! are converted into HTTP responses with appropriate status codes and JSON bodies.
//!
//! # Error Categories
//!
//! - **Startup Errors**: `ConfigError` (see `config`) and `ConnectionError`, both fatal
//! - **Store Errors**: `StoreError`, raised by a single store call
//! - **Exchange Errors**: `ExchangeError`, the terminal failure outcome of an exchange
//! - **HTTP Errors**: `AppError`, everything a handler can return

use std::time::Duration;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;

use crate::models::balance::StoreId;

/// A store pool could not be established at startup.
#[derive(Debug, thiserror::Error)]
#[error("Failed to connect to {store} store: {source}")]
pub struct ConnectionError {
    pub store: StoreId,
    #[source]
    pub source: sqlx::Error,
}

/// Failure of one call against a balance store.
///
/// These never reach end users; the coordinator folds them into an `ExchangeError`.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Query, connection or pool error from sqlx.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The call did not finish within the configured store timeout.
    #[error("Store call timed out after {0:?}")]
    Timeout(Duration),

    /// A conditional update did not touch exactly one row.
    #[error("Expected exactly one row to change, {0} changed")]
    RowCount(u64),

    /// Failure injected or reported by a non-SQL store.
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Terminal failure of an exchange attempt.
///
/// Every variant has a stable `code()` and a `user_message()` that never contains
/// raw database text. `CompensationFailed` is critical and must not be treated as
/// an ordinary retryable error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExchangeError {
    // === Validation (nothing touched) ===
    #[error("Invalid exchange request: {0}")]
    InvalidRequest(String),

    #[error("User not found in {store} store")]
    UserNotFound { store: StoreId },

    #[error("Insufficient balance (current: {current})")]
    InsufficientBalance { current: i64 },

    #[error("Amount converts to zero (minimum required: {minimum_required})")]
    ZeroConversionAmount { minimum_required: i64 },

    #[error("{store} store unavailable during validation")]
    StoreUnavailable { store: StoreId },

    #[error("Idempotency key already used for a different exchange")]
    IdempotencyKeyReused,

    // === Mutation ===
    #[error("Debit of source points failed")]
    DebitFailed,

    #[error("Credit of target points failed, source points restored")]
    CreditFailed,

    #[error("Credit failed and source refund failed, balances inconsistent")]
    CompensationFailed,
}

impl ExchangeError {
    /// Error code for API responses and logs
    pub fn code(&self) -> &'static str {
        match self {
            ExchangeError::InvalidRequest(_) => "INVALID_REQUEST",
            ExchangeError::UserNotFound {
                store: StoreId::Source,
            } => "SOURCE_USER_NOT_FOUND",
            ExchangeError::UserNotFound {
                store: StoreId::Target,
            } => "TARGET_USER_NOT_FOUND",
            ExchangeError::InsufficientBalance { .. } => "INSUFFICIENT_BALANCE",
            ExchangeError::ZeroConversionAmount { .. } => "ZERO_CONVERSION_AMOUNT",
            ExchangeError::StoreUnavailable { .. } => "STORE_UNAVAILABLE",
            ExchangeError::IdempotencyKeyReused => "IDEMPOTENCY_KEY_REUSED",
            ExchangeError::DebitFailed => "DEBIT_FAILED",
            ExchangeError::CreditFailed => "CREDIT_FAILED",
            ExchangeError::CompensationFailed => "EXCHANGE_FAILED",
        }
    }

    /// HTTP status code suggestion
    pub fn http_status(&self) -> StatusCode {
        match self {
            ExchangeError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ExchangeError::UserNotFound { .. } => StatusCode::NOT_FOUND,
            ExchangeError::IdempotencyKeyReused => StatusCode::CONFLICT,
            ExchangeError::InsufficientBalance { .. }
            | ExchangeError::ZeroConversionAmount { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            ExchangeError::StoreUnavailable { .. }
            | ExchangeError::DebitFailed
            | ExchangeError::CreditFailed => StatusCode::SERVICE_UNAVAILABLE,
            ExchangeError::CompensationFailed => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to show to the end user.
    pub fn user_message(&self) -> String {
        match self {
            ExchangeError::InvalidRequest(reason) => format!("Invalid exchange request: {reason}"),
            ExchangeError::UserNotFound {
                store: StoreId::Source,
            } => "You are not registered with the source service, or your account is not linked."
                .to_string(),
            ExchangeError::UserNotFound {
                store: StoreId::Target,
            } => "You are not registered with the target service, or your account is not linked."
                .to_string(),
            ExchangeError::InsufficientBalance { current } => {
                format!("Not enough source points. Current balance: {current}")
            }
            ExchangeError::ZeroConversionAmount { minimum_required } => format!(
                "Amount too small. At least {minimum_required} source points are needed for 1 target point."
            ),
            ExchangeError::StoreUnavailable { .. } => {
                "The service is temporarily unavailable. Please try again later.".to_string()
            }
            ExchangeError::IdempotencyKeyReused => {
                "This request id was already used for a different exchange.".to_string()
            }
            ExchangeError::DebitFailed => {
                "Exchange failed while deducting source points. Nothing was changed, please try again."
                    .to_string()
            }
            ExchangeError::CreditFailed => {
                "Exchange failed while adding target points. Your source points were restored, please try again later."
                    .to_string()
            }
            ExchangeError::CompensationFailed => {
                "Exchange failed. Please contact an administrator.".to_string()
            }
        }
    }

    /// Balances are known to be unchanged and the same request may be sent again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExchangeError::StoreUnavailable { .. }
                | ExchangeError::DebitFailed
                | ExchangeError::CreditFailed
        )
    }

    /// Balances are inconsistent and need manual reconciliation.
    pub fn is_critical(&self) -> bool {
        matches!(self, ExchangeError::CompensationFailed)
    }
}

/// Application-wide error type for HTTP handlers.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// Terminal failure of an exchange.
    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    /// A store call failed outside of an exchange (balance lookup, health check).
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// API key is missing or does not match.
    ///
    /// Returns HTTP 401 Unauthorized.
    #[error("Invalid API key")]
    InvalidApiKey,

    /// No balance record for this user in the requested store.
    ///
    /// Returns HTTP 404 Not Found.
    #[error("User not found in {0} store")]
    UserNotFound(StoreId),

    /// Request body or parameters are invalid.
    ///
    /// Returns HTTP 400 Bad Request.
    #[error("Invalid request")]
    InvalidRequest(String),
}

/// Convert AppError into an HTTP response.
///
/// # Response Format
///
/// ```json
/// {
///   "error": {
///     "code": "error_type",
///     "message": "Human-readable error message"
///   }
/// }
/// ```
///
/// Store errors become 503 with a generic message; database details stay in the logs.
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            AppError::Exchange(ref e) => (e.http_status(), e.code(), e.user_message()),
            AppError::InvalidApiKey => (
                StatusCode::UNAUTHORIZED,
                "INVALID_API_KEY",
                self.to_string(),
            ),
            AppError::UserNotFound(store) => (
                StatusCode::NOT_FOUND,
                ExchangeError::UserNotFound { store }.code(),
                ExchangeError::UserNotFound { store }.user_message(),
            ),
            AppError::InvalidRequest(ref msg) => {
                (StatusCode::BAD_REQUEST, "INVALID_REQUEST", msg.clone())
            }
            AppError::Store(ref e) => {
                tracing::warn!(error = %e, "Store call failed");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "STORE_UNAVAILABLE",
                    "The service is temporarily unavailable. Please try again later.".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message
            }
        }));

        (status, body).into_response()
    }
}
