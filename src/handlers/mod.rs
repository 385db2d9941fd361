//! HTTP request handlers and the router that wires them.
//!
//! Each handler is an async function that:
//! 1. Receives HTTP request data (JSON body, URL params)
//! 2. Calls the exchange coordinator
//! 3. Returns a JSON response or an `AppError`

use axum::{
    Router, middleware as axum_middleware,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

use crate::{middleware, state::AppState};

/// Balance lookup endpoint
pub mod balances;
/// Exchange endpoint
pub mod exchanges;
/// Health check endpoint
pub mod health;

/// Build the application router.
///
/// `/health` is public; everything under `/api/v1` goes through the API key check.
pub fn router(state: AppState) -> Router {
    let authenticated_routes = Router::new()
        .route(
            "/api/v1/balances/{store}/{user_key}",
            get(balances::get_balance),
        )
        .route("/api/v1/exchanges", post(exchanges::create_exchange))
        .route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::auth::auth_middleware,
        ));

    Router::new()
        .route("/health", get(health::health_check))
        .merge(authenticated_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
