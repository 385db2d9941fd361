//! Points Exchange Service - Main Application Entry Point
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment variables
//! 2. Open both store pools (fails fast if either is unreachable)
//! 3. Build the exchange coordinator and notifier
//! 4. Serve HTTP until Ctrl-C or SIGTERM
//! 5. Close both pools

use std::{sync::Arc, time::Duration};

use points_exchange::{
    AppState, ExchangeCoordinator,
    config::Settings,
    db::{PoolSettings, StoreManager},
    handlers,
    models::balance::StoreId,
    services::notifier::Notifier,
    store::PgBalanceStore,
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Reads RUST_LOG (defaults to "info")
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let settings = Settings::from_env()?;
    let config = settings.app;
    tracing::info!(rate = config.exchange_rate, "Configuration loaded");

    let stores = StoreManager::initialize(
        &settings.source,
        &settings.target,
        PoolSettings {
            max_connections: config.max_connections,
            acquire_timeout: config.store_timeout(),
        },
    )
    .await?;

    let notifier = Notifier::new(
        config.notify_webhook_urls.clone(),
        config.alert_webhook_urls.clone(),
        config.webhook_secret.clone(),
    )?;

    let timeout = config.store_timeout();
    let coordinator = ExchangeCoordinator::with_idempotency_ttl(
        Arc::new(PgBalanceStore::new(stores.clone(), StoreId::Source, timeout)),
        Arc::new(PgBalanceStore::new(stores.clone(), StoreId::Target, timeout)),
        config.idempotency_ttl(),
    )
    .with_alerts(Arc::new(notifier.clone()));

    let api_key_hash = config
        .api_key_hash
        .as_deref()
        .map(|h| Arc::from(h.to_ascii_lowercase()));
    if api_key_hash.is_none() {
        tracing::warn!("API_KEY_HASH not set, /api/v1 routes are unauthenticated");
    }

    let coordinator = Arc::new(coordinator);
    let state = AppState {
        coordinator: Arc::clone(&coordinator),
        notifier,
        exchange_rate: config.exchange_rate,
        api_key_hash,
    };
    let app = handlers::router(state);

    let addr = format!("0.0.0.0:{}", config.server_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    // Sagas outlive their requests; let them settle before the pools close.
    if !coordinator.wait_idle(Duration::from_secs(10)).await {
        tracing::error!("Exchanges still in flight at shutdown");
    }
    stores.shutdown().await;
    tracing::info!("Shutdown complete");

    served?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
