//! Application configuration management.
//!
//! This module handles loading configuration from environment variables.
//! It uses the `envy` crate to deserialize environment variables into type-safe structs:
//! one for the application itself and one per store connection profile.

use std::time::Duration;

use serde::Deserialize;

use crate::models::balance::StoreId;

/// Errors raised while loading configuration. Always fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A variable is missing or cannot be parsed.
    #[error("Failed to read {section} configuration: {source}")]
    Env {
        section: &'static str,
        #[source]
        source: envy::Error,
    },

    /// A value parsed but is out of range or malformed.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Application configuration loaded from environment variables.
///
/// # Environment Variables
///
/// - `EXCHANGE_RATE` (required): source units per one target unit, at least 1
/// - `SERVER_PORT` (optional): HTTP server port, defaults to 3000
/// - `STORE_TIMEOUT_MS` (optional): per store call timeout, defaults to 5000
/// - `MAX_CONNECTIONS` (optional): pool size per store, defaults to 5
/// - `API_KEY_HASH` (optional): SHA-256 hex of the bearer key guarding `/api/v1`
/// - `NOTIFY_WEBHOOK_URLS` / `ALERT_WEBHOOK_URLS` (optional): comma-separated URLs
/// - `WEBHOOK_SECRET` (optional): HMAC key for webhook signatures
/// - `IDEMPOTENCY_TTL_SECS` (optional): replay window, defaults to one day
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub exchange_rate: i64,

    #[serde(default = "default_port")]
    pub server_port: u16,

    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    #[serde(default)]
    pub api_key_hash: Option<String>,

    #[serde(default)]
    pub notify_webhook_urls: Vec<String>,

    #[serde(default)]
    pub alert_webhook_urls: Vec<String>,

    #[serde(default)]
    pub webhook_secret: Option<String>,

    #[serde(default = "default_idempotency_ttl_secs")]
    pub idempotency_ttl_secs: u64,
}

/// Connection profile for one store, read with a `SOURCE_DB_` or `TARGET_DB_` prefix.
#[derive(Clone, Deserialize)]
pub struct StoreConfig {
    pub host: String,

    #[serde(default = "default_db_port")]
    pub port: u16,

    pub user: String,
    pub password: String,
    pub database: String,
}

// Keeps the password out of logs.
impl std::fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .finish()
    }
}

/// Everything the service needs at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    pub app: Config,
    pub source: StoreConfig,
    pub target: StoreConfig,
}

fn default_port() -> u16 {
    3000
}

fn default_store_timeout_ms() -> u64 {
    5000
}

fn default_max_connections() -> u32 {
    5
}

fn default_idempotency_ttl_secs() -> u64 {
    86_400
}

fn default_db_port() -> u16 {
    5432
}

/// Environment prefix for a store profile.
pub fn store_prefix(store: StoreId) -> &'static str {
    match store {
        StoreId::Source => "SOURCE_DB_",
        StoreId::Target => "TARGET_DB_",
    }
}

impl Config {
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn idempotency_ttl(&self) -> Duration {
        Duration::from_secs(self.idempotency_ttl_secs)
    }

    /// Check ranges that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.exchange_rate < 1 {
            return Err(ConfigError::Invalid(format!(
                "EXCHANGE_RATE must be at least 1, got {}",
                self.exchange_rate
            )));
        }
        if self.store_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "STORE_TIMEOUT_MS must be positive".to_string(),
            ));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "MAX_CONNECTIONS must be positive".to_string(),
            ));
        }
        if let Some(hash) = &self.api_key_hash
            && (hash.len() != 64 || !hash.chars().all(|c| c.is_ascii_hexdigit()))
        {
            return Err(ConfigError::Invalid(
                "API_KEY_HASH must be 64 hex characters".to_string(),
            ));
        }
        for url in self.notify_webhook_urls.iter().chain(&self.alert_webhook_urls) {
            validate_webhook_url(url)?;
        }
        Ok(())
    }
}

impl StoreConfig {
    fn validate(&self, store: StoreId) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() || self.database.trim().is_empty() {
            return Err(ConfigError::Invalid(format!(
                "{store} store profile needs a host and a database"
            )));
        }
        Ok(())
    }
}

impl Settings {
    /// Load configuration from environment variables.
    ///
    /// This method first attempts to load a `.env` file (which is optional),
    /// then reads the application variables and both prefixed store profiles.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Required environment variables are missing (e.g., EXCHANGE_RATE, SOURCE_DB_HOST)
    /// - Values cannot be parsed or fail validation
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_vars(std::env::vars())
    }

    /// Build settings from an explicit set of variables.
    pub fn from_vars<I>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let vars: Vec<(String, String)> = vars.into_iter().collect();

        let app = envy::from_iter::<_, Config>(vars.clone())
            .map_err(|source| ConfigError::Env {
                section: "application",
                source,
            })?;
        app.validate()?;

        let source = load_store(StoreId::Source, &vars)?;
        let target = load_store(StoreId::Target, &vars)?;

        Ok(Self {
            app,
            source,
            target,
        })
    }
}

fn load_store(store: StoreId, vars: &[(String, String)]) -> Result<StoreConfig, ConfigError> {
    let profile = envy::prefixed(store_prefix(store))
        .from_iter::<_, StoreConfig>(vars.iter().cloned())
        .map_err(|source| ConfigError::Env {
            section: store.as_str(),
            source,
        })?;
    profile.validate(store)?;
    Ok(profile)
}

/// Validate webhook URL format.
///
/// # Rules
///
/// - Must be valid URL
/// - Must be HTTPS (HTTP localhost allowed for development)
/// - Maximum 2048 characters
pub fn validate_webhook_url(url: &str) -> Result<(), ConfigError> {
    if url.len() > 2048 {
        return Err(ConfigError::Invalid(
            "Webhook URL exceeds 2048 characters".to_string(),
        ));
    }

    let parsed = url::Url::parse(url)
        .map_err(|_| ConfigError::Invalid(format!("Invalid webhook URL: {url}")))?;

    match parsed.scheme() {
        "https" => Ok(()),
        "http" => match parsed.host_str() {
            Some("localhost") | Some("127.0.0.1") | Some("0.0.0.0") => Ok(()),
            _ => Err(ConfigError::Invalid(format!(
                "HTTP webhooks are only allowed for localhost: {url}"
            ))),
        },
        _ => Err(ConfigError::Invalid(format!(
            "Webhook URL must use HTTP or HTTPS: {url}"
        ))),
    }
}
