//! Webhook notifier for exchange events.
//!
//! Broadcasts completed exchanges to the configured notification webhooks (for
//! example a relay that posts into chat groups) and raises alerts for failed
//! compensations on the alert webhooks. Delivery never affects the exchange itself.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use rand::seq::IndexedRandom;
use serde::Serialize;
use sha2::Sha256;
use uuid::Uuid;

use super::exchange_service::AlertSink;
use crate::models::{balance::UserKey, exchange::ExchangeReceipt};

type HmacSha256 = Hmac<Sha256>;

/// Lines a completed exchange is announced with. `{user}`, `{debited}` and
/// `{credited}` are substituted.
const CONGRATULATIONS: &[&str] = &[
    "🎉 Another one! User {user} just turned {debited} source points into {credited} target points!",
    "🥳 Smooth combo! User {user}: {debited} source points → {credited} target points. Thanks for the support!",
    "💰 Ding! {credited} target points delivered. Thanks to {user} for feeding the server!",
    "🚀 Exchange complete! User {user} packed {debited} source points into {credited} target points!",
    "🧪 Alchemist {user} strikes again: {debited} source points transmuted into {credited} target points!",
    "📈 Investor {user} restructured {debited} source points into {credited} target points. Sharp eye!",
];

/// Event types sent to webhooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EventType {
    #[serde(rename = "exchange.completed")]
    ExchangeCompleted,
    #[serde(rename = "exchange.compensation_failed")]
    CompensationFailed,
}

/// Body of every webhook request.
///
/// # JSON Example
///
/// ```json
/// {
///   "event_id": "880e8400-e29b-41d4-a716-446655440003",
///   "event_type": "exchange.completed",
///   "user_key": 123456789,
///   "debited": 100,
///   "credited": 20,
///   "message": "🎉 Another one! ...",
///   "created_at": "2025-12-21T16:00:00Z"
/// }
/// ```
#[derive(Debug, Clone, Serialize)]
pub struct WebhookPayload {
    pub event_id: Uuid,
    pub event_type: EventType,
    pub user_key: UserKey,
    pub debited: i64,
    pub credited: i64,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// Sends signed webhook events.
///
/// Cloning is cheap; clones share the HTTP client.
#[derive(Debug, Clone)]
pub struct Notifier {
    client: reqwest::Client,
    notify_urls: Arc<[String]>,
    alert_urls: Arc<[String]>,
    secret: Option<Arc<str>>,
}

impl Notifier {
    /// Build a notifier with a 5 second per-request timeout.
    pub fn new(
        notify_urls: Vec<String>,
        alert_urls: Vec<String>,
        secret: Option<String>,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?;

        Ok(Self {
            client,
            notify_urls: notify_urls.into(),
            alert_urls: alert_urls.into(),
            secret: secret.map(Into::into),
        })
    }

    /// A notifier with no endpoints, which sends nothing.
    pub fn disabled() -> Result<Self, reqwest::Error> {
        Self::new(Vec::new(), Vec::new(), None)
    }

    /// Announce a completed exchange in the background.
    pub fn exchange_completed(&self, receipt: &ExchangeReceipt) {
        if self.notify_urls.is_empty() {
            return;
        }
        let payload = WebhookPayload {
            event_id: Uuid::new_v4(),
            event_type: EventType::ExchangeCompleted,
            user_key: receipt.user_key,
            debited: receipt.debited,
            credited: receipt.credited,
            message: congratulation(receipt),
            created_at: Utc::now(),
        };
        self.spawn_delivery(Arc::clone(&self.notify_urls), payload);
    }

    fn spawn_delivery(&self, urls: Arc<[String]>, payload: WebhookPayload) {
        let notifier = self.clone();
        tokio::spawn(async move {
            notifier.deliver_all(&urls, &payload).await;
        });
    }

    /// Send `payload` to every URL. Individual failures are logged and skipped.
    pub async fn deliver_all(&self, urls: &[String], payload: &WebhookPayload) {
        let body = match serde_json::to_string(payload) {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to serialize webhook payload");
                return;
            }
        };

        for url in urls {
            match self.send(url, payload.event_id, &body).await {
                Ok(status) => tracing::info!(
                    url = %url,
                    event_id = %payload.event_id,
                    status,
                    "Webhook delivered"
                ),
                Err(e) => tracing::warn!(
                    url = %url,
                    event_id = %payload.event_id,
                    error = %e,
                    "Webhook delivery failed"
                ),
            }
        }
    }

    /// Send a single webhook.
    ///
    /// # Headers Sent
    ///
    /// - `Content-Type: application/json`
    /// - `X-Webhook-Signature: sha256=<hex>` (when a secret is configured)
    /// - `X-Webhook-Event-Id: <uuid>`
    async fn send(&self, url: &str, event_id: Uuid, body: &str) -> Result<u16, reqwest::Error> {
        let mut request = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .header("X-Webhook-Event-Id", event_id.to_string());

        if let Some(secret) = &self.secret {
            request = request.header("X-Webhook-Signature", generate_signature(secret, body));
        }

        let response = request.body(body.to_string()).send().await?;
        Ok(response.error_for_status()?.status().as_u16())
    }
}

impl AlertSink for Notifier {
    /// Raise an operator alert for a debit that could not be refunded.
    fn compensation_failed(&self, user_key: UserKey, debited: i64, owed: i64) {
        if self.alert_urls.is_empty() {
            tracing::warn!(user_key, "No alert webhooks configured for failed compensation");
            return;
        }
        let payload = WebhookPayload {
            event_id: Uuid::new_v4(),
            event_type: EventType::CompensationFailed,
            user_key,
            debited,
            credited: owed,
            message: format!(
                "Exchange for user {user_key} debited {debited} source points, could not credit {owed} target points, and the refund failed. Manual reconciliation required."
            ),
            created_at: Utc::now(),
        };
        self.spawn_delivery(Arc::clone(&self.alert_urls), payload);
    }
}

/// Pick a random announcement line for `receipt`.
fn congratulation(receipt: &ExchangeReceipt) -> String {
    let template = CONGRATULATIONS
        .choose(&mut rand::rng())
        .copied()
        .unwrap_or(CONGRATULATIONS[0]);

    template
        .replace("{user}", &receipt.user_key.to_string())
        .replace("{debited}", &receipt.debited.to_string())
        .replace("{credited}", &receipt.credited.to_string())
}

/// Generate HMAC-SHA256 signature for webhook payload.
///
/// # Format
///
/// `sha256=<hex_encoded_hmac>`
///
/// # Verification
///
/// Receivers compute HMAC-SHA256(secret, request_body) and compare in constant time.
pub fn generate_signature(secret: &str, payload: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC key length is valid");
    mac.update(payload.as_bytes());
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}
