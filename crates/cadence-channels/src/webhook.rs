//! Incoming-webhook transport (Synology Chat style).
//!
//! Messages are posted as a form body `payload={"text": ..., "user_ids": [..]}`.
//! A send counts as delivered only on HTTP 200 with `"success": true` in the
//! response body.

use async_trait::async_trait;
use cadence_core::config::TransportConfig;
use cadence_core::error::{CadenceError, Result};
use cadence_core::retry::{Backoff, is_retryable_status};
use cadence_core::traits::Transport;
use cadence_core::types::Recipient;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize)]
struct WebhookResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

/// Outcome of one HTTP attempt.
enum Attempt {
    Retry(CadenceError),
    Fatal(CadenceError),
}

pub struct WebhookTransport {
    url: String,
    token: String,
    default_user_ids: Vec<i64>,
    require_success_flag: bool,
    backoff: Backoff,
    client: reqwest::Client,
}

impl WebhookTransport {
    pub fn from_config(config: &TransportConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs.max(1)))
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .map_err(|e| CadenceError::Http(format!("failed to build HTTP client: {e}")))?;

        let transport = Self {
            url: config.webhook_url.trim().to_string(),
            token: config.token.clone(),
            default_user_ids: config.default_user_ids.clone(),
            require_success_flag: config.require_success_flag,
            backoff: Backoff::new(config.max_attempts),
            client,
        };
        if transport.enabled() {
            tracing::info!("📡 Webhook transport enabled, default user ids {:?}", transport.default_user_ids);
        } else {
            tracing::warn!("⚠️ Webhook transport not configured; set transport.webhook_url");
        }
        Ok(transport)
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Parse an address of comma-separated numeric user ids.
    fn user_ids(&self, address: &str) -> Result<Vec<i64>> {
        if address.trim().is_empty() {
            return Ok(self.default_user_ids.clone());
        }
        address
            .split(',')
            .map(|id| {
                id.trim()
                    .parse::<i64>()
                    .map_err(|_| CadenceError::Transport(format!("invalid user id '{id}'")))
            })
            .collect()
    }

    async fn attempt(&self, form: &[(&str, String)]) -> std::result::Result<(), Attempt> {
        let mut req = self.client.post(&self.url).form(form);
        if !self.token.is_empty() && !self.url.contains("token=") {
            req = req.query(&[("token", self.token.as_str())]);
        }
        let resp = req.send().await.map_err(|e| {
            Attempt::Retry(CadenceError::Transport(format!("webhook request failed: {e}")))
        })?;

        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        if status.as_u16() != 200 {
            let err = CadenceError::Transport(format!("webhook returned {status}: {text}"));
            return Err(if is_retryable_status(status.as_u16()) {
                Attempt::Retry(err)
            } else {
                Attempt::Fatal(err)
            });
        }
        if !self.require_success_flag {
            return Ok(());
        }
        match serde_json::from_str::<WebhookResponse>(&text) {
            Ok(body) if body.success => Ok(()),
            Ok(body) => Err(Attempt::Fatal(CadenceError::Transport(format!(
                "webhook rejected message: {}",
                body.error.map(|e| e.to_string()).unwrap_or(text)
            )))),
            Err(_) => Err(Attempt::Fatal(CadenceError::Transport(format!(
                "webhook response without success flag: {text}"
            )))),
        }
    }
}

#[async_trait]
impl Transport for WebhookTransport {
    fn name(&self) -> &str {
        "webhook"
    }

    fn enabled(&self) -> bool {
        !self.url.is_empty()
    }

    fn resolve_address(&self, recipient: &Recipient) -> Result<String> {
        let external = recipient.external_id.trim();
        if external.is_empty() {
            if self.default_user_ids.is_empty() {
                return Err(CadenceError::Transport(format!(
                    "recipient {recipient} has no external id and no default user ids are configured"
                )));
            }
            let ids: Vec<String> = self.default_user_ids.iter().map(i64::to_string).collect();
            return Ok(ids.join(","));
        }
        external.parse::<i64>().map(|id| id.to_string()).map_err(|_| {
            CadenceError::Transport(format!(
                "recipient {recipient}: external id '{external}' is not a numeric user id"
            ))
        })
    }

    async fn send(&self, content: &str, address: &str) -> Result<()> {
        if !self.enabled() {
            return Err(CadenceError::Transport("webhook transport is not configured".into()));
        }
        let user_ids = self.user_ids(address)?;
        let mut payload = serde_json::json!({ "text": content });
        if user_ids.is_empty() {
            tracing::warn!("⚠️ No target user ids; the webhook may drop the message");
        } else {
            payload["user_ids"] = serde_json::json!(user_ids);
        }
        let form = [("payload", payload.to_string())];

        let mut attempt = 1;
        loop {
            match self.attempt(&form).await {
                Ok(()) => {
                    tracing::info!("📤 Webhook delivered to {address} ({} chars)", content.chars().count());
                    return Ok(());
                }
                Err(Attempt::Retry(e)) if self.backoff.should_retry(attempt) => {
                    let wait = self.backoff.delay(attempt);
                    tracing::warn!("⚠️ {e}; retrying in {}ms", wait.as_millis());
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Err(Attempt::Retry(e)) | Err(Attempt::Fatal(e)) => return Err(e),
            }
        }
    }
}
