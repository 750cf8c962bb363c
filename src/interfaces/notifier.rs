use async_trait::async_trait;
use serde_json::json;

use crate::error::{GarageBotError, Result};

/// Delivery of a rendered message to one chat identity. Best effort: the
/// transport gives no delivery receipt, and callers must treat an Err as
/// "retry later", never as "already seen".
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, chat_id: &str, text: &str) -> Result<()>;
}

/// Swallows messages. Used when no webhook is configured so scheduled
/// checks still exercise their evaluation paths.
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn send(&self, chat_id: &str, text: &str) -> Result<()> {
        tracing::debug!(chat_id, text, "notification dropped (no transport configured)");
        Ok(())
    }
}

/// Posts `{chat_id, text}` to the configured webhook. The receiving bridge
/// owns the actual chat transport.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, chat_id: &str, text: &str) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(&json!({ "chat_id": chat_id, "text": text }))
            .send()
            .await
            .map_err(|e| GarageBotError::Dispatch(e.to_string()))?;
        if !response.status().is_success() {
            return Err(GarageBotError::Dispatch(format!(
                "webhook returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}
