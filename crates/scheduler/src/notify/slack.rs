//! Slack incoming webhook sink

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, instrument};

use super::{Notifier, NotifyError};

#[derive(Serialize)]
struct WebhookPayload<'a> {
    text: &'a str,
}

/// Posts each message as `{"text": ...}` to an incoming webhook
pub struct SlackNotifier {
    webhook_url: String,
    http: reqwest::Client,
}

impl SlackNotifier {
    pub fn new(webhook_url: impl Into<String>) -> Self {
        Self {
            webhook_url: webhook_url.into(),
            http: reqwest::Client::new(),
        }
    }

    /// Use a preconfigured HTTP client
    pub fn with_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }
}

#[async_trait]
impl Notifier for SlackNotifier {
    #[instrument(skip_all)]
    async fn send(&self, message: &str) -> Result<(), NotifyError> {
        let response = self
            .http
            .post(&self.webhook_url)
            .json(&WebhookPayload { text: message })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(NotifyError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        debug!("Notification delivered");
        Ok(())
    }
}
