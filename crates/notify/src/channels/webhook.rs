//! Generic JSON webhook channel.
//!
//! Posts `{"message": ..., "severity": ...}` to the configured URL.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::ChannelError;
use crate::events::{NotifyEvent, Severity};
use crate::NotifyChannel;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct WebhookChannel {
    webhook_url: Option<String>,
    client: reqwest::Client,
}

impl WebhookChannel {
    #[must_use]
    pub fn new(webhook_url: impl Into<String>) -> Self {
        Self::from_url(Some(webhook_url.into()))
    }

    /// Channel for an optional URL; disabled when `None` or empty.
    #[must_use]
    pub fn from_url(webhook_url: Option<String>) -> Self {
        let webhook_url = webhook_url.filter(|u| !u.trim().is_empty());
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            webhook_url,
            client,
        }
    }

    fn format_payload(event: &NotifyEvent) -> WebhookPayload {
        WebhookPayload {
            message: event.message(),
            severity: event.severity(),
        }
    }
}

#[async_trait]
impl NotifyChannel for WebhookChannel {
    fn name(&self) -> &'static str {
        "webhook"
    }

    fn enabled(&self) -> bool {
        self.webhook_url.is_some()
    }

    async fn send(&self, event: &NotifyEvent) -> Result<(), ChannelError> {
        let webhook_url = self
            .webhook_url
            .as_ref()
            .ok_or_else(|| ChannelError::NotConfigured("webhook_url".to_string()))?;

        let payload = Self::format_payload(event);
        debug!(channel = "webhook", severity = payload.severity.as_str(), "Sending notification");

        let response = self.client.post(webhook_url).json(&payload).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(60);
            return Err(ChannelError::RateLimited { retry_after_secs });
        }

        let body = response.text().await.unwrap_or_default();
        warn!(channel = "webhook", status = %status, body = %body, "Webhook request failed");
        Err(ChannelError::Other(format!("webhook returned {status}: {body}")))
    }
}

#[derive(Debug, Serialize)]
struct WebhookPayload {
    message: String,
    severity: Severity,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn rollback_event() -> NotifyEvent {
        NotifyEvent::RollbackStarted {
            run_id: "0123456789".into(),
            environment: "staging".into(),
            reason: "failed pods (2)".into(),
            backup: "backups/staging-20240501T100000Z".into(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_posts_message_and_severity() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hooks/rollout"))
            .and(body_json(json!({
                "message": "[staging] Rolling back run 01234567 from backups/staging-20240501T100000Z: failed pods (2)",
                "severity": "warning"
            })))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let channel = WebhookChannel::new(format!("{}/hooks/rollout", server.uri()));
        channel.send(&rollback_event()).await.unwrap();
    }

    #[tokio::test]
    async fn test_server_error_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let channel = WebhookChannel::new(server.uri());
        let err = channel.send(&rollback_event()).await.unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn test_rate_limit() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "30"))
            .mount(&server)
            .await;

        let channel = WebhookChannel::new(server.uri());
        let err = channel.send(&rollback_event()).await.unwrap_err();
        assert!(matches!(err, ChannelError::RateLimited { retry_after_secs: 30 }));
    }

    #[tokio::test]
    async fn test_unconfigured_channel() {
        let channel = WebhookChannel::from_url(Some("  ".into()));
        assert!(!channel.enabled());
        assert!(matches!(
            channel.send(&rollback_event()).await,
            Err(ChannelError::NotConfigured(_))
        ));
    }
}
