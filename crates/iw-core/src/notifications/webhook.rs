//! Webhook delivery of notifications as plain JSON.

use super::{Notification, NotificationError, Notifier};
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, instrument, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Posts every notification to one URL.
pub struct WebhookNotifier {
    url: String,
    bearer_token: Option<String>,
    headers: Vec<(String, String)>,
    client: reqwest::Client,
}

/// Body of a webhook request.
#[derive(Debug, Serialize)]
pub struct WebhookPayload<'a> {
    pub source: &'static str,
    /// `notification_type` repeated at the top level for routing.
    pub event: super::NotificationType,
    pub notification: &'a Notification,
}

impl<'a> WebhookPayload<'a> {
    pub fn new(notification: &'a Notification) -> Self {
        Self {
            source: "incident-warden",
            event: notification.notification_type,
            notification,
        }
    }
}

impl WebhookNotifier {
    /// Fails unless `url` is an http(s) URL.
    pub fn new(url: impl Into<String>) -> Result<Self, NotificationError> {
        let url = url.into();
        let url = url.trim();
        if url.is_empty() {
            return Err(NotificationError::InvalidConfig("webhook URL is empty".to_string()));
        }
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(NotificationError::InvalidConfig(format!(
                "webhook URL must use http or https: {}",
                url
            )));
        }

        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| NotificationError::InvalidConfig(e.to_string()))?;

        Ok(Self {
            url: url.to_string(),
            bearer_token: None,
            headers: Vec::new(),
            client,
        })
    }

    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn request(&self, payload: &WebhookPayload<'_>) -> reqwest::RequestBuilder {
        let mut request = self.client.post(&self.url).json(payload);
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        request
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    #[instrument(skip(self, notification), fields(url = %self.url, notification_id = %notification.id))]
    async fn send(&self, notification: &Notification) -> Result<(), NotificationError> {
        let payload = WebhookPayload::new(notification);
        let response = self
            .request(&payload)
            .send()
            .await
            .map_err(|e| NotificationError::SendFailed(format!("webhook request failed: {}", e)))?;

        let status = response.status();
        if status.is_success() {
            debug!(status = status.as_u16(), "Webhook accepted notification");
            return Ok(());
        }

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("unknown")
                .to_string();
            warn!(retry_after = %retry_after, "Webhook rate limited");
            return Err(NotificationError::RateLimited(format!(
                "retry after {}",
                retry_after
            )));
        }

        let body = response.text().await.unwrap_or_default();
        let snippet: String = body.chars().take(200).collect();
        Err(NotificationError::SendFailed(format!(
            "webhook returned {}: {}",
            status, snippet
        )))
    }

    fn name(&self) -> &str {
        "webhook"
    }
}
