//! Notification delivery.
//!
//! Every notification in the pipeline goes out through [`deliver`], which
//! bounds the call with a timeout and swallows failures after logging them.
//! Callers never fail because a chat channel or webhook is down.

mod webhook;

pub use webhook::{WebhookNotifier, WebhookPayload};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum NotificationError {
    #[error("Notification delivery failed: {0}")]
    SendFailed(String),

    #[error("Invalid notifier configuration: {0}")]
    InvalidConfig(String),

    /// The receiving service asked us to back off.
    #[error("Notification rate limited: {0}")]
    RateLimited(String),
}

/// Type of notification being sent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    /// Approval is required for a remediation task.
    ApprovalRequired,
    /// SLA escalation.
    Escalation,
    /// Alert requiring attention.
    Alert,
    /// Informational notification.
    Info,
}

impl NotificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationType::ApprovalRequired => "approval_required",
            NotificationType::Escalation => "escalation",
            NotificationType::Alert => "alert",
            NotificationType::Info => "info",
        }
    }
}

impl std::fmt::Display for NotificationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Priority level for notifications.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NotificationPriority {
    Low,
    Normal,
    High,
    Urgent,
}

impl std::fmt::Display for NotificationPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            NotificationPriority::Low => "low",
            NotificationPriority::Normal => "normal",
            NotificationPriority::High => "high",
            NotificationPriority::Urgent => "urgent",
        };
        f.write_str(label)
    }
}

impl From<crate::incident::Severity> for NotificationPriority {
    fn from(severity: crate::incident::Severity) -> Self {
        use crate::incident::Severity;
        match severity {
            Severity::Low => NotificationPriority::Low,
            Severity::Medium => NotificationPriority::Normal,
            Severity::High => NotificationPriority::High,
            Severity::Critical => NotificationPriority::Urgent,
        }
    }
}

/// A notification addressed to one channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub notification_type: NotificationType,
    /// Destination channel, e.g. `#incidents` or `@alice`.
    pub channel: String,
    pub title: String,
    pub message: String,
    pub priority: NotificationPriority,
    pub metadata: HashMap<String, String>,
    /// Optional structured body for channels that render rich messages.
    pub blocks: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    /// Creates a new notification.
    pub fn new(
        notification_type: NotificationType,
        channel: impl Into<String>,
        title: impl Into<String>,
        message: impl Into<String>,
        priority: NotificationPriority,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            notification_type,
            channel: channel.into(),
            title: title.into(),
            message: message.into(),
            priority,
            metadata: HashMap::new(),
            blocks: None,
            created_at: Utc::now(),
        }
    }

    pub fn approval_required(
        channel: impl Into<String>,
        title: impl Into<String>,
        message: impl Into<String>,
        priority: NotificationPriority,
    ) -> Self {
        Self::new(
            NotificationType::ApprovalRequired,
            channel,
            title,
            message,
            priority,
        )
    }

    pub fn escalation(
        channel: impl Into<String>,
        title: impl Into<String>,
        message: impl Into<String>,
        priority: NotificationPriority,
    ) -> Self {
        Self::new(NotificationType::Escalation, channel, title, message, priority)
    }

    pub fn alert(
        channel: impl Into<String>,
        title: impl Into<String>,
        message: impl Into<String>,
        priority: NotificationPriority,
    ) -> Self {
        Self::new(NotificationType::Alert, channel, title, message, priority)
    }

    pub fn info(
        channel: impl Into<String>,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(
            NotificationType::Info,
            channel,
            title,
            message,
            NotificationPriority::Low,
        )
    }

    /// Adds metadata to the notification.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_blocks(mut self, blocks: serde_json::Value) -> Self {
        self.blocks = Some(blocks);
        self
    }

    /// Returns a copy addressed to another channel, with a fresh id.
    pub fn to_channel(&self, channel: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            channel: channel.into(),
            ..self.clone()
        }
    }
}

/// Trait for notification channels.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Sends a notification.
    async fn send(&self, notification: &Notification) -> Result<(), NotificationError>;

    /// Returns the name of the notifier.
    fn name(&self) -> &str;
}

/// Sends `notification` with a bounded wait.
///
/// Returns whether delivery succeeded. Failures and timeouts are logged and
/// never propagated.
pub async fn deliver(notifier: &dyn Notifier, notification: &Notification, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, notifier.send(notification)).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            warn!(
                notifier = %notifier.name(),
                channel = %notification.channel,
                error = %e,
                "Notification delivery failed"
            );
            false
        }
        Err(_) => {
            warn!(
                notifier = %notifier.name(),
                channel = %notification.channel,
                timeout_ms = timeout.as_millis() as u64,
                "Notification delivery timed out"
            );
            false
        }
    }
}

/// A notifier that logs notifications via tracing.
#[derive(Debug, Default)]
pub struct LogNotifier {
    name: String,
}

impl LogNotifier {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    #[instrument(skip(self, notification), fields(notifier = %self.name))]
    async fn send(&self, notification: &Notification) -> Result<(), NotificationError> {
        info!(
            notification_id = %notification.id,
            notification_type = %notification.notification_type,
            channel = %notification.channel,
            priority = %notification.priority,
            title = %notification.title,
            "Notification sent via LogNotifier"
        );
        debug!(message = %notification.message, "Notification details");
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// A composite notifier that sends to multiple notification channels.
pub struct CompositeNotifier {
    notifiers: Vec<Arc<dyn Notifier>>,
    /// Whether to continue sending if one notifier fails.
    continue_on_error: bool,
}

impl CompositeNotifier {
    pub fn new() -> Self {
        Self {
            notifiers: Vec::new(),
            continue_on_error: true,
        }
    }

    pub fn with_continue_on_error(mut self, continue_on_error: bool) -> Self {
        self.continue_on_error = continue_on_error;
        self
    }

    pub fn add_notifier<N: Notifier + 'static>(mut self, notifier: N) -> Self {
        self.notifiers.push(Arc::new(notifier));
        self
    }

    pub fn add_arc_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifiers.push(notifier);
        self
    }

    pub fn len(&self) -> usize {
        self.notifiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notifiers.is_empty()
    }
}

impl Default for CompositeNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Notifier for CompositeNotifier {
    #[instrument(skip(self, notification), fields(notifier_count = %self.notifiers.len()))]
    async fn send(&self, notification: &Notification) -> Result<(), NotificationError> {
        if self.notifiers.is_empty() {
            warn!("CompositeNotifier has no notifiers configured");
            return Ok(());
        }

        let mut errors = Vec::new();

        for notifier in &self.notifiers {
            match notifier.send(notification).await {
                Ok(()) => {
                    debug!(notifier = %notifier.name(), "Notification sent successfully");
                }
                Err(e) => {
                    error!(
                        notifier = %notifier.name(),
                        error = %e,
                        "Failed to send notification"
                    );
                    if !self.continue_on_error {
                        return Err(e);
                    }
                    errors.push(format!("{}: {}", notifier.name(), e));
                }
            }
        }

        // Only an error when nobody got it.
        if !errors.is_empty() && errors.len() == self.notifiers.len() {
            return Err(NotificationError::SendFailed(errors.join("; ")));
        }

        Ok(())
    }

    fn name(&self) -> &str {
        "composite"
    }
}

/// Keeps every notification in memory.
///
/// Used by tests and by dry runs that want to inspect what would have been sent.
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    sent: Mutex<Vec<Notification>>,
    calls: AtomicUsize,
    failing: AtomicBool,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subsequent sends fail (they are still counted).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Successfully sent notifications, oldest first.
    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Successfully sent notifications of the given type.
    pub fn sent_of_type(&self, notification_type: NotificationType) -> Vec<Notification> {
        self.sent()
            .into_iter()
            .filter(|n| n.notification_type == notification_type)
            .collect()
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), NotificationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(NotificationError::SendFailed("notifier unavailable".to_string()));
        }
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(notification.clone());
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SlowNotifier;

    #[async_trait]
    impl Notifier for SlowNotifier {
        async fn send(&self, _notification: &Notification) -> Result<(), NotificationError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        }

        fn name(&self) -> &str {
            "slow"
        }
    }

    #[test]
    fn test_notification_creation() {
        let notification = Notification::new(
            NotificationType::Alert,
            "#incidents",
            "High error rate",
            "5xx responses above threshold",
            NotificationPriority::High,
        )
        .with_metadata("incident_id", "INC-123");

        assert_eq!(notification.channel, "#incidents");
        assert_eq!(notification.priority, NotificationPriority::High);
        assert_eq!(notification.metadata.len(), 1);
        assert!(notification.blocks.is_none());
    }

    #[test]
    fn test_to_channel_gets_new_id() {
        let original = Notification::info("#ops", "Title", "Body");
        let copy = original.to_channel("@alice");
        assert_eq!(copy.channel, "@alice");
        assert_eq!(copy.title, original.title);
        assert_ne!(copy.id, original.id);
    }

    #[test]
    fn test_priority_from_severity() {
        use crate::incident::Severity;
        assert_eq!(
            NotificationPriority::from(Severity::Critical),
            NotificationPriority::Urgent
        );
        assert_eq!(
            NotificationPriority::from(Severity::Medium),
            NotificationPriority::Normal
        );
    }

    #[tokio::test]
    async fn test_deliver_reports_failure_without_error() {
        let notifier = MemoryNotifier::new();
        let notification = Notification::info("#ops", "Test", "Body");

        assert!(deliver(&notifier, &notification, Duration::from_secs(1)).await);
        notifier.set_failing(true);
        assert!(!deliver(&notifier, &notification, Duration::from_secs(1)).await);

        assert_eq!(notifier.call_count(), 2);
        assert_eq!(notifier.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_deliver_times_out() {
        let notification = Notification::info("#ops", "Test", "Body");
        assert!(!deliver(&SlowNotifier, &notification, Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn test_composite_notifier_continues_on_error() {
        let failing = Arc::new(MemoryNotifier::new());
        failing.set_failing(true);
        let healthy = Arc::new(MemoryNotifier::new());

        let composite = CompositeNotifier::new()
            .add_arc_notifier(failing.clone())
            .add_arc_notifier(healthy.clone());

        let result = composite
            .send(&Notification::info("#ops", "Test", "Body"))
            .await;

        assert!(result.is_ok());
        assert_eq!(failing.call_count(), 1);
        assert_eq!(healthy.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_composite_notifier_stops_on_error() {
        let failing = Arc::new(MemoryNotifier::new());
        failing.set_failing(true);
        let healthy = Arc::new(MemoryNotifier::new());

        let composite = CompositeNotifier::new()
            .with_continue_on_error(false)
            .add_arc_notifier(failing.clone())
            .add_arc_notifier(healthy.clone());

        let result = composite
            .send(&Notification::info("#ops", "Test", "Body"))
            .await;

        assert!(result.is_err());
        assert_eq!(healthy.call_count(), 0);
    }

    #[tokio::test]
    async fn test_composite_notifier_all_fail() {
        let first = Arc::new(MemoryNotifier::new());
        let second = Arc::new(MemoryNotifier::new());
        first.set_failing(true);
        second.set_failing(true);

        let composite = CompositeNotifier::new()
            .add_arc_notifier(first)
            .add_arc_notifier(second);

        let result = composite
            .send(&Notification::info("#ops", "Test", "Body"))
            .await;
        assert!(matches!(result, Err(NotificationError::SendFailed(msg)) if msg.contains("memory")));
    }
}
