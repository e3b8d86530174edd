//! Audit logging for Incident Warden.
//!
//! The automation engine reports every significant step of a remediation
//! task through the [`AuditLogger`] trait. [`AuditLog`] is the in-memory
//! implementation used by the daemon and by tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

/// Types of auditable events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    /// Task execution started.
    TaskStarted,
    /// Task halted waiting for an approval decision.
    TaskPendingApproval,
    /// A safety check produced a result.
    SafetyCheck,
    /// Task completed successfully.
    TaskCompleted,
    /// Task failed.
    TaskFailed,
    /// Task was cancelled while running.
    TaskCancelled,
    /// Rollback started.
    RollbackStarted,
    /// Rollback completed.
    RollbackCompleted,
    /// Rollback failed.
    RollbackFailed,
    /// Approval request created.
    ApprovalRequested,
    /// Approval decision made.
    ApprovalDecision,
    /// Custom event.
    Custom(String),
}

impl std::fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuditEventType::TaskStarted => write!(f, "task_started"),
            AuditEventType::TaskPendingApproval => write!(f, "task_pending_approval"),
            AuditEventType::SafetyCheck => write!(f, "safety_check"),
            AuditEventType::TaskCompleted => write!(f, "task_completed"),
            AuditEventType::TaskFailed => write!(f, "task_failed"),
            AuditEventType::TaskCancelled => write!(f, "task_cancelled"),
            AuditEventType::RollbackStarted => write!(f, "rollback_started"),
            AuditEventType::RollbackCompleted => write!(f, "rollback_completed"),
            AuditEventType::RollbackFailed => write!(f, "rollback_failed"),
            AuditEventType::ApprovalRequested => write!(f, "approval_requested"),
            AuditEventType::ApprovalDecision => write!(f, "approval_decision"),
            AuditEventType::Custom(name) => write!(f, "{}", name),
        }
    }
}

/// An entry in the audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogEntry {
    /// Unique entry ID.
    pub id: Uuid,
    /// Timestamp.
    pub timestamp: DateTime<Utc>,
    /// Event type.
    pub event_type: AuditEventType,
    /// Human-readable description of the event.
    pub message: String,
    /// Structured details (task id, check name, error text, ...).
    pub details: serde_json::Value,
}

/// Sink for audit events.
///
/// Implementations must not fail or panic into the caller.
#[async_trait]
pub trait AuditLogger: Send + Sync {
    /// Records an audit event.
    async fn log(&self, event_type: AuditEventType, message: &str, details: serde_json::Value);
}

/// Audit logger that drops every event.
#[derive(Debug, Default, Clone)]
pub struct NoopAuditLogger;

#[async_trait]
impl AuditLogger for NoopAuditLogger {
    async fn log(&self, _event_type: AuditEventType, _message: &str, _details: serde_json::Value) {}
}

/// Audit log with bounded in-memory storage.
pub struct AuditLog {
    entries: Arc<RwLock<VecDeque<AuditLogEntry>>>,
    max_entries: usize,
    log_to_tracing: bool,
}

impl AuditLog {
    /// Creates a new audit log that also mirrors entries to tracing.
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Arc::new(RwLock::new(VecDeque::with_capacity(max_entries.min(1024)))),
            max_entries: max_entries.max(1),
            log_to_tracing: true,
        }
    }

    /// Creates an audit log without tracing output.
    pub fn without_tracing(max_entries: usize) -> Self {
        Self {
            log_to_tracing: false,
            ..Self::new(max_entries)
        }
    }

    /// Appends an entry, evicting the oldest when full.
    pub async fn record(&self, entry: AuditLogEntry) {
        if self.log_to_tracing {
            info!(
                event_type = %entry.event_type,
                details = %entry.details,
                "Audit: {}",
                entry.message
            );
        }

        let mut entries = self.entries.write().await;
        while entries.len() >= self.max_entries {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Gets all entries, oldest first.
    pub async fn get_entries(&self) -> Vec<AuditLogEntry> {
        self.entries.read().await.iter().cloned().collect()
    }

    /// Gets entries by event type.
    pub async fn get_entries_by_type(&self, event_type: AuditEventType) -> Vec<AuditLogEntry> {
        let entries = self.entries.read().await;
        entries
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }

    /// Gets entries whose details carry the given `task_id`.
    pub async fn get_task_entries(&self, task_id: &str) -> Vec<AuditLogEntry> {
        let entries = self.entries.read().await;
        entries
            .iter()
            .filter(|e| e.details.get("task_id").and_then(|v| v.as_str()) == Some(task_id))
            .cloned()
            .collect()
    }

    /// Exports entries as JSON.
    pub async fn export_json(&self) -> String {
        let entries = self.get_entries().await;
        serde_json::to_string_pretty(&entries).unwrap_or_else(|_| "[]".to_string())
    }

    /// Gets the number of entries.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Checks if the audit log is empty.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new(10000)
    }
}

#[async_trait]
impl AuditLogger for AuditLog {
    async fn log(&self, event_type: AuditEventType, message: &str, details: serde_json::Value) {
        self.record(AuditLogEntry {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            event_type,
            message: message.to_string(),
            details,
        })
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_log_event() {
        let audit_log = AuditLog::without_tracing(100);

        audit_log
            .log(
                AuditEventType::TaskStarted,
                "Task started",
                json!({"task_id": "task-1"}),
            )
            .await;

        let entries = audit_log.get_entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].event_type, AuditEventType::TaskStarted);
    }

    #[tokio::test]
    async fn test_task_entries() {
        let audit_log = AuditLog::without_tracing(100);

        audit_log
            .log(AuditEventType::TaskStarted, "start", json!({"task_id": "a"}))
            .await;
        audit_log
            .log(AuditEventType::TaskStarted, "start", json!({"task_id": "b"}))
            .await;
        audit_log
            .log(AuditEventType::TaskCompleted, "done", json!({"task_id": "a"}))
            .await;

        assert_eq!(audit_log.get_task_entries("a").await.len(), 2);
        assert_eq!(
            audit_log
                .get_entries_by_type(AuditEventType::TaskStarted)
                .await
                .len(),
            2
        );
    }

    #[tokio::test]
    async fn test_max_entries() {
        let audit_log = AuditLog::without_tracing(5);

        for i in 0..10 {
            audit_log
                .log(
                    AuditEventType::Custom(format!("event-{}", i)),
                    &format!("Event {}", i),
                    json!({}),
                )
                .await;
        }

        assert_eq!(audit_log.len().await, 5);

        let entries = audit_log.get_entries().await;
        assert!(matches!(
            &entries[0].event_type,
            AuditEventType::Custom(s) if s == "event-5"
        ));
    }

    #[tokio::test]
    async fn test_export_json() {
        let audit_log = AuditLog::without_tracing(100);
        audit_log
            .log(AuditEventType::RollbackFailed, "Rollback failed", json!({}))
            .await;

        let exported = audit_log.export_json().await;
        assert!(exported.contains("rollback_failed"));
    }
}
