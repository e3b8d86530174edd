//! Event bus for pipeline events.
//!
//! Detection, approval, automation and SLA tracking announce what they did
//! here. Publishing never fails: with no subscribers the event only lands in
//! the bounded history.

use crate::incident::Severity;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;
use uuid::Uuid;

/// Events emitted by the incident pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    /// A detection rule raised a new incident.
    IncidentDetected {
        incident_id: Uuid,
        rule: String,
        severity: Severity,
    },

    /// Several incidents from one sweep were merged into `primary_id`.
    IncidentsCorrelated {
        primary_id: Uuid,
        merged_ids: Vec<Uuid>,
    },

    /// A remediation task is waiting for approvers.
    ApprovalRequested {
        request_id: Uuid,
        task_id: String,
        approval_level: String,
    },

    /// An approval request reached a terminal state.
    ApprovalDecided {
        request_id: Uuid,
        task_id: String,
        status: String,
        decided_by: Option<String>,
    },

    /// A remediation task finished, successfully or not.
    TaskFinished {
        task_id: String,
        task_type: String,
        status: String,
    },

    SlaViolationRaised {
        incident_id: Uuid,
        violation_type: String,
        team: String,
    },

    IncidentEscalated {
        incident_id: Uuid,
        team: String,
        age_minutes: i64,
    },
}

impl PipelineEvent {
    /// Short machine-readable name of the event.
    pub fn event_type(&self) -> &'static str {
        match self {
            PipelineEvent::IncidentDetected { .. } => "incident_detected",
            PipelineEvent::IncidentsCorrelated { .. } => "incidents_correlated",
            PipelineEvent::ApprovalRequested { .. } => "approval_requested",
            PipelineEvent::ApprovalDecided { .. } => "approval_decided",
            PipelineEvent::TaskFinished { .. } => "task_finished",
            PipelineEvent::SlaViolationRaised { .. } => "sla_violation_raised",
            PipelineEvent::IncidentEscalated { .. } => "incident_escalated",
        }
    }
}

/// Broadcast bus with a bounded history of recent events.
pub struct EventBus {
    broadcast_tx: broadcast::Sender<PipelineEvent>,
    history_size: usize,
    history: Arc<RwLock<VecDeque<PipelineEvent>>>,
}

impl EventBus {
    /// Creates a new event bus with the specified broadcast capacity.
    pub fn new(capacity: usize) -> Self {
        Self::with_history_size(capacity, 1000)
    }

    /// Creates a new event bus with custom history size.
    pub fn with_history_size(capacity: usize, history_size: usize) -> Self {
        let (broadcast_tx, _) = broadcast::channel(capacity.max(1));
        Self {
            broadcast_tx,
            history_size,
            history: Arc::new(RwLock::new(VecDeque::with_capacity(history_size.min(1024)))),
        }
    }

    /// Subscribes to all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.broadcast_tx.subscribe()
    }

    /// Publishes an event to all subscribers.
    pub async fn publish(&self, event: PipelineEvent) {
        debug!(event_type = event.event_type(), "Publishing event");

        if self.history_size > 0 {
            let mut history = self.history.write().await;
            while history.len() >= self.history_size {
                history.pop_front();
            }
            history.push_back(event.clone());
        }

        if self.broadcast_tx.send(event).is_err() {
            debug!("No broadcast receivers for event");
        }
    }

    /// Returns up to `limit` of the most recent events, oldest first.
    pub async fn recent_events(&self, limit: usize) -> Vec<PipelineEvent> {
        let history = self.history.read().await;
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }

    pub fn subscriber_count(&self) -> usize {
        self.broadcast_tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
