//! Metrics collection for Incident Warden.
//!
//! Metrics are recorded through the `metrics` crate facade. Without an
//! installed recorder every call is a no-op; the CLI installs a Prometheus
//! exporter when asked to.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::sync::Once;

static REGISTER: Once = Once::new();

/// Metrics collector for the incident pipeline.
///
/// Cheap to clone; all state lives in the global recorder.
#[derive(Debug, Clone)]
pub struct MetricsCollector {
    _private: (),
}

impl MetricsCollector {
    /// Creates a new metrics collector, registering descriptions once per process.
    pub fn new() -> Self {
        REGISTER.call_once(Self::register_metrics);
        Self { _private: () }
    }

    fn register_metrics() {
        describe_counter!(
            "iw_incidents_detected_total",
            "Total number of incidents raised by detection rules"
        );
        describe_counter!(
            "iw_incidents_correlated_total",
            "Total number of incidents merged into a correlation group"
        );
        describe_counter!(
            "iw_rule_query_failures_total",
            "Total number of failed or timed out rule queries"
        );
        describe_counter!(
            "iw_analyzer_fallbacks_total",
            "Total number of times the canned description replaced analyzer output"
        );
        describe_counter!(
            "iw_approvals_requested_total",
            "Total number of approval requests created"
        );
        describe_counter!(
            "iw_approvals_decided_total",
            "Total number of approval requests reaching a terminal state"
        );
        describe_gauge!(
            "iw_pending_approvals",
            "Number of pending approval requests"
        );
        describe_counter!(
            "iw_tasks_total",
            "Total number of remediation tasks by type and outcome"
        );
        describe_histogram!(
            "iw_task_duration_seconds",
            "Remediation task execution duration"
        );
        describe_gauge!("iw_running_tasks", "Number of tasks currently running");
        describe_counter!(
            "iw_sla_violations_total",
            "Total number of SLA violations by type"
        );
        describe_counter!(
            "iw_escalations_total",
            "Total number of escalation notifications sent"
        );
    }

    /// Records an incident raised by a rule.
    pub fn record_incident_detected(&self, rule: &str, severity: &str) {
        counter!("iw_incidents_detected_total", "rule" => rule.to_string(), "severity" => severity.to_string()).increment(1);
    }

    /// Records a correlation merge of `group_size` incidents.
    pub fn record_incidents_correlated(&self, group_size: usize) {
        counter!("iw_incidents_correlated_total").increment(group_size as u64);
    }

    /// Records a failed rule query.
    pub fn record_rule_query_failure(&self, rule: &str, reason: &str) {
        counter!("iw_rule_query_failures_total", "rule" => rule.to_string(), "reason" => reason.to_string()).increment(1);
    }

    /// Records an analyzer fallback.
    pub fn record_analyzer_fallback(&self) {
        counter!("iw_analyzer_fallbacks_total").increment(1);
    }

    /// Records a created approval request.
    pub fn record_approval_requested(&self, level: &str) {
        counter!("iw_approvals_requested_total", "level" => level.to_string()).increment(1);
    }

    /// Records an approval request reaching a terminal state.
    pub fn record_approval_decided(&self, outcome: &str) {
        counter!("iw_approvals_decided_total", "outcome" => outcome.to_string()).increment(1);
    }

    /// Records pending approvals count.
    pub fn record_pending_approvals(&self, count: usize) {
        gauge!("iw_pending_approvals").set(count as f64);
    }

    /// Records a finished task.
    pub fn record_task(&self, task_type: &str, status: &str) {
        counter!("iw_tasks_total", "task_type" => task_type.to_string(), "status" => status.to_string()).increment(1);
    }

    /// Records task duration.
    pub fn record_task_duration(&self, task_type: &str, duration_secs: f64) {
        histogram!("iw_task_duration_seconds", "task_type" => task_type.to_string())
            .record(duration_secs);
    }

    /// Records the running task count.
    pub fn record_running_tasks(&self, count: usize) {
        gauge!("iw_running_tasks").set(count as f64);
    }

    /// Records an SLA violation.
    pub fn record_sla_violation(&self, violation_type: &str, team: &str) {
        counter!("iw_sla_violations_total", "type" => violation_type.to_string(), "team" => team.to_string()).increment(1);
    }

    /// Records an escalation.
    pub fn record_escalation(&self, team: &str) {
        counter!("iw_escalations_total", "team" => team.to_string()).increment(1);
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
