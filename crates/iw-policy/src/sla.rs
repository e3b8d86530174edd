//! SLA monitoring and team performance metrics.

use chrono::{DateTime, Duration, Utc};
use iw_core::notifications::{deliver, Notification, NotificationPriority, Notifier};
use iw_core::{EventBus, Incident, IncidentStatus, IncidentStore, PipelineEvent, Severity, SharedClock};
use iw_observability::MetricsCollector;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Time limits for one severity, in minutes since creation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SlaTarget {
    /// Someone must be assigned within this time.
    pub response_time_minutes: i64,
    pub escalation_time_minutes: i64,
    pub resolution_time_minutes: i64,
}

impl SlaTarget {
    pub const fn new(response: i64, escalation: i64, resolution: i64) -> Self {
        Self {
            response_time_minutes: response,
            escalation_time_minutes: escalation,
            resolution_time_minutes: resolution,
        }
    }
}

/// SLA targets by severity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SlaTargets {
    pub critical: SlaTarget,
    pub high: SlaTarget,
    pub medium: SlaTarget,
    pub low: SlaTarget,
}

impl Default for SlaTargets {
    fn default() -> Self {
        Self {
            critical: SlaTarget::new(15, 30, 240),
            high: SlaTarget::new(30, 120, 480),
            medium: SlaTarget::new(120, 480, 1440),
            low: SlaTarget::new(480, 1440, 4320),
        }
    }
}

impl SlaTargets {
    pub fn for_severity(&self, severity: Severity) -> &SlaTarget {
        match severity {
            Severity::Critical => &self.critical,
            Severity::High => &self.high,
            Severity::Medium => &self.medium,
            Severity::Low => &self.low,
        }
    }
}

/// Per-team settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TeamConfig {
    pub name: String,
    /// Active incidents the team can carry at once.
    #[serde(default = "default_capacity")]
    pub max_capacity: usize,
    /// Channel that receives the team's escalations, in addition to the global ones.
    #[serde(default)]
    pub escalation_channel: Option<String>,
}

fn default_capacity() -> usize {
    10
}

/// SLA monitor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SlaConfig {
    pub targets: SlaTargets,
    pub teams: Vec<TeamConfig>,
    /// Capacity assumed for teams without an entry.
    pub default_max_capacity: usize,
    /// Management channels notified on escalation.
    pub escalation_channels: Vec<String>,
    /// Channel notified of resolution and response breaches.
    pub violation_channel: String,
    pub notification_timeout_secs: u64,
    /// Violations kept in memory; oldest are dropped first.
    pub max_violations: usize,
}

impl Default for SlaConfig {
    fn default() -> Self {
        Self {
            targets: SlaTargets::default(),
            teams: Vec::new(),
            default_max_capacity: default_capacity(),
            escalation_channels: vec!["#incident-escalations".to_string()],
            violation_channel: "#incidents".to_string(),
            notification_timeout_secs: 10,
            max_violations: 10_000,
        }
    }
}

impl SlaConfig {
    pub fn team(&self, name: &str) -> Option<&TeamConfig> {
        self.teams.iter().find(|t| t.name == name)
    }

    pub fn capacity_for(&self, team: &str) -> usize {
        self.team(team)
            .map(|t| t.max_capacity)
            .unwrap_or(self.default_max_capacity)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ViolationType {
    Response,
    Resolution,
    Escalation,
}

impl ViolationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ViolationType::Response => "response",
            ViolationType::Resolution => "resolution",
            ViolationType::Escalation => "escalation",
        }
    }
}

impl fmt::Display for ViolationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recorded SLA breach.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SlaViolation {
    pub id: Uuid,
    pub incident_id: Uuid,
    pub team_name: String,
    pub violation_type: ViolationType,
    pub target_minutes: i64,
    pub actual_minutes: i64,
    pub severity: Severity,
    pub created_at: DateTime<Utc>,
    /// Whether management was notified.
    pub escalated: bool,
}

/// Aggregated team performance over a period.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TeamPerformanceMetrics {
    pub team: String,
    pub period_days: i64,
    pub total_incidents: usize,
    pub resolved_incidents: usize,
    pub active_incidents: usize,
    pub mean_resolution_minutes: Option<f64>,
    pub median_resolution_minutes: Option<f64>,
    /// Resolved within target / resolved; 1.0 when nothing was resolved.
    pub sla_compliance_rate: f64,
    pub max_capacity: usize,
    pub capacity_utilization: f64,
    pub violations: usize,
}

/// Bounded violation history plus the dedup keys of open incidents.
///
/// Keys outlive evicted entries and are only dropped once their incident is
/// no longer active.
#[derive(Default)]
struct ViolationLog {
    entries: VecDeque<SlaViolation>,
    keys: HashSet<(Uuid, ViolationType)>,
}

impl ViolationLog {
    fn contains(&self, incident_id: Uuid, kind: ViolationType) -> bool {
        self.keys.contains(&(incident_id, kind))
    }

    fn push(&mut self, violation: SlaViolation, max: usize) {
        self.keys
            .insert((violation.incident_id, violation.violation_type));
        self.entries.push_back(violation);
        while self.entries.len() > max.max(1) {
            self.entries.pop_front();
        }
    }

    fn retain_open(&mut self, open: &HashSet<Uuid>) {
        self.keys.retain(|(incident_id, _)| open.contains(incident_id));
    }
}

/// Watches active incidents against their SLA targets.
pub struct PerformanceTracker {
    config: SlaConfig,
    store: Arc<IncidentStore>,
    notifier: Arc<dyn Notifier>,
    events: Arc<EventBus>,
    clock: SharedClock,
    violations: RwLock<ViolationLog>,
    metrics: MetricsCollector,
}

impl PerformanceTracker {
    pub fn new(
        config: SlaConfig,
        store: Arc<IncidentStore>,
        notifier: Arc<dyn Notifier>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            clock: store.clock().clone(),
            config,
            store,
            notifier,
            events,
            violations: RwLock::new(ViolationLog::default()),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn config(&self) -> &SlaConfig {
        &self.config
    }

    /// Scans active incidents and records new breaches.
    ///
    /// Each incident gets at most one violation of each type. Returns only the
    /// violations raised by this call.
    #[instrument(skip(self))]
    pub async fn check_sla_violations(&self) -> Vec<SlaViolation> {
        let now = self.clock.now();
        let incidents = self.store.list_active().await;
        let open: HashSet<Uuid> = incidents.iter().map(|i| i.id).collect();

        let raised = {
            let mut log = self.violations.write().await;
            log.retain_open(&open);
            let mut raised = Vec::new();
            for incident in &incidents {
                for violation in self.breaches(incident, now, &log) {
                    log.push(violation.clone(), self.config.max_violations);
                    raised.push(violation);
                }
            }
            raised
        };

        for violation in &raised {
            self.announce(violation).await;
        }
        if !raised.is_empty() {
            info!(checked = incidents.len(), raised = raised.len(), "SLA violations raised");
        } else {
            debug!(checked = incidents.len(), "No new SLA violations");
        }
        raised
    }

    fn breaches(&self, incident: &Incident, now: DateTime<Utc>, log: &ViolationLog) -> Vec<SlaViolation> {
        let target = self.config.targets.for_severity(incident.severity);
        let age = incident.age_minutes(now);
        let violation = |violation_type: ViolationType, target_minutes: i64| SlaViolation {
            id: Uuid::new_v4(),
            incident_id: incident.id,
            team_name: incident.team().to_string(),
            violation_type,
            target_minutes,
            actual_minutes: age,
            severity: incident.severity,
            created_at: now,
            escalated: violation_type == ViolationType::Escalation,
        };

        let mut found = Vec::new();
        if age > target.resolution_time_minutes {
            if !log.contains(incident.id, ViolationType::Resolution) {
                found.push(violation(ViolationType::Resolution, target.resolution_time_minutes));
            }
        } else if age > target.escalation_time_minutes
            && !log.contains(incident.id, ViolationType::Escalation)
        {
            found.push(violation(ViolationType::Escalation, target.escalation_time_minutes));
        }

        if incident.status == IncidentStatus::Detected
            && age > target.response_time_minutes
            && !log.contains(incident.id, ViolationType::Response)
        {
            found.push(violation(ViolationType::Response, target.response_time_minutes));
        }
        found
    }

    async fn announce(&self, violation: &SlaViolation) {
        warn!(
            incident_id = %violation.incident_id,
            team = %violation.team_name,
            violation_type = %violation.violation_type,
            target_minutes = violation.target_minutes,
            actual_minutes = violation.actual_minutes,
            "SLA violated"
        );
        self.metrics
            .record_sla_violation(violation.violation_type.as_str(), &violation.team_name);
        self.events
            .publish(PipelineEvent::SlaViolationRaised {
                incident_id: violation.incident_id,
                violation_type: violation.violation_type.to_string(),
                team: violation.team_name.clone(),
            })
            .await;

        let timeout = std::time::Duration::from_secs(self.config.notification_timeout_secs.max(1));
        let title = self
            .store
            .get(violation.incident_id)
            .await
            .map(|incident| incident.title)
            .unwrap_or_else(|| violation.incident_id.to_string());
        let message = format!(
            "{} SLA breached for {} incident '{}' owned by {}: {} minutes elapsed, target {} minutes.",
            violation.violation_type,
            violation.severity,
            title,
            violation.team_name,
            violation.actual_minutes,
            violation.target_minutes
        );

        if violation.violation_type == ViolationType::Escalation {
            self.metrics.record_escalation(&violation.team_name);
            self.events
                .publish(PipelineEvent::IncidentEscalated {
                    incident_id: violation.incident_id,
                    team: violation.team_name.clone(),
                    age_minutes: violation.actual_minutes,
                })
                .await;

            let notification = Notification::escalation(
                self.config
                    .escalation_channels
                    .first()
                    .cloned()
                    .unwrap_or_else(|| self.config.violation_channel.clone()),
                format!("Escalation: {}", title),
                message,
                NotificationPriority::Urgent,
            )
            .with_metadata("incident_id", violation.incident_id.to_string())
            .with_metadata("team", violation.team_name.clone());

            let mut channels: Vec<String> = self.config.escalation_channels.clone();
            if let Some(team_channel) = self
                .config
                .team(&violation.team_name)
                .and_then(|t| t.escalation_channel.clone())
            {
                if !channels.contains(&team_channel) {
                    channels.push(team_channel);
                }
            }
            if channels.is_empty() {
                channels.push(self.config.violation_channel.clone());
            }
            for channel in channels {
                deliver(self.notifier.as_ref(), &notification.to_channel(channel), timeout).await;
            }
        } else {
            let notification = Notification::alert(
                self.config.violation_channel.clone(),
                format!("SLA breach: {}", title),
                message,
                NotificationPriority::from(violation.severity),
            )
            .with_metadata("incident_id", violation.incident_id.to_string());
            deliver(self.notifier.as_ref(), &notification, timeout).await;
        }
    }

    /// Performance of `team` over incidents created in the last `period_days`.
    pub async fn get_team_performance_metrics(&self, team: &str, period_days: i64) -> TeamPerformanceMetrics {
        let now = self.clock.now();
        let since = now - Duration::days(period_days.max(0));
        let incidents: Vec<Incident> = self
            .store
            .list_by_team(team)
            .await
            .into_iter()
            .filter(|i| i.created_at >= since)
            .collect();

        let resolved: Vec<(Severity, f64)> = incidents
            .iter()
            .filter(|i| matches!(i.status, IncidentStatus::Resolved | IncidentStatus::Closed))
            .filter_map(|i| i.resolution_minutes().map(|m| (i.severity, m)))
            .collect();

        let mut durations: Vec<f64> = resolved.iter().map(|(_, m)| *m).collect();
        durations.sort_by(|a, b| a.total_cmp(b));
        let compliant = resolved
            .iter()
            .filter(|(severity, minutes)| {
                *minutes <= self.config.targets.for_severity(*severity).resolution_time_minutes as f64
            })
            .count();

        let active = self.store.count_active_for_team(team).await;
        let max_capacity = self.config.capacity_for(team);
        let violations = self
            .violations
            .read()
            .await
            .entries
            .iter()
            .filter(|v| v.team_name == team && v.created_at >= since)
            .count();

        TeamPerformanceMetrics {
            team: team.to_string(),
            period_days,
            total_incidents: incidents.len(),
            resolved_incidents: resolved.len(),
            active_incidents: active,
            mean_resolution_minutes: mean(&durations),
            median_resolution_minutes: median(&durations),
            sla_compliance_rate: if resolved.is_empty() {
                1.0
            } else {
                compliant as f64 / resolved.len() as f64
            },
            max_capacity,
            capacity_utilization: if max_capacity == 0 {
                0.0
            } else {
                active as f64 / max_capacity as f64
            },
            violations,
        }
    }

    /// Recorded violations, optionally for one incident, oldest first.
    pub async fn get_violations(&self, incident_id: Option<Uuid>) -> Vec<SlaViolation> {
        self.violations
            .read()
            .await
            .entries
            .iter()
            .filter(|v| incident_id.map_or(true, |id| v.incident_id == id))
            .cloned()
            .collect()
    }
}

fn mean(values: &[f64]) -> Option<f64> {
    (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64)
}

/// Median of sorted values.
fn median(sorted: &[f64]) -> Option<f64> {
    let n = sorted.len();
    match n {
        0 => None,
        _ if n % 2 == 1 => Some(sorted[n / 2]),
        _ => Some((sorted[n / 2 - 1] + sorted[n / 2]) / 2.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use iw_core::{Clock, ManualClock, MemoryNotifier, NotificationType, StoreConfig};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 4, 2, 8, 0, 0).unwrap()
    }

    struct Setup {
        clock: Arc<ManualClock>,
        store: Arc<IncidentStore>,
        notifier: Arc<MemoryNotifier>,
        tracker: PerformanceTracker,
    }

    fn setup(config: SlaConfig) -> Setup {
        let (clock, shared) = ManualClock::shared(t0());
        let store = Arc::new(IncidentStore::new(StoreConfig::default(), shared));
        let notifier = Arc::new(MemoryNotifier::new());
        let tracker = PerformanceTracker::new(
            config,
            store.clone(),
            notifier.clone(),
            Arc::new(EventBus::default()),
        );
        Setup {
            clock,
            store,
            notifier,
            tracker,
        }
    }

    async fn open_incident(s: &Setup, severity: Severity, team: Option<&str>) -> Incident {
        let now = s.clock.now();
        let mut incident = Incident::new("Checkout errors", "", severity, "q", now);
        if let Some(team) = team {
            incident.assign(team, None, now).unwrap();
        }
        s.store.insert(incident.clone()).await;
        incident
    }

    #[tokio::test]
    async fn test_escalation_raised_once() {
        let s = setup(SlaConfig::default());
        let incident = open_incident(&s, Severity::High, Some("payments")).await;

        s.clock.advance(Duration::minutes(121));
        let first = s.tracker.check_sla_violations().await;
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].violation_type, ViolationType::Escalation);
        assert!(first[0].escalated);
        assert_eq!(first[0].incident_id, incident.id);

        s.clock.advance(Duration::minutes(5));
        assert!(s.tracker.check_sla_violations().await.is_empty());
        assert!(s.tracker.check_sla_violations().await.is_empty());

        assert_eq!(s.notifier.sent_of_type(NotificationType::Escalation).len(), 1);
        assert_eq!(s.tracker.get_violations(Some(incident.id)).await.len(), 1);
    }

    #[tokio::test]
    async fn test_escalation_not_repeated_after_log_eviction() {
        let s = setup(SlaConfig {
            max_violations: 1,
            ..Default::default()
        });
        let incident = open_incident(&s, Severity::Critical, None).await;

        s.clock.advance(Duration::minutes(31));
        let raised = s.tracker.check_sla_violations().await;
        assert_eq!(raised.len(), 2);
        assert_eq!(s.tracker.get_violations(None).await.len(), 1);

        s.clock.advance(Duration::minutes(1));
        assert!(s.tracker.check_sla_violations().await.is_empty());
        assert_eq!(s.notifier.sent_of_type(NotificationType::Escalation).len(), 1);

        s.store
            .transition(incident.id, IncidentStatus::Resolved)
            .await
            .unwrap();
        s.tracker.check_sla_violations().await;
        assert!(s.tracker.violations.read().await.keys.is_empty());
    }

    #[tokio::test]
    async fn test_resolution_breach_supersedes_escalation() {
        let s = setup(SlaConfig::default());
        open_incident(&s, Severity::Critical, Some("core")).await;

        s.clock.advance(Duration::minutes(241));
        let raised = s.tracker.check_sla_violations().await;
        assert_eq!(raised.len(), 1);
        assert_eq!(raised[0].violation_type, ViolationType::Resolution);
        assert_eq!(raised[0].target_minutes, 240);
        assert!(s.tracker.check_sla_violations().await.is_empty());
    }

    #[tokio::test]
    async fn test_unassigned_incident_breaches_response() {
        let s = setup(SlaConfig::default());
        let incident = open_incident(&s, Severity::Critical, None).await;

        s.clock.advance(Duration::minutes(16));
        let raised = s.tracker.check_sla_violations().await;
        assert_eq!(raised.len(), 1);
        assert_eq!(raised[0].violation_type, ViolationType::Response);
        assert_eq!(raised[0].team_name, "unassigned");

        s.store
            .assign(incident.id, "core", None)
            .await
            .unwrap();
        s.clock.advance(Duration::minutes(15));
        let raised = s.tracker.check_sla_violations().await;
        assert_eq!(raised.len(), 1);
        assert_eq!(raised[0].violation_type, ViolationType::Escalation);
    }

    #[tokio::test]
    async fn test_resolved_incidents_are_ignored() {
        let s = setup(SlaConfig::default());
        let incident = open_incident(&s, Severity::Low, Some("infra")).await;
        s.clock.advance(Duration::minutes(30));
        s.store
            .transition(incident.id, IncidentStatus::Resolved)
            .await
            .unwrap();

        s.clock.advance(Duration::days(10));
        assert!(s.tracker.check_sla_violations().await.is_empty());
    }

    #[tokio::test]
    async fn test_escalation_reaches_team_channel() {
        let s = setup(SlaConfig {
            teams: vec![TeamConfig {
                name: "payments".into(),
                max_capacity: 4,
                escalation_channel: Some("#payments-leads".into()),
            }],
            ..Default::default()
        });
        open_incident(&s, Severity::Critical, Some("payments")).await;
        s.clock.advance(Duration::minutes(31));
        s.tracker.check_sla_violations().await;

        let channels: Vec<String> = s
            .notifier
            .sent_of_type(NotificationType::Escalation)
            .into_iter()
            .map(|n| n.channel)
            .collect();
        assert_eq!(channels, vec!["#incident-escalations".to_string(), "#payments-leads".to_string()]);
    }

    #[tokio::test]
    async fn test_team_performance_metrics() {
        let s = setup(SlaConfig {
            teams: vec![TeamConfig {
                name: "payments".into(),
                max_capacity: 4,
                escalation_channel: None,
            }],
            ..Default::default()
        });

        // Resolved in 60, 200 and 600 minutes; HIGH target is 480.
        for minutes in [60, 200, 600] {
            let incident = open_incident(&s, Severity::High, Some("payments")).await;
            s.clock.advance(Duration::minutes(minutes));
            s.store
                .transition(incident.id, IncidentStatus::Resolved)
                .await
                .unwrap();
        }
        let closed = s.store.list_by_status(IncidentStatus::Resolved).await[0].id;
        s.store.transition(closed, IncidentStatus::Closed).await.unwrap();
        open_incident(&s, Severity::Medium, Some("payments")).await;

        let metrics = s.tracker.get_team_performance_metrics("payments", 7).await;
        assert_eq!(metrics.total_incidents, 4);
        assert_eq!(metrics.resolved_incidents, 3);
        assert_eq!(metrics.active_incidents, 1);
        assert_eq!(metrics.median_resolution_minutes, Some(200.0));
        let mean = metrics.mean_resolution_minutes.unwrap();
        assert!((mean - 286.666).abs() < 0.01);
        assert!((metrics.sla_compliance_rate - 2.0 / 3.0).abs() < 1e-9);
        assert!((metrics.capacity_utilization - 0.25).abs() < 1e-9);

        let idle = s.tracker.get_team_performance_metrics("nobody", 7).await;
        assert_eq!(idle.sla_compliance_rate, 1.0);
        assert_eq!(idle.max_capacity, 10);
    }

    #[test]
    fn test_median() {
        assert_eq!(median(&[]), None);
        assert_eq!(median(&[3.0]), Some(3.0));
        assert_eq!(median(&[1.0, 2.0, 4.0, 10.0]), Some(3.0));
    }
}
