//! Incident data model and lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Metadata key holding the resolution time in minutes.
pub const RESOLUTION_MINUTES_KEY: &str = "resolution_minutes";

/// Errors raised by incident mutations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IncidentError {
    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition {
        from: IncidentStatus,
        to: IncidentStatus,
    },

    #[error("Invalid severity: {0}")]
    InvalidSeverity(String),

    #[error("Invalid status: {0}")]
    InvalidStatus(String),

    #[error("Invalid alert: {0}")]
    InvalidAlert(String),
}

/// Severity levels for incidents, ordered from least to most severe.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub const ALL: [Severity; 4] = [
        Severity::Low,
        Severity::Medium,
        Severity::High,
        Severity::Critical,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = IncidentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "LOW" => Ok(Severity::Low),
            "MEDIUM" => Ok(Severity::Medium),
            "HIGH" => Ok(Severity::High),
            "CRITICAL" => Ok(Severity::Critical),
            _ => Err(IncidentError::InvalidSeverity(s.to_string())),
        }
    }
}

/// Lifecycle status of an incident.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IncidentStatus {
    /// Raised by detection or ingestion, nobody has picked it up.
    Detected,
    /// Routed to a team or person.
    Assigned,
    /// Someone is working on it.
    InProgress,
    /// Mitigated; may still be reopened.
    Resolved,
    /// Final.
    Closed,
}

impl IncidentStatus {
    /// Whether the incident still needs attention.
    pub fn is_active(&self) -> bool {
        !matches!(self, IncidentStatus::Resolved | IncidentStatus::Closed)
    }

    /// Whether `next` is a legal successor of this status.
    pub fn can_transition_to(&self, next: IncidentStatus) -> bool {
        use IncidentStatus::*;
        match self {
            Detected => matches!(next, Assigned | InProgress | Resolved | Closed),
            Assigned => matches!(next, Assigned | InProgress | Resolved | Closed),
            InProgress => matches!(next, Assigned | Resolved | Closed),
            Resolved => matches!(next, InProgress | Closed),
            Closed => false,
        }
    }
}

impl std::fmt::Display for IncidentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IncidentStatus::Detected => write!(f, "DETECTED"),
            IncidentStatus::Assigned => write!(f, "ASSIGNED"),
            IncidentStatus::InProgress => write!(f, "IN_PROGRESS"),
            IncidentStatus::Resolved => write!(f, "RESOLVED"),
            IncidentStatus::Closed => write!(f, "CLOSED"),
        }
    }
}

impl FromStr for IncidentStatus {
    type Err = IncidentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "DETECTED" => Ok(IncidentStatus::Detected),
            "ASSIGNED" => Ok(IncidentStatus::Assigned),
            "IN_PROGRESS" => Ok(IncidentStatus::InProgress),
            "RESOLVED" => Ok(IncidentStatus::Resolved),
            "CLOSED" => Ok(IncidentStatus::Closed),
            _ => Err(IncidentError::InvalidStatus(s.to_string())),
        }
    }
}

/// An operational problem tracked from detection to resolution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Incident {
    /// Unique identifier, never changes.
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub severity: Severity,
    pub status: IncidentStatus,
    /// Query (or alert source) that raised the incident.
    pub source_query: String,
    pub affected_systems: BTreeSet<String>,
    pub assigned_team: Option<String>,
    pub assigned_user: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Never moves backwards.
    pub updated_at: DateTime<Utc>,
    /// Set exactly while `status == RESOLVED`.
    pub resolved_at: Option<DateTime<Utc>>,
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Incident {
    /// Creates a new incident in the DETECTED state.
    pub fn new(
        title: impl Into<String>,
        description: impl Into<String>,
        severity: Severity,
        source_query: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            description: description.into(),
            severity,
            status: IncidentStatus::Detected,
            source_query: source_query.into(),
            affected_systems: BTreeSet::new(),
            assigned_team: None,
            assigned_user: None,
            created_at: now,
            updated_at: now,
            resolved_at: None,
            tags: BTreeSet::new(),
            metadata: HashMap::new(),
        }
    }

    /// Builds an incident from an externally raised alert.
    pub fn from_alert(alert: ExternalAlert, now: DateTime<Utc>) -> Result<Self, IncidentError> {
        alert.validate()?;

        let mut incident = Self::new(
            alert.title,
            alert.description,
            alert.severity,
            format!("alert:{}", alert.source),
            alert.raised_at.unwrap_or(now),
        );
        incident.affected_systems.extend(alert.affected_systems);
        incident.tags.extend(alert.tags);
        incident.metadata = alert.metadata;
        incident
            .metadata
            .insert("external_id".to_string(), alert.external_id.into());
        incident
            .metadata
            .insert("alert_source".to_string(), alert.source.into());
        incident.updated_at = incident.updated_at.max(now);
        Ok(incident)
    }

    /// Moves the incident to `next`, maintaining `resolved_at` and the
    /// recorded resolution time.
    pub fn transition(
        &mut self,
        next: IncidentStatus,
        now: DateTime<Utc>,
    ) -> Result<(), IncidentError> {
        if !self.status.can_transition_to(next) {
            return Err(IncidentError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }

        match (self.status, next) {
            (IncidentStatus::Resolved, IncidentStatus::InProgress) => {
                self.resolved_at = None;
                self.metadata.remove(RESOLUTION_MINUTES_KEY);
            }
            (IncidentStatus::Resolved, _) => {
                self.resolved_at = None;
            }
            (_, IncidentStatus::Resolved) => {
                self.resolved_at = Some(now);
                let minutes = (now - self.created_at).num_seconds().max(0) as f64 / 60.0;
                self.metadata
                    .insert(RESOLUTION_MINUTES_KEY.to_string(), minutes.into());
            }
            _ => {}
        }

        self.status = next;
        self.touch(now);
        Ok(())
    }

    /// Assigns the incident to a team and optionally a user.
    pub fn assign(
        &mut self,
        team: impl Into<String>,
        user: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), IncidentError> {
        self.transition(IncidentStatus::Assigned, now)?;
        self.assigned_team = Some(team.into());
        self.assigned_user = user;
        Ok(())
    }

    pub fn start_progress(&mut self, now: DateTime<Utc>) -> Result<(), IncidentError> {
        self.transition(IncidentStatus::InProgress, now)
    }

    pub fn resolve(&mut self, now: DateTime<Utc>) -> Result<(), IncidentError> {
        self.transition(IncidentStatus::Resolved, now)
    }

    pub fn close(&mut self, now: DateTime<Utc>) -> Result<(), IncidentError> {
        self.transition(IncidentStatus::Closed, now)
    }

    /// Reopens a resolved incident.
    pub fn reopen(&mut self, now: DateTime<Utc>) -> Result<(), IncidentError> {
        if self.status != IncidentStatus::Resolved {
            return Err(IncidentError::InvalidTransition {
                from: self.status,
                to: IncidentStatus::InProgress,
            });
        }
        self.transition(IncidentStatus::InProgress, now)
    }

    pub fn add_tags<I, S>(&mut self, tags: I, now: DateTime<Utc>)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self.touch(now);
    }

    pub fn add_affected_systems<I, S>(&mut self, systems: I, now: DateTime<Utc>)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.affected_systems
            .extend(systems.into_iter().map(Into::into));
        self.touch(now);
    }

    pub fn set_metadata(
        &mut self,
        key: impl Into<String>,
        value: serde_json::Value,
        now: DateTime<Utc>,
    ) {
        self.metadata.insert(key.into(), value);
        self.touch(now);
    }

    /// Minutes from creation to resolution, if the incident was resolved.
    pub fn resolution_minutes(&self) -> Option<f64> {
        self.metadata
            .get(RESOLUTION_MINUTES_KEY)
            .and_then(|v| v.as_f64())
    }

    /// Team responsible for the incident.
    pub fn team(&self) -> &str {
        self.assigned_team.as_deref().unwrap_or("unassigned")
    }

    /// Whole minutes elapsed since creation.
    pub fn age_minutes(&self, now: DateTime<Utc>) -> i64 {
        (now - self.created_at).num_minutes()
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = self.updated_at.max(now);
    }
}

/// An alert raised by an external monitoring system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalAlert {
    /// Identifier assigned by the source system.
    pub external_id: String,
    /// Name of the source system.
    pub source: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub severity: Severity,
    #[serde(default)]
    pub affected_systems: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// When the source raised the alert.
    #[serde(default)]
    pub raised_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl ExternalAlert {
    /// Key used to ignore repeated deliveries of the same alert.
    pub fn dedup_key(&self) -> String {
        format!("alert:{}:{}", self.source, self.external_id)
    }

    fn validate(&self) -> Result<(), IncidentError> {
        if self.external_id.trim().is_empty() {
            return Err(IncidentError::InvalidAlert("external_id is empty".into()));
        }
        if self.source.trim().is_empty() {
            return Err(IncidentError::InvalidAlert("source is empty".into()));
        }
        if self.title.trim().is_empty() {
            return Err(IncidentError::InvalidAlert("title is empty".into()));
        }
        Ok(())
    }
}
