//! Approval workflow for remediation tasks.
//!
//! Tasks are matched against an ordered list of [`ApprovalRule`]s; the first
//! enabled rule whose task types and parameter conditions match decides the
//! approval level, the eligible approvers, and the timeout. A rule may
//! auto-approve when all of its [`AutoApproveCondition`]s hold.
//!
//! Every [`ApprovalRequest`] sits behind its own mutex so votes on one request
//! are serialized through the quorum check, while votes on different requests
//! proceed independently.

use chrono::{DateTime, Datelike, Duration, Timelike, Utc, Weekday};
use iw_core::notifications::{deliver, Notification, NotificationPriority, Notifier};
use iw_core::{EventBus, PipelineEvent, Severity, SharedClock};
use iw_observability::MetricsCollector;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Errors that can occur in the approval workflow.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApprovalError {
    #[error("Approval request not found: {0}")]
    NotFound(Uuid),

    #[error("Approval request {request_id} is already {status}")]
    AlreadyDecided {
        request_id: Uuid,
        status: ApprovalStatus,
    },

    #[error("Approval request has expired: {0}")]
    Expired(Uuid),

    #[error("User '{0}' is not an eligible approver for this request")]
    NotEligible(String),

    #[error("User '{0}' has already voted on this request")]
    AlreadyVoted(String),

    #[error("User '{0}' may not cancel this request")]
    NotAuthorized(String),

    #[error("Invalid approval action: {0}")]
    InvalidAction(String),
}

/// How many distinct approvers a request needs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApprovalLevel {
    /// One approver.
    Single,
    /// Two distinct approvers.
    Dual,
    /// Every required approver (at least one).
    MultiLevel,
}

impl ApprovalLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalLevel::Single => "SINGLE",
            ApprovalLevel::Dual => "DUAL",
            ApprovalLevel::MultiLevel => "MULTI_LEVEL",
        }
    }

    /// Approvals needed given the configured approver set.
    pub fn quorum(&self, required_approvers: &BTreeSet<String>) -> usize {
        match self {
            ApprovalLevel::Single => 1,
            ApprovalLevel::Dual => 2,
            ApprovalLevel::MultiLevel => required_approvers.len().max(1),
        }
    }
}

impl fmt::Display for ApprovalLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of an approval request. Everything except `Pending` is terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
    Cancelled,
}

impl ApprovalStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ApprovalStatus::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "PENDING",
            ApprovalStatus::Approved => "APPROVED",
            ApprovalStatus::Rejected => "REJECTED",
            ApprovalStatus::Expired => "EXPIRED",
            ApprovalStatus::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A vote cast on a request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalAction {
    Approve,
    Reject,
}

impl FromStr for ApprovalAction {
    type Err = ApprovalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "approve" | "approved" => Ok(ApprovalAction::Approve),
            "reject" | "rejected" | "deny" => Ok(ApprovalAction::Reject),
            other => Err(ApprovalError::InvalidAction(other.to_string())),
        }
    }
}

/// Condition on a task parameter. All conditions of a rule must hold.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParameterCondition {
    /// Numeric parameter within `[min, max]`; either bound may be omitted.
    Range {
        parameter: String,
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
    },
    OneOf {
        parameter: String,
        values: Vec<Value>,
    },
    Equals {
        parameter: String,
        value: Value,
    },
    Present {
        parameter: String,
    },
    /// String parameter matching a regular expression.
    Matches {
        parameter: String,
        pattern: String,
    },
}

impl ParameterCondition {
    pub fn parameter(&self) -> &str {
        match self {
            ParameterCondition::Range { parameter, .. }
            | ParameterCondition::OneOf { parameter, .. }
            | ParameterCondition::Equals { parameter, .. }
            | ParameterCondition::Present { parameter }
            | ParameterCondition::Matches { parameter, .. } => parameter,
        }
    }

    pub fn matches(&self, parameters: &Map<String, Value>) -> bool {
        let Some(value) = parameters.get(self.parameter()) else {
            return false;
        };
        match self {
            ParameterCondition::Range { min, max, .. } => {
                let Some(n) = numeric(value) else {
                    return false;
                };
                min.map_or(true, |min| n >= min) && max.map_or(true, |max| n <= max)
            }
            ParameterCondition::OneOf { values, .. } => {
                values.iter().any(|candidate| loosely_equal(candidate, value))
            }
            ParameterCondition::Equals { value: expected, .. } => loosely_equal(expected, value),
            ParameterCondition::Present { .. } => !value.is_null(),
            ParameterCondition::Matches { pattern, .. } => match (value.as_str(), Regex::new(pattern)) {
                (Some(s), Ok(re)) => re.is_match(s),
                _ => false,
            },
        }
    }
}

fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Equality that treats `3` and `3.0` as the same number.
fn loosely_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

/// Condition under which a matched task is approved without a human.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AutoApproveCondition {
    /// The related incident's severity is one of these.
    SeverityIn { severities: Vec<Severity> },
    /// Current time falls outside `[start_hour, end_hour)` UTC, or on a weekend
    /// when `weekdays_only` is set.
    OutsideBusinessHours {
        #[serde(default = "default_start_hour")]
        start_hour: u32,
        #[serde(default = "default_end_hour")]
        end_hour: u32,
        #[serde(default = "default_true")]
        weekdays_only: bool,
    },
    RequesterIn { users: Vec<String> },
    /// The execution is a dry run.
    DryRun,
}

fn default_start_hour() -> u32 {
    9
}

fn default_end_hour() -> u32 {
    17
}

fn default_true() -> bool {
    true
}

fn default_timeout_minutes() -> i64 {
    60
}

impl AutoApproveCondition {
    pub fn holds(&self, context: &ApprovalContext, now: DateTime<Utc>) -> bool {
        match self {
            AutoApproveCondition::SeverityIn { severities } => context
                .incident_severity
                .map_or(false, |severity| severities.contains(&severity)),
            AutoApproveCondition::OutsideBusinessHours {
                start_hour,
                end_hour,
                weekdays_only,
            } => {
                let weekend = matches!(now.weekday(), Weekday::Sat | Weekday::Sun);
                let in_hours = (*start_hour..*end_hour).contains(&now.hour());
                !(in_hours && !(*weekdays_only && weekend))
            }
            AutoApproveCondition::RequesterIn { users } => users.contains(&context.requester_id),
            AutoApproveCondition::DryRun => context.dry_run,
        }
    }
}

/// Rule deciding whether and how a task must be approved.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApprovalRule {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Task types the rule applies to, e.g. `restart_service`. Empty matches any.
    #[serde(default)]
    pub task_types: Vec<String>,
    #[serde(default)]
    pub conditions: Vec<ParameterCondition>,
    pub approval_level: ApprovalLevel,
    /// Users allowed to vote. Empty means anyone except the requester.
    #[serde(default)]
    pub required_approvers: BTreeSet<String>,
    #[serde(default = "default_timeout_minutes")]
    pub timeout_minutes: i64,
    #[serde(default)]
    pub auto_approve_conditions: Vec<AutoApproveCondition>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl ApprovalRule {
    pub fn new(name: impl Into<String>, approval_level: ApprovalLevel) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            task_types: Vec::new(),
            conditions: Vec::new(),
            approval_level,
            required_approvers: BTreeSet::new(),
            timeout_minutes: default_timeout_minutes(),
            auto_approve_conditions: Vec::new(),
            enabled: true,
        }
    }

    pub fn for_task_types<I, S>(mut self, task_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.task_types = task_types.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_condition(mut self, condition: ParameterCondition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn with_approvers<I, S>(mut self, approvers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_approvers = approvers.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout_minutes(mut self, minutes: i64) -> Self {
        self.timeout_minutes = minutes;
        self
    }

    pub fn with_auto_approve(mut self, condition: AutoApproveCondition) -> Self {
        self.auto_approve_conditions.push(condition);
        self
    }

    /// Whether the rule covers `subject`.
    pub fn applies_to(&self, subject: &ApprovalSubject) -> bool {
        self.enabled
            && (self.task_types.is_empty()
                || self
                    .task_types
                    .iter()
                    .any(|t| t.eq_ignore_ascii_case(&subject.task_type)))
            && self.conditions.iter().all(|c| c.matches(&subject.parameters))
    }

    /// Whether `context` satisfies every auto-approve condition. An empty list never does.
    pub fn auto_approves(&self, context: &ApprovalContext, now: DateTime<Utc>) -> bool {
        !self.auto_approve_conditions.is_empty()
            && self
                .auto_approve_conditions
                .iter()
                .all(|c| c.holds(context, now))
    }
}

/// Policy-side view of a remediation task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApprovalSubject {
    pub task_id: String,
    /// Snake-case task type, e.g. `scale_resource`.
    pub task_type: String,
    pub name: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

impl ApprovalSubject {
    fn same_action(&self, task_type: &str, parameters: &Map<String, Value>) -> bool {
        self.task_type == task_type && &self.parameters == parameters
    }
}

/// Circumstances of an approval evaluation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApprovalContext {
    pub requester_id: String,
    #[serde(default)]
    pub incident_id: Option<Uuid>,
    #[serde(default)]
    pub incident_severity: Option<Severity>,
    #[serde(default)]
    pub dry_run: bool,
}

impl ApprovalContext {
    pub fn new(requester_id: impl Into<String>) -> Self {
        Self {
            requester_id: requester_id.into(),
            ..Default::default()
        }
    }

    pub fn with_incident(mut self, incident_id: Uuid, severity: Severity) -> Self {
        self.incident_id = Some(incident_id);
        self.incident_severity = Some(severity);
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }
}

/// A comment left with a vote.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApprovalComment {
    pub user_id: String,
    pub action: ApprovalAction,
    pub comment: String,
    pub at: DateTime<Utc>,
}

/// A request for human approval of one task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApprovalRequest {
    pub request_id: Uuid,
    pub task_id: String,
    pub task_type: String,
    pub task_name: String,
    /// Parameters the approvers were asked about.
    #[serde(default)]
    pub parameters: Map<String, Value>,
    pub requester_id: String,
    /// Rule that required the approval.
    pub rule_name: String,
    pub approval_level: ApprovalLevel,
    pub required_approvers: BTreeSet<String>,
    pub status: ApprovalStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
    pub approved_by: Vec<String>,
    pub rejected_by: Vec<String>,
    pub comments: Vec<ApprovalComment>,
}

impl ApprovalRequest {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Pending and not yet expired at `now`.
    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        self.status == ApprovalStatus::Pending && !self.is_expired(now)
    }

    pub fn quorum(&self) -> usize {
        self.approval_level.quorum(&self.required_approvers)
    }

    pub fn is_eligible(&self, user_id: &str) -> bool {
        if self.required_approvers.is_empty() {
            user_id != self.requester_id
        } else {
            self.required_approvers.contains(user_id)
        }
    }

    pub fn has_voted(&self, user_id: &str) -> bool {
        self.approved_by.iter().any(|u| u == user_id) || self.rejected_by.iter().any(|u| u == user_id)
    }

    /// Whether this request was raised for the same action as `subject`.
    pub fn covers(&self, subject: &ApprovalSubject) -> bool {
        self.task_id == subject.task_id && subject.same_action(&self.task_type, &self.parameters)
    }

    fn finish(&mut self, status: ApprovalStatus, now: DateTime<Utc>) {
        self.status = status;
        self.decided_at = Some(now);
    }
}

/// Outcome of [`ApprovalWorkflow::evaluate_approval_requirement`].
#[derive(Debug, Clone, PartialEq)]
pub enum ApprovalEvaluation {
    /// No rule requires approval.
    NotRequired,
    /// The matched rule's auto-approve conditions held.
    AutoApproved { rule: String },
    /// The task was already approved, by a request or automatically.
    AlreadyApproved { request_id: Option<Uuid> },
    /// A human decision is needed.
    Pending(ApprovalRequest),
}

/// Workflow settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalConfig {
    /// Ordered rules; the first match wins.
    pub rules: Vec<ApprovalRule>,
    /// Apply a SINGLE-approval rule when nothing matches.
    pub fallback_to_default_rule: bool,
    pub default_approvers: BTreeSet<String>,
    pub default_timeout_minutes: i64,
    /// Users allowed to cancel any request.
    pub admin_users: BTreeSet<String>,
    pub approval_channel: String,
    /// Also notify each required approver on `@<user>`.
    pub notify_approvers_directly: bool,
    pub notification_timeout_secs: u64,
    /// How long decided requests are kept before the sweep drops them.
    pub retention_minutes: i64,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            fallback_to_default_rule: true,
            default_approvers: BTreeSet::new(),
            default_timeout_minutes: default_timeout_minutes(),
            admin_users: BTreeSet::new(),
            approval_channel: "#approvals".to_string(),
            notify_approvers_directly: false,
            notification_timeout_secs: 10,
            retention_minutes: 24 * 60,
        }
    }
}

impl ApprovalConfig {
    fn default_rule(&self) -> ApprovalRule {
        ApprovalRule {
            name: "default".to_string(),
            description: "Applied when no other approval rule matches".to_string(),
            task_types: Vec::new(),
            conditions: Vec::new(),
            approval_level: ApprovalLevel::Single,
            required_approvers: self.default_approvers.clone(),
            timeout_minutes: self.default_timeout_minutes,
            auto_approve_conditions: Vec::new(),
            enabled: true,
        }
    }
}

type SharedRequest = Arc<Mutex<ApprovalRequest>>;

/// An unconsumed approval for one task id and parameter set.
#[derive(Debug, Clone)]
struct ApprovalGrant {
    request_id: Option<Uuid>,
    task_type: String,
    parameters: Map<String, Value>,
    granted_at: DateTime<Utc>,
}

impl ApprovalGrant {
    fn covers(&self, subject: &ApprovalSubject) -> bool {
        subject.same_action(&self.task_type, &self.parameters)
    }
}

/// Decides approval requirements and tracks approval requests.
pub struct ApprovalWorkflow {
    config: ApprovalConfig,
    requests: RwLock<HashMap<Uuid, SharedRequest>>,
    /// Latest request per task id.
    task_requests: RwLock<HashMap<String, Uuid>>,
    /// Approvals not yet consumed by an execution, by task id.
    approved_tasks: RwLock<HashMap<String, ApprovalGrant>>,
    notifier: Arc<dyn Notifier>,
    events: Arc<EventBus>,
    clock: SharedClock,
    metrics: MetricsCollector,
}

impl ApprovalWorkflow {
    pub fn new(
        config: ApprovalConfig,
        notifier: Arc<dyn Notifier>,
        events: Arc<EventBus>,
        clock: SharedClock,
    ) -> Self {
        Self {
            config,
            requests: RwLock::new(HashMap::new()),
            task_requests: RwLock::new(HashMap::new()),
            approved_tasks: RwLock::new(HashMap::new()),
            notifier,
            events,
            clock,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn config(&self) -> &ApprovalConfig {
        &self.config
    }

    /// First enabled rule covering `subject`, or the default rule when enabled.
    pub fn matching_rule(&self, subject: &ApprovalSubject) -> Option<ApprovalRule> {
        self.config
            .rules
            .iter()
            .find(|rule| rule.applies_to(subject))
            .cloned()
            .or_else(|| {
                self.config
                    .fallback_to_default_rule
                    .then(|| self.config.default_rule())
            })
    }

    /// Decides whether `subject` needs a human decision, creating a request if so.
    ///
    /// An open request for the same task and parameters is returned rather
    /// than duplicated. Approvals only carry over while the parameters are
    /// unchanged; an open request for different parameters is superseded.
    #[instrument(skip(self, subject, context), fields(task_id = %subject.task_id, task_type = %subject.task_type))]
    pub async fn evaluate_approval_requirement(
        &self,
        subject: &ApprovalSubject,
        context: &ApprovalContext,
    ) -> ApprovalEvaluation {
        let now = self.clock.now();

        if let Some(evaluation) = self.existing_decision(subject, now).await {
            return evaluation;
        }

        let Some(rule) = self.matching_rule(subject) else {
            debug!("No approval rule matches");
            return ApprovalEvaluation::NotRequired;
        };

        if rule.auto_approves(context, now) {
            self.approved_tasks.write().await.insert(
                subject.task_id.clone(),
                ApprovalGrant {
                    request_id: None,
                    task_type: subject.task_type.clone(),
                    parameters: subject.parameters.clone(),
                    granted_at: now,
                },
            );
            self.metrics.record_approval_decided("auto_approved");
            info!(rule = %rule.name, "Task auto-approved");
            return ApprovalEvaluation::AutoApproved { rule: rule.name };
        }

        let request = ApprovalRequest {
            request_id: Uuid::new_v4(),
            task_id: subject.task_id.clone(),
            task_type: subject.task_type.clone(),
            task_name: subject.name.clone(),
            parameters: subject.parameters.clone(),
            requester_id: context.requester_id.clone(),
            rule_name: rule.name.clone(),
            approval_level: rule.approval_level,
            required_approvers: rule.required_approvers.clone(),
            status: ApprovalStatus::Pending,
            created_at: now,
            expires_at: now + Duration::minutes(rule.timeout_minutes.max(1)),
            decided_at: None,
            approved_by: Vec::new(),
            rejected_by: Vec::new(),
            comments: Vec::new(),
        };

        self.requests
            .write()
            .await
            .insert(request.request_id, Arc::new(Mutex::new(request.clone())));
        self.task_requests
            .write()
            .await
            .insert(subject.task_id.clone(), request.request_id);

        info!(
            request_id = %request.request_id,
            rule = %rule.name,
            level = %request.approval_level,
            expires_at = %request.expires_at,
            "Approval request created"
        );
        self.metrics
            .record_approval_requested(request.approval_level.as_str());
        self.events
            .publish(PipelineEvent::ApprovalRequested {
                request_id: request.request_id,
                task_id: request.task_id.clone(),
                approval_level: request.approval_level.to_string(),
            })
            .await;
        self.notify_approvers(&request, context).await;

        ApprovalEvaluation::Pending(request)
    }

    async fn existing_decision(&self, subject: &ApprovalSubject, now: DateTime<Utc>) -> Option<ApprovalEvaluation> {
        {
            let mut grants = self.approved_tasks.write().await;
            let grant = grants
                .get(&subject.task_id)
                .map(|grant| (grant.covers(subject), grant.request_id));
            match grant {
                Some((true, request_id)) => {
                    return Some(ApprovalEvaluation::AlreadyApproved { request_id });
                }
                Some((false, _)) => {
                    debug!(task_id = %subject.task_id, "Parameters changed since approval, dropping grant");
                    grants.remove(&subject.task_id);
                }
                None => {}
            }
        }

        let request_id = self.task_requests.read().await.get(&subject.task_id).copied()?;
        let entry = self.requests.read().await.get(&request_id).cloned()?;
        let mut request = entry.lock().await;
        let status = request.status;
        let same_action = request.covers(subject);
        match status {
            ApprovalStatus::Approved if same_action => Some(ApprovalEvaluation::AlreadyApproved {
                request_id: Some(request.request_id),
            }),
            ApprovalStatus::Pending if !request.is_expired(now) && same_action => {
                Some(ApprovalEvaluation::Pending(request.clone()))
            }
            ApprovalStatus::Pending => {
                let next = if request.is_expired(now) {
                    ApprovalStatus::Expired
                } else {
                    info!(request_id = %request.request_id, "Approval request superseded by new parameters");
                    ApprovalStatus::Cancelled
                };
                request.finish(next, now);
                let closed = request.clone();
                drop(request);
                self.announce_decision(&closed, None).await;
                None
            }
            _ => None,
        }
    }

    /// Records a vote on a pending request.
    ///
    /// Approval completes once the quorum is reached; a single rejection
    /// rejects the request.
    #[instrument(skip(self, comment))]
    pub async fn process_approval(
        &self,
        request_id: Uuid,
        user_id: &str,
        action: ApprovalAction,
        comment: Option<String>,
    ) -> Result<ApprovalRequest, ApprovalError> {
        let entry = self
            .requests
            .read()
            .await
            .get(&request_id)
            .cloned()
            .ok_or(ApprovalError::NotFound(request_id))?;
        let now = self.clock.now();

        let mut request = entry.lock().await;
        if request.status.is_terminal() {
            return Err(ApprovalError::AlreadyDecided {
                request_id,
                status: request.status,
            });
        }
        if request.is_expired(now) {
            request.finish(ApprovalStatus::Expired, now);
            let expired = request.clone();
            drop(request);
            warn!(request_id = %request_id, user = %user_id, "Vote on expired approval request");
            self.announce_decision(&expired, None).await;
            return Err(ApprovalError::Expired(request_id));
        }
        if !request.is_eligible(user_id) {
            return Err(ApprovalError::NotEligible(user_id.to_string()));
        }
        if request.has_voted(user_id) {
            return Err(ApprovalError::AlreadyVoted(user_id.to_string()));
        }

        match action {
            ApprovalAction::Approve => {
                request.approved_by.push(user_id.to_string());
                if request.approved_by.len() >= request.quorum() {
                    request.finish(ApprovalStatus::Approved, now);
                }
            }
            ApprovalAction::Reject => {
                request.rejected_by.push(user_id.to_string());
                request.finish(ApprovalStatus::Rejected, now);
            }
        }
        if let Some(comment) = comment.filter(|c| !c.trim().is_empty()) {
            request.comments.push(ApprovalComment {
                user_id: user_id.to_string(),
                action,
                comment,
                at: now,
            });
        }
        if request.status == ApprovalStatus::Approved {
            self.approved_tasks.write().await.insert(
                request.task_id.clone(),
                ApprovalGrant {
                    request_id: Some(request.request_id),
                    task_type: request.task_type.clone(),
                    parameters: request.parameters.clone(),
                    granted_at: now,
                },
            );
        }
        let updated = request.clone();
        drop(request);

        info!(
            request_id = %request_id,
            user = %user_id,
            action = ?action,
            approvals = updated.approved_by.len(),
            quorum = updated.quorum(),
            status = %updated.status,
            "Approval vote recorded"
        );
        if updated.status.is_terminal() {
            self.announce_decision(&updated, Some(user_id)).await;
        }
        Ok(updated)
    }

    /// Open requests, optionally only those `user_id` can still vote on.
    ///
    /// Requests found expired are moved to EXPIRED.
    pub async fn get_pending_approvals(&self, user_id: Option<&str>) -> Vec<ApprovalRequest> {
        let now = self.clock.now();
        let entries: Vec<SharedRequest> = self.requests.read().await.values().cloned().collect();

        let mut pending = Vec::new();
        let mut expired = Vec::new();
        for entry in entries {
            let mut request = entry.lock().await;
            if request.status != ApprovalStatus::Pending {
                continue;
            }
            if request.is_expired(now) {
                request.finish(ApprovalStatus::Expired, now);
                expired.push(request.clone());
                continue;
            }
            let visible = user_id.map_or(true, |user| {
                request.is_eligible(user) && !request.has_voted(user)
            });
            if visible {
                pending.push(request.clone());
            }
        }

        for request in &expired {
            self.announce_decision(request, None).await;
        }
        self.metrics.record_pending_approvals(pending.len());
        pending.sort_by_key(|r| (r.created_at, r.request_id));
        pending
    }

    /// Cancels a pending request. Only its requester or an admin may do so.
    pub async fn cancel_approval_request(
        &self,
        request_id: Uuid,
        user_id: &str,
    ) -> Result<ApprovalRequest, ApprovalError> {
        let entry = self
            .requests
            .read()
            .await
            .get(&request_id)
            .cloned()
            .ok_or(ApprovalError::NotFound(request_id))?;
        let now = self.clock.now();

        let mut request = entry.lock().await;
        if request.requester_id != user_id && !self.config.admin_users.contains(user_id) {
            return Err(ApprovalError::NotAuthorized(user_id.to_string()));
        }
        if request.status.is_terminal() {
            return Err(ApprovalError::AlreadyDecided {
                request_id,
                status: request.status,
            });
        }
        request.finish(ApprovalStatus::Cancelled, now);
        let cancelled = request.clone();
        drop(request);

        info!(request_id = %request_id, user = %user_id, "Approval request cancelled");
        self.announce_decision(&cancelled, Some(user_id)).await;
        Ok(cancelled)
    }

    /// Expires overdue requests and drops decided ones past retention.
    ///
    /// Returns the ids that expired in this sweep.
    #[instrument(skip(self))]
    pub async fn expire_stale_requests(&self) -> Vec<Uuid> {
        let now = self.clock.now();
        let retention_cutoff = now - Duration::minutes(self.config.retention_minutes.max(0));
        let entries: Vec<(Uuid, SharedRequest)> = self
            .requests
            .read()
            .await
            .iter()
            .map(|(id, entry)| (*id, entry.clone()))
            .collect();

        let mut expired = Vec::new();
        let mut stale = Vec::new();
        let mut pending = 0;
        for (id, entry) in entries {
            let mut request = entry.lock().await;
            let status = request.status;
            match status {
                ApprovalStatus::Pending if request.is_expired(now) => {
                    request.finish(ApprovalStatus::Expired, now);
                    expired.push(request.clone());
                }
                ApprovalStatus::Pending => pending += 1,
                _ => {
                    if request.decided_at.map_or(false, |at| at < retention_cutoff) {
                        stale.push((id, request.task_id.clone()));
                    }
                }
            }
        }

        if !stale.is_empty() {
            let mut requests = self.requests.write().await;
            let mut task_requests = self.task_requests.write().await;
            for (id, task_id) in &stale {
                requests.remove(id);
                if task_requests.get(task_id) == Some(id) {
                    task_requests.remove(task_id);
                }
            }
            debug!(dropped = stale.len(), "Dropped decided approval requests");
        }
        {
            let mut grants = self.approved_tasks.write().await;
            let before = grants.len();
            grants.retain(|_, grant| grant.granted_at >= retention_cutoff);
            if grants.len() < before {
                debug!(dropped = before - grants.len(), "Dropped unused approvals");
            }
        }

        for request in &expired {
            self.announce_decision(request, None).await;
        }
        self.metrics.record_pending_approvals(pending);
        if !expired.is_empty() {
            info!(expired = expired.len(), "Expired stale approval requests");
        }
        expired.into_iter().map(|r| r.request_id).collect()
    }

    pub async fn get_request(&self, request_id: Uuid) -> Option<ApprovalRequest> {
        let entry = self.requests.read().await.get(&request_id).cloned()?;
        let request = entry.lock().await;
        Some(request.clone())
    }

    /// Latest request raised for `task_id`.
    pub async fn request_for_task(&self, task_id: &str) -> Option<ApprovalRequest> {
        let request_id = self.task_requests.read().await.get(task_id).copied()?;
        self.get_request(request_id).await
    }

    /// Whether `task_id` holds an approval, by quorum or automatic, not yet consumed.
    pub async fn is_task_approved(&self, task_id: &str) -> bool {
        self.approved_tasks.read().await.contains_key(task_id)
    }

    /// Uses up the approval of `task_id` once it executes.
    ///
    /// A later task with the same id goes through approval again.
    pub async fn consume_approval(&self, task_id: &str) -> bool {
        let grant = self.approved_tasks.write().await.remove(task_id);
        let request_id = self.task_requests.read().await.get(task_id).copied();
        if let Some(request_id) = request_id {
            let entry = self.requests.read().await.get(&request_id).cloned();
            let approved = match entry {
                Some(entry) => entry.lock().await.status == ApprovalStatus::Approved,
                None => true,
            };
            let mut task_requests = self.task_requests.write().await;
            if approved && task_requests.get(task_id) == Some(&request_id) {
                task_requests.remove(task_id);
            }
        }
        if grant.is_some() {
            debug!(task_id = %task_id, "Approval consumed");
        }
        grant.is_some()
    }

    async fn notify_approvers(&self, request: &ApprovalRequest, context: &ApprovalContext) {
        let priority = context
            .incident_severity
            .map(NotificationPriority::from)
            .unwrap_or(NotificationPriority::Normal);
        let approvers = if request.required_approvers.is_empty() {
            "any approver".to_string()
        } else {
            request
                .required_approvers
                .iter()
                .cloned()
                .collect::<Vec<_>>()
                .join(", ")
        };
        let notification = Notification::approval_required(
            self.config.approval_channel.clone(),
            format!("Approval required: {}", request.task_name),
            format!(
                "Task {} ({}) requested by {} needs {} approval from {}. Expires at {}.",
                request.task_id,
                request.task_type,
                request.requester_id,
                request.approval_level,
                approvers,
                request.expires_at.to_rfc3339()
            ),
            priority,
        )
        .with_metadata("request_id", request.request_id.to_string())
        .with_metadata("task_id", request.task_id.clone());

        let timeout = std::time::Duration::from_secs(self.config.notification_timeout_secs.max(1));
        deliver(self.notifier.as_ref(), &notification, timeout).await;
        if self.config.notify_approvers_directly {
            for approver in &request.required_approvers {
                let direct = notification.to_channel(format!("@{}", approver));
                deliver(self.notifier.as_ref(), &direct, timeout).await;
            }
        }
    }

    async fn announce_decision(&self, request: &ApprovalRequest, decided_by: Option<&str>) {
        self.metrics
            .record_approval_decided(&request.status.as_str().to_ascii_lowercase());
        self.events
            .publish(PipelineEvent::ApprovalDecided {
                request_id: request.request_id,
                task_id: request.task_id.clone(),
                status: request.status.to_string(),
                decided_by: decided_by.map(str::to_string),
            })
            .await;

        let notification = Notification::info(
            self.config.approval_channel.clone(),
            format!("Approval {}: {}", request.status, request.task_name),
            match decided_by {
                Some(user) => format!("Request {} is {} by {}.", request.request_id, request.status, user),
                None => format!("Request {} is {}.", request.request_id, request.status),
            },
        )
        .with_metadata("request_id", request.request_id.to_string());
        deliver(
            self.notifier.as_ref(),
            &notification,
            std::time::Duration::from_secs(self.config.notification_timeout_secs.max(1)),
        )
        .await;
    }
}
