//! Remediation task model.
//!
//! Each task type carries its own parameter struct. Untyped JSON input goes
//! through [`TaskParameters::from_json`] at the boundary.

use chrono::{DateTime, Utc};
use iw_policy::ApprovalSubject;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Errors raised while building or validating a task.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    #[error("Unknown task type: {0}")]
    UnknownTaskType(String),

    #[error("Invalid parameters for {task_type}: {message}")]
    InvalidParameters { task_type: TaskType, message: String },

    #[error("Invalid task: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    RestartService,
    ScaleResource,
    UpdateConfig,
    RollbackDeployment,
    CollectLogs,
    RunHealthCheck,
    ExecuteScript,
}

impl TaskType {
    pub const ALL: [TaskType; 7] = [
        TaskType::RestartService,
        TaskType::ScaleResource,
        TaskType::UpdateConfig,
        TaskType::RollbackDeployment,
        TaskType::CollectLogs,
        TaskType::RunHealthCheck,
        TaskType::ExecuteScript,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::RestartService => "restart_service",
            TaskType::ScaleResource => "scale_resource",
            TaskType::UpdateConfig => "update_config",
            TaskType::RollbackDeployment => "rollback_deployment",
            TaskType::CollectLogs => "collect_logs",
            TaskType::RunHealthCheck => "run_health_check",
            TaskType::ExecuteScript => "execute_script",
        }
    }

    /// Whether the task changes the running system.
    pub fn is_destructive(&self) -> bool {
        !matches!(self, TaskType::CollectLogs | TaskType::RunHealthCheck)
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        TaskType::ALL
            .into_iter()
            .find(|t| t.as_str() == normalized)
            .ok_or_else(|| TaskError::UnknownTaskType(s.to_string()))
    }
}

fn default_true() -> bool {
    true
}

fn default_resource_type() -> String {
    "ecs_service".to_string()
}

fn default_since_minutes() -> u32 {
    60
}

fn default_expected_status() -> u16 {
    200
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RestartServiceParams {
    pub service: String,
    #[serde(default)]
    pub cluster: Option<String>,
    /// Drain connections before stopping.
    #[serde(default = "default_true")]
    pub graceful: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScaleResourceParams {
    pub resource_id: String,
    #[serde(default = "default_resource_type")]
    pub resource_type: String,
    pub desired_capacity: u32,
    /// Capacity before scaling, used for rollback and impact checks.
    #[serde(default)]
    pub previous_capacity: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpdateConfigParams {
    pub target: String,
    pub changes: Map<String, Value>,
    #[serde(default)]
    pub previous_values: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RollbackDeploymentParams {
    pub service: String,
    pub target_version: String,
    #[serde(default)]
    pub current_version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CollectLogsParams {
    pub sources: Vec<String>,
    #[serde(default = "default_since_minutes")]
    pub since_minutes: u32,
    #[serde(default)]
    pub destination: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunHealthCheckParams {
    pub target: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_expected_status")]
    pub expected_status: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecuteScriptParams {
    pub script: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub host: Option<String>,
}

/// Parameters of a task, one variant per task type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskParameters {
    RestartService(RestartServiceParams),
    ScaleResource(ScaleResourceParams),
    UpdateConfig(UpdateConfigParams),
    RollbackDeployment(RollbackDeploymentParams),
    CollectLogs(CollectLogsParams),
    RunHealthCheck(RunHealthCheckParams),
    ExecuteScript(ExecuteScriptParams),
}

impl TaskParameters {
    /// Parses untyped parameters for `task_type`.
    pub fn from_json(task_type: TaskType, value: Value) -> Result<Self, TaskError> {
        let invalid = |e: serde_json::Error| TaskError::InvalidParameters {
            task_type,
            message: e.to_string(),
        };
        let params = match task_type {
            TaskType::RestartService => {
                TaskParameters::RestartService(serde_json::from_value(value).map_err(invalid)?)
            }
            TaskType::ScaleResource => {
                TaskParameters::ScaleResource(serde_json::from_value(value).map_err(invalid)?)
            }
            TaskType::UpdateConfig => {
                TaskParameters::UpdateConfig(serde_json::from_value(value).map_err(invalid)?)
            }
            TaskType::RollbackDeployment => {
                TaskParameters::RollbackDeployment(serde_json::from_value(value).map_err(invalid)?)
            }
            TaskType::CollectLogs => {
                TaskParameters::CollectLogs(serde_json::from_value(value).map_err(invalid)?)
            }
            TaskType::RunHealthCheck => {
                TaskParameters::RunHealthCheck(serde_json::from_value(value).map_err(invalid)?)
            }
            TaskType::ExecuteScript => {
                TaskParameters::ExecuteScript(serde_json::from_value(value).map_err(invalid)?)
            }
        };
        Ok(params)
    }

    pub fn task_type(&self) -> TaskType {
        match self {
            TaskParameters::RestartService(_) => TaskType::RestartService,
            TaskParameters::ScaleResource(_) => TaskType::ScaleResource,
            TaskParameters::UpdateConfig(_) => TaskType::UpdateConfig,
            TaskParameters::RollbackDeployment(_) => TaskType::RollbackDeployment,
            TaskParameters::CollectLogs(_) => TaskType::CollectLogs,
            TaskParameters::RunHealthCheck(_) => TaskType::RunHealthCheck,
            TaskParameters::ExecuteScript(_) => TaskType::ExecuteScript,
        }
    }

    /// The system the task acts on.
    pub fn target(&self) -> String {
        match self {
            TaskParameters::RestartService(p) => p.service.clone(),
            TaskParameters::ScaleResource(p) => p.resource_id.clone(),
            TaskParameters::UpdateConfig(p) => p.target.clone(),
            TaskParameters::RollbackDeployment(p) => p.service.clone(),
            TaskParameters::CollectLogs(p) => p.sources.join(","),
            TaskParameters::RunHealthCheck(p) => p.target.clone(),
            TaskParameters::ExecuteScript(p) => p.host.clone().unwrap_or_else(|| "local".into()),
        }
    }

    /// Parameters as a flat JSON object, without the type tag.
    pub fn to_json(&self) -> Map<String, Value> {
        let value = match self {
            TaskParameters::RestartService(p) => serde_json::to_value(p),
            TaskParameters::ScaleResource(p) => serde_json::to_value(p),
            TaskParameters::UpdateConfig(p) => serde_json::to_value(p),
            TaskParameters::RollbackDeployment(p) => serde_json::to_value(p),
            TaskParameters::CollectLogs(p) => serde_json::to_value(p),
            TaskParameters::RunHealthCheck(p) => serde_json::to_value(p),
            TaskParameters::ExecuteScript(p) => serde_json::to_value(p),
        };
        match value {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }

    pub fn validate(&self) -> Result<(), TaskError> {
        let task_type = self.task_type();
        let invalid = |message: &str| {
            Err(TaskError::InvalidParameters {
                task_type,
                message: message.to_string(),
            })
        };
        match self {
            TaskParameters::RestartService(p) if p.service.trim().is_empty() => invalid("service is empty"),
            TaskParameters::ScaleResource(p) if p.resource_id.trim().is_empty() => {
                invalid("resource_id is empty")
            }
            TaskParameters::UpdateConfig(p) if p.target.trim().is_empty() => invalid("target is empty"),
            TaskParameters::UpdateConfig(p) if p.changes.is_empty() => invalid("changes are empty"),
            TaskParameters::RollbackDeployment(p) if p.service.trim().is_empty() => {
                invalid("service is empty")
            }
            TaskParameters::RollbackDeployment(p) if p.target_version.trim().is_empty() => {
                invalid("target_version is empty")
            }
            TaskParameters::CollectLogs(p) if p.sources.is_empty() => invalid("no log sources"),
            TaskParameters::RunHealthCheck(p) if p.target.trim().is_empty() => invalid("target is empty"),
            TaskParameters::ExecuteScript(p) if p.script.trim().is_empty() => invalid("script is empty"),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    RequiresApproval,
    Approved,
    Running,
    Completed,
    Failed,
    Rejected,
    Cancelled,
    /// Stopped by a blocking safety check.
    Blocked,
}

impl TaskStatus {
    /// Whether the task has run, or was refused, and must not run again.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Rejected | TaskStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::RequiresApproval => "REQUIRES_APPROVAL",
            TaskStatus::Approved => "APPROVED",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Rejected => "REJECTED",
            TaskStatus::Cancelled => "CANCELLED",
            TaskStatus::Blocked => "BLOCKED",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SafetyCheckKind {
    ResourceAvailability,
    Dependency,
    Backup,
    Permission,
    Impact,
    RollbackReadiness,
    /// A kind with no built-in validator.
    #[serde(other)]
    Other,
}

fn default_check_timeout() -> u64 {
    30
}

/// A pre-execution check attached to a task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SafetyCheck {
    pub name: String,
    pub kind: SafetyCheckKind,
    #[serde(default)]
    pub description: String,
    /// A failed blocking check stops execution unless forced.
    #[serde(default = "default_true")]
    pub is_blocking: bool,
    #[serde(default = "default_check_timeout")]
    pub timeout_secs: u64,
    /// Validator-specific settings.
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

impl SafetyCheck {
    pub fn new(name: impl Into<String>, kind: SafetyCheckKind) -> Self {
        Self {
            name: name.into(),
            kind,
            description: String::new(),
            is_blocking: true,
            timeout_secs: default_check_timeout(),
            parameters: Map::new(),
        }
    }

    pub fn non_blocking(mut self) -> Self {
        self.is_blocking = false;
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn with_param(mut self, key: &str, value: Value) -> Self {
        self.parameters.insert(key.to_string(), value);
        self
    }
}

/// How a failed task is undone.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RollbackProcedure {
    #[serde(default)]
    pub description: String,
    /// Steps for an operator when rollback is manual.
    #[serde(default)]
    pub steps: Vec<String>,
    /// Allow the executor to roll back on its own.
    #[serde(default = "default_true")]
    pub automated: bool,
}

/// A concrete remediation action proposed for an incident.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemediationTask {
    /// Caller-provided identifier.
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub task_type: TaskType,
    pub parameters: TaskParameters,
    pub status: TaskStatus,
    #[serde(default)]
    pub safety_checks: Vec<SafetyCheck>,
    #[serde(default)]
    pub rollback_procedure: Option<RollbackProcedure>,
    pub approval_required: bool,
    #[serde(default)]
    pub approval_request_id: Option<Uuid>,
    #[serde(default)]
    pub incident_id: Option<Uuid>,
    /// Stamped by the engine when the task is first admitted.
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl RemediationTask {
    /// Creates a pending task. Destructive task types require approval by default.
    pub fn new(id: impl Into<String>, name: impl Into<String>, parameters: TaskParameters) -> Self {
        let task_type = parameters.task_type();
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            task_type,
            parameters,
            status: TaskStatus::Pending,
            safety_checks: Vec::new(),
            rollback_procedure: None,
            approval_required: task_type.is_destructive(),
            approval_request_id: None,
            incident_id: None,
            created_at: None,
        }
    }

    /// Builds a task from an untyped proposal.
    pub fn from_json(
        id: impl Into<String>,
        name: impl Into<String>,
        task_type: &str,
        parameters: Value,
    ) -> Result<Self, TaskError> {
        let task_type: TaskType = task_type.parse()?;
        Ok(Self::new(id, name, TaskParameters::from_json(task_type, parameters)?))
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_safety_check(mut self, check: SafetyCheck) -> Self {
        self.safety_checks.push(check);
        self
    }

    pub fn with_rollback_procedure(mut self, procedure: RollbackProcedure) -> Self {
        self.rollback_procedure = Some(procedure);
        self
    }

    pub fn with_approval_required(mut self, required: bool) -> Self {
        self.approval_required = required;
        self
    }

    pub fn for_incident(mut self, incident_id: Uuid) -> Self {
        self.incident_id = Some(incident_id);
        self
    }

    pub fn requires_approval(&self) -> bool {
        self.approval_required
    }

    /// Structural checks run before anything else.
    pub fn validate(&self) -> Result<(), TaskError> {
        if self.id.trim().is_empty() {
            return Err(TaskError::Invalid("task id is empty".into()));
        }
        if self.name.trim().is_empty() {
            return Err(TaskError::Invalid("task name is empty".into()));
        }
        if self.parameters.task_type() != self.task_type {
            return Err(TaskError::Invalid(format!(
                "parameters are for {} but the task is {}",
                self.parameters.task_type(),
                self.task_type
            )));
        }
        self.parameters.validate()
    }

    /// View of the task used by approval rules.
    pub fn to_subject(&self) -> ApprovalSubject {
        ApprovalSubject {
            task_id: self.id.clone(),
            task_type: self.task_type.as_str().to_string(),
            name: self.name.clone(),
            parameters: self.parameters.to_json(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_task_type_parsing() {
        assert_eq!("scale_resource".parse::<TaskType>().unwrap(), TaskType::ScaleResource);
        assert_eq!("RESTART_SERVICE".parse::<TaskType>().unwrap(), TaskType::RestartService);
        assert_eq!("run-health-check".parse::<TaskType>().unwrap(), TaskType::RunHealthCheck);
        assert!(matches!(
            "reboot_datacenter".parse::<TaskType>(),
            Err(TaskError::UnknownTaskType(_))
        ));
    }

    #[test]
    fn test_from_json_builds_typed_parameters() {
        let task = RemediationTask::from_json(
            "t-1",
            "Scale checkout",
            "scale_resource",
            json!({"resource_id": "checkout-svc", "desired_capacity": 12, "previous_capacity": 4}),
        )
        .unwrap();

        assert_eq!(task.task_type, TaskType::ScaleResource);
        assert!(task.requires_approval());
        match &task.parameters {
            TaskParameters::ScaleResource(p) => {
                assert_eq!(p.desired_capacity, 12);
                assert_eq!(p.resource_type, "ecs_service");
            }
            other => panic!("unexpected parameters {:?}", other),
        }

        let subject = task.to_subject();
        assert_eq!(subject.task_type, "scale_resource");
        assert_eq!(subject.parameters["desired_capacity"], json!(12));
        assert!(!subject.parameters.contains_key("type"));
    }

    #[test]
    fn test_from_json_rejects_bad_parameters() {
        let missing = RemediationTask::from_json("t", "n", "restart_service", json!({"cluster": "a"}));
        assert!(matches!(missing, Err(TaskError::InvalidParameters { .. })));

        let wrong_type =
            RemediationTask::from_json("t", "n", "scale_resource", json!({"resource_id": "x", "desired_capacity": "many"}));
        assert!(wrong_type.is_err());
    }

    #[test]
    fn test_validate() {
        let logs = RemediationTask::new(
            "t-2",
            "Collect logs",
            TaskParameters::CollectLogs(CollectLogsParams {
                sources: vec!["api".into()],
                since_minutes: 30,
                destination: None,
            }),
        );
        assert!(logs.validate().is_ok());
        assert!(!logs.requires_approval());

        let mut unnamed = logs.clone();
        unnamed.name = " ".into();
        assert!(unnamed.validate().is_err());

        let mut mismatched = logs.clone();
        mismatched.task_type = TaskType::ExecuteScript;
        assert!(matches!(mismatched.validate(), Err(TaskError::Invalid(_))));

        let empty_script = RemediationTask::new(
            "t-3",
            "Run script",
            TaskParameters::ExecuteScript(ExecuteScriptParams {
                script: "".into(),
                args: vec![],
                host: None,
            }),
        );
        assert!(empty_script.validate().is_err());
    }

    #[test]
    fn test_unknown_safety_check_kind_deserializes() {
        let check: SafetyCheck =
            serde_json::from_value(json!({"name": "canary", "kind": "canary_analysis"})).unwrap();
        assert_eq!(check.kind, SafetyCheckKind::Other);
        assert!(check.is_blocking);
        assert_eq!(check.timeout_secs, 30);
    }
}
