//! Pre-execution safety validators.
//!
//! Each [`SafetyCheck`] attached to a task is routed to the validator for its
//! kind and run under the check's own timeout. A check that times out fails;
//! a check with no validator is skipped.

use crate::task::{RemediationTask, SafetyCheck, SafetyCheckKind, TaskParameters, TaskType};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ValidationResult {
    Passed,
    Failed,
    Warning,
    Skipped,
}

/// A validator's decision and the reason for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub result: ValidationResult,
    pub message: String,
}

impl Verdict {
    pub fn passed(message: impl Into<String>) -> Self {
        Self::new(ValidationResult::Passed, message)
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(ValidationResult::Failed, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(ValidationResult::Warning, message)
    }

    fn new(result: ValidationResult, message: impl Into<String>) -> Self {
        Self {
            result,
            message: message.into(),
        }
    }
}

/// Result of one safety check as recorded on the execution result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SafetyCheckOutcome {
    pub name: String,
    pub kind: SafetyCheckKind,
    pub result: ValidationResult,
    pub message: String,
    pub is_blocking: bool,
    pub duration_ms: u64,
}

impl SafetyCheckOutcome {
    /// A failed blocking check.
    pub fn blocks(&self) -> bool {
        self.is_blocking && self.result == ValidationResult::Failed
    }
}

#[async_trait]
pub trait SafetyValidator: Send + Sync {
    fn kind(&self) -> SafetyCheckKind;

    async fn validate(&self, task: &RemediationTask, check: &SafetyCheck) -> Verdict;
}

fn param_bool(check: &SafetyCheck, key: &str) -> Option<bool> {
    check.parameters.get(key).and_then(Value::as_bool)
}

fn param_strings(check: &SafetyCheck, key: &str) -> Vec<String> {
    check
        .parameters
        .get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Capacity headroom for the requested change.
pub struct ResourceAvailabilityValidator;

#[async_trait]
impl SafetyValidator for ResourceAvailabilityValidator {
    fn kind(&self) -> SafetyCheckKind {
        SafetyCheckKind::ResourceAvailability
    }

    async fn validate(&self, task: &RemediationTask, check: &SafetyCheck) -> Verdict {
        if param_bool(check, "available") == Some(false) {
            return Verdict::failed("target resources reported unavailable");
        }
        if let TaskParameters::ScaleResource(p) = &task.parameters {
            let max = check
                .parameters
                .get("max_capacity")
                .and_then(Value::as_u64)
                .unwrap_or(100);
            if u64::from(p.desired_capacity) > max {
                return Verdict::failed(format!(
                    "desired capacity {} exceeds the limit of {}",
                    p.desired_capacity, max
                ));
            }
            if p.desired_capacity == 0 {
                return Verdict::warning("scaling to zero removes all capacity");
            }
        }
        Verdict::passed("resources available")
    }
}

/// Upstream dependencies of the target must be healthy.
pub struct DependencyValidator;

#[async_trait]
impl SafetyValidator for DependencyValidator {
    fn kind(&self) -> SafetyCheckKind {
        SafetyCheckKind::Dependency
    }

    async fn validate(&self, _task: &RemediationTask, check: &SafetyCheck) -> Verdict {
        let dependencies = param_strings(check, "dependencies");
        if dependencies.is_empty() {
            return Verdict::passed("no dependencies declared");
        }
        let unhealthy = param_strings(check, "unhealthy");
        let broken: Vec<&String> = dependencies
            .iter()
            .filter(|d| unhealthy.contains(d))
            .collect();
        if broken.is_empty() {
            Verdict::passed(format!("{} dependencies healthy", dependencies.len()))
        } else {
            Verdict::failed(format!(
                "unhealthy dependencies: {}",
                broken
                    .iter()
                    .map(|s| s.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ))
        }
    }
}

/// A restorable copy of the state being changed.
pub struct BackupValidator;

#[async_trait]
impl SafetyValidator for BackupValidator {
    fn kind(&self) -> SafetyCheckKind {
        SafetyCheckKind::Backup
    }

    async fn validate(&self, task: &RemediationTask, check: &SafetyCheck) -> Verdict {
        match param_bool(check, "backup_available") {
            Some(false) => return Verdict::failed("no backup available"),
            Some(true) => return Verdict::passed("backup verified"),
            None => {}
        }
        let captured = match &task.parameters {
            TaskParameters::UpdateConfig(p) => p.previous_values.is_some(),
            TaskParameters::RollbackDeployment(p) => p.current_version.is_some(),
            TaskParameters::ScaleResource(p) => p.previous_capacity.is_some(),
            _ => !task.task_type.is_destructive(),
        };
        if captured {
            Verdict::passed("previous state captured in task parameters")
        } else {
            Verdict::warning("no backup of the current state was verified")
        }
    }
}

/// The task type and target are allowed for automation.
pub struct PermissionValidator;

#[async_trait]
impl SafetyValidator for PermissionValidator {
    fn kind(&self) -> SafetyCheckKind {
        SafetyCheckKind::Permission
    }

    async fn validate(&self, task: &RemediationTask, check: &SafetyCheck) -> Verdict {
        let allowed = param_strings(check, "allowed_task_types");
        if !allowed.is_empty() && !allowed.iter().any(|t| t == task.task_type.as_str()) {
            return Verdict::failed(format!("{} is not permitted", task.task_type));
        }
        let target = task.parameters.target();
        if param_strings(check, "protected_targets").contains(&target) {
            return Verdict::failed(format!("target '{}' is protected", target));
        }
        Verdict::passed("permitted")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Impact {
    Low,
    Medium,
    High,
}

impl Impact {
    fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Some(Impact::Low),
            "medium" => Some(Impact::Medium),
            "high" => Some(Impact::High),
            _ => None,
        }
    }
}

/// Estimated blast radius against the allowed maximum.
pub struct ImpactValidator;

impl ImpactValidator {
    fn estimate(task: &RemediationTask) -> Impact {
        match &task.parameters {
            TaskParameters::ExecuteScript(_) => Impact::High,
            TaskParameters::RestartService(p) if !p.graceful => Impact::High,
            TaskParameters::ScaleResource(p) => match p.previous_capacity {
                Some(previous)
                    if previous > 0
                        && u64::from(p.desired_capacity) * 2 < u64::from(previous) =>
                {
                    Impact::High
                }
                Some(previous) if p.desired_capacity < previous => Impact::Medium,
                _ => Impact::Low,
            },
            _ if task.task_type.is_destructive() => Impact::Medium,
            _ => Impact::Low,
        }
    }
}

#[async_trait]
impl SafetyValidator for ImpactValidator {
    fn kind(&self) -> SafetyCheckKind {
        SafetyCheckKind::Impact
    }

    async fn validate(&self, task: &RemediationTask, check: &SafetyCheck) -> Verdict {
        let estimated = Self::estimate(task);
        let max = check
            .parameters
            .get("max_impact")
            .and_then(Value::as_str)
            .and_then(Impact::parse)
            .unwrap_or(Impact::High);
        if estimated > max {
            Verdict::failed(format!("estimated impact {:?} exceeds {:?}", estimated, max))
        } else if estimated == Impact::High {
            Verdict::warning("high impact change")
        } else {
            Verdict::passed(format!("estimated impact {:?}", estimated))
        }
    }
}

/// The task can be undone if it fails.
pub struct RollbackReadinessValidator;

#[async_trait]
impl SafetyValidator for RollbackReadinessValidator {
    fn kind(&self) -> SafetyCheckKind {
        SafetyCheckKind::RollbackReadiness
    }

    async fn validate(&self, task: &RemediationTask, _check: &SafetyCheck) -> Verdict {
        if let Some(procedure) = &task.rollback_procedure {
            if procedure.automated || !procedure.steps.is_empty() {
                return Verdict::passed("rollback procedure defined");
            }
        }
        if !task.task_type.is_destructive() {
            return Verdict::passed("task makes no changes");
        }
        if matches!(task.task_type, TaskType::ExecuteScript) {
            return Verdict::failed("scripts have no rollback procedure");
        }
        Verdict::passed(format!("automated rollback available for {}", task.task_type))
    }
}

/// Validators by check kind.
#[derive(Clone, Default)]
pub struct SafetyValidatorSet {
    validators: HashMap<SafetyCheckKind, Arc<dyn SafetyValidator>>,
}

impl SafetyValidatorSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// The six built-in validators.
    pub fn with_defaults() -> Self {
        Self::new()
            .with_validator(Arc::new(ResourceAvailabilityValidator))
            .with_validator(Arc::new(DependencyValidator))
            .with_validator(Arc::new(BackupValidator))
            .with_validator(Arc::new(PermissionValidator))
            .with_validator(Arc::new(ImpactValidator))
            .with_validator(Arc::new(RollbackReadinessValidator))
    }

    /// Adds or replaces the validator for its kind.
    pub fn with_validator(mut self, validator: Arc<dyn SafetyValidator>) -> Self {
        self.validators.insert(validator.kind(), validator);
        self
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    /// Runs one check under its timeout.
    pub async fn run_check(&self, task: &RemediationTask, check: &SafetyCheck) -> SafetyCheckOutcome {
        let started = Instant::now();
        let verdict = match self.validators.get(&check.kind) {
            None => Verdict::new(ValidationResult::Skipped, "no validator for this check"),
            Some(validator) => {
                let limit = Duration::from_secs(check.timeout_secs.max(1));
                match tokio::time::timeout(limit, validator.validate(task, check)).await {
                    Ok(verdict) => verdict,
                    Err(_) => {
                        warn!(check = %check.name, timeout_secs = limit.as_secs(), "Safety check timed out");
                        Verdict::failed(format!("timed out after {}s", limit.as_secs()))
                    }
                }
            }
        };
        debug!(check = %check.name, result = ?verdict.result, "Safety check finished");

        SafetyCheckOutcome {
            name: check.name.clone(),
            kind: check.kind,
            result: verdict.result,
            message: verdict.message,
            is_blocking: check.is_blocking,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }

    /// Runs the task's checks in order.
    pub async fn run_all(&self, task: &RemediationTask) -> Vec<SafetyCheckOutcome> {
        let mut outcomes = Vec::with_capacity(task.safety_checks.len());
        for check in &task.safety_checks {
            outcomes.push(self.run_check(task, check).await);
        }
        outcomes
    }
}
