//! Automation engine.
//!
//! [`AutomationEngine::execute_task`] drives one remediation task through
//! admission, validation, the approval gate, safety checks, execution and,
//! on failure, rollback. Each step can stop the run; the returned
//! [`ExecutionResult`] says where through its [`ExecutionStatus`].
//!
//! A task waiting for approval is not a failure. The caller re-drives it with
//! the same task id once the request is decided.

use crate::executor::{ExecutionOutput, ExecutorError, ExecutorRegistry};
use crate::safety::{SafetyCheckOutcome, SafetyValidatorSet};
use crate::task::{RemediationTask, TaskStatus, TaskType};
use chrono::{DateTime, Utc};
use iw_core::notifications::{deliver, Notification, NotificationPriority, Notifier};
use iw_core::{EventBus, PipelineEvent, Severity, SharedClock};
use iw_observability::{AuditEventType, AuditLogger, MetricsCollector, NoopAuditLogger};
use iw_policy::{
    ApprovalAction, ApprovalContext, ApprovalError, ApprovalEvaluation, ApprovalRequest,
    ApprovalStatus, ApprovalWorkflow,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Task is not running: {0}")]
    TaskNotRunning(String),

    #[error("Approval error: {0}")]
    Approval(#[from] ApprovalError),
}

/// Engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub max_concurrent_tasks: usize,
    /// Limit for one executor call, rollback included.
    pub execution_timeout_secs: u64,
    pub audit_timeout_secs: u64,
    /// Simulate every task without side effects.
    pub dry_run: bool,
    /// Route every task through the approval workflow regardless of type.
    pub require_approval_for_all: bool,
    /// Finished results kept in memory.
    pub history_size: usize,
    /// Where manual rollback notices go.
    pub operations_channel: String,
    pub notification_timeout_secs: u64,
    /// Blocked or pending tasks not re-driven within this window are forgotten.
    pub stale_task_minutes: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 10,
            execution_timeout_secs: 300,
            audit_timeout_secs: 5,
            dry_run: false,
            require_approval_for_all: false,
            history_size: 1000,
            operations_channel: "#ops".to_string(),
            notification_timeout_secs: 10,
            stale_task_minutes: 24 * 60,
        }
    }
}

/// Who is asking for a task to run, and under which incident.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub requester_id: String,
    #[serde(default)]
    pub incident_id: Option<Uuid>,
    #[serde(default)]
    pub incident_severity: Option<Severity>,
    #[serde(default)]
    pub dry_run: bool,
    /// Run even when a blocking safety check fails.
    #[serde(default)]
    pub force_execution: bool,
}

impl ExecutionContext {
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

    pub fn force(mut self, force: bool) -> Self {
        self.force_execution = force;
        self
    }

    fn approval_context(&self, dry_run: bool) -> ApprovalContext {
        let context = ApprovalContext::new(self.requester_id.clone()).dry_run(dry_run);
        match (self.incident_id, self.incident_severity) {
            (Some(id), Some(severity)) => context.with_incident(id, severity),
            _ => context,
        }
    }
}

/// Where a run of [`AutomationEngine::execute_task`] ended.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Completed,
    Failed,
    /// Waiting on an approval request; re-drive once it is decided.
    PendingApproval,
    Rejected,
    ValidationFailed,
    Blocked,
    Cancelled,
    CapacityExceeded,
    /// The task already finished or is running right now.
    AlreadyProcessed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::PendingApproval => "pending_approval",
            ExecutionStatus::Rejected => "rejected",
            ExecutionStatus::ValidationFailed => "validation_failed",
            ExecutionStatus::Blocked => "blocked",
            ExecutionStatus::Cancelled => "cancelled",
            ExecutionStatus::CapacityExceeded => "capacity_exceeded",
            ExecutionStatus::AlreadyProcessed => "already_processed",
        }
    }

    /// Whether the run reached an end state that belongs in the history.
    fn is_recorded(&self) -> bool {
        !matches!(
            self,
            ExecutionStatus::PendingApproval
                | ExecutionStatus::CapacityExceeded
                | ExecutionStatus::AlreadyProcessed
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RollbackStrategy {
    Automated,
    Manual,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RollbackStatus {
    Succeeded,
    Failed,
    ManualRequired,
}

/// What happened when a failed task was rolled back.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RollbackRecord {
    pub strategy: RollbackStrategy,
    pub status: RollbackStatus,
    pub message: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionResult {
    pub execution_id: Uuid,
    pub task_id: String,
    pub task_type: TaskType,
    pub status: ExecutionStatus,
    /// Task status after this run.
    pub task_status: TaskStatus,
    pub message: String,
    pub approval_request_id: Option<Uuid>,
    pub safety_checks: Vec<SafetyCheckOutcome>,
    pub output: Option<ExecutionOutput>,
    pub rollback: Option<RollbackRecord>,
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Completed
    }
}

/// State accumulated over one run.
struct Run {
    execution_id: Uuid,
    started_at: DateTime<Utc>,
    started: Instant,
    dry_run: bool,
    safety_checks: Vec<SafetyCheckOutcome>,
    output: Option<ExecutionOutput>,
    rollback: Option<RollbackRecord>,
}

impl Run {
    fn start(started_at: DateTime<Utc>, dry_run: bool) -> Self {
        Self {
            execution_id: Uuid::new_v4(),
            started_at,
            started: Instant::now(),
            dry_run,
            safety_checks: Vec::new(),
            output: None,
            rollback: None,
        }
    }
}

type RunningMap = Arc<StdMutex<HashMap<String, watch::Sender<bool>>>>;

fn lock_running(running: &StdMutex<HashMap<String, watch::Sender<bool>>>) -> MutexGuard<'_, HashMap<String, watch::Sender<bool>>> {
    running.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Holds a running slot and frees it on drop.
struct RunningSlot {
    running: RunningMap,
    task_id: String,
    metrics: MetricsCollector,
}

impl Drop for RunningSlot {
    fn drop(&mut self) {
        let mut running = lock_running(&self.running);
        running.remove(&self.task_id);
        self.metrics.record_running_tasks(running.len());
    }
}

enum Admission {
    Admitted(RunningSlot, watch::Receiver<bool>),
    AlreadyRunning,
    AtCapacity(usize),
}

async fn cancellation(cancel: &mut watch::Receiver<bool>) {
    if cancel.wait_for(|cancelled| *cancelled).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Runs remediation tasks under approval and safety gates.
pub struct AutomationEngine {
    config: EngineConfig,
    workflow: Arc<ApprovalWorkflow>,
    validators: SafetyValidatorSet,
    executors: ExecutorRegistry,
    audit: Arc<dyn AuditLogger>,
    notifier: Arc<dyn Notifier>,
    events: Arc<EventBus>,
    clock: SharedClock,
    metrics: MetricsCollector,
    running: RunningMap,
    /// Latest state of every known task.
    tasks: RwLock<HashMap<String, RemediationTask>>,
    history: RwLock<VecDeque<ExecutionResult>>,
}

impl AutomationEngine {
    /// Creates an engine with the built-in validators and simulated executors.
    pub fn new(
        config: EngineConfig,
        workflow: Arc<ApprovalWorkflow>,
        notifier: Arc<dyn Notifier>,
        events: Arc<EventBus>,
        clock: SharedClock,
    ) -> Self {
        Self {
            config,
            workflow,
            validators: SafetyValidatorSet::with_defaults(),
            executors: ExecutorRegistry::simulated(),
            audit: Arc::new(NoopAuditLogger),
            notifier,
            events,
            clock,
            metrics: MetricsCollector::new(),
            running: Arc::new(StdMutex::new(HashMap::new())),
            tasks: RwLock::new(HashMap::new()),
            history: RwLock::new(VecDeque::new()),
        }
    }

    pub fn with_audit_logger(mut self, audit: Arc<dyn AuditLogger>) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_validators(mut self, validators: SafetyValidatorSet) -> Self {
        self.validators = validators;
        self
    }

    pub fn with_executors(mut self, executors: ExecutorRegistry) -> Self {
        self.executors = executors;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn workflow(&self) -> &Arc<ApprovalWorkflow> {
        &self.workflow
    }

    /// Runs `task` as far as its gates allow.
    #[instrument(skip(self, task, context), fields(task_id = %task.id, task_type = %task.task_type))]
    pub async fn execute_task(&self, task: RemediationTask, context: &ExecutionContext) -> ExecutionResult {
        let run = Run::start(self.clock.now(), self.config.dry_run || context.dry_run);

        let (_slot, mut cancel) = match self.admit(&task.id) {
            Admission::Admitted(slot, cancel) => (slot, cancel),
            Admission::AlreadyRunning => {
                debug!("Task is already running");
                let status = task.status;
                return self.reject(&task, run, ExecutionStatus::AlreadyProcessed, status, "task is already running".into());
            }
            Admission::AtCapacity(limit) => {
                warn!(limit, "Task rejected, engine at capacity");
                let status = task.status;
                return self.reject(
                    &task,
                    run,
                    ExecutionStatus::CapacityExceeded,
                    status,
                    format!("{} tasks are already running", limit),
                );
            }
        };

        let mut task = task;
        let stored = self
            .tasks
            .read()
            .await
            .get(&task.id)
            .map(|stored| (stored.status, stored.approval_request_id, stored.created_at));
        if let Some((stored_status, stored_request, stored_created)) = stored {
            if stored_status.is_final() {
                debug!(status = %stored_status, "Task already processed");
                return self.reject(
                    &task,
                    run,
                    ExecutionStatus::AlreadyProcessed,
                    stored_status,
                    format!("task is already {}", stored_status),
                );
            }
            if task.approval_request_id.is_none() {
                task.approval_request_id = stored_request;
            }
            if task.created_at.is_none() {
                task.created_at = stored_created;
            }
        }
        if task.created_at.is_none() {
            task.created_at = Some(run.started_at);
        }

        if let Err(e) = task.validate() {
            warn!(error = %e, "Task validation failed");
            task.status = TaskStatus::Failed;
            self.audit(
                AuditEventType::TaskFailed,
                "Task failed validation",
                json!({ "task_id": task.id, "error": e.to_string() }),
            )
            .await;
            return self
                .finish(task, run, ExecutionStatus::ValidationFailed, e.to_string())
                .await;
        }

        if task.requires_approval() || self.config.require_approval_for_all {
            if let Some((status, message)) = self.approval_gate(&mut task, context, run.dry_run).await {
                return self.finish(task, run, status, message).await;
            }
        }

        self.run_gated(task, run, context, &mut cancel).await
    }

    /// Safety checks, execution and rollback for an admitted, approved task.
    async fn run_gated(
        &self,
        mut task: RemediationTask,
        mut run: Run,
        context: &ExecutionContext,
        cancel: &mut watch::Receiver<bool>,
    ) -> ExecutionResult {
        task.status = TaskStatus::Running;
        self.tasks.write().await.insert(task.id.clone(), task.clone());
        info!(dry_run = run.dry_run, requester = %context.requester_id, "Task execution started");
        self.audit(
            AuditEventType::TaskStarted,
            &format!("Task '{}' started", task.name),
            json!({
                "task_id": task.id,
                "task_type": task.task_type.as_str(),
                "requester": context.requester_id,
                "incident_id": context.incident_id,
                "dry_run": run.dry_run,
            }),
        )
        .await;

        let outcomes = self.validators.run_all(&task).await;
        for outcome in &outcomes {
            self.audit(
                AuditEventType::SafetyCheck,
                &format!("Safety check '{}' {:?}", outcome.name, outcome.result),
                json!({
                    "task_id": task.id,
                    "check": outcome.name,
                    "result": outcome.result,
                    "message": outcome.message,
                    "blocking": outcome.is_blocking,
                }),
            )
            .await;
        }
        let blocking: Vec<String> = outcomes
            .iter()
            .filter(|o| o.blocks())
            .map(|o| format!("{}: {}", o.name, o.message))
            .collect();
        run.safety_checks = outcomes;

        if !blocking.is_empty() {
            if context.force_execution {
                warn!(checks = ?blocking, "Blocking safety checks overridden");
            } else {
                warn!(checks = ?blocking, "Task blocked by safety checks");
                task.status = TaskStatus::Blocked;
                return self
                    .finish(
                        task,
                        run,
                        ExecutionStatus::Blocked,
                        format!("blocked by safety checks: {}", blocking.join("; ")),
                    )
                    .await;
            }
        }

        if *cancel.borrow() {
            return self.cancelled(task, run).await;
        }
        self.workflow.consume_approval(&task.id).await;

        let execution = if run.dry_run {
            Ok(ExecutionOutput::success(format!(
                "Dry run: {} against {} skipped",
                task.task_type,
                task.parameters.target()
            ))
            .with_metadata("dry_run", json!(true)))
        } else {
            self.run_executor(&task, cancel).await
        };

        match execution {
            Ok(output) => {
                task.status = TaskStatus::Completed;
                self.audit(
                    AuditEventType::TaskCompleted,
                    &format!("Task '{}' completed", task.name),
                    json!({ "task_id": task.id, "stdout": output.stdout, "exit_code": output.exit_code }),
                )
                .await;
                let message = output.stdout.clone();
                run.output = Some(output);
                self.finish(task, run, ExecutionStatus::Completed, message).await
            }
            Err(ExecutorError::Cancelled) => self.cancelled(task, run).await,
            Err(e) => {
                error!(error = %e, "Task execution failed");
                task.status = TaskStatus::Failed;
                self.audit(
                    AuditEventType::TaskFailed,
                    &format!("Task '{}' failed", task.name),
                    json!({ "task_id": task.id, "error": e.to_string() }),
                )
                .await;
                let timed_out = matches!(e, ExecutorError::Timeout(_));
                if e.rollback_required() || (timed_out && task.task_type.is_destructive()) {
                    run.rollback = Some(self.roll_back(&task).await);
                }
                self.finish(task, run, ExecutionStatus::Failed, e.to_string()).await
            }
        }
    }

    fn admit(&self, task_id: &str) -> Admission {
        let mut running = lock_running(&self.running);
        if running.contains_key(task_id) {
            return Admission::AlreadyRunning;
        }
        if running.len() >= self.config.max_concurrent_tasks {
            return Admission::AtCapacity(self.config.max_concurrent_tasks);
        }
        let (sender, receiver) = watch::channel(false);
        running.insert(task_id.to_string(), sender);
        self.metrics.record_running_tasks(running.len());

        let slot = RunningSlot {
            running: self.running.clone(),
            task_id: task_id.to_string(),
            metrics: self.metrics.clone(),
        };
        Admission::Admitted(slot, receiver)
    }

    /// Returns the status and message to stop with, or `None` to proceed.
    async fn approval_gate(
        &self,
        task: &mut RemediationTask,
        context: &ExecutionContext,
        dry_run: bool,
    ) -> Option<(ExecutionStatus, String)> {
        let subject = task.to_subject();
        let previous = match task.approval_request_id {
            Some(request_id) => self.workflow.get_request(request_id).await,
            None => self.workflow.request_for_task(&task.id).await,
        };
        if let Some(request) = previous.filter(|r| r.covers(&subject)) {
            match request.status {
                ApprovalStatus::Rejected => {
                    task.status = TaskStatus::Rejected;
                    task.approval_request_id = Some(request.request_id);
                    return Some((
                        ExecutionStatus::Rejected,
                        format!("approval request {} was rejected", request.request_id),
                    ));
                }
                ApprovalStatus::Cancelled => {
                    task.status = TaskStatus::Cancelled;
                    task.approval_request_id = Some(request.request_id);
                    return Some((
                        ExecutionStatus::Cancelled,
                        format!("approval request {} was cancelled", request.request_id),
                    ));
                }
                _ => {}
            }
        }

        match self
            .workflow
            .evaluate_approval_requirement(&subject, &context.approval_context(dry_run))
            .await
        {
            ApprovalEvaluation::NotRequired => {
                debug!("No approval rule applies");
                None
            }
            ApprovalEvaluation::AutoApproved { rule } => {
                task.status = TaskStatus::Approved;
                self.audit(
                    AuditEventType::ApprovalDecision,
                    &format!("Task '{}' auto-approved by rule '{}'", task.name, rule),
                    json!({ "task_id": task.id, "rule": rule, "status": "auto_approved" }),
                )
                .await;
                None
            }
            ApprovalEvaluation::AlreadyApproved { request_id } => {
                task.status = TaskStatus::Approved;
                if request_id.is_some() {
                    task.approval_request_id = request_id;
                }
                None
            }
            ApprovalEvaluation::Pending(request) => {
                task.status = TaskStatus::RequiresApproval;
                task.approval_request_id = Some(request.request_id);
                info!(request_id = %request.request_id, level = %request.approval_level, "Task awaiting approval");
                self.audit(
                    AuditEventType::TaskPendingApproval,
                    &format!("Task '{}' awaiting approval", task.name),
                    json!({
                        "task_id": task.id,
                        "request_id": request.request_id,
                        "approval_level": request.approval_level.as_str(),
                        "expires_at": request.expires_at,
                    }),
                )
                .await;
                Some((
                    ExecutionStatus::PendingApproval,
                    format!(
                        "awaiting {} approval (request {})",
                        request.approval_level, request.request_id
                    ),
                ))
            }
        }
    }

    async fn run_executor(
        &self,
        task: &RemediationTask,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<ExecutionOutput, ExecutorError> {
        let executor = self.executors.get(task.task_type).ok_or_else(|| ExecutorError::Failed {
            message: format!("no executor registered for {}", task.task_type),
            rollback_required: false,
        })?;
        let limit = Duration::from_secs(self.config.execution_timeout_secs.max(1));

        tokio::select! {
            result = tokio::time::timeout(limit, executor.execute(task)) => {
                result.unwrap_or_else(|_| Err(ExecutorError::Timeout(limit.as_secs())))
            }
            _ = cancellation(cancel) => {
                warn!("Task cancelled during execution");
                Err(ExecutorError::Cancelled)
            }
        }
    }

    async fn roll_back(&self, task: &RemediationTask) -> RollbackRecord {
        self.audit(
            AuditEventType::RollbackStarted,
            &format!("Rolling back task '{}'", task.name),
            json!({ "task_id": task.id }),
        )
        .await;

        let automated = task.rollback_procedure.as_ref().map_or(true, |p| p.automated);
        let executor = self
            .executors
            .get(task.task_type)
            .filter(|executor| automated && executor.supports_rollback());

        let Some(executor) = executor else {
            return self.manual_rollback(task).await;
        };

        let limit = Duration::from_secs(self.config.execution_timeout_secs.max(1));
        let result = tokio::time::timeout(limit, executor.rollback(task))
            .await
            .unwrap_or_else(|_| Err(ExecutorError::Timeout(limit.as_secs())));
        let at = self.clock.now();
        match result {
            Ok(output) => {
                info!("Rollback completed");
                self.audit(
                    AuditEventType::RollbackCompleted,
                    &format!("Rollback of task '{}' completed", task.name),
                    json!({ "task_id": task.id, "stdout": output.stdout }),
                )
                .await;
                RollbackRecord {
                    strategy: RollbackStrategy::Automated,
                    status: RollbackStatus::Succeeded,
                    message: output.stdout,
                    at,
                }
            }
            Err(e) => {
                error!(error = %e, "Rollback failed");
                self.audit(
                    AuditEventType::RollbackFailed,
                    &format!("Rollback of task '{}' failed", task.name),
                    json!({ "task_id": task.id, "error": e.to_string() }),
                )
                .await;
                RollbackRecord {
                    strategy: RollbackStrategy::Automated,
                    status: RollbackStatus::Failed,
                    message: e.to_string(),
                    at,
                }
            }
        }
    }

    async fn manual_rollback(&self, task: &RemediationTask) -> RollbackRecord {
        let steps = task
            .rollback_procedure
            .as_ref()
            .filter(|p| !p.steps.is_empty())
            .map(|p| p.steps.join("\n"))
            .unwrap_or_else(|| "No rollback steps were provided.".to_string());
        let message = format!("Manual rollback required for {} on {}", task.task_type, task.parameters.target());
        warn!("{}", message);

        let notification = Notification::alert(
            self.config.operations_channel.clone(),
            format!("Manual rollback required: {}", task.name),
            format!("{}.\n{}", message, steps),
            NotificationPriority::High,
        )
        .with_metadata("task_id", task.id.clone());
        deliver(
            self.notifier.as_ref(),
            &notification,
            Duration::from_secs(self.config.notification_timeout_secs.max(1)),
        )
        .await;
        self.audit(
            AuditEventType::RollbackFailed,
            &message,
            json!({ "task_id": task.id, "manual": true }),
        )
        .await;

        RollbackRecord {
            strategy: RollbackStrategy::Manual,
            status: RollbackStatus::ManualRequired,
            message,
            at: self.clock.now(),
        }
    }

    async fn cancelled(&self, mut task: RemediationTask, run: Run) -> ExecutionResult {
        task.status = TaskStatus::Cancelled;
        self.audit(
            AuditEventType::TaskCancelled,
            &format!("Task '{}' cancelled", task.name),
            json!({ "task_id": task.id }),
        )
        .await;
        self.finish(task, run, ExecutionStatus::Cancelled, "task was cancelled".into())
            .await
    }

    fn build_result(
        &self,
        task: &RemediationTask,
        run: Run,
        status: ExecutionStatus,
        task_status: TaskStatus,
        message: String,
    ) -> ExecutionResult {
        ExecutionResult {
            execution_id: run.execution_id,
            task_id: task.id.clone(),
            task_type: task.task_type,
            status,
            task_status,
            message,
            approval_request_id: task.approval_request_id,
            safety_checks: run.safety_checks,
            output: run.output,
            rollback: run.rollback,
            dry_run: run.dry_run,
            started_at: run.started_at,
            finished_at: self.clock.now(),
            duration_ms: run.started.elapsed().as_millis() as u64,
        }
    }

    /// Result for a run that never got a slot or found the task already done.
    fn reject(
        &self,
        task: &RemediationTask,
        run: Run,
        status: ExecutionStatus,
        task_status: TaskStatus,
        message: String,
    ) -> ExecutionResult {
        self.metrics.record_task(task.task_type.as_str(), status.as_str());
        self.build_result(task, run, status, task_status, message)
    }

    async fn finish(
        &self,
        task: RemediationTask,
        run: Run,
        status: ExecutionStatus,
        message: String,
    ) -> ExecutionResult {
        let elapsed = run.started.elapsed();
        let result = self.build_result(&task, run, status, task.status, message);
        let task_type = task.task_type;
        self.metrics.record_task(task_type.as_str(), status.as_str());

        if !status.is_recorded() {
            self.tasks.write().await.insert(task.id.clone(), task);
            return result;
        }
        self.metrics
            .record_task_duration(task_type.as_str(), elapsed.as_secs_f64());

        {
            let mut tasks = self.tasks.write().await;
            let mut history = self.history.write().await;
            if status != ExecutionStatus::ValidationFailed {
                tasks.insert(task.id.clone(), task);
            }
            history.push_back(result.clone());
            while history.len() > self.config.history_size.max(1) {
                let Some(evicted) = history.pop_front() else {
                    break;
                };
                let referenced = history.iter().any(|r| r.task_id == evicted.task_id);
                let settled = tasks
                    .get(&evicted.task_id)
                    .map_or(false, |t| t.status.is_final());
                if !referenced && settled {
                    tasks.remove(&evicted.task_id);
                }
            }
        }

        info!(status = %status, duration_ms = result.duration_ms, "Task execution finished");
        self.events
            .publish(PipelineEvent::TaskFinished {
                task_id: result.task_id.clone(),
                task_type: task_type.as_str().to_string(),
                status: status.as_str().to_string(),
            })
            .await;
        result
    }

    async fn audit(&self, event_type: AuditEventType, message: &str, details: Value) {
        let limit = Duration::from_secs(self.config.audit_timeout_secs.max(1));
        if tokio::time::timeout(limit, self.audit.log(event_type, message, details))
            .await
            .is_err()
        {
            warn!(timeout_secs = limit.as_secs(), "Audit logger timed out");
        }
    }

    /// Records a vote and moves the task to APPROVED or REJECTED once decided.
    #[instrument(skip(self, comment))]
    pub async fn process_approval(
        &self,
        request_id: Uuid,
        user_id: &str,
        action: ApprovalAction,
        comment: Option<String>,
    ) -> Result<ApprovalRequest, EngineError> {
        let request = self
            .workflow
            .process_approval(request_id, user_id, action, comment)
            .await?;
        self.audit(
            AuditEventType::ApprovalDecision,
            &format!("{} voted {:?} on request {}", user_id, action, request_id),
            json!({
                "task_id": request.task_id,
                "request_id": request_id,
                "user": user_id,
                "status": request.status.as_str(),
            }),
        )
        .await;

        let next = match request.status {
            ApprovalStatus::Approved => TaskStatus::Approved,
            ApprovalStatus::Rejected => TaskStatus::Rejected,
            _ => return Ok(request),
        };
        let moved = {
            let mut tasks = self.tasks.write().await;
            match tasks.get_mut(&request.task_id) {
                Some(task) if task.status == TaskStatus::RequiresApproval => {
                    task.status = next;
                    true
                }
                _ => false,
            }
        };
        if moved {
            info!(task_id = %request.task_id, status = %next, "Task approval decided");
        }
        if moved && next == TaskStatus::Rejected {
            self.metrics
                .record_task(&request.task_type, ExecutionStatus::Rejected.as_str());
            self.events
                .publish(PipelineEvent::TaskFinished {
                    task_id: request.task_id.clone(),
                    task_type: request.task_type.clone(),
                    status: ExecutionStatus::Rejected.as_str().to_string(),
                })
                .await;
        }
        Ok(request)
    }

    /// Expires overdue approval requests and forgets tasks that can no longer run.
    ///
    /// A task that is not running is dropped from the registry when it is
    /// final but outside the history window, when it waits on an approval
    /// request that was closed without approval or is gone, or when it sat
    /// blocked or pending longer than `stale_task_minutes`.
    #[instrument(skip(self))]
    pub async fn expire_stale_approvals(&self) -> Vec<Uuid> {
        let expired = self.workflow.expire_stale_requests().await;
        let now = self.clock.now();
        let stale_cutoff = now - chrono::Duration::minutes(self.config.stale_task_minutes.max(0));

        let candidates: Vec<(String, TaskStatus, Option<Uuid>, Option<DateTime<Utc>>)> = self
            .tasks
            .read()
            .await
            .values()
            .map(|t| (t.id.clone(), t.status, t.approval_request_id, t.created_at))
            .collect();
        let recorded: HashSet<String> = self
            .history
            .read()
            .await
            .iter()
            .map(|r| r.task_id.clone())
            .collect();

        let mut forget = Vec::new();
        for (id, status, request_id, created_at) in candidates {
            let stale = match status {
                _ if status.is_final() => !recorded.contains(&id),
                TaskStatus::RequiresApproval | TaskStatus::Approved => match request_id {
                    Some(request_id) => self
                        .workflow
                        .get_request(request_id)
                        .await
                        .map_or(true, |r| {
                            matches!(
                                r.status,
                                ApprovalStatus::Expired | ApprovalStatus::Cancelled | ApprovalStatus::Rejected
                            )
                        }),
                    None => created_at.map_or(true, |at| at < stale_cutoff),
                },
                TaskStatus::Blocked | TaskStatus::Pending => created_at.map_or(true, |at| at < stale_cutoff),
                _ => false,
            };
            if stale {
                forget.push((id, status));
            }
        }

        if !forget.is_empty() {
            let running = lock_running(&self.running).keys().cloned().collect::<HashSet<_>>();
            let mut tasks = self.tasks.write().await;
            let mut dropped = 0;
            for (id, status) in forget {
                let unchanged = tasks.get(&id).map_or(false, |t| t.status == status);
                if unchanged && !running.contains(&id) {
                    tasks.remove(&id);
                    dropped += 1;
                }
            }
            if dropped > 0 {
                debug!(dropped, "Forgot tasks that can no longer run");
            }
        }
        expired
    }

    /// Signals a running task to stop. Best effort once the executor has started.
    pub fn cancel_task(&self, task_id: &str) -> Result<(), EngineError> {
        let running = lock_running(&self.running);
        let sender = running
            .get(task_id)
            .ok_or_else(|| EngineError::TaskNotRunning(task_id.to_string()))?;
        sender.send_replace(true);
        info!(task_id = %task_id, "Task cancellation requested");
        Ok(())
    }

    pub async fn get_task(&self, task_id: &str) -> Option<RemediationTask> {
        self.tasks.read().await.get(task_id).cloned()
    }

    pub async fn task_status(&self, task_id: &str) -> Result<TaskStatus, EngineError> {
        self.tasks
            .read()
            .await
            .get(task_id)
            .map(|t| t.status)
            .ok_or_else(|| EngineError::TaskNotFound(task_id.to_string()))
    }

    /// Ids of tasks holding a running slot, sorted.
    pub fn running_tasks(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock_running(&self.running).keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Finished results, newest first.
    pub async fn get_execution_history(&self, limit: Option<usize>) -> Vec<ExecutionResult> {
        let history = self.history.read().await;
        history
            .iter()
            .rev()
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{SimulatedCloudExecutor, SimulatedFailure};
    use crate::safety::ValidationResult;
    use crate::task::{
        CollectLogsParams, ExecuteScriptParams, SafetyCheck, SafetyCheckKind, ScaleResourceParams,
        TaskParameters,
    };
    use chrono::TimeZone;
    use iw_core::{ManualClock, MemoryNotifier, NotificationType};
    use iw_observability::AuditLog;
    use iw_policy::ApprovalConfig;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 5, 14, 0, 0).unwrap()
    }

    struct Harness {
        clock: Arc<ManualClock>,
        engine: Arc<AutomationEngine>,
        notifier: Arc<MemoryNotifier>,
        audit: Arc<AuditLog>,
    }

    fn harness(config: EngineConfig, executors: ExecutorRegistry) -> Harness {
        let (manual, clock) = ManualClock::shared(t0());
        let notifier = Arc::new(MemoryNotifier::new());
        let events = Arc::new(EventBus::default());
        let workflow = Arc::new(ApprovalWorkflow::new(
            ApprovalConfig::default(),
            notifier.clone(),
            events.clone(),
            clock.clone(),
        ));
        let audit = Arc::new(AuditLog::without_tracing(1000));
        let engine = AutomationEngine::new(config, workflow, notifier.clone(), events, clock)
            .with_executors(executors)
            .with_audit_logger(audit.clone());
        Harness {
            clock: manual,
            engine: Arc::new(engine),
            notifier,
            audit,
        }
    }

    fn collect_logs(id: &str) -> RemediationTask {
        RemediationTask::new(
            id,
            "Collect checkout logs",
            TaskParameters::CollectLogs(CollectLogsParams {
                sources: vec!["checkout".into()],
                since_minutes: 30,
                destination: None,
            }),
        )
    }

    fn scale(id: &str) -> RemediationTask {
        RemediationTask::new(
            id,
            "Scale checkout",
            TaskParameters::ScaleResource(ScaleResourceParams {
                resource_id: "checkout".into(),
                resource_type: "ecs_service".into(),
                desired_capacity: 6,
                previous_capacity: Some(3),
            }),
        )
    }

    fn context() -> ExecutionContext {
        ExecutionContext::new("warden")
    }

    async fn wait_until_running(engine: &AutomationEngine, task_id: &str) {
        for _ in 0..200 {
            if engine.running_tasks().iter().any(|id| id == task_id) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("task {} never started", task_id);
    }

    #[tokio::test]
    async fn test_read_only_task_runs_without_approval() {
        let h = harness(EngineConfig::default(), ExecutorRegistry::simulated());
        let result = h.engine.execute_task(collect_logs("logs-1"), &context()).await;

        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.task_status, TaskStatus::Completed);
        assert!(result.approval_request_id.is_none());
        assert_eq!(h.engine.task_status("logs-1").await.unwrap(), TaskStatus::Completed);
        assert_eq!(h.engine.get_task("logs-1").await.unwrap().created_at, Some(t0()));
        assert_eq!(h.engine.get_execution_history(None).await.len(), 1);
        assert!(h.engine.running_tasks().is_empty());

        let kinds: Vec<AuditEventType> = h
            .audit
            .get_task_entries("logs-1")
            .await
            .into_iter()
            .map(|e| e.event_type)
            .collect();
        assert_eq!(kinds, vec![AuditEventType::TaskStarted, AuditEventType::TaskCompleted]);
    }

    #[tokio::test]
    async fn test_destructive_task_waits_for_approval_then_runs_once() {
        let h = harness(EngineConfig::default(), ExecutorRegistry::simulated());

        let pending = h.engine.execute_task(scale("scale-1"), &context()).await;
        assert_eq!(pending.status, ExecutionStatus::PendingApproval);
        assert_eq!(pending.task_status, TaskStatus::RequiresApproval);
        let request_id = pending.approval_request_id.unwrap();
        assert!(h.engine.get_execution_history(None).await.is_empty());
        assert_eq!(h.notifier.sent_of_type(NotificationType::ApprovalRequired).len(), 1);

        // Re-driving before the decision does not raise a second request.
        let again = h.engine.execute_task(scale("scale-1"), &context()).await;
        assert_eq!(again.status, ExecutionStatus::PendingApproval);
        assert_eq!(again.approval_request_id, Some(request_id));

        let decided = h
            .engine
            .process_approval(request_id, "alice", ApprovalAction::Approve, None)
            .await
            .unwrap();
        assert_eq!(decided.status, ApprovalStatus::Approved);
        assert_eq!(h.engine.task_status("scale-1").await.unwrap(), TaskStatus::Approved);

        let done = h.engine.execute_task(scale("scale-1"), &context()).await;
        assert_eq!(done.status, ExecutionStatus::Completed);

        let repeat = h.engine.execute_task(scale("scale-1"), &context()).await;
        assert_eq!(repeat.status, ExecutionStatus::AlreadyProcessed);
        assert_eq!(repeat.task_status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_reused_task_id_needs_fresh_approval() {
        let h = harness(
            EngineConfig {
                history_size: 1,
                ..Default::default()
            },
            ExecutorRegistry::simulated(),
        );

        let pending = h.engine.execute_task(scale("scale-x"), &context()).await;
        let first_request = pending.approval_request_id.unwrap();
        h.engine
            .process_approval(first_request, "alice", ApprovalAction::Approve, None)
            .await
            .unwrap();
        let done = h.engine.execute_task(scale("scale-x"), &context()).await;
        assert_eq!(done.status, ExecutionStatus::Completed);
        assert!(!h.engine.workflow().is_task_approved("scale-x").await);

        // Pushes scale-x out of the history and the task registry.
        h.engine.execute_task(collect_logs("logs-z"), &context()).await;
        assert!(h.engine.get_task("scale-x").await.is_none());

        let mut reused = scale("scale-x");
        reused.parameters = TaskParameters::ScaleResource(ScaleResourceParams {
            resource_id: "checkout".into(),
            resource_type: "ecs_service".into(),
            desired_capacity: 1,
            previous_capacity: Some(3),
        });
        let rerun = h.engine.execute_task(reused, &context()).await;

        assert_eq!(rerun.status, ExecutionStatus::PendingApproval);
        assert_ne!(rerun.approval_request_id, Some(first_request));
        assert_eq!(h.notifier.sent_of_type(NotificationType::ApprovalRequired).len(), 2);
    }

    #[tokio::test]
    async fn test_sweep_forgets_tasks_that_can_no_longer_run() {
        let h = harness(EngineConfig::default(), ExecutorRegistry::simulated());
        let expiring = h.engine.execute_task(scale("scale-3"), &context()).await;
        let rejected = h.engine.execute_task(scale("scale-4"), &context()).await;
        h.engine
            .process_approval(rejected.approval_request_id.unwrap(), "bob", ApprovalAction::Reject, None)
            .await
            .unwrap();

        h.clock.advance(chrono::Duration::minutes(61));
        let open = h.engine.execute_task(scale("scale-5"), &context()).await;
        assert_eq!(open.status, ExecutionStatus::PendingApproval);

        let expired = h.engine.expire_stale_approvals().await;

        assert_eq!(expired, vec![expiring.approval_request_id.unwrap()]);
        assert!(matches!(
            h.engine.task_status("scale-3").await,
            Err(EngineError::TaskNotFound(_))
        ));
        assert!(h.engine.get_task("scale-4").await.is_none());
        let kept = h.engine.get_task("scale-5").await.unwrap();
        assert_eq!(kept.status, TaskStatus::RequiresApproval);
        assert_eq!(kept.created_at, Some(t0() + chrono::Duration::minutes(61)));

        // The rejection still stands for a re-drive.
        let redriven = h.engine.execute_task(scale("scale-4"), &context()).await;
        assert_eq!(redriven.status, ExecutionStatus::Rejected);
    }

    #[tokio::test]
    async fn test_blocked_task_is_forgotten_after_stale_window() {
        let h = harness(
            EngineConfig {
                stale_task_minutes: 30,
                ..Default::default()
            },
            ExecutorRegistry::simulated(),
        );
        let task = collect_logs("logs-blocked").with_safety_check(
            SafetyCheck::new("backup", SafetyCheckKind::Backup).with_param("backup_available", json!(false)),
        );
        let blocked = h.engine.execute_task(task, &context()).await;
        assert_eq!(blocked.status, ExecutionStatus::Blocked);

        h.engine.expire_stale_approvals().await;
        assert_eq!(h.engine.task_status("logs-blocked").await.unwrap(), TaskStatus::Blocked);

        h.clock.advance(chrono::Duration::minutes(31));
        h.engine.expire_stale_approvals().await;
        assert!(h.engine.get_task("logs-blocked").await.is_none());
    }

    #[tokio::test]
    async fn test_rejected_task_never_runs() {
        let executor = Arc::new(SimulatedCloudExecutor::new(TaskType::ScaleResource));
        let h = harness(
            EngineConfig::default(),
            ExecutorRegistry::simulated().register(executor.clone()),
        );

        let pending = h.engine.execute_task(scale("scale-2"), &context()).await;
        let request_id = pending.approval_request_id.unwrap();
        h.engine
            .process_approval(request_id, "bob", ApprovalAction::Reject, Some("not now".into()))
            .await
            .unwrap();
        assert_eq!(h.engine.task_status("scale-2").await.unwrap(), TaskStatus::Rejected);

        let result = h.engine.execute_task(scale("scale-2"), &context()).await;
        assert_eq!(result.status, ExecutionStatus::AlreadyProcessed);
        assert!(executor.operations().is_empty());
    }

    #[tokio::test]
    async fn test_require_approval_for_all() {
        let config = EngineConfig {
            require_approval_for_all: true,
            ..Default::default()
        };
        let h = harness(config, ExecutorRegistry::simulated());
        let result = h.engine.execute_task(collect_logs("logs-2"), &context()).await;
        assert_eq!(result.status, ExecutionStatus::PendingApproval);
    }

    #[tokio::test]
    async fn test_validation_failure() {
        let h = harness(EngineConfig::default(), ExecutorRegistry::simulated());
        let mut task = scale("scale-3");
        task.parameters = TaskParameters::ScaleResource(ScaleResourceParams {
            resource_id: String::new(),
            resource_type: "ecs_service".into(),
            desired_capacity: 2,
            previous_capacity: None,
        });

        let result = h.engine.execute_task(task, &context()).await;
        assert_eq!(result.status, ExecutionStatus::ValidationFailed);
        assert!(h.engine.get_task("scale-3").await.is_none());
    }

    #[tokio::test]
    async fn test_blocking_safety_check_and_force() {
        let h = harness(EngineConfig::default(), ExecutorRegistry::simulated());
        let check = SafetyCheck::new("deps", SafetyCheckKind::Dependency)
            .with_param("dependencies", json!(["postgres"]))
            .with_param("unhealthy", json!(["postgres"]));
        let task = collect_logs("logs-3").with_safety_check(check.clone());

        let blocked = h.engine.execute_task(task.clone(), &context()).await;
        assert_eq!(blocked.status, ExecutionStatus::Blocked);
        assert_eq!(blocked.task_status, TaskStatus::Blocked);
        assert_eq!(blocked.safety_checks[0].result, ValidationResult::Failed);

        // Blocked is not final, so the task may be re-driven with an override.
        let forced = h.engine.execute_task(task, &context().force(true)).await;
        assert_eq!(forced.status, ExecutionStatus::Completed);

        let non_blocking = collect_logs("logs-4").with_safety_check(check.non_blocking());
        let result = h.engine.execute_task(non_blocking, &context()).await;
        assert_eq!(result.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_failure_rolls_back_automatically() {
        let executor = Arc::new(SimulatedCloudExecutor::new(TaskType::ScaleResource));
        executor.set_failure(Some(SimulatedFailure {
            message: "capacity update rejected".into(),
            rollback_required: true,
        }));
        let h = harness(
            EngineConfig::default(),
            ExecutorRegistry::simulated().register(executor.clone()),
        );

        let task = scale("scale-4").with_approval_required(false);
        let result = h.engine.execute_task(task, &context()).await;

        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.task_status, TaskStatus::Failed);
        let rollback = result.rollback.unwrap();
        assert_eq!(rollback.strategy, RollbackStrategy::Automated);
        assert_eq!(rollback.status, RollbackStatus::Succeeded);
        assert_eq!(executor.operations().len(), 1);

        let kinds: Vec<AuditEventType> = h
            .audit
            .get_task_entries("scale-4")
            .await
            .into_iter()
            .map(|e| e.event_type)
            .collect();
        assert!(kinds.contains(&AuditEventType::RollbackStarted));
        assert!(kinds.contains(&AuditEventType::RollbackCompleted));
    }

    #[tokio::test]
    async fn test_rollback_failure_keeps_failed_status() {
        let executor = Arc::new(SimulatedCloudExecutor::new(TaskType::ScaleResource));
        executor.set_failure(Some(SimulatedFailure {
            message: "boom".into(),
            rollback_required: true,
        }));
        executor.set_rollback_failing(true);
        let h = harness(
            EngineConfig::default(),
            ExecutorRegistry::simulated().register(executor),
        );

        let result = h
            .engine
            .execute_task(scale("scale-5").with_approval_required(false), &context())
            .await;
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.rollback.unwrap().status, RollbackStatus::Failed);
    }

    #[tokio::test]
    async fn test_manual_rollback_notice() {
        let executor = Arc::new(SimulatedCloudExecutor::new(TaskType::ExecuteScript));
        executor.set_failure(Some(SimulatedFailure {
            message: "script exited 3".into(),
            rollback_required: true,
        }));
        let h = harness(
            EngineConfig::default(),
            ExecutorRegistry::simulated().register(executor),
        );
        let task = RemediationTask::new(
            "script-1",
            "Flush cache",
            TaskParameters::ExecuteScript(ExecuteScriptParams {
                script: "flush_cache.sh".into(),
                args: vec![],
                host: Some("cache-1".into()),
            }),
        )
        .with_approval_required(false);

        let result = h.engine.execute_task(task, &context()).await;
        let rollback = result.rollback.unwrap();
        assert_eq!(rollback.strategy, RollbackStrategy::Manual);
        assert_eq!(rollback.status, RollbackStatus::ManualRequired);

        let alerts = h.notifier.sent_of_type(NotificationType::Alert);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].channel, "#ops");
    }

    #[tokio::test]
    async fn test_dry_run_has_no_side_effects() {
        let executor = Arc::new(SimulatedCloudExecutor::new(TaskType::CollectLogs));
        let h = harness(
            EngineConfig::default(),
            ExecutorRegistry::simulated().register(executor.clone()),
        );

        let result = h
            .engine
            .execute_task(collect_logs("logs-5"), &context().dry_run(true))
            .await;
        assert_eq!(result.status, ExecutionStatus::Completed);
        assert!(result.dry_run);
        assert_eq!(result.output.unwrap().metadata["dry_run"], json!(true));
        assert!(executor.operations().is_empty());
    }

    #[tokio::test]
    async fn test_capacity_limit() {
        let slow = Arc::new(
            SimulatedCloudExecutor::new(TaskType::CollectLogs).with_latency(Duration::from_millis(300)),
        );
        let config = EngineConfig {
            max_concurrent_tasks: 1,
            ..Default::default()
        };
        let h = harness(config, ExecutorRegistry::simulated().register(slow));

        let engine = h.engine.clone();
        let first = tokio::spawn(async move { engine.execute_task(collect_logs("logs-6"), &context()).await });
        wait_until_running(&h.engine, "logs-6").await;

        let second = h.engine.execute_task(collect_logs("logs-7"), &context()).await;
        assert_eq!(second.status, ExecutionStatus::CapacityExceeded);

        let duplicate = h.engine.execute_task(collect_logs("logs-6"), &context()).await;
        assert_eq!(duplicate.status, ExecutionStatus::AlreadyProcessed);

        assert_eq!(first.await.unwrap().status, ExecutionStatus::Completed);
        assert!(h.engine.running_tasks().is_empty());

        // The slot is free again.
        let third = h.engine.execute_task(collect_logs("logs-7"), &context()).await;
        assert_eq!(third.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_cancel_running_task() {
        let slow = Arc::new(
            SimulatedCloudExecutor::new(TaskType::CollectLogs).with_latency(Duration::from_secs(10)),
        );
        let h = harness(EngineConfig::default(), ExecutorRegistry::simulated().register(slow));

        let engine = h.engine.clone();
        let run = tokio::spawn(async move { engine.execute_task(collect_logs("logs-8"), &context()).await });
        wait_until_running(&h.engine, "logs-8").await;

        h.engine.cancel_task("logs-8").unwrap();
        let result = run.await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Cancelled);
        assert_eq!(h.engine.task_status("logs-8").await.unwrap(), TaskStatus::Cancelled);

        assert!(matches!(
            h.engine.cancel_task("logs-8"),
            Err(EngineError::TaskNotRunning(_))
        ));
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let config = EngineConfig {
            history_size: 2,
            ..Default::default()
        };
        let h = harness(config, ExecutorRegistry::simulated());
        for id in ["logs-a", "logs-b", "logs-c"] {
            h.engine.execute_task(collect_logs(id), &context()).await;
        }

        let history = h.engine.get_execution_history(None).await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].task_id, "logs-c");
        assert!(h.engine.get_task("logs-a").await.is_none());
        assert!(h.engine.get_task("logs-c").await.is_some());
        assert_eq!(h.engine.get_execution_history(Some(1)).await.len(), 1);
    }
}
