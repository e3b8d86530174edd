//! Task executors.
//!
//! The engine dispatches each task to the [`TaskExecutor`] registered for its
//! type. The built-in executors simulate cloud operations and keep a record
//! of what they would have changed.

use crate::task::{RemediationTask, TaskParameters, TaskType};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExecutorError {
    #[error("Execution failed: {message}")]
    Failed {
        message: String,
        /// The target may have been partially changed.
        rollback_required: bool,
    },

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Timeout: task did not complete within {0} seconds")]
    Timeout(u64),

    #[error("Execution cancelled")]
    Cancelled,

    #[error("Rollback not supported for {0}")]
    RollbackNotSupported(TaskType),

    #[error("Rollback failed: {0}")]
    RollbackFailed(String),
}

impl ExecutorError {
    pub fn rollback_required(&self) -> bool {
        matches!(
            self,
            ExecutorError::Failed {
                rollback_required: true,
                ..
            }
        )
    }
}

/// What an executor reports back.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExecutionOutput {
    pub stdout: String,
    pub exit_code: i32,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl ExecutionOutput {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            exit_code: 0,
            metadata: Map::new(),
        }
    }

    pub fn with_metadata(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }
}

#[async_trait]
pub trait TaskExecutor: Send + Sync {
    fn task_type(&self) -> TaskType;

    async fn execute(&self, task: &RemediationTask) -> Result<ExecutionOutput, ExecutorError>;

    fn supports_rollback(&self) -> bool {
        false
    }

    async fn rollback(&self, task: &RemediationTask) -> Result<ExecutionOutput, ExecutorError> {
        Err(ExecutorError::RollbackNotSupported(task.task_type))
    }
}

/// Failure injected into a simulated executor.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulatedFailure {
    pub message: String,
    pub rollback_required: bool,
}

#[derive(Default)]
struct SimulationState {
    failure: Option<SimulatedFailure>,
    fail_rollback: bool,
    latency: Duration,
    operations: Vec<String>,
}

/// Executor that simulates the cloud API calls for one task type.
pub struct SimulatedCloudExecutor {
    task_type: TaskType,
    state: Mutex<SimulationState>,
}

impl SimulatedCloudExecutor {
    pub fn new(task_type: TaskType) -> Self {
        Self {
            task_type,
            state: Mutex::new(SimulationState::default()),
        }
    }

    pub fn with_latency(self, latency: Duration) -> Self {
        self.state().latency = latency;
        self
    }

    /// Makes every subsequent execution fail until cleared with `None`.
    pub fn set_failure(&self, failure: Option<SimulatedFailure>) {
        self.state().failure = failure;
    }

    pub fn set_rollback_failing(&self, failing: bool) {
        self.state().fail_rollback = failing;
    }

    /// Operations applied so far, oldest first.
    pub fn operations(&self) -> Vec<String> {
        self.state().operations.clone()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, SimulationState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_parameters(&self, task: &RemediationTask) -> Result<(), ExecutorError> {
        if task.parameters.task_type() != self.task_type {
            return Err(ExecutorError::InvalidParameters(format!(
                "{} executor received {} parameters",
                self.task_type,
                task.parameters.task_type()
            )));
        }
        Ok(())
    }

    fn apply(&self, task: &RemediationTask) -> ExecutionOutput {
        match &task.parameters {
            TaskParameters::RestartService(p) => {
                let cluster = p.cluster.as_deref().unwrap_or("default");
                ExecutionOutput::success(format!(
                    "Forced new deployment of service {} in cluster {}",
                    p.service, cluster
                ))
                .with_metadata("service", json!(p.service))
                .with_metadata("cluster", json!(cluster))
                .with_metadata("graceful", json!(p.graceful))
            }
            TaskParameters::ScaleResource(p) => ExecutionOutput::success(format!(
                "Set desired capacity of {} {} to {}",
                p.resource_type, p.resource_id, p.desired_capacity
            ))
            .with_metadata("resource_id", json!(p.resource_id))
            .with_metadata("desired_capacity", json!(p.desired_capacity))
            .with_metadata("previous_capacity", json!(p.previous_capacity)),
            TaskParameters::UpdateConfig(p) => ExecutionOutput::success(format!(
                "Updated {} keys on {}",
                p.changes.len(),
                p.target
            ))
            .with_metadata("target", json!(p.target))
            .with_metadata("keys", json!(p.changes.keys().collect::<Vec<_>>())),
            TaskParameters::RollbackDeployment(p) => ExecutionOutput::success(format!(
                "Deployed {} version {}",
                p.service, p.target_version
            ))
            .with_metadata("service", json!(p.service))
            .with_metadata("deployed_version", json!(p.target_version))
            .with_metadata("replaced_version", json!(p.current_version)),
            TaskParameters::CollectLogs(p) => {
                let destination = p.destination.as_deref().unwrap_or("local");
                ExecutionOutput::success(format!(
                    "Exported {} minutes of logs from {} sources to {}",
                    p.since_minutes,
                    p.sources.len(),
                    destination
                ))
                .with_metadata("sources", json!(p.sources))
                .with_metadata("destination", json!(destination))
            }
            TaskParameters::RunHealthCheck(p) => {
                let endpoint = p.endpoint.as_deref().unwrap_or("/health");
                ExecutionOutput::success(format!(
                    "{}{} returned {}",
                    p.target, endpoint, p.expected_status
                ))
                .with_metadata("status", json!(p.expected_status))
            }
            TaskParameters::ExecuteScript(p) => {
                let host = p.host.as_deref().unwrap_or("localhost");
                ExecutionOutput::success(format!("Ran {} on {}", p.script, host))
                    .with_metadata("host", json!(host))
                    .with_metadata("args", json!(p.args))
            }
        }
    }

    fn revert(&self, task: &RemediationTask) -> Result<ExecutionOutput, ExecutorError> {
        match &task.parameters {
            TaskParameters::RestartService(p) => Ok(ExecutionOutput::success(format!(
                "Restored previous task definition of {}",
                p.service
            ))),
            TaskParameters::ScaleResource(p) => {
                let previous = p.previous_capacity.ok_or_else(|| {
                    ExecutorError::RollbackFailed(format!(
                        "previous capacity of {} is unknown",
                        p.resource_id
                    ))
                })?;
                Ok(ExecutionOutput::success(format!(
                    "Restored capacity of {} to {}",
                    p.resource_id, previous
                )))
            }
            TaskParameters::UpdateConfig(p) => {
                let previous = p.previous_values.as_ref().ok_or_else(|| {
                    ExecutorError::RollbackFailed(format!("previous values of {} were not captured", p.target))
                })?;
                Ok(ExecutionOutput::success(format!(
                    "Restored {} keys on {}",
                    previous.len(),
                    p.target
                )))
            }
            TaskParameters::RollbackDeployment(p) => {
                let current = p.current_version.as_deref().ok_or_else(|| {
                    ExecutorError::RollbackFailed(format!("replaced version of {} is unknown", p.service))
                })?;
                Ok(ExecutionOutput::success(format!(
                    "Redeployed {} version {}",
                    p.service, current
                )))
            }
            _ => Err(ExecutorError::RollbackNotSupported(task.task_type)),
        }
    }
}

#[async_trait]
impl TaskExecutor for SimulatedCloudExecutor {
    fn task_type(&self) -> TaskType {
        self.task_type
    }

    #[instrument(skip(self, task), fields(task_id = %task.id))]
    async fn execute(&self, task: &RemediationTask) -> Result<ExecutionOutput, ExecutorError> {
        self.check_parameters(task)?;
        let (latency, failure) = {
            let state = self.state();
            (state.latency, state.failure.clone())
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if let Some(failure) = failure {
            warn!(task_type = %self.task_type, error = %failure.message, "Simulated execution failure");
            return Err(ExecutorError::Failed {
                message: failure.message,
                rollback_required: failure.rollback_required,
            });
        }

        let output = self.apply(task);
        info!(task_type = %self.task_type, "{}", output.stdout);
        self.state().operations.push(output.stdout.clone());
        Ok(output)
    }

    fn supports_rollback(&self) -> bool {
        matches!(
            self.task_type,
            TaskType::RestartService
                | TaskType::ScaleResource
                | TaskType::UpdateConfig
                | TaskType::RollbackDeployment
        )
    }

    async fn rollback(&self, task: &RemediationTask) -> Result<ExecutionOutput, ExecutorError> {
        self.check_parameters(task)?;
        if self.state().fail_rollback {
            return Err(ExecutorError::RollbackFailed("simulated rollback failure".into()));
        }
        let output = self.revert(task)?;
        debug!(task_type = %self.task_type, "{}", output.stdout);
        self.state().operations.push(output.stdout.clone());
        Ok(output)
    }
}

/// Executors keyed by task type.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<TaskType, Arc<dyn TaskExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A simulated executor for every task type.
    pub fn simulated() -> Self {
        TaskType::ALL
            .into_iter()
            .fold(Self::new(), |registry, task_type| {
                registry.register(Arc::new(SimulatedCloudExecutor::new(task_type)))
            })
    }

    /// Adds or replaces the executor for its task type.
    pub fn register(mut self, executor: Arc<dyn TaskExecutor>) -> Self {
        self.executors.insert(executor.task_type(), executor);
        self
    }

    pub fn get(&self, task_type: TaskType) -> Option<Arc<dyn TaskExecutor>> {
        self.executors.get(&task_type).cloned()
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}
