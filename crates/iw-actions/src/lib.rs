//! # iw-actions
//!
//! Remediation tasks and their execution for Incident Warden.
//!
//! A [`RemediationTask`] passes through the [`AutomationEngine`]: admission,
//! the approval gate backed by [`iw_policy::ApprovalWorkflow`], the
//! [`SafetyValidatorSet`], and finally the [`TaskExecutor`] for its type.
//! Failed tasks that may have changed their target are rolled back.

pub mod engine;
pub mod executor;
pub mod safety;
pub mod task;

pub use engine::{
    AutomationEngine, EngineConfig, EngineError, ExecutionContext, ExecutionResult,
    ExecutionStatus, RollbackRecord, RollbackStatus, RollbackStrategy,
};
pub use executor::{
    ExecutionOutput, ExecutorError, ExecutorRegistry, SimulatedCloudExecutor, SimulatedFailure,
    TaskExecutor,
};
pub use safety::{
    SafetyCheckOutcome, SafetyValidator, SafetyValidatorSet, ValidationResult, Verdict,
};
pub use task::{
    CollectLogsParams, ExecuteScriptParams, RemediationTask, RestartServiceParams,
    RollbackDeploymentParams, RollbackProcedure, RunHealthCheckParams, SafetyCheck,
    SafetyCheckKind, ScaleResourceParams, TaskError, TaskParameters, TaskStatus, TaskType,
    UpdateConfigParams,
};
