//! # iw-policy
//!
//! Approval workflow and SLA tracking for Incident Warden.
//!
//! [`ApprovalWorkflow`] decides whether a remediation task needs a human
//! decision and tracks the resulting requests to quorum. [`PerformanceTracker`]
//! watches active incidents against severity-based SLA targets and escalates
//! breaches.

pub mod approval;
pub mod config;
pub mod sla;

pub use approval::{
    ApprovalAction, ApprovalConfig, ApprovalContext, ApprovalError, ApprovalEvaluation,
    ApprovalLevel, ApprovalRequest, ApprovalRule, ApprovalStatus, ApprovalSubject,
    ApprovalWorkflow, AutoApproveCondition, ParameterCondition,
};
pub use config::{load_policy, substitute_env_vars, ConfigError, PolicyConfig};
pub use sla::{
    PerformanceTracker, SlaConfig, SlaTarget, SlaTargets, SlaViolation, TeamConfig,
    TeamPerformanceMetrics, ViolationType,
};
