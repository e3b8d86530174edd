//! YAML policy configuration.
//!
//! A policy file carries the approval rules, SLA targets and team settings.
//! `${VAR}` references are replaced from the environment before parsing.

use crate::approval::{ApprovalConfig, ApprovalLevel, ParameterCondition};
use crate::sla::{SlaConfig, SlaTarget};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::env;
use std::path::Path;
use thiserror::Error;

/// Errors that can occur during configuration loading.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML configuration: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid regex pattern '{pattern}': {message}")]
    InvalidRegex { pattern: String, message: String },

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),

    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
}

/// Approval and SLA policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub approval: ApprovalConfig,
    pub sla: SlaConfig,
    /// Require approval for every remediation task regardless of type.
    pub testing_mode: bool,
}

impl PolicyConfig {
    /// Parses a policy document, substituting environment variables first.
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        let content = substitute_env_vars(content)?;
        let config: PolicyConfig = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks semantic constraints serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut names = HashSet::new();
        for rule in &self.approval.rules {
            if rule.name.trim().is_empty() {
                return Err(ConfigError::InvalidValue("approval rule name is empty".into()));
            }
            if !names.insert(rule.name.as_str()) {
                return Err(ConfigError::InvalidValue(format!(
                    "duplicate approval rule '{}'",
                    rule.name
                )));
            }
            if rule.timeout_minutes <= 0 {
                return Err(ConfigError::InvalidValue(format!(
                    "approval rule '{}': timeout_minutes must be positive",
                    rule.name
                )));
            }
            if rule.approval_level == ApprovalLevel::Dual
                && !rule.required_approvers.is_empty()
                && rule.required_approvers.len() < 2
            {
                return Err(ConfigError::InvalidValue(format!(
                    "approval rule '{}': DUAL approval needs at least two approvers",
                    rule.name
                )));
            }
            for condition in &rule.conditions {
                validate_condition(&rule.name, condition)?;
            }
        }
        if self.approval.default_timeout_minutes <= 0 {
            return Err(ConfigError::InvalidValue(
                "approval.default_timeout_minutes must be positive".into(),
            ));
        }

        let targets = &self.sla.targets;
        for (name, target) in [
            ("critical", &targets.critical),
            ("high", &targets.high),
            ("medium", &targets.medium),
            ("low", &targets.low),
        ] {
            validate_target(name, target)?;
        }

        let mut teams = HashSet::new();
        for team in &self.sla.teams {
            if !teams.insert(team.name.as_str()) {
                return Err(ConfigError::InvalidValue(format!(
                    "duplicate team '{}'",
                    team.name
                )));
            }
            if team.max_capacity == 0 {
                return Err(ConfigError::InvalidValue(format!(
                    "team '{}': max_capacity must be positive",
                    team.name
                )));
            }
        }
        if self.sla.default_max_capacity == 0 {
            return Err(ConfigError::InvalidValue(
                "sla.default_max_capacity must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Loads and validates a policy file.
pub fn load_policy(path: &Path) -> Result<PolicyConfig, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    PolicyConfig::from_yaml_str(&content)
}

/// Replaces `${VAR}` references with environment values.
///
/// Every missing variable is reported in one error.
pub fn substitute_env_vars(input: &str) -> Result<String, ConfigError> {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").map_err(|e| ConfigError::InvalidRegex {
        pattern: "env var".to_string(),
        message: e.to_string(),
    })?;
    let mut missing = Vec::new();

    let result = re.replace_all(input, |caps: &regex::Captures<'_>| match env::var(&caps[1]) {
        Ok(value) => value,
        Err(_) => {
            missing.push(caps[1].to_string());
            String::new()
        }
    });

    if !missing.is_empty() {
        return Err(ConfigError::EnvVarNotFound(missing.join(", ")));
    }
    Ok(result.into_owned())
}

fn validate_condition(rule: &str, condition: &ParameterCondition) -> Result<(), ConfigError> {
    match condition {
        ParameterCondition::Range { min: Some(min), max: Some(max), .. } if min > max => {
            Err(ConfigError::InvalidValue(format!(
                "approval rule '{}': range on '{}' has min {} above max {}",
                rule,
                condition.parameter(),
                min,
                max
            )))
        }
        ParameterCondition::Matches { pattern, .. } => Regex::new(pattern)
            .map(|_| ())
            .map_err(|e| ConfigError::InvalidRegex {
                pattern: pattern.clone(),
                message: e.to_string(),
            }),
        _ => Ok(()),
    }
}

fn validate_target(severity: &str, target: &SlaTarget) -> Result<(), ConfigError> {
    if target.response_time_minutes <= 0
        || target.escalation_time_minutes <= 0
        || target.resolution_time_minutes <= 0
    {
        return Err(ConfigError::InvalidValue(format!(
            "sla target '{}': times must be positive",
            severity
        )));
    }
    if target.escalation_time_minutes > target.resolution_time_minutes {
        return Err(ConfigError::InvalidValue(format!(
            "sla target '{}': escalation time exceeds resolution time",
            severity
        )));
    }
    Ok(())
}
