//! Configuration loading for the Incident Warden daemon.

use anyhow::{Context, Result};
use iw_actions::{EngineConfig, RemediationTask, TaskError};
use iw_connectors::ConnectorConfig;
use iw_core::{DetectionRule, DetectorConfig, Incident, StoreConfig};
use iw_observability::LoggingConfig;
use iw_policy::{substitute_env_vars, PolicyConfig};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};

/// File looked up in the working directory when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "incident-warden.yaml";

/// Application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Log search backend the detection rules query.
    pub log_source: Option<ConnectorConfig>,
    /// Optional text analyzer for incident descriptions.
    pub analyzer: Option<ConnectorConfig>,
    pub notifications: NotificationSettings,
    pub intervals: IntervalConfig,
    pub store: StoreConfig,
    pub detector: DetectorConfig,
    /// YAML file holding the detection rules.
    pub rules_file: Option<PathBuf>,
    pub engine: EngineConfig,
    /// Remediation proposed automatically for incidents of a rule.
    pub playbooks: Vec<PlaybookConfig>,
    pub logging: LoggingConfig,
    pub policy: PolicyConfig,
}

/// Where notifications are delivered.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationSettings {
    /// Webhook receiving every notification as JSON. Unset means log only.
    pub webhook_url: Option<String>,
    pub bearer_token: Option<String>,
}

/// Daemon loop intervals in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntervalConfig {
    pub detection_secs: u64,
    pub sla_secs: u64,
    pub approval_expiry_secs: u64,
    pub snapshot_secs: u64,
}

impl Default for IntervalConfig {
    fn default() -> Self {
        Self {
            detection_secs: 60,
            sla_secs: 60,
            approval_expiry_secs: 30,
            snapshot_secs: 300,
        }
    }
}

/// A remediation task template run for every incident raised by `rule`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlaybookConfig {
    pub name: String,
    pub rule: String,
    pub task_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: Value,
}

impl PlaybookConfig {
    /// Builds the task for `incident`. The task id is stable per incident.
    pub fn build_task(&self, incident: &Incident) -> Result<RemediationTask, TaskError> {
        let parameters = match &self.parameters {
            Value::Null => Value::Object(Default::default()),
            other => other.clone(),
        };
        Ok(RemediationTask::from_json(
            format!("{}-{}", self.name, incident.id),
            self.name.clone(),
            &self.task_type,
            parameters,
        )?
        .with_description(self.description.clone())
        .for_incident(incident.id))
    }
}

#[derive(Debug, Default, Deserialize)]
struct RulesFile {
    #[serde(default)]
    rules: Vec<DetectionRule>,
}

impl AppConfig {
    /// Loads configuration from a file, substituting `${VAR}` references.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let contents = substitute_env_vars(&contents)
            .with_context(|| format!("Failed to expand config file: {}", path.display()))?;

        let config: Self = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Loads `path`, or the default file when present, or the defaults.
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let default = Path::new(DEFAULT_CONFIG_FILE);
                if default.exists() {
                    Self::load(default)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Detection rules from `rules_file`; none when unset.
    pub fn load_rules(&self) -> Result<Vec<DetectionRule>> {
        let Some(path) = &self.rules_file else {
            return Ok(Vec::new());
        };
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read rules file: {}", path.display()))?;
        let contents = substitute_env_vars(&contents)
            .with_context(|| format!("Failed to expand rules file: {}", path.display()))?;
        let file: RulesFile = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse rules file: {}", path.display()))?;
        Ok(file.rules)
    }

    /// Engine settings with the policy's testing mode applied.
    pub fn effective_engine_config(&self) -> EngineConfig {
        let mut engine = self.engine.clone();
        engine.require_approval_for_all |= self.policy.testing_mode;
        engine
    }
}
