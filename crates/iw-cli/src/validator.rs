//! Startup validation for Incident Warden configuration.

use crate::config::AppConfig;
use colored::Colorize;
use iw_connectors::ConnectorConfig;
use iw_core::DetectionRule;
use std::collections::HashSet;

/// Result of configuration validation.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// Problems that prevent the daemon from starting.
    pub errors: Vec<String>,
    /// Problems that should be addressed but don't prevent startup.
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    pub fn add_warning(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }

    /// Prints the validation result to the console.
    pub fn print(&self) {
        if !self.warnings.is_empty() {
            println!();
            println!("{}", "Configuration Warnings:".yellow().bold());
            for warning in &self.warnings {
                println!("  {} {}", "⚠".yellow(), warning);
            }
        }

        if !self.errors.is_empty() {
            println!();
            println!("{}", "Configuration Errors:".red().bold());
            for error in &self.errors {
                println!("  {} {}", "✗".red(), error);
            }
        }

        if self.errors.is_empty() && self.warnings.is_empty() {
            println!("  {} Configuration OK", "✓".green());
        }
    }
}

/// Validates application configuration before startup.
pub struct ConfigValidator;

impl ConfigValidator {
    /// Runs every check and collects the findings.
    pub fn validate(config: &AppConfig) -> ValidationResult {
        let mut result = ValidationResult::new();

        Self::validate_connectors(config, &mut result);
        Self::validate_limits(config, &mut result);
        Self::validate_policy(config, &mut result);
        let rules = Self::validate_rules(config, &mut result);
        Self::validate_playbooks(config, rules.as_deref(), &mut result);
        Self::validate_notifications(config, &mut result);

        if config.engine.dry_run {
            result.add_warning("Engine runs in dry-run mode. Remediation tasks will not change anything.");
        }

        result
    }

    fn validate_connectors(config: &AppConfig, result: &mut ValidationResult) {
        match &config.log_source {
            Some(source) => Self::validate_connector("log_source", source, result),
            None => result.add_error(
                "Missing required config: log_source. Detection rules need a log search backend.",
            ),
        }

        if let Some(analyzer) = &config.analyzer {
            Self::validate_connector("analyzer", analyzer, result);
        }
    }

    fn validate_connector(field: &str, connector: &ConnectorConfig, result: &mut ValidationResult) {
        if connector.base_url.is_empty() {
            result.add_error(format!("{}: base_url is required", field));
        } else if !connector.base_url.starts_with("http://")
            && !connector.base_url.starts_with("https://")
        {
            result.add_error(format!(
                "{}: base_url must use http:// or https://, got '{}'",
                field, connector.base_url
            ));
        }

        if connector.timeout_secs == 0 {
            result.add_error(format!("{}: timeout_secs must be greater than zero", field));
        }
    }

    fn validate_limits(config: &AppConfig, result: &mut ValidationResult) {
        let intervals = &config.intervals;
        for (name, value) in [
            ("intervals.detection_secs", intervals.detection_secs),
            ("intervals.sla_secs", intervals.sla_secs),
            ("intervals.approval_expiry_secs", intervals.approval_expiry_secs),
            ("intervals.snapshot_secs", intervals.snapshot_secs),
            ("engine.execution_timeout_secs", config.engine.execution_timeout_secs),
        ] {
            if value == 0 {
                result.add_error(format!("{} must be greater than zero", name));
            }
        }

        for (name, value) in [
            ("engine.max_concurrent_tasks", config.engine.max_concurrent_tasks),
            ("engine.history_size", config.engine.history_size),
            ("store.max_incidents", config.store.max_incidents),
            ("detector.max_concurrent_queries", config.detector.max_concurrent_queries),
        ] {
            if value == 0 {
                result.add_error(format!("{} must be greater than zero", name));
            }
        }

        if config.store.snapshot_dir.is_none() {
            result.add_warning(
                "store.snapshot_dir is not set. Incidents are kept in memory only and lost on restart.",
            );
        }
    }

    fn validate_policy(config: &AppConfig, result: &mut ValidationResult) {
        if let Err(e) = config.policy.validate() {
            result.add_error(format!("policy: {}", e));
        }
        if let Err(e) = config.detector.correlation.validate() {
            result.add_error(format!("detector.correlation: {}", e));
        }
        if config.policy.testing_mode {
            result.add_warning("policy.testing_mode is on. Every remediation task requires approval.");
        }
    }

    /// Returns the loaded rules, or `None` when the rules file is unusable.
    fn validate_rules(config: &AppConfig, result: &mut ValidationResult) -> Option<Vec<DetectionRule>> {
        let rules = match config.load_rules() {
            Ok(rules) => rules,
            Err(e) => {
                result.add_error(format!("{:#}", e));
                return None;
            }
        };

        if rules.is_empty() {
            result.add_warning("No detection rules configured. Set rules_file to enable detection.");
        }

        let mut names = HashSet::new();
        for rule in &rules {
            if let Err(e) = rule.validate() {
                result.add_error(format!("rule '{}': {}", rule.name, e));
            }
            if !names.insert(rule.name.as_str()) {
                result.add_error(format!("rule '{}' is defined more than once", rule.name));
            }
        }

        Some(rules)
    }

    fn validate_playbooks(
        config: &AppConfig,
        rules: Option<&[DetectionRule]>,
        result: &mut ValidationResult,
    ) {
        let mut names = HashSet::new();
        for playbook in &config.playbooks {
            if !names.insert(playbook.name.as_str()) {
                result.add_error(format!("playbook '{}' is defined more than once", playbook.name));
            }

            let sample_incident = iw_core::Incident::new(
                "validation",
                "",
                iw_core::Severity::Low,
                "",
                chrono::Utc::now(),
            );
            match playbook.build_task(&sample_incident) {
                Ok(task) => {
                    if let Err(e) = task.validate() {
                        result.add_error(format!("playbook '{}': {}", playbook.name, e));
                    }
                }
                Err(e) => result.add_error(format!("playbook '{}': {}", playbook.name, e)),
            }

            if let Some(rules) = rules {
                if !rules.iter().any(|r| r.name == playbook.rule) {
                    result.add_error(format!(
                        "playbook '{}' references unknown rule '{}'",
                        playbook.name, playbook.rule
                    ));
                }
            }
        }
    }

    fn validate_notifications(config: &AppConfig, result: &mut ValidationResult) {
        match &config.notifications.webhook_url {
            None => result.add_warning(
                "notifications.webhook_url is not set. Notifications are only written to the log.",
            ),
            Some(url) if !url.starts_with("http://") && !url.starts_with("https://") => {
                result.add_error(format!(
                    "notifications.webhook_url must use http:// or https://, got '{}'",
                    url
                ));
            }
            Some(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PlaybookConfig;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn valid_config() -> AppConfig {
        AppConfig {
            log_source: Some(ConnectorConfig {
                name: "loki".into(),
                base_url: "http://loki:3100".into(),
                ..Default::default()
            }),
            notifications: crate::config::NotificationSettings {
                webhook_url: Some("https://hooks.example.com/x".into()),
                bearer_token: None,
            },
            store: iw_core::StoreConfig {
                snapshot_dir: Some("/var/lib/incident-warden".into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn rules_file() -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(
            b"rules:\n  - name: checkout-5xx\n    query: status>=500\n    severity: HIGH\n    threshold: 10\n",
        )
        .unwrap();
        file
    }

    #[test]
    fn test_missing_log_source() {
        let mut config = valid_config();
        config.log_source = None;

        let mut result = ValidationResult::new();
        ConfigValidator::validate_connectors(&config, &mut result);

        assert!(result.has_errors());
        assert!(result.errors[0].contains("log_source"));
    }

    #[test]
    fn test_connector_scheme() {
        let mut config = valid_config();
        config.analyzer = Some(ConnectorConfig {
            name: "llm".into(),
            base_url: "ftp://llm".into(),
            ..Default::default()
        });

        let mut result = ValidationResult::new();
        ConfigValidator::validate_connectors(&config, &mut result);

        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].starts_with("analyzer"));
    }

    #[test]
    fn test_zero_interval_is_error() {
        let mut config = valid_config();
        config.intervals.sla_secs = 0;

        let mut result = ValidationResult::new();
        ConfigValidator::validate_limits(&config, &mut result);

        assert!(result.has_errors());
        assert!(result.errors[0].contains("intervals.sla_secs"));
    }

    #[test]
    fn test_snapshot_dir_warning() {
        let mut config = valid_config();
        config.store.snapshot_dir = None;

        let mut result = ValidationResult::new();
        ConfigValidator::validate_limits(&config, &mut result);

        assert!(!result.has_errors());
        assert!(result.has_warnings());
    }

    #[test]
    fn test_duplicate_rule_names() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(
            b"rules:\n  - {name: a, query: q1, severity: LOW, threshold: 1}\n  - {name: a, query: q2, severity: LOW, threshold: 2}\n",
        )
        .unwrap();
        let mut config = valid_config();
        config.rules_file = Some(file.path().to_path_buf());

        let mut result = ValidationResult::new();
        let rules = ConfigValidator::validate_rules(&config, &mut result);

        assert_eq!(rules.map(|r| r.len()), Some(2));
        assert!(result.errors.iter().any(|e| e.contains("more than once")));
    }

    #[test]
    fn test_unreadable_rules_file() {
        let mut config = valid_config();
        config.rules_file = Some("/nonexistent/rules.yaml".into());

        let result = ConfigValidator::validate(&config);
        assert!(result.errors.iter().any(|e| e.contains("rules file")));
    }

    #[test]
    fn test_playbook_checks() {
        let file = rules_file();
        let mut config = valid_config();
        config.rules_file = Some(file.path().to_path_buf());
        config.playbooks = vec![
            PlaybookConfig {
                name: "restart".into(),
                rule: "checkout-5xx".into(),
                task_type: "restart_service".into(),
                description: String::new(),
                parameters: serde_json::json!({"service": "checkout"}),
            },
            PlaybookConfig {
                name: "orphan".into(),
                rule: "missing-rule".into(),
                task_type: "collect_logs".into(),
                description: String::new(),
                parameters: serde_json::json!({"sources": ["checkout"]}),
            },
            PlaybookConfig {
                name: "bogus".into(),
                rule: "checkout-5xx".into(),
                task_type: "format_disk".into(),
                description: String::new(),
                parameters: serde_json::Value::Null,
            },
        ];

        let result = ConfigValidator::validate(&config);

        assert!(result.errors.iter().any(|e| e.contains("unknown rule 'missing-rule'")));
        assert!(result.errors.iter().any(|e| e.starts_with("playbook 'bogus'")));
        assert!(!result.errors.iter().any(|e| e.starts_with("playbook 'restart'")));
    }

    #[test]
    fn test_valid_config_passes() {
        let file = rules_file();
        let mut config = valid_config();
        config.rules_file = Some(file.path().to_path_buf());

        let result = ConfigValidator::validate(&config);
        assert!(!result.has_errors(), "unexpected errors: {:?}", result.errors);
        assert!(!result.has_warnings(), "unexpected warnings: {:?}", result.warnings);
    }

    #[test]
    fn test_dry_run_warning() {
        let mut config = valid_config();
        config.engine.dry_run = true;

        let result = ConfigValidator::validate(&config);
        assert!(result.warnings.iter().any(|w| w.contains("dry-run")));
    }
}
