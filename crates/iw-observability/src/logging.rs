//! Subscriber setup and span helpers.

use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Crates that receive the configured default level when `RUST_LOG` is unset.
const CRATE_TARGETS: [&str; 6] = [
    "iw_core",
    "iw_policy",
    "iw_actions",
    "iw_connectors",
    "iw_observability",
    "iw_cli",
];

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(with = "level_serde")]
    pub level: Level,
    /// Whether to use JSON format.
    pub json_format: bool,
    /// Whether to include span events.
    pub include_spans: bool,
    /// Whether to include file/line info.
    pub include_location: bool,
    /// Whether to include thread IDs.
    pub include_thread_ids: bool,
    /// Whether to include target (module path).
    pub include_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            json_format: false,
            include_spans: false,
            include_location: false,
            include_thread_ids: false,
            include_target: true,
        }
    }
}

impl LoggingConfig {
    /// Verbose human-readable output with spans, locations and thread ids.
    pub fn development() -> Self {
        Self {
            level: Level::DEBUG,
            include_spans: true,
            include_location: true,
            include_thread_ids: true,
            ..Self::default()
        }
    }

    /// JSON lines at INFO.
    pub fn production() -> Self {
        Self {
            json_format: true,
            ..Self::default()
        }
    }

    /// Filter directive used when `RUST_LOG` is unset, e.g. `iw_core=info,iw_cli=info`.
    pub fn default_directive(&self) -> String {
        let level = self.level.as_str().to_ascii_lowercase();
        let mut directive = String::new();
        for (i, target) in CRATE_TARGETS.iter().enumerate() {
            if i > 0 {
                directive.push(',');
            }
            directive.push_str(target);
            directive.push('=');
            directive.push_str(&level);
        }
        directive
    }

    fn span_events(&self) -> FmtSpan {
        if self.include_spans {
            FmtSpan::NEW | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        }
    }
}

/// Installs the global subscriber. Returns false if one was already installed.
pub fn init_logging_with_config(config: LoggingConfig) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.default_directive()));

    let base = fmt::layer()
        .with_span_events(config.span_events())
        .with_file(config.include_location)
        .with_line_number(config.include_location)
        .with_thread_ids(config.include_thread_ids)
        .with_target(config.include_target);
    let layer = if config.json_format {
        base.json().boxed()
    } else {
        base.boxed()
    };

    match tracing_subscriber::registry()
        .with(layer.with_filter(filter))
        .try_init()
    {
        Ok(()) => true,
        Err(err) => {
            tracing::debug!(error = %err, "Logging already initialized");
            false
        }
    }
}

/// Creates a span for incident processing.
#[macro_export]
macro_rules! incident_span {
    ($incident_id:expr) => {
        tracing::info_span!("incident", incident_id = %$incident_id)
    };
    ($incident_id:expr, $($field:tt)*) => {
        tracing::info_span!("incident", incident_id = %$incident_id, $($field)*)
    };
}

/// Creates a span for remediation task execution.
#[macro_export]
macro_rules! task_span {
    ($task_id:expr, $task_type:expr) => {
        tracing::info_span!("task", task_id = %$task_id, task_type = %$task_type)
    };
}

mod level_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S: Serializer>(level: &Level, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&level.to_string().to_lowercase())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Level, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Level::from_str(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LoggingConfig::default();
        assert_eq!(config.level, Level::INFO);
        assert!(!config.json_format);
    }

    #[test]
    fn test_production_config() {
        let config = LoggingConfig::production();
        assert_eq!(config.level, Level::INFO);
        assert!(config.json_format);
    }

    #[test]
    fn test_development_config() {
        let config = LoggingConfig::development();
        assert_eq!(config.level, Level::DEBUG);
        assert!(config.include_spans);
    }

    #[test]
    fn test_default_directive_covers_all_crates() {
        let directive = LoggingConfig::development().default_directive();
        assert!(directive.contains("iw_core=debug"));
        assert!(directive.contains("iw_cli=debug"));
        assert_eq!(directive.split(',').count(), CRATE_TARGETS.len());
    }

    #[test]
    fn test_second_init_is_ignored() {
        init_logging_with_config(LoggingConfig::default());
        assert!(!init_logging_with_config(LoggingConfig::production()));
    }

    #[test]
    fn test_level_deserializes_from_string() {
        let config: LoggingConfig =
            serde_json::from_str(r#"{"level": "warn", "json_format": true}"#).unwrap();
        assert_eq!(config.level, Level::WARN);
        assert!(config.json_format);
        assert!(config.include_target);
    }
}
