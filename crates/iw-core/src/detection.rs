//! Rule-based incident detection.
//!
//! A sweep runs every enabled [`DetectionRule`] against the log-query source
//! concurrently, waits for all of them, then correlates the incidents that
//! crossed their thresholds before storing and announcing them. A rule whose
//! query fails or times out is logged and skipped; it never aborts the sweep.

use crate::clock::SharedClock;
use crate::correlation::{correlate, CorrelationConfig};
use crate::events::{EventBus, PipelineEvent};
use crate::incident::{Incident, Severity};
use crate::notifications::{deliver, Notification, NotificationPriority, Notifier};
use crate::store::IncidentStore;
use chrono::{DateTime, Utc};
use iw_connectors::{ConnectorError, LogQuerySource, LogRow, TextAnalyzer};
use iw_observability::MetricsCollector;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{RwLock, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

/// Row fields read as a pre-aggregated count, in priority order.
pub const AGGREGATE_FIELDS: [&str; 4] = ["count", "total", "event_count", "value"];

/// Row fields that name an affected system regardless of rule configuration.
pub const WELL_KNOWN_SYSTEM_FIELDS: [&str; 8] = [
    "host",
    "hostname",
    "source",
    "sourceIPAddress",
    "service",
    "instance_id",
    "eventSource",
    "resource",
];

const MAX_SAMPLE_ROWS: usize = 5;

/// Errors raised by detection.
#[derive(Error, Debug)]
pub enum DetectionError {
    #[error("Detection rule already exists: {0}")]
    DuplicateRule(String),

    #[error("Detection rule not found: {0}")]
    RuleNotFound(String),

    #[error("Invalid detection rule '{name}': {reason}")]
    InvalidRule { name: String, reason: String },

    #[error("Query for rule '{rule}' failed: {source}")]
    QueryFailed {
        rule: String,
        #[source]
        source: ConnectorError,
    },

    #[error("Query for rule '{rule}' timed out after {timeout_secs}s")]
    QueryTimeout { rule: String, timeout_secs: u64 },
}

fn default_time_window() -> u32 {
    5
}

fn default_true() -> bool {
    true
}

/// A named query and the threshold that turns its result into an incident.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DetectionRule {
    /// Unique key.
    pub name: String,
    pub query: String,
    pub severity: Severity,
    #[serde(default)]
    pub description: String,
    /// Aggregate value at or above which the rule fires.
    pub threshold: u64,
    /// Window the query covers; also the dedup bucket width.
    #[serde(default = "default_time_window")]
    pub time_window_minutes: u32,
    /// Extra row fields naming affected systems.
    #[serde(default)]
    pub correlation_fields: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl DetectionRule {
    pub fn new(
        name: impl Into<String>,
        query: impl Into<String>,
        severity: Severity,
        threshold: u64,
    ) -> Self {
        Self {
            name: name.into(),
            query: query.into(),
            severity,
            description: String::new(),
            threshold,
            time_window_minutes: default_time_window(),
            correlation_fields: Vec::new(),
            tags: Vec::new(),
            enabled: true,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_time_window(mut self, minutes: u32) -> Self {
        self.time_window_minutes = minutes;
        self
    }

    pub fn with_correlation_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.correlation_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn validate(&self) -> Result<(), DetectionError> {
        let invalid = |reason: &str| DetectionError::InvalidRule {
            name: self.name.clone(),
            reason: reason.to_string(),
        };
        if self.name.trim().is_empty() {
            return Err(invalid("name is empty"));
        }
        if self.query.trim().is_empty() {
            return Err(invalid("query is empty"));
        }
        if self.time_window_minutes == 0 {
            return Err(invalid("time_window_minutes must be positive"));
        }
        Ok(())
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn row_aggregate(row: &LogRow) -> Option<f64> {
    AGGREGATE_FIELDS
        .iter()
        .find_map(|field| row.get(*field).and_then(as_number))
}

/// Aggregate value of a result set.
///
/// The sum of each row's aggregate field when every row carries one,
/// otherwise the number of rows.
pub fn rule_aggregate(rows: &[LogRow]) -> f64 {
    if rows.is_empty() {
        return 0.0;
    }
    rows.iter()
        .map(row_aggregate)
        .collect::<Option<Vec<f64>>>()
        .map(|values| values.iter().sum())
        .unwrap_or(rows.len() as f64)
}

/// Whether `rows` breach `rule`. An empty result never does.
pub fn check_threshold(rows: &[LogRow], rule: &DetectionRule) -> bool {
    !rows.is_empty() && rule_aggregate(rows) >= rule.threshold as f64
}

/// Systems named by the rule's correlation fields and the well-known keys.
pub fn extract_affected_systems(rows: &[LogRow], rule: &DetectionRule) -> BTreeSet<String> {
    let fields: Vec<&str> = rule
        .correlation_fields
        .iter()
        .map(String::as_str)
        .chain(WELL_KNOWN_SYSTEM_FIELDS)
        .collect();

    rows.iter()
        .flat_map(|row| fields.iter().filter_map(|field| row.get(*field)))
        .filter_map(|value| match value {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .collect()
}

/// Key identifying one breach of `rule` within its time window.
pub fn dedup_key(rule: &DetectionRule, now: DateTime<Utc>) -> String {
    let window = i64::from(rule.time_window_minutes.max(1));
    let bucket = now.timestamp().div_euclid(60).div_euclid(window);
    format!("rule:{}:{}", rule.name, bucket)
}

/// Narrative fields extracted from an analyzer response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Enrichment {
    pub description: Option<String>,
    pub tags: Vec<String>,
}

/// Reads an analyzer response.
///
/// A JSON object contributes its `description` and `tags` fields; any other
/// non-empty text becomes the description.
pub fn parse_enrichment(text: &str) -> Enrichment {
    let trimmed = strip_code_fence(text.trim());
    if trimmed.is_empty() {
        return Enrichment::default();
    }

    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(trimmed) {
        let description = map
            .get("description")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .map(str::to_string);
        let tags = map
            .get("tags")
            .and_then(Value::as_array)
            .map(|tags| {
                tags.iter()
                    .filter_map(Value::as_str)
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        return Enrichment { description, tags };
    }

    Enrichment {
        description: Some(trimmed.to_string()),
        tags: Vec::new(),
    }
}

fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let body = rest.split_once('\n').map_or("", |(_, body)| body);
    body.trim_end().trim_end_matches("```").trim()
}

/// Builds the analyzer prompt for a triggered rule.
pub fn build_prompt(
    rule: &DetectionRule,
    rows: &[LogRow],
    aggregate: f64,
    systems: &BTreeSet<String>,
) -> String {
    let samples = rows
        .iter()
        .take(MAX_SAMPLE_ROWS)
        .map(|row| format!("- {}", Value::Object(row.clone())))
        .collect::<Vec<_>>()
        .join("\n");
    let systems = if systems.is_empty() {
        "unknown".to_string()
    } else {
        systems.iter().cloned().collect::<Vec<_>>().join(", ")
    };

    format!(
        "An operational incident was raised by detection rule \"{name}\".\n\
         Rule description: {description}\n\
         Query: {query}\n\
         Severity: {severity}\n\
         Observed value: {aggregate} (threshold {threshold}, window {window} minutes)\n\
         Affected systems: {systems}\n\
         Sample rows ({shown} of {total}):\n{samples}\n\n\
         Reply with a JSON object {{\"description\": string, \"tags\": [string]}} \
         describing the likely cause and impact.",
        name = rule.name,
        description = if rule.description.is_empty() {
            "none"
        } else {
            &rule.description
        },
        query = rule.query,
        severity = rule.severity,
        aggregate = aggregate,
        threshold = rule.threshold,
        window = rule.time_window_minutes,
        systems = systems,
        shown = rows.len().min(MAX_SAMPLE_ROWS),
        total = rows.len(),
        samples = samples,
    )
}

fn canned_description(rule: &DetectionRule, aggregate: f64, systems: &BTreeSet<String>) -> String {
    let base = if rule.description.is_empty() {
        format!("Detection rule '{}' exceeded its threshold", rule.name)
    } else {
        rule.description.trim_end_matches('.').to_string()
    };
    let on = if systems.is_empty() {
        String::new()
    } else {
        format!(
            " on {}",
            systems.iter().cloned().collect::<Vec<_>>().join(", ")
        )
    };
    format!(
        "{}. Observed {} against a threshold of {} in the last {} minutes{}.",
        base, aggregate, rule.threshold, rule.time_window_minutes, on
    )
}

/// Detector settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Rule queries running at once.
    pub max_concurrent_queries: usize,
    pub query_timeout_secs: u64,
    pub analyzer_timeout_secs: u64,
    pub notification_timeout_secs: u64,
    /// Channel new incidents are announced on.
    pub detection_channel: String,
    pub correlation: CorrelationConfig,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_queries: 8,
            query_timeout_secs: 30,
            analyzer_timeout_secs: 20,
            notification_timeout_secs: 10,
            detection_channel: "#incidents".to_string(),
            correlation: CorrelationConfig::default(),
        }
    }
}

/// Dry-run result of a single rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleTestReport {
    pub rule_name: String,
    pub row_count: usize,
    pub aggregate: f64,
    pub threshold: u64,
    pub would_trigger: bool,
    pub affected_systems: Vec<String>,
    pub sample_rows: Vec<LogRow>,
    /// Query or validation failure, if any.
    pub error: Option<String>,
}

enum RuleOutcome {
    Triggered { incident: Incident, key: String },
    Quiet { rule: String },
    Failed { rule: String, error: DetectionError },
}

/// Everything a spawned rule evaluation needs, cloned per task.
#[derive(Clone)]
struct RuleRunner {
    source: Arc<dyn LogQuerySource>,
    analyzer: Option<Arc<dyn TextAnalyzer>>,
    query_timeout: Duration,
    analyzer_timeout: Duration,
    metrics: MetricsCollector,
}

impl RuleRunner {
    async fn query(&self, rule: &DetectionRule) -> Result<Vec<LogRow>, DetectionError> {
        match tokio::time::timeout(
            self.query_timeout,
            self.source.execute(&rule.query, self.query_timeout),
        )
        .await
        {
            Ok(Ok(rows)) => Ok(rows),
            Ok(Err(source)) => Err(DetectionError::QueryFailed {
                rule: rule.name.clone(),
                source,
            }),
            Err(_) => Err(DetectionError::QueryTimeout {
                rule: rule.name.clone(),
                timeout_secs: self.query_timeout.as_secs(),
            }),
        }
    }

    async fn evaluate(self, rule: DetectionRule, now: DateTime<Utc>) -> RuleOutcome {
        let rows = match self.query(&rule).await {
            Ok(rows) => rows,
            Err(error) => {
                return RuleOutcome::Failed {
                    rule: rule.name,
                    error,
                }
            }
        };

        if !check_threshold(&rows, &rule) {
            debug!(rule = %rule.name, rows = rows.len(), "Rule below threshold");
            return RuleOutcome::Quiet { rule: rule.name };
        }

        let aggregate = rule_aggregate(&rows);
        let systems = extract_affected_systems(&rows, &rule);
        let key = dedup_key(&rule, now);

        let mut incident = Incident::new(
            format!("{} threshold exceeded", rule.name),
            canned_description(&rule, aggregate, &systems),
            rule.severity,
            rule.query.clone(),
            now,
        );
        incident.affected_systems = systems;
        incident.tags = rule.tags.iter().cloned().collect();
        incident.metadata.insert("rule".into(), rule.name.clone().into());
        incident.metadata.insert("aggregate".into(), aggregate.into());
        incident.metadata.insert("threshold".into(), rule.threshold.into());
        incident.metadata.insert("row_count".into(), rows.len().into());
        incident.metadata.insert("dedup_key".into(), key.clone().into());

        self.enrich(&rule, &rows, aggregate, &mut incident).await;

        RuleOutcome::Triggered { incident, key }
    }

    async fn enrich(
        &self,
        rule: &DetectionRule,
        rows: &[LogRow],
        aggregate: f64,
        incident: &mut Incident,
    ) {
        let Some(analyzer) = &self.analyzer else {
            return;
        };
        let prompt = build_prompt(rule, rows, aggregate, &incident.affected_systems);

        match tokio::time::timeout(self.analyzer_timeout, analyzer.analyze(&prompt)).await {
            Ok(Ok(text)) => {
                let enrichment = parse_enrichment(&text);
                if let Some(description) = enrichment.description {
                    incident.description = description;
                }
                incident.tags.extend(enrichment.tags);
                incident
                    .metadata
                    .insert("analyzed_by".into(), analyzer.name().into());
            }
            Ok(Err(e)) => {
                warn!(rule = %rule.name, analyzer = %analyzer.name(), error = %e, "Analyzer failed, using canned description");
                self.metrics.record_analyzer_fallback();
            }
            Err(_) => {
                warn!(
                    rule = %rule.name,
                    analyzer = %analyzer.name(),
                    timeout_secs = self.analyzer_timeout.as_secs(),
                    "Analyzer timed out, using canned description"
                );
                self.metrics.record_analyzer_fallback();
            }
        }
    }
}

/// Runs detection rules and turns breaches into stored incidents.
pub struct IncidentDetector {
    config: DetectorConfig,
    rules: RwLock<Vec<DetectionRule>>,
    runner: RuleRunner,
    store: Arc<IncidentStore>,
    notifier: Arc<dyn Notifier>,
    events: Arc<EventBus>,
    clock: SharedClock,
    metrics: MetricsCollector,
}

impl IncidentDetector {
    /// Creates a detector with no rules. Time comes from the store's clock.
    pub fn new(
        config: DetectorConfig,
        source: Arc<dyn LogQuerySource>,
        store: Arc<IncidentStore>,
        notifier: Arc<dyn Notifier>,
        events: Arc<EventBus>,
    ) -> Self {
        let metrics = MetricsCollector::new();
        let runner = RuleRunner {
            source,
            analyzer: None,
            query_timeout: Duration::from_secs(config.query_timeout_secs.max(1)),
            analyzer_timeout: Duration::from_secs(config.analyzer_timeout_secs.max(1)),
            metrics: metrics.clone(),
        };
        Self {
            clock: store.clock().clone(),
            config,
            rules: RwLock::new(Vec::new()),
            runner,
            store,
            notifier,
            events,
            metrics,
        }
    }

    /// Enables narrative enrichment through `analyzer`.
    pub fn with_analyzer(mut self, analyzer: Arc<dyn TextAnalyzer>) -> Self {
        self.runner.analyzer = Some(analyzer);
        self
    }

    pub async fn add_rule(&self, rule: DetectionRule) -> Result<(), DetectionError> {
        rule.validate()?;
        let mut rules = self.rules.write().await;
        if rules.iter().any(|r| r.name == rule.name) {
            return Err(DetectionError::DuplicateRule(rule.name));
        }
        info!(rule = %rule.name, severity = %rule.severity, threshold = rule.threshold, "Detection rule added");
        rules.push(rule);
        Ok(())
    }

    /// Replaces the rule with the same name, returning the previous version.
    pub async fn update_rule(&self, rule: DetectionRule) -> Result<DetectionRule, DetectionError> {
        rule.validate()?;
        let mut rules = self.rules.write().await;
        let slot = rules
            .iter_mut()
            .find(|r| r.name == rule.name)
            .ok_or_else(|| DetectionError::RuleNotFound(rule.name.clone()))?;
        info!(rule = %rule.name, "Detection rule updated");
        Ok(std::mem::replace(slot, rule))
    }

    pub async fn remove_rule(&self, name: &str) -> Result<DetectionRule, DetectionError> {
        let mut rules = self.rules.write().await;
        let index = rules
            .iter()
            .position(|r| r.name == name)
            .ok_or_else(|| DetectionError::RuleNotFound(name.to_string()))?;
        info!(rule = %name, "Detection rule removed");
        Ok(rules.remove(index))
    }

    pub async fn get_rule(&self, name: &str) -> Option<DetectionRule> {
        self.rules.read().await.iter().find(|r| r.name == name).cloned()
    }

    pub async fn list_rules(&self) -> Vec<DetectionRule> {
        self.rules.read().await.clone()
    }

    /// Replaces the whole rule set. Nothing changes if any rule is invalid.
    pub async fn load_rules(&self, new_rules: Vec<DetectionRule>) -> Result<usize, DetectionError> {
        let mut names = BTreeSet::new();
        for rule in &new_rules {
            rule.validate()?;
            if !names.insert(rule.name.clone()) {
                return Err(DetectionError::DuplicateRule(rule.name.clone()));
            }
        }
        let count = new_rules.len();
        *self.rules.write().await = new_rules;
        info!(count, "Detection rules loaded");
        Ok(count)
    }

    /// Runs one detection sweep and returns the incidents it stored.
    #[instrument(skip(self))]
    pub async fn detect_incidents(&self) -> Vec<Incident> {
        let now = self.clock.now();
        let rules: Vec<DetectionRule> = self
            .rules
            .read()
            .await
            .iter()
            .filter(|r| r.enabled)
            .cloned()
            .collect();
        let rule_count = rules.len();

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_queries.max(1)));
        let mut tasks = JoinSet::new();
        for rule in rules {
            if self.store.is_seen(&dedup_key(&rule, now)).await {
                debug!(rule = %rule.name, "Rule already raised an incident in this window");
                continue;
            }
            let runner = self.runner.clone();
            let semaphore = semaphore.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                runner.evaluate(rule, now).await
            });
        }

        let mut triggered = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(RuleOutcome::Triggered { incident, key }) => triggered.push((key, incident)),
                Ok(RuleOutcome::Quiet { rule }) => debug!(rule = %rule, "No breach"),
                Ok(RuleOutcome::Failed { rule, error }) => {
                    let reason = match error {
                        DetectionError::QueryTimeout { .. } => "timeout",
                        _ => "error",
                    };
                    warn!(rule = %rule, error = %error, "Rule query failed, skipping");
                    self.metrics.record_rule_query_failure(&rule, reason);
                }
                Err(e) => error!(error = %e, "Detection task aborted"),
            }
        }

        triggered.sort_by(|a, b| a.0.cmp(&b.0));
        let mut fresh = Vec::with_capacity(triggered.len());
        for (key, incident) in triggered {
            if self.store.mark_seen(&key).await {
                fresh.push(incident);
            } else {
                debug!(key = %key, "Duplicate breach ignored");
            }
        }

        let groups = correlate(fresh, &self.config.correlation);
        let mut stored = Vec::with_capacity(groups.len());
        for group in groups {
            let incident = group.incident;
            let rule = incident
                .metadata
                .get("rule")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown")
                .to_string();

            self.store.insert(incident.clone()).await;
            self.metrics
                .record_incident_detected(&rule, incident.severity.as_str());
            info!(
                incident_id = %incident.id,
                rule = %rule,
                severity = %incident.severity,
                systems = incident.affected_systems.len(),
                "Incident detected"
            );

            self.events
                .publish(PipelineEvent::IncidentDetected {
                    incident_id: incident.id,
                    rule,
                    severity: incident.severity,
                })
                .await;
            if !group.merged_ids.is_empty() {
                self.metrics
                    .record_incidents_correlated(group.merged_ids.len() + 1);
                self.events
                    .publish(PipelineEvent::IncidentsCorrelated {
                        primary_id: incident.id,
                        merged_ids: group.merged_ids.clone(),
                    })
                    .await;
            }

            self.notify(&incident).await;
            stored.push(incident);
        }

        info!(rules = rule_count, raised = stored.len(), "Detection sweep complete");
        stored
    }

    /// Runs `rule` once and reports what a sweep would do, without side effects.
    #[instrument(skip(self, rule), fields(rule = %rule.name))]
    pub async fn test_detection_rule(&self, rule: &DetectionRule) -> RuleTestReport {
        let mut report = RuleTestReport {
            rule_name: rule.name.clone(),
            row_count: 0,
            aggregate: 0.0,
            threshold: rule.threshold,
            would_trigger: false,
            affected_systems: Vec::new(),
            sample_rows: Vec::new(),
            error: None,
        };

        if let Err(e) = rule.validate() {
            report.error = Some(e.to_string());
            return report;
        }

        match self.runner.query(rule).await {
            Ok(rows) => {
                report.row_count = rows.len();
                report.aggregate = rule_aggregate(&rows);
                report.would_trigger = check_threshold(&rows, rule);
                report.affected_systems = extract_affected_systems(&rows, rule)
                    .into_iter()
                    .collect();
                report.sample_rows = rows.into_iter().take(MAX_SAMPLE_ROWS).collect();
            }
            Err(e) => report.error = Some(e.to_string()),
        }
        report
    }

    /// Dry-runs a registered rule by name.
    pub async fn test_rule_by_name(&self, name: &str) -> Result<RuleTestReport, DetectionError> {
        let rule = self
            .get_rule(name)
            .await
            .ok_or_else(|| DetectionError::RuleNotFound(name.to_string()))?;
        Ok(self.test_detection_rule(&rule).await)
    }

    async fn notify(&self, incident: &Incident) {
        let mut message = incident.description.clone();
        if !incident.affected_systems.is_empty() {
            message.push_str(&format!(
                "\nAffected systems: {}",
                incident
                    .affected_systems
                    .iter()
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(", ")
            ));
        }
        let notification = Notification::alert(
            self.config.detection_channel.clone(),
            format!("[{}] {}", incident.severity, incident.title),
            message,
            NotificationPriority::from(incident.severity),
        )
        .with_metadata("incident_id", incident.id.to_string());

        deliver(
            self.notifier.as_ref(),
            &notification,
            Duration::from_secs(self.config.notification_timeout_secs.max(1)),
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::notifications::MemoryNotifier;
    use crate::store::StoreConfig;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use iw_connectors::testing::{rows, MockLogQuerySource, MockTextAnalyzer};
    use serde_json::json;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
    }

    struct Harness {
        clock: Arc<ManualClock>,
        source: Arc<MockLogQuerySource>,
        store: Arc<IncidentStore>,
        notifier: Arc<MemoryNotifier>,
        events: Arc<EventBus>,
    }

    impl Harness {
        fn new() -> Self {
            let (clock, shared) = ManualClock::shared(t0());
            Self {
                clock,
                source: Arc::new(MockLogQuerySource::new()),
                store: Arc::new(IncidentStore::new(StoreConfig::default(), shared)),
                notifier: Arc::new(MemoryNotifier::new()),
                events: Arc::new(EventBus::new(64)),
            }
        }

        fn detector(&self, config: DetectorConfig) -> IncidentDetector {
            IncidentDetector::new(
                config,
                self.source.clone(),
                self.store.clone(),
                self.notifier.clone(),
                self.events.clone(),
            )
        }
    }

    fn errors_rule() -> DetectionRule {
        DetectionRule::new("high-error-rate", "status>=500 | count", Severity::High, 50)
            .with_description("5xx responses above normal")
    }

    #[test]
    fn test_threshold_uses_aggregate_fields_or_row_count() {
        let rule = DetectionRule::new("r", "q", Severity::Low, 50);

        assert!(!check_threshold(&[], &DetectionRule::new("r", "q", Severity::Low, 0)));
        assert!(check_threshold(&rows(json!([{"count": 51}])), &rule));
        assert!(check_threshold(&rows(json!([{"count": 50}])), &rule));
        assert!(!check_threshold(&rows(json!([{"count": 49}])), &rule));
        assert!(check_threshold(
            &rows(json!([{"total": 20}, {"event_count": "30"}])),
            &rule
        ));

        // One row without a numeric field falls back to counting rows.
        let mixed = rows(json!([{"count": 100}, {"host": "a"}]));
        assert_eq!(rule_aggregate(&mixed), 2.0);
        assert!(!check_threshold(&mixed, &rule));
    }

    #[test]
    fn test_extract_affected_systems() {
        let rule = DetectionRule::new("r", "q", Severity::Low, 1).with_correlation_fields(["cluster"]);
        let result = rows(json!([
            {"host": "web-1", "cluster": "eu-1", "count": 3},
            {"sourceIPAddress": "10.0.0.7", "instance_id": 42},
            {"service": "  ", "user": "alice"}
        ]));

        let systems = extract_affected_systems(&result, &rule);
        let expected: BTreeSet<String> = ["web-1", "eu-1", "10.0.0.7", "42"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(systems, expected);
    }

    #[test]
    fn test_dedup_key_buckets_by_window() {
        let rule = errors_rule().with_time_window(5);
        let key = dedup_key(&rule, t0());
        assert_eq!(key, dedup_key(&rule, t0() + ChronoDuration::minutes(4)));
        assert_ne!(key, dedup_key(&rule, t0() + ChronoDuration::minutes(5)));
        assert!(key.starts_with("rule:high-error-rate:"));
    }

    #[test]
    fn test_parse_enrichment() {
        let parsed = parse_enrichment(r#"{"description": "Database saturated", "tags": ["db", ""]}"#);
        assert_eq!(parsed.description.as_deref(), Some("Database saturated"));
        assert_eq!(parsed.tags, vec!["db".to_string()]);

        let fenced = parse_enrichment("```json\n{\"tags\": [\"cache\"]}\n```");
        assert!(fenced.description.is_none());
        assert_eq!(fenced.tags, vec!["cache".to_string()]);

        let plain = parse_enrichment("  Likely a bad deploy.  ");
        assert_eq!(plain.description.as_deref(), Some("Likely a bad deploy."));

        assert_eq!(parse_enrichment("   "), Enrichment::default());
    }

    #[test]
    fn test_prompt_includes_at_most_five_samples() {
        let rule = errors_rule();
        let many = rows(json!([
            {"n": 1}, {"n": 2}, {"n": 3}, {"n": 4}, {"n": 5}, {"n": 6}, {"n": 7}
        ]));
        let prompt = build_prompt(&rule, &many, 7.0, &BTreeSet::new());
        assert!(prompt.contains("high-error-rate"));
        assert!(prompt.contains("Sample rows (5 of 7)"));
        assert!(prompt.contains("{\"n\":5}"));
        assert!(!prompt.contains("{\"n\":6}"));
    }

    #[tokio::test]
    async fn test_threshold_breach_then_quiet() {
        let h = Harness::new();
        let detector = h.detector(DetectorConfig::default());
        detector.add_rule(errors_rule()).await.unwrap();

        h.source
            .set_rows("status>=500 | count", rows(json!([{"count": 51, "host": "api-1"}])));
        let raised = detector.detect_incidents().await;
        assert_eq!(raised.len(), 1);
        let incident = &raised[0];
        assert_eq!(incident.severity, Severity::High);
        assert!(incident.affected_systems.contains("api-1"));
        assert_eq!(h.notifier.sent().len(), 1);

        h.clock.advance(ChronoDuration::seconds(1));
        h.source
            .set_rows("status>=500 | count", rows(json!([{"count": 10}])));
        // Same window: the rule is not even queried again.
        assert!(detector.detect_incidents().await.is_empty());

        h.clock.advance(ChronoDuration::minutes(10));
        assert!(detector.detect_incidents().await.is_empty());

        assert_eq!(h.store.len().await, 1);
        assert_eq!(h.store.get(incident.id).await.as_ref(), Some(incident));
    }

    #[tokio::test]
    async fn test_repeated_breach_in_window_raises_once() {
        let h = Harness::new();
        let detector = h.detector(DetectorConfig::default());
        detector.add_rule(errors_rule()).await.unwrap();
        h.source
            .set_rows("status>=500 | count", rows(json!([{"count": 80}])));

        assert_eq!(detector.detect_incidents().await.len(), 1);
        h.clock.advance(ChronoDuration::minutes(1));
        assert!(detector.detect_incidents().await.is_empty());

        h.clock.advance(ChronoDuration::minutes(5));
        assert_eq!(detector.detect_incidents().await.len(), 1);
        assert_eq!(h.store.len().await, 2);
    }

    #[tokio::test]
    async fn test_failing_rule_does_not_abort_sweep() {
        let h = Harness::new();
        let detector = h.detector(DetectorConfig::default());
        detector.add_rule(errors_rule()).await.unwrap();
        detector
            .add_rule(DetectionRule::new("broken", "bad query", Severity::Low, 1))
            .await
            .unwrap();

        h.source.set_error(
            "bad query",
            ConnectorError::RequestFailed("syntax error".to_string()),
        );
        h.source
            .set_rows("status>=500 | count", rows(json!([{"count": 99}])));

        let raised = detector.detect_incidents().await;
        assert_eq!(raised.len(), 1);
        assert_eq!(h.source.calls_for("bad query"), 1);
    }

    #[tokio::test]
    async fn test_slow_query_is_skipped() {
        let h = Harness::new();
        let detector = h.detector(DetectorConfig {
            query_timeout_secs: 1,
            ..Default::default()
        });
        detector.add_rule(errors_rule()).await.unwrap();
        h.source.set_slow(
            "status>=500 | count",
            std::time::Duration::from_secs(3),
            rows(json!([{"count": 99}])),
        );

        assert!(detector.detect_incidents().await.is_empty());
        assert!(h.store.is_empty().await);
    }

    #[tokio::test]
    async fn test_analyzer_enrichment_and_fallback() {
        let h = Harness::new();
        let analyzer = Arc::new(MockTextAnalyzer::responding(
            r#"{"description": "Upstream database is refusing connections", "tags": ["database"]}"#,
        ));
        let detector = h
            .detector(DetectorConfig::default())
            .with_analyzer(analyzer.clone());
        detector.add_rule(errors_rule().with_tags(["api"])).await.unwrap();
        h.source
            .set_rows("status>=500 | count", rows(json!([{"count": 60}])));

        let raised = detector.detect_incidents().await;
        assert_eq!(raised[0].description, "Upstream database is refusing connections");
        assert!(raised[0].tags.contains("database"));
        assert!(raised[0].tags.contains("api"));
        assert!(analyzer.prompts()[0].contains("high-error-rate"));

        let h = Harness::new();
        let failing = Arc::new(MockTextAnalyzer::failing(ConnectorError::Timeout(
            "llm".to_string(),
        )));
        let detector = h.detector(DetectorConfig::default()).with_analyzer(failing);
        detector.add_rule(errors_rule()).await.unwrap();
        h.source
            .set_rows("status>=500 | count", rows(json!([{"count": 60}])));

        let raised = detector.detect_incidents().await;
        assert_eq!(raised.len(), 1);
        assert!(raised[0].description.starts_with("5xx responses above normal."));
    }

    #[tokio::test]
    async fn test_sweep_correlates_related_breaches() {
        let h = Harness::new();
        let detector = h.detector(DetectorConfig::default());
        let mut events = h.events.subscribe();
        detector.add_rule(errors_rule()).await.unwrap();
        detector
            .add_rule(DetectionRule::new("latency", "latency>2s", Severity::High, 5))
            .await
            .unwrap();
        h.source.set_rows(
            "status>=500 | count",
            rows(json!([{"count": 70, "host": "hostA"}])),
        );
        h.source
            .set_rows("latency>2s", rows(json!([{"count": 9, "host": "hostA"}])));

        let raised = detector.detect_incidents().await;
        assert_eq!(raised.len(), 1);
        assert_eq!(h.store.len().await, 1);
        assert_eq!(raised[0].metadata["correlation_group_size"], json!(2));

        let first = events.recv().await.unwrap();
        let second = events.recv().await.unwrap();
        assert_eq!(first.event_type(), "incident_detected");
        assert_eq!(second.event_type(), "incidents_correlated");
    }

    #[tokio::test]
    async fn test_rule_dry_run_has_no_side_effects() {
        let h = Harness::new();
        let detector = h.detector(DetectorConfig::default());
        h.source.set_rows(
            "status>=500 | count",
            rows(json!([{"count": 51, "host": "api-1"}])),
        );

        let report = detector.test_detection_rule(&errors_rule()).await;
        assert!(report.would_trigger);
        assert_eq!(report.aggregate, 51.0);
        assert_eq!(report.affected_systems, vec!["api-1".to_string()]);
        assert!(report.error.is_none());

        assert!(h.store.is_empty().await);
        assert!(!h.store.is_seen(&dedup_key(&errors_rule(), t0())).await);
        assert_eq!(h.notifier.call_count(), 0);

        h.source
            .set_error("status>=500 | count", ConnectorError::Timeout("x".into()));
        let failed = detector.test_detection_rule(&errors_rule()).await;
        assert!(!failed.would_trigger);
        assert!(failed.error.is_some());
    }

    #[tokio::test]
    async fn test_rule_management() {
        let h = Harness::new();
        let detector = h.detector(DetectorConfig::default());

        detector.add_rule(errors_rule()).await.unwrap();
        assert!(matches!(
            detector.add_rule(errors_rule()).await,
            Err(DetectionError::DuplicateRule(_))
        ));
        assert!(matches!(
            detector
                .add_rule(DetectionRule::new("empty", " ", Severity::Low, 1))
                .await,
            Err(DetectionError::InvalidRule { .. })
        ));

        let previous = detector
            .update_rule(errors_rule().with_time_window(15))
            .await
            .unwrap();
        assert_eq!(previous.time_window_minutes, 5);
        assert_eq!(
            detector
                .get_rule("high-error-rate")
                .await
                .unwrap()
                .time_window_minutes,
            15
        );

        assert!(matches!(
            detector.remove_rule("missing").await,
            Err(DetectionError::RuleNotFound(_))
        ));
        detector.remove_rule("high-error-rate").await.unwrap();
        assert!(detector.list_rules().await.is_empty());

        let duplicate_batch = vec![errors_rule(), errors_rule()];
        assert!(detector.load_rules(duplicate_batch).await.is_err());
        assert_eq!(detector.load_rules(vec![errors_rule()]).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_disabled_rules_are_not_queried() {
        let h = Harness::new();
        let detector = h.detector(DetectorConfig::default());
        detector.add_rule(errors_rule().disabled()).await.unwrap();
        h.source
            .set_rows("status>=500 | count", rows(json!([{"count": 500}])));

        assert!(detector.detect_incidents().await.is_empty());
        assert_eq!(h.source.total_calls(), 0);
    }
}
