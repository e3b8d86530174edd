//! Run command - the detection, remediation, and SLA daemon.

use anyhow::{Context, Result};
use colored::Colorize;
use iw_actions::{AutomationEngine, ExecutionContext, ExecutionResult, ExecutionStatus, RemediationTask};
use iw_connectors::{HttpLogQuerySource, HttpTextAnalyzer, LogQuerySource, TextAnalyzer};
use iw_core::{
    CompositeNotifier, EventBus, Incident, IncidentDetector, IncidentStore, LogNotifier, Notifier,
    SharedClock, SystemClock, WebhookNotifier,
};
use iw_observability::{incident_span, task_span, AuditLog};
use iw_policy::{ApprovalStatus, ApprovalWorkflow, PerformanceTracker};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use crate::config::AppConfig;

/// Requester recorded on tasks the daemon proposes.
const DAEMON_REQUESTER: &str = "incident-warden";

/// Audit entries kept in memory.
const AUDIT_CAPACITY: usize = 10_000;

/// A task parked until its approval request is decided.
#[derive(Debug, Clone)]
struct PendingTask {
    task: RemediationTask,
    context: ExecutionContext,
    request_id: Uuid,
}

/// Wires the pipeline together and drives it on timers.
pub struct Daemon {
    config: AppConfig,
    store: Arc<IncidentStore>,
    detector: IncidentDetector,
    tracker: PerformanceTracker,
    engine: AutomationEngine,
    pending: Mutex<HashMap<String, PendingTask>>,
}

impl Daemon {
    /// Builds the daemon around the given collaborators.
    pub async fn new(
        config: AppConfig,
        source: Arc<dyn LogQuerySource>,
        analyzer: Option<Arc<dyn TextAnalyzer>>,
        notifier: Arc<dyn Notifier>,
        clock: SharedClock,
    ) -> Result<Self> {
        let store = Arc::new(
            IncidentStore::open(config.store.clone(), clock.clone())
                .await
                .context("Failed to open incident store")?,
        );
        let events = Arc::new(EventBus::default());

        let mut detector = IncidentDetector::new(
            config.detector.clone(),
            source,
            store.clone(),
            notifier.clone(),
            events.clone(),
        );
        if let Some(analyzer) = analyzer {
            detector = detector.with_analyzer(analyzer);
        }
        let rules = config.load_rules()?;
        let loaded = detector
            .load_rules(rules)
            .await
            .context("Failed to load detection rules")?;
        info!(rules = loaded, "Detection rules ready");

        let workflow = Arc::new(ApprovalWorkflow::new(
            config.policy.approval.clone(),
            notifier.clone(),
            events.clone(),
            clock.clone(),
        ));
        let tracker = PerformanceTracker::new(
            config.policy.sla.clone(),
            store.clone(),
            notifier.clone(),
            events.clone(),
        );
        let engine = AutomationEngine::new(
            config.effective_engine_config(),
            workflow,
            notifier,
            events.clone(),
            clock,
        )
        .with_audit_logger(Arc::new(AuditLog::new(AUDIT_CAPACITY)));

        Ok(Self {
            config,
            store,
            detector,
            tracker,
            engine,
            pending: Mutex::new(HashMap::new()),
        })
    }

    /// Builds the daemon with HTTP connectors and the configured notifier.
    pub async fn from_config(config: AppConfig) -> Result<Self> {
        let source_config = config
            .log_source
            .clone()
            .context("Missing required config: log_source")?;
        let source: Arc<dyn LogQuerySource> = Arc::new(
            HttpLogQuerySource::new(source_config).context("Failed to create log query source")?,
        );

        let analyzer: Option<Arc<dyn TextAnalyzer>> = match config.analyzer.clone() {
            Some(analyzer_config) => Some(Arc::new(
                HttpTextAnalyzer::new(analyzer_config).context("Failed to create text analyzer")?,
            )),
            None => None,
        };

        let mut notifier = CompositeNotifier::new().add_notifier(LogNotifier::new("log"));
        if let Some(url) = &config.notifications.webhook_url {
            let mut webhook =
                WebhookNotifier::new(url.clone()).context("Failed to create webhook notifier")?;
            if let Some(token) = &config.notifications.bearer_token {
                webhook = webhook.with_bearer_token(token.clone());
            }
            notifier = notifier.add_notifier(webhook);
        }

        Self::new(
            config,
            source,
            analyzer,
            Arc::new(notifier),
            SystemClock::shared(),
        )
        .await
    }

    pub fn store(&self) -> &Arc<IncidentStore> {
        &self.store
    }

    #[allow(dead_code)]
    pub fn engine(&self) -> &AutomationEngine {
        &self.engine
    }

    /// Task ids waiting on an approval decision, sorted.
    #[allow(dead_code)]
    pub async fn pending_tasks(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.pending.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Runs the detection rules and the playbooks for every new incident.
    pub async fn detection_sweep(&self) -> Vec<ExecutionResult> {
        let incidents = self.detector.detect_incidents().await;
        let mut results = Vec::new();
        for incident in incidents {
            let span = incident_span!(incident.id, severity = %incident.severity);
            results.extend(self.run_playbooks(&incident).instrument(span).await);
        }
        results
    }

    async fn run_playbooks(&self, incident: &Incident) -> Vec<ExecutionResult> {
        let Some(rule) = incident.metadata.get("rule").and_then(|v| v.as_str()) else {
            return Vec::new();
        };

        let context = ExecutionContext::new(DAEMON_REQUESTER).with_incident(incident.id, incident.severity);
        let mut results = Vec::new();
        for playbook in self.config.playbooks.iter().filter(|p| p.rule == rule) {
            let task = match playbook.build_task(incident) {
                Ok(task) => task,
                Err(e) => {
                    error!(playbook = %playbook.name, error = %e, "Playbook produced an invalid task");
                    continue;
                }
            };
            info!(playbook = %playbook.name, task_id = %task.id, "Proposing remediation");
            let result = self.drive(task, context.clone()).await;
            results.push(result);
        }
        results
    }

    /// Executes a task and parks it when it needs an approval decision.
    async fn drive(&self, task: RemediationTask, context: ExecutionContext) -> ExecutionResult {
        let span = task_span!(task.id, task.task_type);
        let result = self
            .engine
            .execute_task(task.clone(), &context)
            .instrument(span)
            .await;

        let mut pending = self.pending.lock().await;
        match (result.status, result.approval_request_id) {
            (ExecutionStatus::PendingApproval, Some(request_id)) => {
                pending.insert(
                    task.id.clone(),
                    PendingTask {
                        task,
                        context,
                        request_id,
                    },
                );
            }
            (ExecutionStatus::CapacityExceeded, _) => {
                warn!(task_id = %task.id, "Engine at capacity, task dropped");
                pending.remove(&task.id);
            }
            (status, _) => {
                info!(task_id = %task.id, status = %status, message = %result.message, "Task run finished");
                pending.remove(&task.id);
            }
        }
        result
    }

    /// Checks open incidents against their SLA targets.
    pub async fn sla_sweep(&self) -> usize {
        let violations = self.tracker.check_sla_violations().await;
        if !violations.is_empty() {
            info!(count = violations.len(), "SLA violations recorded");
        }
        violations.len()
    }

    /// Expires stale approval requests, prunes dead tasks and re-drives tasks
    /// whose request was decided.
    pub async fn approval_sweep(&self) -> Vec<ExecutionResult> {
        let expired = self.engine.expire_stale_approvals().await;
        if !expired.is_empty() {
            info!(count = expired.len(), "Approval requests expired");
        }

        let parked: Vec<PendingTask> = self.pending.lock().await.values().cloned().collect();
        let mut results = Vec::new();
        for entry in parked {
            let status = self
                .engine
                .workflow()
                .get_request(entry.request_id)
                .await
                .map(|r| r.status);
            match status {
                Some(ApprovalStatus::Pending) => {
                    debug!(task_id = %entry.task.id, "Still awaiting approval");
                }
                Some(ApprovalStatus::Expired) | None => {
                    warn!(task_id = %entry.task.id, request_id = %entry.request_id, "Approval request expired, task dropped");
                    self.pending.lock().await.remove(&entry.task.id);
                }
                Some(_) => {
                    results.push(self.drive(entry.task, entry.context).await);
                }
            }
        }
        results
    }

    /// Persists the incident store.
    pub async fn flush(&self) -> Result<()> {
        self.store
            .save_snapshot()
            .await
            .context("Failed to save incident snapshot")
    }

    /// Runs every loop until `shutdown` resolves, then writes a final snapshot.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let intervals = &self.config.intervals;
        let mut detection = ticker(intervals.detection_secs);
        let mut sla = ticker(intervals.sla_secs);
        let mut approvals = ticker(intervals.approval_expiry_secs);
        let mut snapshot = ticker(intervals.snapshot_secs);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = detection.tick() => {
                    self.detection_sweep().await;
                }
                _ = sla.tick() => {
                    self.sla_sweep().await;
                }
                _ = approvals.tick() => {
                    self.approval_sweep().await;
                }
                _ = snapshot.tick() => {
                    if let Err(e) = self.flush().await {
                        error!(error = %format!("{:#}", e), "Periodic snapshot failed");
                    }
                }
            }
        }

        info!("Shutting down, writing final snapshot");
        self.flush().await
    }
}

fn ticker(secs: u64) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(Duration::from_secs(secs.max(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

/// Runs the daemon until Ctrl+C.
pub async fn run_daemon(config: AppConfig, metrics_port: Option<u16>) -> Result<()> {
    println!("{} Starting Incident Warden...", "[daemon]".cyan());

    if let Some(port) = metrics_port {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("Failed to install Prometheus exporter")?;
        println!("  {} Metrics: http://{}/metrics", "→".green(), addr);
    }

    let daemon = Daemon::from_config(config).await?;
    println!("  {} Incidents loaded: {}", "✓".green(), daemon.store().len().await);
    println!();
    println!("Press {} to stop", "Ctrl+C".yellow());

    daemon
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for Ctrl+C");
            }
        })
        .await?;

    println!("{} Daemon stopped", "[daemon]".cyan());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PlaybookConfig;
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};
    use iw_actions::TaskStatus;
    use iw_connectors::testing::{rows, MockLogQuerySource};
    use iw_core::{IncidentStore, ManualClock, MemoryNotifier, StoreConfig};
    use iw_policy::ApprovalAction;
    use serde_json::json;
    use std::io::Write;
    use tempfile::{tempdir, NamedTempFile};

    const QUERY: &str = "status>=500 service=checkout";

    fn rules_file() -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(
            format!(
                "rules:\n  - name: checkout-5xx\n    query: \"{}\"\n    severity: HIGH\n    threshold: 50\n    correlation_fields: [service]\n",
                QUERY
            )
            .as_bytes(),
        )
        .unwrap();
        file
    }

    fn config(rules: &NamedTempFile, snapshot_dir: Option<std::path::PathBuf>) -> AppConfig {
        AppConfig {
            rules_file: Some(rules.path().to_path_buf()),
            store: StoreConfig {
                snapshot_dir,
                ..Default::default()
            },
            playbooks: vec![
                PlaybookConfig {
                    name: "collect-logs".into(),
                    rule: "checkout-5xx".into(),
                    task_type: "collect_logs".into(),
                    description: String::new(),
                    parameters: json!({"sources": ["checkout"]}),
                },
                PlaybookConfig {
                    name: "restart-checkout".into(),
                    rule: "checkout-5xx".into(),
                    task_type: "restart_service".into(),
                    description: "Restart the checkout service".into(),
                    parameters: json!({"service": "checkout"}),
                },
            ],
            ..Default::default()
        }
    }

    async fn daemon(config: AppConfig) -> (Daemon, Arc<MockLogQuerySource>, Arc<ManualClock>) {
        let (clock, shared) = ManualClock::shared(Utc.with_ymd_and_hms(2024, 5, 7, 10, 0, 0).unwrap());
        let source = Arc::new(MockLogQuerySource::new());
        let daemon = Daemon::new(config, source.clone(), None, Arc::new(MemoryNotifier::new()), shared)
            .await
            .unwrap();
        (daemon, source, clock)
    }

    #[tokio::test]
    async fn test_detection_runs_playbooks() {
        let rules = rules_file();
        let (daemon, source, _clock) = daemon(config(&rules, None)).await;
        source.set_rows(QUERY, rows(json!([{"service": "checkout", "count": 120}])));

        let results = daemon.detection_sweep().await;

        assert_eq!(daemon.store().len().await, 1);
        assert_eq!(results.len(), 2);
        let collect = results.iter().find(|r| r.task_id.starts_with("collect-logs-")).unwrap();
        assert_eq!(collect.status, ExecutionStatus::Completed);
        let restart = results.iter().find(|r| r.task_id.starts_with("restart-checkout-")).unwrap();
        assert_eq!(restart.status, ExecutionStatus::PendingApproval);
        assert_eq!(daemon.pending_tasks().await, vec![restart.task_id.clone()]);

        // Same window: no second incident, no second proposal.
        assert!(daemon.detection_sweep().await.is_empty());
    }

    #[tokio::test]
    async fn test_approved_task_is_redriven() {
        let rules = rules_file();
        let (daemon, source, _clock) = daemon(config(&rules, None)).await;
        source.set_rows(QUERY, rows(json!([{"service": "checkout", "count": 120}])));
        let results = daemon.detection_sweep().await;
        let restart = results
            .into_iter()
            .find(|r| r.status == ExecutionStatus::PendingApproval)
            .unwrap();

        assert!(daemon.approval_sweep().await.is_empty());

        daemon
            .engine()
            .process_approval(restart.approval_request_id.unwrap(), "oncall", ApprovalAction::Approve, None)
            .await
            .unwrap();
        let redriven = daemon.approval_sweep().await;

        assert_eq!(redriven.len(), 1);
        assert_eq!(redriven[0].status, ExecutionStatus::Completed);
        assert!(daemon.pending_tasks().await.is_empty());
        assert_eq!(
            daemon.engine().task_status(&restart.task_id).await.unwrap(),
            TaskStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_expired_request_drops_task() {
        let rules = rules_file();
        let (daemon, source, clock) = daemon(config(&rules, None)).await;
        source.set_rows(QUERY, rows(json!([{"service": "checkout", "count": 120}])));
        daemon.detection_sweep().await;
        let parked = daemon.pending_tasks().await;
        assert_eq!(parked.len(), 1);

        clock.advance(ChronoDuration::hours(2));
        assert!(daemon.approval_sweep().await.is_empty());
        assert!(daemon.pending_tasks().await.is_empty());
        assert!(daemon.engine().get_task(&parked[0]).await.is_none());
    }

    #[tokio::test]
    async fn test_sla_sweep_counts_violations() {
        let rules = rules_file();
        let (daemon, source, clock) = daemon(config(&rules, None)).await;
        source.set_rows(QUERY, rows(json!([{"service": "checkout", "count": 120}])));
        daemon.detection_sweep().await;

        assert_eq!(daemon.sla_sweep().await, 0);
        clock.advance(ChronoDuration::minutes(45));
        assert_eq!(daemon.sla_sweep().await, 1);
    }

    #[tokio::test]
    async fn test_shutdown_writes_snapshot() {
        let rules = rules_file();
        let dir = tempdir().unwrap();
        let snapshot_dir = dir.path().join("state");
        let (daemon, source, _clock) = daemon(config(&rules, Some(snapshot_dir.clone()))).await;
        source.set_rows(QUERY, rows(json!([{"service": "checkout", "count": 120}])));
        daemon.detection_sweep().await;

        daemon.run_until(async {}).await.unwrap();

        let (_, shared) = ManualClock::shared(Utc::now());
        let reopened = IncidentStore::open(
            StoreConfig {
                snapshot_dir: Some(snapshot_dir),
                ..Default::default()
            },
            shared,
        )
        .await
        .unwrap();
        assert_eq!(reopened.len().await, 1);
    }
}
