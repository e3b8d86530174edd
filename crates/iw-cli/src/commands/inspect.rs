//! Offline commands: rule dry-runs and snapshot inspection.

use anyhow::{Context, Result};
use iw_connectors::{HttpLogQuerySource, LogQuerySource};
use iw_core::{
    EventBus, Incident, IncidentDetector, IncidentStatus, IncidentStore, LogNotifier,
    RuleTestReport, StoreConfig, SystemClock,
};
use std::sync::Arc;

use crate::config::AppConfig;

/// Dry-runs the named rule against the configured log source.
pub async fn test_rule(config: &AppConfig, name: &str) -> Result<RuleTestReport> {
    let source_config = config
        .log_source
        .clone()
        .context("Missing required config: log_source")?;
    let source = HttpLogQuerySource::new(source_config).context("Failed to create log query source")?;
    test_rule_with_source(config, Arc::new(source), name).await
}

/// Dry-runs the named rule against `source`. Nothing is stored or sent.
pub async fn test_rule_with_source(
    config: &AppConfig,
    source: Arc<dyn LogQuerySource>,
    name: &str,
) -> Result<RuleTestReport> {
    // Scratch store: the dry run must not touch the snapshot.
    let store = Arc::new(IncidentStore::new(StoreConfig::default(), SystemClock::shared()));
    let detector = IncidentDetector::new(
        config.detector.clone(),
        source,
        store,
        Arc::new(LogNotifier::new("test-rule")),
        Arc::new(EventBus::default()),
    );
    detector
        .load_rules(config.load_rules()?)
        .await
        .context("Failed to load detection rules")?;

    detector
        .test_rule_by_name(name)
        .await
        .with_context(|| format!("Cannot test rule '{}'", name))
}

/// Incidents from the snapshot directory, newest first.
pub async fn list_incidents(
    config: &AppConfig,
    status: Option<&str>,
    limit: usize,
) -> Result<Vec<Incident>> {
    if config.store.snapshot_dir.is_none() {
        anyhow::bail!("store.snapshot_dir is not set; there is no snapshot to read");
    }
    let store = IncidentStore::open(config.store.clone(), SystemClock::shared())
        .await
        .context("Failed to read incident snapshot")?;

    let mut incidents = match status {
        Some(status) => {
            let status: IncidentStatus = status.parse()?;
            store.list_by_status(status).await
        }
        None => store.list().await,
    };
    incidents.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
    incidents.truncate(limit);
    Ok(incidents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use iw_connectors::testing::{rows, MockLogQuerySource};
    use iw_core::{Clock, ManualClock, Severity};
    use serde_json::json;
    use std::io::Write;
    use tempfile::{tempdir, NamedTempFile};

    #[tokio::test]
    async fn test_rule_dry_run() {
        let mut rules = NamedTempFile::new().unwrap();
        rules
            .write_all(b"rules:\n  - {name: db-errors, query: level=error component=db, severity: MEDIUM, threshold: 5}\n")
            .unwrap();
        let config = AppConfig {
            rules_file: Some(rules.path().to_path_buf()),
            ..Default::default()
        };
        let source = Arc::new(MockLogQuerySource::new());
        source.set_rows(
            "level=error component=db",
            rows(json!([{"host": "db-1", "count": 3}, {"host": "db-2", "count": 4}])),
        );

        let report = test_rule_with_source(&config, source.clone(), "db-errors").await.unwrap();
        assert!(report.would_trigger);
        assert_eq!(report.aggregate, 7.0);
        assert_eq!(report.row_count, 2);

        let err = test_rule_with_source(&config, source, "missing").await.unwrap_err();
        assert!(format!("{:#}", err).contains("missing"));
    }

    #[tokio::test]
    async fn test_list_incidents_from_snapshot() {
        let dir = tempdir().unwrap();
        let store_config = StoreConfig {
            snapshot_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let (clock, shared) = ManualClock::shared(Utc::now() - Duration::hours(1));
        let store = IncidentStore::new(store_config.clone(), shared);
        let older = Incident::new("older", "", Severity::Low, "q", clock.now());
        let newer = Incident::new("newer", "", Severity::High, "q", clock.now() + Duration::minutes(5));
        store.insert(older.clone()).await;
        store.insert(newer.clone()).await;
        store.transition(older.id, IncidentStatus::Resolved).await.unwrap();
        store.save_snapshot().await.unwrap();

        let config = AppConfig {
            store: store_config,
            ..Default::default()
        };
        let all = list_incidents(&config, None, 10).await.unwrap();
        assert_eq!(all.iter().map(|i| i.id).collect::<Vec<_>>(), vec![newer.id, older.id]);

        let resolved = list_incidents(&config, Some("resolved"), 10).await.unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].id, older.id);

        assert_eq!(list_incidents(&config, None, 1).await.unwrap().len(), 1);
        assert!(list_incidents(&config, Some("bogus"), 10).await.is_err());
    }

    #[tokio::test]
    async fn test_list_requires_snapshot_dir() {
        assert!(list_incidents(&AppConfig::default(), None, 10).await.is_err());
    }
}
