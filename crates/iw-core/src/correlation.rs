//! Correlation of incidents raised in the same detection sweep.
//!
//! Pairs are scored on time proximity, shared affected systems, shared tags
//! and equal severity. Pairs scoring above the merge threshold are linked and
//! every connected group becomes a single incident, so the outcome does not
//! depend on the order incidents arrive in.

use crate::incident::Incident;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Weights and thresholds for correlation scoring.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CorrelationConfig {
    /// Incidents further apart than this get no time score.
    pub window_minutes: u32,
    /// Pairs must score strictly above this to merge.
    pub merge_threshold: f64,
    pub time_weight: f64,
    pub systems_weight: f64,
    pub tags_weight: f64,
    pub severity_weight: f64,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            window_minutes: 30,
            merge_threshold: 0.7,
            time_weight: 0.3,
            systems_weight: 0.4,
            tags_weight: 0.2,
            severity_weight: 0.1,
        }
    }
}

impl CorrelationConfig {
    /// Returns a description of the first invalid setting, if any.
    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.merge_threshold) {
            return Err(format!(
                "merge_threshold must be within 0..=1, got {}",
                self.merge_threshold
            ));
        }
        for (name, weight) in [
            ("time_weight", self.time_weight),
            ("systems_weight", self.systems_weight),
            ("tags_weight", self.tags_weight),
            ("severity_weight", self.severity_weight),
        ] {
            if !(0.0..=1.0).contains(&weight) {
                return Err(format!("{} must be within 0..=1, got {}", name, weight));
            }
        }
        Ok(())
    }
}

/// A merged incident and the ids folded into it.
#[derive(Debug, Clone)]
pub struct CorrelationGroup {
    pub incident: Incident,
    /// Ids of the other members, sorted. Empty for a singleton.
    pub merged_ids: Vec<Uuid>,
}

/// Jaccard similarity; two empty sets score 0.
pub fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

/// Scores how likely two incidents share a root cause.
pub fn correlation_score(a: &Incident, b: &Incident, config: &CorrelationConfig) -> f64 {
    let delta_minutes = (a.created_at - b.created_at).num_seconds().abs() as f64 / 60.0;
    let window = config.window_minutes as f64;
    let time = if window <= 0.0 {
        if delta_minutes == 0.0 {
            config.time_weight
        } else {
            0.0
        }
    } else if delta_minutes <= window {
        config.time_weight * (1.0 - delta_minutes / window)
    } else {
        0.0
    };

    let systems = config.systems_weight * jaccard(&a.affected_systems, &b.affected_systems);
    let tags = config.tags_weight * jaccard(&a.tags, &b.tags);
    let severity = if a.severity == b.severity {
        config.severity_weight
    } else {
        0.0
    };

    time + systems + tags + severity
}

struct DisjointSet {
    parent: Vec<usize>,
}

impl DisjointSet {
    fn new(size: usize) -> Self {
        Self {
            parent: (0..size).collect(),
        }
    }

    fn find(&mut self, x: usize) -> usize {
        let mut root = x;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        let mut node = x;
        while self.parent[node] != root {
            let next = self.parent[node];
            self.parent[node] = root;
            node = next;
        }
        root
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            self.parent[ra.max(rb)] = ra.min(rb);
        }
    }
}

/// Groups related incidents and merges each group.
///
/// Output is ordered by the primary incident's `(created_at, id)`.
pub fn correlate(mut incidents: Vec<Incident>, config: &CorrelationConfig) -> Vec<CorrelationGroup> {
    incidents.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));

    let mut sets = DisjointSet::new(incidents.len());
    for i in 0..incidents.len() {
        for j in (i + 1)..incidents.len() {
            if correlation_score(&incidents[i], &incidents[j], config) > config.merge_threshold {
                sets.union(i, j);
            }
        }
    }

    let mut groups: Vec<Vec<Incident>> = Vec::new();
    let mut group_of_root: Vec<Option<usize>> = vec![None; incidents.len()];
    for (index, incident) in incidents.into_iter().enumerate() {
        let root = sets.find(index);
        match group_of_root[root] {
            Some(group) => groups[group].push(incident),
            None => {
                group_of_root[root] = Some(groups.len());
                groups.push(vec![incident]);
            }
        }
    }

    groups.into_iter().filter_map(merge_group).collect()
}

/// Merges members (already in `(created_at, id)` order) into the first one.
fn merge_group(members: Vec<Incident>) -> Option<CorrelationGroup> {
    let mut members = members.into_iter();
    let mut primary = members.next()?;
    let others: Vec<Incident> = members.collect();
    if others.is_empty() {
        return Some(CorrelationGroup {
            incident: primary,
            merged_ids: Vec::new(),
        });
    }

    let mut titles = vec![primary.title.clone()];
    let mut descriptions = vec![primary.description.clone()];
    let mut rules: BTreeSet<String> = primary
        .metadata
        .get("rule")
        .and_then(|v| v.as_str())
        .map(|r| BTreeSet::from([r.to_string()]))
        .unwrap_or_default();

    for other in &others {
        titles.push(other.title.clone());
        descriptions.push(other.description.clone());
        primary.affected_systems.extend(other.affected_systems.iter().cloned());
        primary.tags.extend(other.tags.iter().cloned());
        primary.severity = primary.severity.max(other.severity);
        primary.updated_at = primary.updated_at.max(other.updated_at);
        if let Some(rule) = other.metadata.get("rule").and_then(|v| v.as_str()) {
            rules.insert(rule.to_string());
        }
        for (key, value) in &other.metadata {
            primary
                .metadata
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
    }

    primary.title = titles.join(" | ");
    primary.description = descriptions
        .into_iter()
        .filter(|d| !d.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n");

    let mut merged_ids: Vec<Uuid> = others.iter().map(|o| o.id).collect();
    merged_ids.sort();

    primary.metadata.insert(
        "related_incidents".to_string(),
        serde_json::Value::Array(
            merged_ids
                .iter()
                .map(|id| serde_json::Value::String(id.to_string()))
                .collect(),
        ),
    );
    primary.metadata.insert(
        "correlation_group_size".to_string(),
        (others.len() + 1).into(),
    );
    if rules.len() > 1 {
        primary.metadata.insert(
            "correlated_rules".to_string(),
            serde_json::Value::Array(rules.into_iter().map(serde_json::Value::String).collect()),
        );
    }

    Some(CorrelationGroup {
        incident: primary,
        merged_ids,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::incident::Severity;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
    }

    fn incident(title: &str, at: DateTime<Utc>, severity: Severity, systems: &[&str]) -> Incident {
        let mut inc = Incident::new(title, format!("{} description", title), severity, "q", at);
        inc.affected_systems = systems.iter().map(|s| s.to_string()).collect();
        inc
    }

    #[test]
    fn test_jaccard() {
        let a: BTreeSet<String> = ["x", "y"].iter().map(|s| s.to_string()).collect();
        let b: BTreeSet<String> = ["y", "z"].iter().map(|s| s.to_string()).collect();
        assert!((jaccard(&a, &b) - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(jaccard(&BTreeSet::new(), &BTreeSet::new()), 0.0);
    }

    #[test]
    fn test_five_minutes_apart_same_host_merge() {
        let config = CorrelationConfig::default();
        let a = incident("A", t0(), Severity::High, &["hostA"]);
        let b = incident("B", t0() + Duration::minutes(5), Severity::High, &["hostA"]);

        // Time weight decays linearly over the window: 0.3 * (1 - 5/30) = 0.25.
        let score = correlation_score(&a, &b, &config);
        assert!((score - (0.25 + 0.4 + 0.1)).abs() < 1e-9);

        let groups = correlate(vec![b.clone(), a.clone()], &config);
        assert_eq!(groups.len(), 1);
        let merged = &groups[0].incident;
        assert_eq!(merged.id, a.id);
        assert_eq!(merged.title, "A | B");
        assert_eq!(groups[0].merged_ids, vec![b.id]);
        assert_eq!(merged.metadata["correlation_group_size"], serde_json::json!(2));
    }

    #[test]
    fn test_time_weight_decays_linearly_within_window() {
        let config = CorrelationConfig::default();
        let a = incident("A", t0(), Severity::High, &["hostA"]);
        let score_at = |minutes: i64| {
            let b = incident("B", t0() + Duration::minutes(minutes), Severity::High, &["hostA"]);
            correlation_score(&a, &b, &config)
        };

        assert!((score_at(0) - 0.8).abs() < 1e-9);
        assert!((score_at(15) - 0.65).abs() < 1e-9);
        assert!((score_at(30) - 0.5).abs() < 1e-9);
        assert!((score_at(31) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_unrelated_incidents_stay_separate() {
        let config = CorrelationConfig::default();
        let a = incident("A", t0(), Severity::High, &["hostA"]);
        let b = incident("B", t0() + Duration::minutes(40), Severity::Low, &["hostB"]);

        assert_eq!(correlation_score(&a, &b, &config), 0.0);
        let groups = correlate(vec![a, b], &config);
        assert_eq!(groups.len(), 2);
        assert!(groups.iter().all(|g| g.merged_ids.is_empty()));
    }

    #[test]
    fn test_merge_is_order_independent() {
        let config = CorrelationConfig::default();
        let mut a = incident("A", t0(), Severity::Medium, &["hostA", "db"]);
        let mut b = incident("B", t0() + Duration::minutes(1), Severity::Critical, &["hostA", "db"]);
        let mut c = incident("C", t0() + Duration::minutes(2), Severity::Medium, &["hostA", "db"]);
        for inc in [&mut a, &mut b, &mut c] {
            inc.tags.insert("latency".to_string());
        }

        let orders = [
            vec![a.clone(), b.clone(), c.clone()],
            vec![c.clone(), b.clone(), a.clone()],
            vec![b.clone(), a.clone(), c.clone()],
        ];

        let results: Vec<Incident> = orders
            .into_iter()
            .map(|order| {
                let groups = correlate(order, &config);
                assert_eq!(groups.len(), 1);
                groups.into_iter().next().unwrap().incident
            })
            .collect();

        for merged in &results {
            assert_eq!(merged.id, a.id);
            assert_eq!(merged.severity, Severity::Critical);
            assert_eq!(merged.affected_systems, results[0].affected_systems);
            assert_eq!(merged.title, "A | B | C");
        }
    }

    #[test]
    fn test_transitive_grouping() {
        // a~b and b~c score above threshold, a and c do not.
        let config = CorrelationConfig::default();
        let mut a = incident("A", t0(), Severity::High, &["h1"]);
        let mut b = incident("B", t0() + Duration::minutes(1), Severity::High, &["h1", "h2"]);
        let mut c = incident("C", t0() + Duration::minutes(2), Severity::High, &["h2"]);
        for inc in [&mut a, &mut b, &mut c] {
            inc.tags.insert("network".to_string());
        }

        assert!(correlation_score(&a, &b, &config) > config.merge_threshold);
        assert!(correlation_score(&b, &c, &config) > config.merge_threshold);
        assert!(correlation_score(&a, &c, &config) <= config.merge_threshold);

        let groups = correlate(vec![c, a, b], &config);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].merged_ids.len(), 2);
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        let config = CorrelationConfig {
            merge_threshold: 1.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        assert!(CorrelationConfig::default().validate().is_ok());
    }
}
