//! In-memory incident store with file snapshots.
//!
//! The store owns every incident and the set of detection keys already
//! raised. Both are bounded; the oldest entries are evicted first. Snapshots
//! are written as two JSON files in a directory and replaced wholesale on
//! each save.

use crate::clock::SharedClock;
use crate::incident::{ExternalAlert, Incident, IncidentError, IncidentStatus};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

const INCIDENTS_FILE: &str = "incidents.json";
const SEEN_KEYS_FILE: &str = "seen_keys.json";

/// Errors raised by the incident store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Incident not found: {0}")]
    NotFound(Uuid),

    #[error(transparent)]
    Incident(#[from] IncidentError),

    #[error("Snapshot I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Snapshot {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Snapshot serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Maximum incidents kept; oldest by creation time are evicted.
    pub max_incidents: usize,
    /// Maximum seen detection keys kept.
    pub max_seen_keys: usize,
    /// Directory for snapshot files. `None` keeps everything in memory.
    pub snapshot_dir: Option<PathBuf>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_incidents: 10_000,
            max_seen_keys: 50_000,
            snapshot_dir: None,
        }
    }
}

#[derive(Debug, Default)]
struct SeenKeys {
    order: VecDeque<String>,
    keys: HashSet<String>,
}

impl SeenKeys {
    fn insert(&mut self, key: &str, max: usize) -> bool {
        if self.keys.contains(key) {
            return false;
        }
        self.keys.insert(key.to_string());
        self.order.push_back(key.to_string());
        while self.order.len() > max.max(1) {
            if let Some(oldest) = self.order.pop_front() {
                self.keys.remove(&oldest);
            }
        }
        true
    }
}

/// Owned store of incidents, shared by handle between subsystems.
pub struct IncidentStore {
    config: StoreConfig,
    clock: SharedClock,
    incidents: RwLock<HashMap<Uuid, Incident>>,
    seen: RwLock<SeenKeys>,
    snapshot_lock: Mutex<()>,
}

impl IncidentStore {
    /// Creates an empty store.
    pub fn new(config: StoreConfig, clock: SharedClock) -> Self {
        Self {
            config,
            clock,
            incidents: RwLock::new(HashMap::new()),
            seen: RwLock::new(SeenKeys::default()),
            snapshot_lock: Mutex::new(()),
        }
    }

    /// Creates a store and loads any snapshot found in the configured directory.
    ///
    /// Missing files mean an empty store; unreadable or corrupt files are errors.
    pub async fn open(config: StoreConfig, clock: SharedClock) -> Result<Self, StoreError> {
        let store = Self::new(config, clock);
        if let Some(dir) = store.config.snapshot_dir.clone() {
            store.load_snapshot(&dir).await?;
        }
        Ok(store)
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// Inserts or replaces an incident, returning the ids evicted to stay in bounds.
    pub async fn insert(&self, incident: Incident) -> Vec<Uuid> {
        let mut incidents = self.incidents.write().await;
        let id = incident.id;
        incidents.insert(id, incident);
        let evicted = evict_oldest(&mut incidents, self.config.max_incidents, id);
        if !evicted.is_empty() {
            debug!(count = evicted.len(), "Evicted oldest incidents");
        }
        evicted
    }

    /// Applies `f` to the stored incident under the write lock.
    pub async fn update<T, F>(&self, id: Uuid, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Incident) -> Result<T, IncidentError>,
    {
        let mut incidents = self.incidents.write().await;
        let incident = incidents.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        Ok(f(incident)?)
    }

    /// Assigns an incident to a team.
    pub async fn assign(
        &self,
        id: Uuid,
        team: &str,
        user: Option<String>,
    ) -> Result<Incident, StoreError> {
        let now = self.clock.now();
        self.update(id, |incident| {
            incident.assign(team, user, now)?;
            Ok(incident.clone())
        })
        .await
    }

    /// Moves an incident to `status`.
    pub async fn transition(
        &self,
        id: Uuid,
        status: IncidentStatus,
    ) -> Result<Incident, StoreError> {
        let now = self.clock.now();
        self.update(id, |incident| {
            incident.transition(status, now)?;
            Ok(incident.clone())
        })
        .await
    }

    pub async fn get(&self, id: Uuid) -> Option<Incident> {
        self.incidents.read().await.get(&id).cloned()
    }

    /// All incidents, oldest first.
    pub async fn list(&self) -> Vec<Incident> {
        self.collect(|_| true).await
    }

    /// Incidents that are neither resolved nor closed.
    pub async fn list_active(&self) -> Vec<Incident> {
        self.collect(|i| i.status.is_active()).await
    }

    pub async fn list_by_status(&self, status: IncidentStatus) -> Vec<Incident> {
        self.collect(|i| i.status == status).await
    }

    /// Incidents whose team (or `"unassigned"`) equals `team`.
    pub async fn list_by_team(&self, team: &str) -> Vec<Incident> {
        self.collect(|i| i.team() == team).await
    }

    pub async fn count_active_for_team(&self, team: &str) -> usize {
        self.incidents
            .read()
            .await
            .values()
            .filter(|i| i.status.is_active() && i.team() == team)
            .count()
    }

    pub async fn len(&self) -> usize {
        self.incidents.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.incidents.read().await.is_empty()
    }

    /// Records a detection key. Returns `false` if it was already seen.
    pub async fn mark_seen(&self, key: &str) -> bool {
        self.seen
            .write()
            .await
            .insert(key, self.config.max_seen_keys)
    }

    pub async fn is_seen(&self, key: &str) -> bool {
        self.seen.read().await.keys.contains(key)
    }

    /// Stores an incident for an external alert unless that alert was already ingested.
    #[instrument(skip(self, alert), fields(source = %alert.source, external_id = %alert.external_id))]
    pub async fn ingest_alert(&self, alert: ExternalAlert) -> Result<Option<Incident>, StoreError> {
        let key = alert.dedup_key();
        let incident = Incident::from_alert(alert, self.clock.now())?;

        if !self.mark_seen(&key).await {
            debug!(key = %key, "Alert already ingested");
            return Ok(None);
        }

        info!(incident_id = %incident.id, severity = %incident.severity, "Ingested external alert");
        self.insert(incident.clone()).await;
        Ok(Some(incident))
    }

    /// Writes both snapshot files to the configured directory.
    ///
    /// Concurrent callers are serialized. Without a snapshot directory this is a no-op.
    #[instrument(skip(self))]
    pub async fn save_snapshot(&self) -> Result<(), StoreError> {
        let Some(dir) = self.config.snapshot_dir.clone() else {
            return Ok(());
        };

        let _guard = self.snapshot_lock.lock().await;

        let incidents: BTreeMap<Uuid, Incident> = self
            .incidents
            .read()
            .await
            .iter()
            .map(|(id, incident)| (*id, incident.clone()))
            .collect();
        let seen: Vec<String> = self.seen.read().await.order.iter().cloned().collect();

        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| StoreError::Io {
                path: dir.clone(),
                source,
            })?;

        write_atomic(&dir.join(INCIDENTS_FILE), &serde_json::to_vec_pretty(&incidents)?).await?;
        write_atomic(&dir.join(SEEN_KEYS_FILE), &serde_json::to_vec_pretty(&seen)?).await?;

        debug!(
            incidents = incidents.len(),
            seen_keys = seen.len(),
            dir = %dir.display(),
            "Snapshot written"
        );
        Ok(())
    }

    async fn load_snapshot(&self, dir: &Path) -> Result<(), StoreError> {
        let incidents: Option<BTreeMap<Uuid, Incident>> =
            read_json(&dir.join(INCIDENTS_FILE)).await?;
        let seen: Option<Vec<String>> = read_json(&dir.join(SEEN_KEYS_FILE)).await?;

        let loaded_incidents = incidents.as_ref().map_or(0, |m| m.len());
        let loaded_keys = seen.as_ref().map_or(0, |k| k.len());

        if let Some(incidents) = incidents {
            let mut map = self.incidents.write().await;
            for (id, incident) in incidents {
                if id != incident.id {
                    warn!(key = %id, incident_id = %incident.id, "Snapshot key does not match incident id");
                }
                map.insert(incident.id, incident);
            }
            let newest = map
                .values()
                .max_by_key(|i| (i.created_at, i.id))
                .map(|i| i.id);
            if let Some(newest) = newest {
                evict_oldest(&mut map, self.config.max_incidents, newest);
            }
        }

        if let Some(keys) = seen {
            let mut set = self.seen.write().await;
            for key in keys {
                set.insert(&key, self.config.max_seen_keys);
            }
        }

        info!(
            incidents = loaded_incidents,
            seen_keys = loaded_keys,
            dir = %dir.display(),
            "Snapshot loaded"
        );
        Ok(())
    }

    async fn collect<F>(&self, predicate: F) -> Vec<Incident>
    where
        F: Fn(&Incident) -> bool,
    {
        let mut incidents: Vec<Incident> = self
            .incidents
            .read()
            .await
            .values()
            .filter(|i| predicate(i))
            .cloned()
            .collect();
        incidents.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        incidents
    }
}

/// Removes the oldest incidents until `max` remain, never evicting `keep`.
fn evict_oldest(incidents: &mut HashMap<Uuid, Incident>, max: usize, keep: Uuid) -> Vec<Uuid> {
    let max = max.max(1);
    let mut evicted = Vec::new();
    while incidents.len() > max {
        let oldest = incidents
            .values()
            .filter(|i| i.id != keep)
            .min_by_key(|i| (i.created_at, i.id))
            .map(|i| i.id);
        match oldest {
            Some(id) => {
                incidents.remove(&id);
                evicted.push(id);
            }
            None => break,
        }
    }
    evicted
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, bytes)
        .await
        .map_err(|source| StoreError::Io {
            path: tmp.clone(),
            source,
        })?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(StoreError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|source| StoreError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
}
