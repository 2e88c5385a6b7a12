use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::GprocError;
use crate::process::{ProcessRecord, ProcessSpec, ProcessStatus, ProcessTemplate};
use crate::scheduler::ScheduledTask;

/// The persisted configuration document (`gproc.json`).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub processes: Vec<ProcessRecord>,
    #[serde(default)]
    pub groups: Vec<ProcessGroup>,
    #[serde(default)]
    pub templates: Vec<ProcessTemplate>,
    #[serde(default)]
    pub scheduled_tasks: Vec<ScheduledTask>,
    #[serde(default)]
    pub log_dir: PathBuf,
}

/// Derived grouping view, written out so external readers of the
/// document do not have to re-scan every spec for labels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessGroup {
    pub name: String,
    pub processes: Vec<String>,
}

pub fn groups_from_records(records: &[ProcessRecord]) -> Vec<ProcessGroup> {
    let mut groups: std::collections::BTreeMap<String, Vec<String>> = Default::default();
    for record in records {
        if let Some(label) = &record.spec.group {
            groups
                .entry(label.clone())
                .or_default()
                .push(record.spec.id.clone());
        }
    }
    groups
        .into_iter()
        .map(|(name, mut processes)| {
            processes.sort();
            ProcessGroup { name, processes }
        })
        .collect()
}

/// Load/save of the config document. Writes go through a sibling temp
/// file, fsync, and an atomic rename over the target.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing file is the empty initial state; a present file that
    /// does not parse is fail-fast corrupt.
    pub fn load(&self) -> Result<Config, GprocError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Config::default());
            }
            Err(err) => return Err(GprocError::Io(err)),
        };
        if content.trim().is_empty() {
            return Ok(Config::default());
        }
        serde_json::from_str(&content).map_err(|err| GprocError::ConfigCorrupt {
            path: self.path.clone(),
            reason: err.to_string(),
        })
    }

    pub fn save(&self, config: &Config) -> Result<(), GprocError> {
        let sanitized = sanitize_for_disk(config);
        let payload = serde_json::to_vec_pretty(&sanitized).map_err(|err| {
            GprocError::Io(std::io::Error::other(format!(
                "failed to encode config: {err}"
            )))
        })?;
        write_atomic(&self.path, &payload)?;
        Ok(())
    }
}

/// Persisted status is never Running: a restarted daemon must not
/// claim ownership of pids it does not hold.
fn sanitize_for_disk(config: &Config) -> Config {
    let mut sanitized = config.clone();
    for record in &mut sanitized.processes {
        if record.status.is_live() {
            record.status = ProcessStatus::Stopped;
        }
        record.pid = None;
    }
    sanitized.processes.sort_by(|a, b| a.spec.id.cmp(&b.spec.id));
    sanitized.groups = groups_from_records(&sanitized.processes);
    sanitized
}

fn write_atomic(path: &Path, payload: &[u8]) -> Result<(), GprocError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    let mut file = File::create(&tmp)?;
    file.write_all(payload)?;
    file.sync_all()?;
    drop(file);
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Immutable capture of the declared process set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub processes: Vec<ProcessSpec>,
}

/// Append-only snapshot documents under `<snapshots_dir>/<id>.json`.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn create(
        &self,
        name: &str,
        processes: Vec<ProcessSpec>,
    ) -> Result<Snapshot, GprocError> {
        let path = self.snapshot_path(name);
        if path.exists() {
            return Err(GprocError::SnapshotExists(name.to_string()));
        }
        let snapshot = Snapshot {
            id: name.to_string(),
            timestamp: Utc::now(),
            processes,
        };
        let payload = serde_json::to_vec_pretty(&snapshot).map_err(|err| {
            GprocError::Io(std::io::Error::other(format!(
                "failed to encode snapshot: {err}"
            )))
        })?;
        write_atomic(&path, &payload)?;
        Ok(snapshot)
    }

    pub fn load(&self, name: &str) -> Result<Snapshot, GprocError> {
        let path = self.snapshot_path(name);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(GprocError::SnapshotNotFound(name.to_string()));
            }
            Err(err) => return Err(GprocError::Io(err)),
        };
        serde_json::from_str(&content).map_err(|err| GprocError::ConfigCorrupt {
            path,
            reason: err.to_string(),
        })
    }

    pub fn list(&self) -> Result<Vec<Snapshot>, GprocError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(GprocError::Io(err)),
        };

        let mut snapshots = Vec::new();
        for entry in entries {
            let entry = entry.map_err(GprocError::Io)?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            snapshots.push(self.load(stem)?);
        }
        snapshots.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(snapshots)
    }

    fn snapshot_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    use crate::process::{ProcessRecord, ProcessSpec, ProcessStatus};

    use super::{Config, ConfigStore, SnapshotStore};

    fn record(id: &str, status: ProcessStatus) -> ProcessRecord {
        let mut record = ProcessRecord::new(
            ProcessSpec::new(id, "/bin/true"),
            PathBuf::from(format!("/tmp/{id}.log")),
        );
        record.status = status;
        if status.is_live() {
            record.pid = Some(4242);
        }
        record
    }

    #[test]
    fn missing_file_loads_as_empty_config() {
        let store = ConfigStore::new(temp_path("missing"));
        let config = store.load().expect("missing file should load as default");
        assert!(config.processes.is_empty());
        assert!(config.scheduled_tasks.is_empty());
    }

    #[test]
    fn corrupt_file_is_fail_fast() {
        let path = temp_path("corrupt");
        fs::write(&path, "{ not json ]").expect("failed to write corrupt fixture");
        let store = ConfigStore::new(&path);

        let err = store.load().expect_err("corrupt config must not load");
        assert!(
            matches!(err, crate::errors::GprocError::ConfigCorrupt { .. }),
            "unexpected error: {err}"
        );

        let _ = fs::remove_file(path);
    }

    #[test]
    fn save_collapses_running_to_stopped_and_drops_pids() {
        let path = temp_path("collapse");
        let store = ConfigStore::new(&path);
        let config = Config {
            processes: vec![
                record("running", ProcessStatus::Running),
                record("failed", ProcessStatus::Failed),
            ],
            ..Default::default()
        };

        store.save(&config).expect("failed to save config");
        let loaded = store.load().expect("failed to reload config");

        let running = loaded
            .processes
            .iter()
            .find(|rec| rec.spec.id == "running")
            .expect("record should survive the round-trip");
        assert_eq!(running.status, ProcessStatus::Stopped);
        assert_eq!(running.pid, None);

        let failed = loaded
            .processes
            .iter()
            .find(|rec| rec.spec.id == "failed")
            .expect("record should survive the round-trip");
        assert_eq!(failed.status, ProcessStatus::Failed);

        let _ = fs::remove_file(path);
    }

    #[test]
    fn save_derives_groups_and_preserves_dependencies() {
        let path = temp_path("groups");
        let store = ConfigStore::new(&path);

        let mut web = record("web", ProcessStatus::Stopped);
        web.spec.group = Some("edge".to_string());
        web.spec.dependencies = vec!["db".to_string()];
        let mut db = record("db", ProcessStatus::Stopped);
        db.spec.group = Some("data".to_string());

        let config = Config {
            processes: vec![web, db],
            ..Default::default()
        };
        store.save(&config).expect("failed to save config");
        let loaded = store.load().expect("failed to reload config");

        let names: Vec<&str> = loaded.groups.iter().map(|g| g.name.as_str()).collect();
        assert_eq!(names, vec!["data", "edge"]);
        let web = loaded
            .processes
            .iter()
            .find(|rec| rec.spec.id == "web")
            .expect("web record missing");
        assert_eq!(web.spec.dependencies, vec!["db".to_string()]);

        let _ = fs::remove_file(path);
    }

    #[test]
    fn save_leaves_no_temp_file_behind() {
        let path = temp_path("atomic");
        let store = ConfigStore::new(&path);
        store
            .save(&Config::default())
            .expect("failed to save config");

        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists());

        let _ = fs::remove_file(path);
    }

    #[test]
    fn snapshots_are_immutable_once_written() {
        let dir = temp_dir("snapshots");
        let store = SnapshotStore::new(&dir);

        let snapshot = store
            .create("before-upgrade", vec![ProcessSpec::new("web", "/bin/true")])
            .expect("failed to create snapshot");
        assert_eq!(snapshot.id, "before-upgrade");

        let err = store
            .create("before-upgrade", Vec::new())
            .expect_err("second create with the same name must fail");
        assert!(
            matches!(err, crate::errors::GprocError::SnapshotExists(_)),
            "unexpected error: {err}"
        );

        let loaded = store
            .load("before-upgrade")
            .expect("failed to load snapshot");
        assert_eq!(loaded.processes.len(), 1);
        assert_eq!(loaded.processes[0].id, "web");

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn snapshot_list_is_ordered_by_timestamp() {
        let dir = temp_dir("snapshot-list");
        let store = SnapshotStore::new(&dir);

        store
            .create("first", Vec::new())
            .expect("failed to create first snapshot");
        store
            .create("second", Vec::new())
            .expect("failed to create second snapshot");

        let listed = store.list().expect("failed to list snapshots");
        assert_eq!(listed.len(), 2);
        assert!(listed[0].timestamp <= listed[1].timestamp);

        let missing = store.load("third");
        assert!(
            matches!(missing, Err(crate::errors::GprocError::SnapshotNotFound(_))),
            "unexpected result for missing snapshot"
        );

        let _ = fs::remove_dir_all(dir);
    }

    fn temp_path(prefix: &str) -> PathBuf {
        let nonce = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock failure")
            .as_nanos();
        std::env::temp_dir().join(format!("gproc-store-{prefix}-{nonce}.json"))
    }

    fn temp_dir(prefix: &str) -> PathBuf {
        let nonce = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock failure")
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("gproc-store-{prefix}-{nonce}"));
        fs::create_dir_all(&dir).expect("failed to create temp dir");
        dir
    }
}
