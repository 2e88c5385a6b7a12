use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Typed failures surfaced by the supervisor's public operations.
///
/// Recoverable conditions (crash restarts, stop escalation, health
/// retries) are absorbed inside the engine and never appear here.
#[derive(Debug, Error)]
pub enum GprocError {
    #[error("process not found: {0}")]
    NotFound(String),
    #[error("process {0} is already running")]
    AlreadyRunning(String),
    #[error("process {0} is not running")]
    NotRunning(String),
    #[error("failed to spawn {id}: {source}")]
    Spawn {
        id: String,
        #[source]
        source: io::Error,
    },
    #[error("process {id} depends on {dep}, which is not running")]
    DependencyUnhealthy { id: String, dep: String },
    #[error("dependency cycle involving: {}", .0.join(", "))]
    DependencyCycle(Vec<String>),
    #[error("config file not found: {0}")]
    ConfigNotFound(PathBuf),
    #[error("config file {path} is corrupt: {reason}")]
    ConfigCorrupt { path: PathBuf, reason: String },
    #[error("invalid process spec: {0}")]
    InvalidSpec(String),
    #[error("invalid cron expression: {0}")]
    InvalidCron(String),
    #[error("scheduled task not found: {0}")]
    TaskNotFound(String),
    #[error("duplicate scheduled task: {0}")]
    DuplicateTask(String),
    #[error("snapshot not found: {0}")]
    SnapshotNotFound(String),
    #[error("snapshot already exists: {0}")]
    SnapshotExists(String),
    #[error("reload of {id} failed: {reason}")]
    ReloadFailed { id: String, reason: String },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}
