use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::errors::GprocError;
use crate::launcher::ChildHandle;

/// Lifecycle state of a managed process.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    Failed,
}

impl ProcessStatus {
    /// True while the record owns a live child (or is about to).
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            ProcessStatus::Starting | ProcessStatus::Running | ProcessStatus::Stopping
        )
    }
}

impl std::fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let value = match self {
            ProcessStatus::Stopped => "stopped",
            ProcessStatus::Starting => "starting",
            ProcessStatus::Running => "running",
            ProcessStatus::Stopping => "stopping",
            ProcessStatus::Failed => "failed",
        };
        write!(f, "{value}")
    }
}

/// Which of the two blue/green slots is authoritative.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Slot {
    Blue,
    Green,
}

impl Slot {
    pub fn other(&self) -> Slot {
        match self {
            Slot::Blue => Slot::Green,
            Slot::Green => Slot::Blue,
        }
    }
}

impl std::fmt::Display for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Slot::Blue => write!(f, "blue"),
            Slot::Green => write!(f, "green"),
        }
    }
}

/// Policy for probing an HTTP health endpoint during reload and
/// dependency settlement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthProbePolicy {
    #[serde(default = "default_probe_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_probe_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_probe_retries")]
    pub retries: u32,
}

impl Default for HealthProbePolicy {
    fn default() -> Self {
        Self {
            interval_secs: default_probe_interval_secs(),
            timeout_secs: default_probe_timeout_secs(),
            retries: default_probe_retries(),
        }
    }
}

fn default_probe_interval_secs() -> u64 {
    1
}

fn default_probe_timeout_secs() -> u64 {
    2
}

fn default_probe_retries() -> u32 {
    5
}

/// Blue/green configuration for a record that supports zero-downtime
/// reload. The active slot's port is handed to the child as `PORT`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlueGreenSpec {
    pub active_slot: Slot,
    pub blue_port: u16,
    pub green_port: u16,
    pub health_path: String,
    #[serde(default)]
    pub probe: HealthProbePolicy,
}

impl BlueGreenSpec {
    pub fn port_for(&self, slot: Slot) -> u16 {
        match slot {
            Slot::Blue => self.blue_port,
            Slot::Green => self.green_port,
        }
    }

    pub fn health_url(&self, slot: Slot) -> String {
        format!("http://localhost:{}{}", self.port_for(slot), self.health_path)
    }
}

/// Declared configuration of a managed process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessSpec {
    pub id: String,
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub auto_restart: bool,
    #[serde(default)]
    pub max_restarts: u32,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub blue_green: Option<BlueGreenSpec>,
}

impl ProcessSpec {
    /// Minimal spec with everything else defaulted.
    pub fn new(id: impl Into<String>, command: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            command: command.into(),
            args: Vec::new(),
            working_dir: None,
            env: HashMap::new(),
            auto_restart: false,
            max_restarts: 0,
            group: None,
            dependencies: Vec::new(),
            blue_green: None,
        }
    }

    pub fn validate(&self) -> Result<(), GprocError> {
        if self.id.is_empty() {
            return Err(GprocError::InvalidSpec("id cannot be empty".to_string()));
        }
        let id_ok = self
            .id
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-');
        if !id_ok {
            return Err(GprocError::InvalidSpec(format!(
                "id {:?} may only contain alphanumerics, '-' and '_'",
                self.id
            )));
        }
        if self.command.is_empty() {
            return Err(GprocError::InvalidSpec(format!(
                "process {} has an empty command",
                self.id
            )));
        }
        if self.dependencies.iter().any(|dep| dep == &self.id) {
            return Err(GprocError::InvalidSpec(format!(
                "process {} cannot depend on itself",
                self.id
            )));
        }
        Ok(())
    }
}

/// Named partial spec stored in the config document; instantiating it
/// produces a fresh [`ProcessSpec`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessTemplate {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub auto_restart: bool,
    #[serde(default)]
    pub max_restarts: u32,
}

impl ProcessTemplate {
    pub fn instantiate(&self, id: impl Into<String>) -> ProcessSpec {
        let id = id.into();
        ProcessSpec {
            name: id.clone(),
            id,
            command: self.command.clone(),
            args: self.args.clone(),
            working_dir: self.working_dir.clone(),
            env: self.env.clone(),
            auto_restart: self.auto_restart,
            max_restarts: self.max_restarts,
            group: None,
            dependencies: Vec::new(),
            blue_green: None,
        }
    }
}

/// In-memory record of a managed process: the declared spec plus the
/// runtime state owned by the supervisor's reducer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub spec: ProcessSpec,
    pub status: ProcessStatus,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub start_time: Option<u64>,
    #[serde(default)]
    pub restarts: u32,
    pub log_file: PathBuf,
    #[serde(skip)]
    pub handle: Option<ChildHandle>,
    #[serde(skip)]
    pub expected_stop: bool,
    /// Epoch millis at which a crash restart becomes due; drained by
    /// the reducer tick so shutdown and explicit stop can cancel it.
    #[serde(skip)]
    pub restart_due_at: Option<u64>,
}

impl ProcessRecord {
    pub fn new(spec: ProcessSpec, log_file: PathBuf) -> Self {
        Self {
            spec,
            status: ProcessStatus::Stopped,
            pid: None,
            start_time: None,
            restarts: 0,
            log_file,
            handle: None,
            expected_stop: false,
            restart_due_at: None,
        }
    }

    /// Clears everything tied to a live child.
    pub fn clear_runtime(&mut self) {
        self.pid = None;
        self.handle = None;
        self.expected_stop = false;
        self.restart_due_at = None;
    }
}

/// How a child left: a normal exit code or a terminating signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildExit {
    Code(i32),
    Signaled(i32),
}

impl ChildExit {
    pub fn from_status(status: std::process::ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return ChildExit::Code(code);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return ChildExit::Signaled(signal);
            }
        }
        ChildExit::Code(-1)
    }
}

impl std::fmt::Display for ChildExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChildExit::Code(code) => write!(f, "exit code {code}"),
            ChildExit::Signaled(signal) => write!(f, "signal {signal}"),
        }
    }
}

/// Exit notification sent by a monitor task to the reducer. The pid
/// lets the reducer discard stale events from a superseded child.
#[derive(Debug, Clone)]
pub struct ExitEvent {
    pub id: String,
    pub pid: u32,
    pub exit: ChildExit,
}

pub fn now_epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}

pub fn now_epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::{BlueGreenSpec, HealthProbePolicy, ProcessSpec, ProcessStatus, ProcessTemplate, Slot};

    #[test]
    fn validate_rejects_bad_ids() {
        let mut spec = ProcessSpec::new("ok-id_1", "/bin/true");
        spec.validate().expect("expected valid spec to pass");

        spec.id = "bad id".to_string();
        assert!(spec.validate().is_err());

        spec.id = String::new();
        assert!(spec.validate().is_err());
    }

    #[test]
    fn validate_rejects_self_dependency() {
        let mut spec = ProcessSpec::new("worker", "/bin/true");
        spec.dependencies = vec!["worker".to_string()];
        assert!(spec.validate().is_err());
    }

    #[test]
    fn validate_rejects_empty_command() {
        let spec = ProcessSpec::new("worker", "");
        assert!(spec.validate().is_err());
    }

    #[test]
    fn live_statuses_match_child_handle_invariant() {
        assert!(ProcessStatus::Starting.is_live());
        assert!(ProcessStatus::Running.is_live());
        assert!(ProcessStatus::Stopping.is_live());
        assert!(!ProcessStatus::Stopped.is_live());
        assert!(!ProcessStatus::Failed.is_live());
    }

    #[test]
    fn blue_green_resolves_slot_ports_and_urls() {
        let bg = BlueGreenSpec {
            active_slot: Slot::Blue,
            blue_port: 8080,
            green_port: 8081,
            health_path: "/health".to_string(),
            probe: HealthProbePolicy::default(),
        };
        assert_eq!(bg.port_for(Slot::Blue), 8080);
        assert_eq!(bg.port_for(Slot::Green), 8081);
        assert_eq!(bg.health_url(Slot::Green), "http://localhost:8081/health");
        assert_eq!(Slot::Blue.other(), Slot::Green);
    }

    #[test]
    fn template_instantiation_copies_launch_fields_only() {
        let template = ProcessTemplate {
            name: "node-app".to_string(),
            command: "node".to_string(),
            args: vec!["server.js".to_string()],
            working_dir: None,
            env: Default::default(),
            auto_restart: true,
            max_restarts: 5,
        };
        let spec = template.instantiate("api");
        assert_eq!(spec.id, "api");
        assert_eq!(spec.name, "api");
        assert_eq!(spec.command, "node");
        assert!(spec.auto_restart);
        assert_eq!(spec.max_restarts, 5);
        assert!(spec.dependencies.is_empty());
        assert!(spec.blue_green.is_none());
    }
}
