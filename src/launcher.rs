use std::collections::HashMap;
use std::fs::File;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::Context;
use tokio::process::{Child, Command};
use tokio::time::{sleep, Instant};
use tracing::warn;

use crate::errors::GprocError;
use crate::logs::{open_sink, LogRotationPolicy};
use crate::process::ProcessSpec;

/// How long a graceful signal is given before escalation to kill.
pub const GRACEFUL_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// The engine's grip on a live child. Signalling goes by pid so the
/// monitor task can own the OS child and its wait future exclusively.
#[derive(Debug, Clone)]
pub struct ChildHandle {
    pub pid: u32,
}

impl ChildHandle {
    /// Platform analogue of SIGINT / CTRL-C. A child that is already
    /// gone is not an error.
    pub fn signal_graceful(&self) -> Result<(), GprocError> {
        signal_pid(self.pid, SignalKind::Graceful)
    }

    /// Unconditional termination.
    pub fn signal_kill(&self) -> Result<(), GprocError> {
        signal_pid(self.pid, SignalKind::Kill)
    }
}

/// A freshly spawned child: the handle the registry keeps plus the OS
/// child that the monitor task consumes.
#[derive(Debug)]
pub struct SpawnedChild {
    pub pid: u32,
    pub child: Child,
}

impl SpawnedChild {
    pub fn handle(&self) -> ChildHandle {
        ChildHandle { pid: self.pid }
    }
}

/// Launches `spec.command` with the spec's argv, working directory and
/// env overlay, wiring stdout and stderr to the same append-only log
/// file. `extra_env` wins over `spec.env` (blue/green injects `PORT`).
pub fn spawn(
    spec: &ProcessSpec,
    log_path: &Path,
    rotation: LogRotationPolicy,
    extra_env: &HashMap<String, String>,
) -> Result<SpawnedChild, GprocError> {
    let sink = open_sink(log_path, rotation).map_err(|err| GprocError::Spawn {
        id: spec.id.clone(),
        source: std::io::Error::other(err.to_string()),
    })?;

    let mut command = Command::new(&spec.command);
    command
        .args(&spec.args)
        .stdin(Stdio::null())
        .stdout(stdio_from(&sink, &spec.id)?)
        .stderr(stdio_from(&sink, &spec.id)?);

    if let Some(dir) = &spec.working_dir {
        command.current_dir(dir);
    }
    if !spec.env.is_empty() {
        command.envs(&spec.env);
    }
    if !extra_env.is_empty() {
        command.envs(extra_env);
    }

    let child = command.spawn().map_err(|source| GprocError::Spawn {
        id: spec.id.clone(),
        source,
    })?;
    let pid = child.id().ok_or_else(|| GprocError::Spawn {
        id: spec.id.clone(),
        source: std::io::Error::other("spawned child has no pid"),
    })?;

    Ok(SpawnedChild { pid, child })
}

fn stdio_from(sink: &File, id: &str) -> Result<Stdio, GprocError> {
    let clone = sink
        .try_clone()
        .with_context(|| format!("failed to clone log descriptor for {id}"))
        .map_err(|err| GprocError::Spawn {
            id: id.to_string(),
            source: std::io::Error::other(err.to_string()),
        })?;
    Ok(Stdio::from(clone))
}

enum SignalKind {
    Graceful,
    Kill,
}

#[cfg(unix)]
fn signal_pid(pid: u32, kind: SignalKind) -> Result<(), GprocError> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let signal = match kind {
        SignalKind::Graceful => Signal::SIGINT,
        SignalKind::Kill => Signal::SIGKILL,
    };
    match kill(Pid::from_raw(pid as i32), signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(err) => Err(GprocError::Io(std::io::Error::other(format!(
            "failed to send {signal:?} to pid {pid}: {err}"
        )))),
    }
}

#[cfg(windows)]
fn signal_pid(pid: u32, kind: SignalKind) -> Result<(), GprocError> {
    let mut command = std::process::Command::new("taskkill");
    command.args(["/PID", &pid.to_string(), "/T"]);
    if matches!(kind, SignalKind::Kill) {
        command.arg("/F");
    }
    command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    // taskkill reports failure for already-gone pids; treat any launch
    // as best-effort delivery.
    let _ = command.status().map_err(GprocError::Io)?;
    Ok(())
}

#[cfg(unix)]
pub fn process_exists(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid as i32), None::<Signal>) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(windows)]
pub fn process_exists(pid: u32) -> bool {
    let probe = std::process::Command::new("tasklist")
        .args(["/FI", &format!("PID eq {pid}"), "/NH"])
        .output();
    match probe {
        Ok(output) => String::from_utf8_lossy(&output.stdout).contains(&pid.to_string()),
        Err(_) => false,
    }
}

/// Graceful stop with escalation for a child the engine does not hold
/// a monitor for (reload shadows, superseded blue/green children):
/// signal, poll for exit until the deadline, then kill.
pub async fn terminate_pid(pid: u32, timeout: Duration) {
    let handle = ChildHandle { pid };
    if let Err(err) = handle.signal_graceful() {
        warn!(pid, %err, "graceful signal failed; escalating to kill");
        let _ = handle.signal_kill();
        return;
    }

    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if !process_exists(pid) {
            return;
        }
        sleep(Duration::from_millis(100)).await;
    }

    if process_exists(pid) {
        warn!(pid, "child ignored graceful stop; sending kill");
        let _ = handle.signal_kill();
    }
}
