use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, sleep, Duration, Instant, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::deps::{startup_waves, DepNode};
use crate::errors::GprocError;
use crate::events::{AlertSink, Event, EventBus, TracingAlertSink};
use crate::launcher::{self, SpawnedChild, GRACEFUL_STOP_TIMEOUT};
use crate::logs::process_log_path;
use crate::process::{
    now_epoch_millis, now_epoch_secs, ChildExit, ExitEvent, ProcessRecord, ProcessSpec,
    ProcessStatus, ProcessTemplate,
};
use crate::reload;
use crate::scheduler::{validate_expr, CronExpr, ScheduledTask};
use crate::settings::Settings;
use crate::store::{Config, ConfigStore, Snapshot, SnapshotStore};

/// Minimum delay between a crash and the next automatic restart.
pub const RESTART_BACKOFF: Duration = Duration::from_secs(2);

/// How often the reducer drains pending restarts that became due.
const REDUCER_TICK: Duration = Duration::from_millis(250);

/// Capacity of the monitor-to-reducer exit channel.
const EXIT_CHANNEL_CAPACITY: usize = 64;

const EVENT_BUS_CAPACITY: usize = 256;

/// How the reducer announces a successful spawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SpawnAnnounce {
    /// Fresh operator start: publishes `Started`.
    Fresh,
    /// Automatic or operator restart: publishes `Restarted`.
    Restart,
}

struct Registry {
    records: HashMap<String, ProcessRecord>,
    tasks: HashMap<String, ScheduledTask>,
    templates: HashMap<String, ProcessTemplate>,
}

struct Inner {
    settings: Settings,
    store: ConfigStore,
    snapshots: SnapshotStore,
    registry: RwLock<Registry>,
    bus: EventBus,
    alert: Arc<dyn AlertSink>,
    exit_tx: mpsc::Sender<ExitEvent>,
    spawn_failures: AtomicU64,
    save_lock: Mutex<()>,
}

/// The supervisor engine: the registry of managed processes, the
/// single-writer reducer that applies child-exit events, and every
/// public operation of the daemon core.
///
/// The value is cheap to clone (shared state behind an `Arc`) and is
/// constructed once at daemon startup, then threaded explicitly into
/// whatever control plane sits on top. Construction must happen inside
/// a tokio runtime: the reducer task is spawned immediately.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    pub fn new(settings: Settings) -> Result<Self, GprocError> {
        Self::with_alert_sink(settings, Arc::new(TracingAlertSink))
    }

    pub fn with_alert_sink(
        settings: Settings,
        alert: Arc<dyn AlertSink>,
    ) -> Result<Self, GprocError> {
        settings
            .ensure_layout()
            .map_err(|err| GprocError::Io(std::io::Error::other(err.to_string())))?;

        let store = ConfigStore::new(&settings.config_path);
        let config = store.load()?;
        let registry = Registry::from_config(config, &settings);

        let (exit_tx, exit_rx) = mpsc::channel(EXIT_CHANNEL_CAPACITY);
        let inner = Arc::new(Inner {
            snapshots: SnapshotStore::new(&settings.snapshots_dir),
            store,
            settings,
            registry: RwLock::new(registry),
            bus: EventBus::new(EVENT_BUS_CAPACITY),
            alert,
            exit_tx,
            spawn_failures: AtomicU64::new(0),
            save_lock: Mutex::new(()),
        });

        let supervisor = Self { inner };
        tokio::spawn(supervisor.clone().run_reducer(exit_rx));
        Ok(supervisor)
    }

    pub fn settings(&self) -> Settings {
        self.inner.settings.clone()
    }

    /// Stream of lifecycle events. Slow subscribers lag and drop;
    /// they never back-pressure the engine.
    pub fn subscribe_events(&self) -> broadcast::Receiver<Event> {
        self.inner.bus.subscribe()
    }

    // ------------------------------------------------------------------
    // Public operations: process lifecycle
    // ------------------------------------------------------------------

    /// Registers the spec without starting it. An existing record is
    /// updated in place unless it currently owns a live child.
    pub fn add(&self, spec: ProcessSpec) -> Result<(), GprocError> {
        spec.validate()?;
        {
            let mut registry = self.write_registry();
            if let Some(existing) = registry.records.get(&spec.id) {
                if existing.status.is_live() {
                    return Err(GprocError::AlreadyRunning(spec.id));
                }
            }
            registry.upsert_spec(spec, &self.inner.settings);
        }
        self.persist()
    }

    /// Registers the spec if unknown, then drives the record toward
    /// Running.
    pub async fn start(&self, spec: ProcessSpec) -> Result<(), GprocError> {
        let id = spec.id.clone();
        self.add(spec)?;
        self.start_existing(&id).await
    }

    /// Start path for an already-registered record.
    pub async fn start_existing(&self, id: &str) -> Result<(), GprocError> {
        self.start_internal(id, SpawnAnnounce::Fresh, false).await
    }

    /// Graceful stop with escalation: SIGINT-equivalent, a 5-second
    /// grace window, then kill. Returns once the exit has been applied
    /// by the reducer, so a subsequent `start` observes Stopped.
    pub async fn stop(&self, id: &str) -> Result<(), GprocError> {
        enum StopAction {
            Cancelled,
            Signal(crate::launcher::ChildHandle),
        }

        let action = {
            let mut registry = self.write_registry();
            let record = registry
                .records
                .get_mut(id)
                .ok_or_else(|| GprocError::NotFound(id.to_string()))?;
            match record.status {
                ProcessStatus::Running => {
                    let handle = record
                        .handle
                        .clone()
                        .ok_or_else(|| GprocError::NotRunning(id.to_string()))?;
                    record.status = ProcessStatus::Stopping;
                    record.expected_stop = true;
                    StopAction::Signal(handle)
                }
                ProcessStatus::Starting if record.restart_due_at.is_some() => {
                    // A crash restart is pending; there is no child yet.
                    record.status = ProcessStatus::Stopped;
                    record.clear_runtime();
                    StopAction::Cancelled
                }
                _ => return Err(GprocError::NotRunning(id.to_string())),
            }
        };

        match action {
            StopAction::Cancelled => {
                info!(id, "cancelled pending restart; process stopped");
                self.persist()
            }
            StopAction::Signal(handle) => {
                handle.signal_graceful()?;
                if !self.wait_for_exit(id, Some(GRACEFUL_STOP_TIMEOUT)).await {
                    warn!(id, "graceful stop deadline exceeded; escalating to kill");
                    handle.signal_kill()?;
                    self.wait_for_exit(id, None).await;
                }
                Ok(())
            }
        }
    }

    /// Stop-then-start with the current spec. Increments the restart
    /// counter and keeps the log file path.
    pub async fn restart(&self, id: &str) -> Result<(), GprocError> {
        let live = {
            let registry = self.read_registry();
            let record = registry
                .records
                .get(id)
                .ok_or_else(|| GprocError::NotFound(id.to_string()))?;
            record.status.is_live()
        };
        if live {
            self.stop(id).await?;
        }

        {
            let mut registry = self.write_registry();
            if let Some(record) = registry.records.get_mut(id) {
                record.restarts = record.restarts.saturating_add(1);
            }
        }
        self.start_internal(id, SpawnAnnounce::Restart, false).await
    }

    /// Zero-downtime blue/green swap; see the reload coordinator.
    pub async fn reload(&self, id: &str) -> Result<(), GprocError> {
        reload::reload(self, id).await
    }

    /// Removes a record. Only Stopped or Failed records may go.
    pub fn remove(&self, id: &str) -> Result<(), GprocError> {
        {
            let mut registry = self.write_registry();
            let record = registry
                .records
                .get(id)
                .ok_or_else(|| GprocError::NotFound(id.to_string()))?;
            if record.status.is_live() {
                return Err(GprocError::AlreadyRunning(id.to_string()));
            }
            registry.records.remove(id);
        }
        self.persist()
    }

    /// Snapshot view of all records, sorted by id.
    pub fn list(&self) -> Vec<ProcessRecord> {
        let registry = self.read_registry();
        let mut records: Vec<ProcessRecord> = registry.records.values().cloned().collect();
        records.sort_by(|a, b| a.spec.id.cmp(&b.spec.id));
        records
    }

    pub fn get(&self, id: &str) -> Option<ProcessRecord> {
        self.read_registry().records.get(id).cloned()
    }

    // ------------------------------------------------------------------
    // Batch operations: dependency-ordered startup
    // ------------------------------------------------------------------

    /// Starts every registered record in dependency waves; used to
    /// restore the declared set at daemon boot.
    pub async fn start_all(&self) -> Result<(), GprocError> {
        let ids: Vec<String> = self.read_registry().records.keys().cloned().collect();
        self.start_batch(ids).await
    }

    /// Starts all members of a group (plus their dependency closure)
    /// in dependency waves.
    pub async fn start_group(&self, label: &str) -> Result<(), GprocError> {
        let members: Vec<String> = {
            let registry = self.read_registry();
            registry
                .records
                .values()
                .filter(|record| record.spec.group.as_deref() == Some(label))
                .map(|record| record.spec.id.clone())
                .collect()
        };
        if members.is_empty() {
            return Err(GprocError::NotFound(format!("group {label}")));
        }
        self.start_batch(members).await
    }

    /// Stops every live member of a group.
    pub async fn stop_group(&self, label: &str) -> Result<(), GprocError> {
        let members: Vec<String> = {
            let registry = self.read_registry();
            registry
                .records
                .values()
                .filter(|record| record.spec.group.as_deref() == Some(label))
                .filter(|record| record.status.is_live())
                .map(|record| record.spec.id.clone())
                .collect()
        };
        for id in members {
            match self.stop(&id).await {
                Ok(()) | Err(GprocError::NotRunning(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    async fn start_batch(&self, requested: Vec<String>) -> Result<(), GprocError> {
        let nodes = {
            let registry = self.read_registry();
            let mut batch: BTreeSet<String> = BTreeSet::new();
            let mut frontier: Vec<String> = requested;
            // Dependency closure: a group start pulls in everything its
            // members need, transitively.
            while let Some(id) = frontier.pop() {
                let record = registry
                    .records
                    .get(&id)
                    .ok_or_else(|| GprocError::NotFound(id.clone()))?;
                if batch.insert(id) {
                    frontier.extend(record.spec.dependencies.iter().cloned());
                }
            }
            batch
                .iter()
                .map(|id| DepNode {
                    id: id.clone(),
                    dependencies: registry.records[id].spec.dependencies.clone(),
                })
                .collect::<Vec<_>>()
        };

        // Cycles reject the whole batch before anything is spawned.
        let waves = startup_waves(&nodes)?;

        for wave in waves {
            let mut handles = Vec::new();
            for id in &wave {
                if matches!(
                    self.get(id).map(|record| record.status),
                    Some(ProcessStatus::Running)
                ) {
                    continue;
                }
                let supervisor = self.clone();
                let id = id.clone();
                handles.push(tokio::spawn(async move {
                    let result = supervisor.start_existing(&id).await;
                    (id, result)
                }));
            }

            for handle in handles {
                let (id, result) = handle.await.map_err(|err| {
                    GprocError::Io(std::io::Error::other(format!(
                        "wave start task panicked: {err}"
                    )))
                })?;
                match result {
                    Ok(()) | Err(GprocError::AlreadyRunning(_)) => {}
                    Err(err) => {
                        error!(%id, %err, "batch start aborted");
                        return Err(err);
                    }
                }
            }

            // The next wave is gated on this one actually holding
            // Running (first monitor tick, or a declared health URL).
            for id in &wave {
                self.settle_wave_member(id).await?;
            }
        }
        Ok(())
    }

    async fn settle_wave_member(&self, id: &str) -> Result<(), GprocError> {
        let record = self
            .get(id)
            .ok_or_else(|| GprocError::NotFound(id.to_string()))?;

        if let Some(bg) = &record.spec.blue_green {
            let url = bg.health_url(bg.active_slot);
            if !reload::probe_health(&url, &bg.probe).await {
                return Err(GprocError::DependencyUnhealthy {
                    id: id.to_string(),
                    dep: id.to_string(),
                });
            }
            return Ok(());
        }

        // Give the monitor a tick to report an instant crash.
        sleep(Duration::from_millis(200)).await;
        match self.get(id).map(|record| record.status) {
            Some(ProcessStatus::Running) | Some(ProcessStatus::Starting) => Ok(()),
            _ => Err(GprocError::NotRunning(id.to_string())),
        }
    }

    // ------------------------------------------------------------------
    // Public operations: scheduled tasks, templates, snapshots
    // ------------------------------------------------------------------

    pub fn add_scheduled(&self, mut task: ScheduledTask) -> Result<(), GprocError> {
        let next = validate_expr(&task.cron)?;
        {
            let mut registry = self.write_registry();
            if registry.tasks.contains_key(&task.name) {
                return Err(GprocError::DuplicateTask(task.name));
            }
            task.next_run = Some(next);
            registry.tasks.insert(task.name.clone(), task);
        }
        self.persist()
    }

    pub fn remove_scheduled(&self, name: &str) -> Result<(), GprocError> {
        {
            let mut registry = self.write_registry();
            if registry.tasks.remove(name).is_none() {
                return Err(GprocError::TaskNotFound(name.to_string()));
            }
        }
        self.persist()
    }

    pub fn list_scheduled(&self) -> Vec<ScheduledTask> {
        let registry = self.read_registry();
        let mut tasks: Vec<ScheduledTask> = registry.tasks.values().cloned().collect();
        tasks.sort_by(|a, b| a.name.cmp(&b.name));
        tasks
    }

    /// Called by the task runner after a run completes; advances the
    /// schedule regardless of the run's outcome.
    pub(crate) fn finish_scheduled_run(&self, name: &str, started_at: chrono::DateTime<Utc>) {
        {
            let mut registry = self.write_registry();
            let Some(task) = registry.tasks.get_mut(name) else {
                return;
            };
            task.last_run = Some(started_at);
            task.next_run = CronExpr::parse(&task.cron)
                .ok()
                .and_then(|expr| expr.next_after(Utc::now()));
        }
        if let Err(err) = self.persist() {
            error!(task = name, %err, "failed to persist schedule state");
        }
    }

    pub fn add_template(&self, template: ProcessTemplate) -> Result<(), GprocError> {
        {
            let mut registry = self.write_registry();
            registry.templates.insert(template.name.clone(), template);
        }
        self.persist()
    }

    pub async fn start_from_template(&self, template: &str, id: &str) -> Result<(), GprocError> {
        let spec = {
            let registry = self.read_registry();
            registry
                .templates
                .get(template)
                .ok_or_else(|| GprocError::NotFound(format!("template {template}")))?
                .instantiate(id)
        };
        self.start(spec).await
    }

    pub fn create_snapshot(&self, name: &str) -> Result<Snapshot, GprocError> {
        let specs: Vec<ProcessSpec> = self
            .list()
            .into_iter()
            .map(|record| record.spec)
            .collect();
        self.inner.snapshots.create(name, specs)
    }

    pub fn list_snapshots(&self) -> Result<Vec<Snapshot>, GprocError> {
        self.inner.snapshots.list()
    }

    /// Re-registers the captured specs with Stopped status. Refused
    /// wholesale when any captured id currently owns a live child.
    pub fn restore_snapshot(&self, name: &str) -> Result<(), GprocError> {
        let snapshot = self.inner.snapshots.load(name)?;
        {
            let mut registry = self.write_registry();
            for spec in &snapshot.processes {
                if let Some(existing) = registry.records.get(&spec.id) {
                    if existing.status.is_live() {
                        return Err(GprocError::AlreadyRunning(spec.id.clone()));
                    }
                }
            }
            for spec in snapshot.processes {
                registry.upsert_spec(spec, &self.inner.settings);
            }
        }
        self.persist()
    }

    // ------------------------------------------------------------------
    // Daemon shutdown
    // ------------------------------------------------------------------

    /// Stops every live record through the graceful path and returns
    /// once all of their exits have been applied.
    pub async fn shutdown(&self) {
        let live: Vec<String> = {
            let registry = self.read_registry();
            registry
                .records
                .values()
                .filter(|record| record.status.is_live())
                .map(|record| record.spec.id.clone())
                .collect()
        };
        for id in live {
            match self.stop(&id).await {
                Ok(()) | Err(GprocError::NotRunning(_)) | Err(GprocError::NotFound(_)) => {}
                Err(err) => warn!(%id, %err, "failed to stop process during shutdown"),
            }
        }
    }

    // ------------------------------------------------------------------
    // Start path internals
    // ------------------------------------------------------------------

    async fn start_internal(
        &self,
        id: &str,
        announce: SpawnAnnounce,
        resume_pending: bool,
    ) -> Result<(), GprocError> {
        {
            let mut registry = self.write_registry();
            let record = registry
                .records
                .get(id)
                .ok_or_else(|| GprocError::NotFound(id.to_string()))?;

            if resume_pending {
                // The reducer already claimed the record for us.
                if record.status != ProcessStatus::Starting {
                    return Ok(());
                }
            } else if record.status.is_live() {
                return Err(GprocError::AlreadyRunning(id.to_string()));
            }

            for dep in &record.spec.dependencies {
                let healthy = registry
                    .records
                    .get(dep)
                    .map(|dep_record| dep_record.status == ProcessStatus::Running)
                    .unwrap_or(false);
                if !healthy {
                    return Err(GprocError::DependencyUnhealthy {
                        id: id.to_string(),
                        dep: dep.clone(),
                    });
                }
            }

            let record = registry
                .records
                .get_mut(id)
                .ok_or_else(|| GprocError::NotFound(id.to_string()))?;
            record.status = ProcessStatus::Starting;
            record.expected_stop = false;
            record.restart_due_at = None;
        }

        match self.spawn_claimed(id).await {
            Ok(pid) => {
                match announce {
                    SpawnAnnounce::Fresh => {
                        info!(id, pid, "process started");
                        self.publish(Event::Started {
                            id: id.to_string(),
                            pid,
                        });
                    }
                    SpawnAnnounce::Restart => {
                        let restarts = self
                            .get(id)
                            .map(|record| record.restarts)
                            .unwrap_or_default();
                        info!(id, pid, restarts, "process restarted");
                        self.publish(Event::Restarted {
                            id: id.to_string(),
                            restarts,
                        });
                    }
                }
                Ok(())
            }
            Err(err) => {
                self.inner.spawn_failures.fetch_add(1, Ordering::Relaxed);
                {
                    let mut registry = self.write_registry();
                    if let Some(record) = registry.records.get_mut(id) {
                        record.status = ProcessStatus::Failed;
                        record.clear_runtime();
                    }
                }
                let _ = self.persist();
                error!(id, %err, "launch failed");
                Err(err)
            }
        }
    }

    /// Spawns the child for a record already claimed as Starting. No
    /// registry lock is held across the spawn itself.
    async fn spawn_claimed(&self, id: &str) -> Result<u32, GprocError> {
        let (spec, log_path) = {
            let registry = self.read_registry();
            let record = registry
                .records
                .get(id)
                .ok_or_else(|| GprocError::NotFound(id.to_string()))?;
            (record.spec.clone(), record.log_file.clone())
        };

        // A blue/green record always serves on its active slot's port.
        let mut extra_env = HashMap::new();
        if let Some(bg) = &spec.blue_green {
            extra_env.insert("PORT".to_string(), bg.port_for(bg.active_slot).to_string());
        }

        let spawned = launcher::spawn(
            &spec,
            &log_path,
            self.inner.settings.log_rotation,
            &extra_env,
        )?;
        let pid = spawned.pid;

        {
            let mut registry = self.write_registry();
            let record = registry
                .records
                .get_mut(id)
                .ok_or_else(|| GprocError::NotFound(id.to_string()))?;
            record.pid = Some(pid);
            record.handle = Some(spawned.handle());
            record.status = ProcessStatus::Running;
            record.start_time = Some(now_epoch_secs());
        }
        self.attach_monitor(id.to_string(), spawned);
        self.persist()?;
        Ok(pid)
    }

    /// One monitor task per live child: await the exit, report it to
    /// the reducer. The monitor never touches the registry.
    pub(crate) fn attach_monitor(&self, id: String, mut spawned: SpawnedChild) {
        let exit_tx = self.inner.exit_tx.clone();
        let pid = spawned.pid;
        tokio::spawn(async move {
            let exit = match spawned.child.wait().await {
                Ok(status) => ChildExit::from_status(status),
                Err(err) => {
                    error!(%id, pid, %err, "wait on child failed");
                    ChildExit::Code(-1)
                }
            };
            let _ = exit_tx.send(ExitEvent { id, pid, exit }).await;
        });
    }

    /// Polls until the record has left its live states. Returns false
    /// if the deadline fired first.
    async fn wait_for_exit(&self, id: &str, deadline: Option<Duration>) -> bool {
        let until = deadline.map(|timeout| Instant::now() + timeout);
        loop {
            let live = self
                .get(id)
                .map(|record| record.status.is_live())
                .unwrap_or(false);
            if !live {
                return true;
            }
            if let Some(until) = until {
                if Instant::now() >= until {
                    return false;
                }
            }
            sleep(Duration::from_millis(50)).await;
        }
    }

    // ------------------------------------------------------------------
    // Reducer
    // ------------------------------------------------------------------

    async fn run_reducer(self, mut exit_rx: mpsc::Receiver<ExitEvent>) {
        let mut ticker = interval(REDUCER_TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                maybe = exit_rx.recv() => match maybe {
                    Some(event) => self.apply_exit(event),
                    None => break,
                },
                _ = ticker.tick() => self.drain_due_restarts().await,
            }
        }
    }

    /// Sole writer of the crash/stop transitions. Runs synchronously
    /// under the registry lock; spawning happens later, on the tick.
    fn apply_exit(&self, event: ExitEvent) {
        let ExitEvent { id, pid, exit } = event;
        let mut out: Vec<Event> = Vec::new();

        {
            let mut registry = self.write_registry();
            let Some(record) = registry.records.get_mut(&id) else {
                return;
            };
            if record.pid != Some(pid) {
                // A superseded child (reload swap, stale monitor).
                return;
            }

            let expected = record.expected_stop;
            record.clear_runtime();

            if expected {
                record.status = ProcessStatus::Stopped;
                info!(%id, %exit, "process stopped");
                out.push(Event::Exited {
                    id: id.clone(),
                    exit,
                    expected: true,
                });
            } else {
                out.push(Event::Exited {
                    id: id.clone(),
                    exit,
                    expected: false,
                });
                if record.spec.auto_restart {
                    record.restarts = record.restarts.saturating_add(1);
                    if record.restarts <= record.spec.max_restarts {
                        record.status = ProcessStatus::Starting;
                        record.restart_due_at =
                            Some(now_epoch_millis() + RESTART_BACKOFF.as_millis() as u64);
                        warn!(
                            %id,
                            %exit,
                            restarts = record.restarts,
                            "unexpected exit; restart scheduled"
                        );
                    } else {
                        record.status = ProcessStatus::Failed;
                        error!(%id, %exit, restarts = record.restarts, "restart budget exhausted");
                        out.push(Event::Failed {
                            id: id.clone(),
                            reason: format!("{exit} after {} restarts", record.restarts - 1),
                        });
                    }
                } else {
                    record.status = ProcessStatus::Failed;
                    error!(%id, %exit, "unexpected exit; auto-restart disabled");
                    out.push(Event::Failed {
                        id: id.clone(),
                        reason: exit.to_string(),
                    });
                }
            }
        }

        for event in out {
            self.publish(event);
        }
        if let Err(err) = self.persist() {
            error!(%id, %err, "failed to persist state after exit");
        }
    }

    /// Drains pending restarts whose backoff elapsed and re-enters the
    /// start path for each.
    async fn drain_due_restarts(&self) {
        let now = now_epoch_millis();
        let due: Vec<String> = {
            let registry = self.read_registry();
            registry
                .records
                .values()
                .filter(|record| {
                    record.status == ProcessStatus::Starting
                        && record.restart_due_at.map(|at| at <= now).unwrap_or(false)
                })
                .map(|record| record.spec.id.clone())
                .collect()
        };

        for id in due {
            if let Err(err) = self
                .start_internal(&id, SpawnAnnounce::Restart, true)
                .await
            {
                error!(%id, %err, "automatic restart failed");
                {
                    let mut registry = self.write_registry();
                    if let Some(record) = registry.records.get_mut(&id) {
                        record.status = ProcessStatus::Failed;
                        record.clear_runtime();
                    }
                }
                let _ = self.persist();
                self.publish(Event::Failed {
                    id: id.clone(),
                    reason: err.to_string(),
                });
            }
        }
    }

    // ------------------------------------------------------------------
    // Shared plumbing
    // ------------------------------------------------------------------

    fn read_registry(&self) -> RwLockReadGuard<'_, Registry> {
        self.inner
            .registry
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_registry(&self) -> RwLockWriteGuard<'_, Registry> {
        self.inner
            .registry
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn publish(&self, event: Event) {
        if matches!(event, Event::Failed { .. } | Event::ReloadFailed { .. }) {
            self.inner.alert.emit(&event);
        }
        self.inner.bus.publish(event);
    }

    pub(crate) fn spawn_failure_count(&self) -> u64 {
        self.inner.spawn_failures.load(Ordering::Relaxed)
    }

    /// Builds the config document under the registry lock, then writes
    /// it outside of it. Saves are serialized so a slow write cannot be
    /// overtaken by an older snapshot.
    pub(crate) fn persist(&self) -> Result<(), GprocError> {
        let config = {
            let registry = self.read_registry();
            let mut processes: Vec<ProcessRecord> =
                registry.records.values().cloned().collect();
            processes.sort_by(|a, b| a.spec.id.cmp(&b.spec.id));
            let mut scheduled_tasks: Vec<ScheduledTask> =
                registry.tasks.values().cloned().collect();
            scheduled_tasks.sort_by(|a, b| a.name.cmp(&b.name));
            let mut templates: Vec<ProcessTemplate> =
                registry.templates.values().cloned().collect();
            templates.sort_by(|a, b| a.name.cmp(&b.name));
            Config {
                processes,
                groups: Vec::new(),
                templates,
                scheduled_tasks,
                log_dir: self.inner.settings.log_dir.clone(),
            }
        };

        let _guard = self
            .inner
            .save_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        self.inner.store.save(&config)
    }

    // Accessors used by the reload coordinator.

    pub(crate) fn with_record<T>(
        &self,
        id: &str,
        read: impl FnOnce(&ProcessRecord) -> T,
    ) -> Result<T, GprocError> {
        let registry = self.read_registry();
        registry
            .records
            .get(id)
            .map(read)
            .ok_or_else(|| GprocError::NotFound(id.to_string()))
    }

    pub(crate) fn with_record_mut<T>(
        &self,
        id: &str,
        mutate: impl FnOnce(&mut ProcessRecord) -> T,
    ) -> Result<T, GprocError> {
        let mut registry = self.write_registry();
        registry
            .records
            .get_mut(id)
            .map(mutate)
            .ok_or_else(|| GprocError::NotFound(id.to_string()))
    }
}

impl Registry {
    fn from_config(config: Config, settings: &Settings) -> Self {
        let mut records = HashMap::new();
        for mut record in config.processes {
            // Never trust a persisted live status: the pid is not ours.
            if record.status.is_live() {
                record.status = ProcessStatus::Stopped;
            }
            record.clear_runtime();
            if !settings.persist_restart_counts {
                record.restarts = 0;
            }
            records.insert(record.spec.id.clone(), record);
        }

        let mut tasks = HashMap::new();
        for mut task in config.scheduled_tasks {
            // Recompute the cached occurrence so a long-stopped daemon
            // does not fire everything at boot.
            match CronExpr::parse(&task.cron) {
                Ok(expr) => {
                    task.next_run = expr.next_after(Utc::now());
                    tasks.insert(task.name.clone(), task);
                }
                Err(err) => {
                    warn!(task = %task.name, %err, "dropping task with invalid cron");
                }
            }
        }

        let templates = config
            .templates
            .into_iter()
            .map(|template| (template.name.clone(), template))
            .collect();

        Self {
            records,
            tasks,
            templates,
        }
    }

    /// Inserts or replaces the declared spec, keeping runtime fields of
    /// a non-live existing record.
    fn upsert_spec(&mut self, spec: ProcessSpec, settings: &Settings) {
        let log_file = process_log_path(&settings.log_dir, &spec.id);
        match self.records.get_mut(&spec.id) {
            Some(existing) => {
                existing.spec = spec;
            }
            None => {
                let id = spec.id.clone();
                self.records
                    .insert(id, ProcessRecord::new(spec, log_file));
            }
        }
    }
}
