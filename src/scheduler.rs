use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Datelike, Duration as ChronoDuration, Local, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::errors::GprocError;
use crate::launcher;
use crate::logs::task_log_path;
use crate::process::{ChildExit, ProcessSpec};
use crate::supervisor::Supervisor;

/// A time-driven one-shot invocation registered with the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub cron: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub next_run: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_run: Option<DateTime<Utc>>,
    /// Wall-clock bound on a single run; the child is killed once it
    /// elapses.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

fn default_enabled() -> bool {
    true
}

impl ScheduledTask {
    pub fn new(name: impl Into<String>, command: impl Into<String>, cron: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            working_dir: None,
            env: HashMap::new(),
            cron: cron.into(),
            enabled: true,
            next_run: None,
            last_run: None,
            timeout_secs: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CronField {
    Any,
    Literal(u32),
}

impl CronField {
    fn matches(&self, value: u32) -> bool {
        match self {
            CronField::Any => true,
            CronField::Literal(literal) => *literal == value,
        }
    }
}

/// Parsed form of the recognized cron grammar: the `@hourly`/`@daily`/
/// `@weekly`/`@monthly` shorthands and the classical five-field form
/// where each field is a literal in its domain or `*`. Anything else
/// is rejected at registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    minute: CronField,
    hour: CronField,
    day: CronField,
    month: CronField,
    weekday: CronField,
}

impl CronExpr {
    pub fn parse(expr: &str) -> Result<Self, GprocError> {
        let normalized = match expr.trim() {
            "@hourly" => "0 * * * *".to_string(),
            "@daily" => "0 0 * * *".to_string(),
            "@weekly" => "0 0 * * 0".to_string(),
            "@monthly" => "0 0 1 * *".to_string(),
            other => other.to_string(),
        };

        let fields: Vec<&str> = normalized.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(GprocError::InvalidCron(expr.to_string()));
        }

        let parsed = CronExpr {
            minute: parse_field(fields[0], 0, 59, expr)?,
            hour: parse_field(fields[1], 0, 23, expr)?,
            day: parse_field(fields[2], 1, 31, expr)?,
            month: parse_field(fields[3], 1, 12, expr)?,
            weekday: parse_field(fields[4], 0, 6, expr)?,
        };
        Ok(parsed)
    }

    fn matches(&self, at: &DateTime<Local>) -> bool {
        self.minute.matches(at.minute())
            && self.hour.matches(at.hour())
            && self.day.matches(at.day())
            && self.month.matches(at.month())
            && self.weekday.matches(at.weekday().num_days_from_sunday())
    }

    /// First matching minute strictly after `after`, scanning at most a
    /// year ahead. `None` means the expression can never fire (e.g. a
    /// literal Feb 30).
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut candidate = truncate_to_minute(after) + ChronoDuration::minutes(1);
        let horizon = after + ChronoDuration::days(366);
        while candidate <= horizon {
            if self.matches(&candidate.with_timezone(&Local)) {
                return Some(candidate);
            }
            candidate += ChronoDuration::minutes(1);
        }
        None
    }
}

fn parse_field(token: &str, min: u32, max: u32, expr: &str) -> Result<CronField, GprocError> {
    if token == "*" {
        return Ok(CronField::Any);
    }
    let value: u32 = token
        .parse()
        .map_err(|_| GprocError::InvalidCron(expr.to_string()))?;
    if value < min || value > max {
        return Err(GprocError::InvalidCron(expr.to_string()));
    }
    Ok(CronField::Literal(value))
}

fn truncate_to_minute(at: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(at.year(), at.month(), at.day(), at.hour(), at.minute(), 0)
        .single()
        .unwrap_or(at)
}

/// Validates an expression for registration: it must parse and have at
/// least one future occurrence.
pub fn validate_expr(expr: &str) -> Result<DateTime<Utc>, GprocError> {
    let parsed = CronExpr::parse(expr)?;
    parsed
        .next_after(Utc::now())
        .ok_or_else(|| GprocError::InvalidCron(expr.to_string()))
}

/// Minute-ticker that launches due tasks through the child launcher.
/// A task never overlaps itself; a tick that finds the previous run
/// still in flight is skipped, not queued.
pub struct Scheduler {
    supervisor: Supervisor,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl Scheduler {
    pub fn new(supervisor: Supervisor) -> Self {
        Self {
            supervisor,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub async fn run(self) {
        let mut ticker = interval(Duration::from_secs(60));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            self.tick(Utc::now());
        }
    }

    /// One pass over the registered tasks; split out so tests can tick
    /// without waiting on the wall clock.
    pub fn tick(&self, now: DateTime<Utc>) {
        for task in self.supervisor.list_scheduled() {
            if !task.enabled {
                continue;
            }
            let due = task.next_run.map(|next| now >= next).unwrap_or(false);
            if !due {
                continue;
            }
            {
                let mut in_flight = self
                    .in_flight
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                if !in_flight.insert(task.name.clone()) {
                    info!(task = %task.name, "previous run still active; skipping tick");
                    continue;
                }
            }

            let supervisor = self.supervisor.clone();
            let in_flight = Arc::clone(&self.in_flight);
            tokio::spawn(async move {
                let name = task.name.clone();
                run_task(&supervisor, task).await;
                let mut in_flight = in_flight
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                in_flight.remove(&name);
            });
        }
    }
}

async fn run_task(supervisor: &Supervisor, task: ScheduledTask) {
    let settings = supervisor.settings();
    let started_at = Utc::now();

    let mut spec = ProcessSpec::new(task.name.clone(), task.command.clone());
    spec.args = task.args.clone();
    spec.working_dir = task.working_dir.clone();
    spec.env = task.env.clone();

    let log_path = task_log_path(&settings.log_dir, &task.name);
    info!(task = %task.name, cron = %task.cron, "launching scheduled run");

    match launcher::spawn(&spec, &log_path, settings.log_rotation, &HashMap::new()) {
        Ok(mut spawned) => {
            let outcome = match task.timeout_secs {
                Some(secs) => {
                    match tokio::time::timeout(Duration::from_secs(secs), spawned.child.wait())
                        .await
                    {
                        Ok(wait) => wait.map(Some),
                        Err(_) => {
                            warn!(
                                task = %task.name,
                                timeout_secs = secs,
                                "scheduled run exceeded its timeout; killing"
                            );
                            let _ = spawned.handle().signal_kill();
                            spawned.child.wait().await.map(|_| None)
                        }
                    }
                }
                None => spawned.child.wait().await.map(Some),
            };

            match outcome {
                Ok(Some(status)) => {
                    info!(
                        task = %task.name,
                        exit = %ChildExit::from_status(status),
                        "scheduled run finished"
                    );
                }
                Ok(None) => {}
                Err(err) => error!(task = %task.name, %err, "failed waiting on scheduled run"),
            }
        }
        Err(err) => {
            error!(task = %task.name, %err, "failed to launch scheduled run");
        }
    }

    supervisor.finish_scheduled_run(&task.name, started_at);
}
