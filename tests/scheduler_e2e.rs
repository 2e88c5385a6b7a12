//! Scheduled-task runner tests: due tasks launch through the child
//! launcher, runs never overlap, and timeouts kill overlong children.

#![cfg(unix)]

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{Duration as ChronoDuration, Utc};
use tokio::time::{sleep, Duration, Instant};

use gproc::{ScheduledTask, Scheduler, Settings, Supervisor};

fn build_supervisor(prefix: &str) -> Supervisor {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let nonce = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock failure")
        .as_nanos();
    let base: PathBuf = std::env::temp_dir().join(format!("gproc-sched-{prefix}-{nonce}"));
    Supervisor::new(Settings::rooted_at(base)).expect("failed to build supervisor")
}

fn shell_task(name: &str, script: &str, cron: &str) -> ScheduledTask {
    let mut task = ScheduledTask::new(name, "/bin/sh", cron);
    task.args = vec!["-c".to_string(), script.to_string()];
    task
}

async fn wait_for_last_run(supervisor: &Supervisor, name: &str, within: Duration) {
    let deadline = Instant::now() + within;
    loop {
        let done = supervisor
            .list_scheduled()
            .into_iter()
            .find(|task| task.name == name)
            .map(|task| task.last_run.is_some())
            .unwrap_or(false);
        if done {
            return;
        }
        if Instant::now() >= deadline {
            panic!("task {name} never completed a run");
        }
        sleep(Duration::from_millis(100)).await;
    }
}

fn cleanup(supervisor: &Supervisor) {
    let _ = std::fs::remove_dir_all(supervisor.settings().base_dir);
}

#[tokio::test]
async fn due_task_runs_and_advances_schedule() {
    let supervisor = build_supervisor("due");
    supervisor
        .add_scheduled(shell_task("report", "echo tick-ran", "* * * * *"))
        .expect("failed to register task");

    let registered_next = supervisor.list_scheduled()[0]
        .next_run
        .expect("registration caches next_run");

    let scheduler = Scheduler::new(supervisor.clone());
    // Pretend the next minute boundary has passed.
    scheduler.tick(Utc::now() + ChronoDuration::minutes(2));

    wait_for_last_run(&supervisor, "report", Duration::from_secs(10)).await;

    let task = supervisor
        .list_scheduled()
        .into_iter()
        .find(|task| task.name == "report")
        .expect("task should still be registered");
    let advanced_next = task.next_run.expect("completion recomputes next_run");
    assert!(advanced_next >= registered_next);

    let log_path = supervisor
        .settings()
        .log_dir
        .join("task-report.log");
    let captured = std::fs::read_to_string(&log_path).expect("failed reading task log");
    assert!(captured.contains("tick-ran"), "log: {captured}");

    cleanup(&supervisor);
}

#[tokio::test]
async fn task_not_yet_due_is_left_alone() {
    let supervisor = build_supervisor("not-due");
    supervisor
        .add_scheduled(shell_task("later", "echo ran", "@daily"))
        .expect("failed to register task");

    let scheduler = Scheduler::new(supervisor.clone());
    scheduler.tick(Utc::now());
    sleep(Duration::from_millis(500)).await;

    let task = &supervisor.list_scheduled()[0];
    assert!(task.last_run.is_none(), "an undue task must not run");

    cleanup(&supervisor);
}

#[tokio::test]
async fn disabled_task_never_runs() {
    let supervisor = build_supervisor("disabled");
    let mut task = shell_task("muted", "echo ran", "* * * * *");
    task.enabled = false;
    supervisor
        .add_scheduled(task)
        .expect("failed to register task");

    let scheduler = Scheduler::new(supervisor.clone());
    scheduler.tick(Utc::now() + ChronoDuration::minutes(2));
    sleep(Duration::from_millis(500)).await;

    assert!(supervisor.list_scheduled()[0].last_run.is_none());
    cleanup(&supervisor);
}

#[tokio::test]
async fn timeout_kills_an_overlong_run() {
    let supervisor = build_supervisor("timeout");
    let mut task = shell_task("hog", "sleep 60", "* * * * *");
    task.timeout_secs = Some(1);
    supervisor
        .add_scheduled(task)
        .expect("failed to register task");

    let scheduler = Scheduler::new(supervisor.clone());
    let started = Instant::now();
    scheduler.tick(Utc::now() + ChronoDuration::minutes(2));

    wait_for_last_run(&supervisor, "hog", Duration::from_secs(15)).await;
    assert!(
        started.elapsed() < Duration::from_secs(30),
        "the run must be cut off by its timeout, not run to completion"
    );

    cleanup(&supervisor);
}

#[tokio::test]
async fn in_flight_task_skips_the_next_tick() {
    let supervisor = build_supervisor("overlap");
    supervisor
        .add_scheduled(shell_task(
            "slow",
            "echo start-marker; sleep 2",
            "* * * * *",
        ))
        .expect("failed to register task");

    let scheduler = Scheduler::new(supervisor.clone());
    let due = Utc::now() + ChronoDuration::minutes(2);
    scheduler.tick(due);
    // Give the first run a moment to get in flight, then tick again.
    sleep(Duration::from_millis(300)).await;
    scheduler.tick(due + ChronoDuration::minutes(1));

    wait_for_last_run(&supervisor, "slow", Duration::from_secs(15)).await;
    sleep(Duration::from_millis(500)).await;

    let log_path = supervisor.settings().log_dir.join("task-slow.log");
    let captured = std::fs::read_to_string(&log_path).expect("failed reading task log");
    let runs = captured.matches("start-marker").count();
    assert_eq!(runs, 1, "overlapping ticks are skipped, not queued");

    cleanup(&supervisor);
}
