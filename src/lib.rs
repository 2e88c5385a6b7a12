//! Supervisor core for the gproc process manager.
//!
//! The crate implements the engine of a long-lived local process
//! supervisor: the data model of managed processes, the per-process
//! lifecycle state machine, one monitor task per live child feeding a
//! single-writer reducer, graceful stop with kill escalation, bounded
//! automatic restarts, dependency-ordered startup, blue/green reload,
//! crash-safe JSON persistence, and a cron-style scheduled-task runner
//! that reuses the same launch pipeline.
//!
//! Front-ends (CLI, REST/gRPC control planes, dashboards) are expected
//! to live outside this crate: they construct a [`Supervisor`] once at
//! daemon startup and translate their requests into its operations, or
//! hand control to [`daemon::run`] for the batteries-included loop.

pub mod daemon;
pub mod deps;
pub mod errors;
pub mod events;
pub mod launcher;
pub mod logs;
pub mod metrics;
pub mod process;
pub mod reload;
pub mod scheduler;
pub mod settings;
pub mod store;
pub mod supervisor;

pub use errors::GprocError;
pub use events::{AlertSink, Event, TracingAlertSink};
pub use metrics::MetricsSnapshot;
pub use process::{
    BlueGreenSpec, ChildExit, HealthProbePolicy, ProcessRecord, ProcessSpec, ProcessStatus,
    ProcessTemplate, Slot,
};
pub use scheduler::{ScheduledTask, Scheduler};
pub use settings::Settings;
pub use store::{Config, Snapshot};
pub use supervisor::Supervisor;
