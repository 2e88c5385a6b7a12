use anyhow::Result;
use tracing::{error, info, warn};

use crate::scheduler::Scheduler;
use crate::settings::Settings;
use crate::supervisor::Supervisor;

/// The composed daemon loop an enclosing front-end calls into: build
/// the engine, restore the declared set in dependency order, run the
/// scheduled-task ticker, and drain everything on the shutdown signal.
pub async fn run(settings: Settings) -> Result<()> {
    let supervisor = Supervisor::new(settings)?;

    if let Err(err) = supervisor.start_all().await {
        // A record that cannot come back up must not keep the daemon
        // itself from serving; the failure is already surfaced.
        error!(%err, "failed to restore declared processes at boot");
    }

    let scheduler_task = tokio::spawn(Scheduler::new(supervisor.clone()).run());
    info!("gproc daemon ready");

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received; stopping managed processes"),
        Err(err) => warn!(%err, "failed to wait for shutdown signal; stopping"),
    }

    scheduler_task.abort();
    supervisor.shutdown().await;
    info!("all managed processes stopped");
    Ok(())
}
