use std::collections::HashMap;

use tokio::time::{sleep, timeout, Duration};
use tracing::{info, warn};

use crate::errors::GprocError;
use crate::events::Event;
use crate::launcher::{self, GRACEFUL_STOP_TIMEOUT};
use crate::process::{now_epoch_secs, HealthProbePolicy, ProcessStatus};
use crate::supervisor::Supervisor;

/// Blue/green swap: launch a shadow child on the inactive slot's port,
/// probe its health endpoint, atomically make it the active instance,
/// then retire the predecessor gracefully. The restart counter is not
/// touched; an upgrade is not a crash.
pub(crate) async fn reload(supervisor: &Supervisor, id: &str) -> Result<(), GprocError> {
    let (spec, log_file, old_pid, bg) = supervisor.with_record(id, |record| {
        if record.status != ProcessStatus::Running {
            return Err(GprocError::NotRunning(id.to_string()));
        }
        let bg = record
            .spec
            .blue_green
            .clone()
            .ok_or_else(|| GprocError::ReloadFailed {
                id: id.to_string(),
                reason: "record has no blue_green configuration".to_string(),
            })?;
        let old_pid = record
            .pid
            .ok_or_else(|| GprocError::NotRunning(id.to_string()))?;
        Ok((record.spec.clone(), record.log_file.clone(), old_pid, bg))
    })??;

    let shadow_slot = bg.active_slot.other();
    let shadow_port = bg.port_for(shadow_slot);
    info!(id, slot = %shadow_slot, port = shadow_port, "launching reload shadow");

    let mut extra_env = HashMap::new();
    extra_env.insert("PORT".to_string(), shadow_port.to_string());

    let mut shadow = launcher::spawn(
        &spec,
        &log_file,
        supervisor.settings().log_rotation,
        &extra_env,
    )
    .map_err(|err| {
        let failure = GprocError::ReloadFailed {
            id: id.to_string(),
            reason: format!("shadow launch failed: {err}"),
        };
        supervisor.publish(Event::ReloadFailed {
            id: id.to_string(),
            reason: failure.to_string(),
        });
        failure
    })?;

    let url = bg.health_url(shadow_slot);
    if !probe_health(&url, &bg.probe).await {
        warn!(id, %url, "shadow never became healthy; keeping current instance");
        retire_shadow(&mut shadow).await;
        let reason = format!("health check never passed at {url}");
        supervisor.publish(Event::ReloadFailed {
            id: id.to_string(),
            reason: reason.clone(),
        });
        return Err(GprocError::ReloadFailed {
            id: id.to_string(),
            reason,
        });
    }

    // Swap under the registry lock; bail if the record changed beneath
    // us (a concurrent stop or crash while the shadow warmed up).
    let new_handle = shadow.handle();
    let swapped = supervisor.with_record_mut(id, |record| {
        if record.status != ProcessStatus::Running || record.pid != Some(old_pid) {
            return false;
        }
        record.pid = Some(new_handle.pid);
        record.handle = Some(new_handle.clone());
        record.start_time = Some(now_epoch_secs());
        if let Some(bg) = record.spec.blue_green.as_mut() {
            bg.active_slot = shadow_slot;
        }
        true
    })?;

    if !swapped {
        warn!(id, "record changed during reload; retiring shadow");
        retire_shadow(&mut shadow).await;
        let reason = "record changed during health probe".to_string();
        supervisor.publish(Event::ReloadFailed {
            id: id.to_string(),
            reason: reason.clone(),
        });
        return Err(GprocError::ReloadFailed {
            id: id.to_string(),
            reason,
        });
    }

    supervisor.attach_monitor(id.to_string(), shadow);
    supervisor.persist()?;
    supervisor.publish(Event::ReloadSucceeded {
        id: id.to_string(),
        active_slot: shadow_slot,
    });
    info!(id, slot = %shadow_slot, "reload swapped; retiring predecessor");

    // The old child's monitor still reports to the reducer, but its
    // pid no longer matches the record, so the exit is discarded.
    launcher::terminate_pid(old_pid, GRACEFUL_STOP_TIMEOUT).await;
    Ok(())
}

/// Probes the health URL until a 2xx arrives or the retry budget is
/// spent.
pub(crate) async fn probe_health(url: &str, policy: &HealthProbePolicy) -> bool {
    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(policy.timeout_secs.max(1)))
        .build()
    {
        Ok(client) => client,
        Err(err) => {
            warn!(url, %err, "failed to build health probe client");
            return false;
        }
    };

    let attempts = policy.retries.max(1);
    for attempt in 1..=attempts {
        match client.get(url).send().await {
            Ok(response) if response.status().is_success() => return true,
            Ok(response) => {
                warn!(url, attempt, status = %response.status(), "health probe rejected");
            }
            Err(err) => {
                warn!(url, attempt, %err, "health probe failed");
            }
        }
        if attempt < attempts {
            sleep(Duration::from_secs(policy.interval_secs.max(1))).await;
        }
    }
    false
}

/// Gracefully stops a shadow the engine never published: signal, wait
/// out the grace window on its own wait future, then kill and reap.
async fn retire_shadow(shadow: &mut launcher::SpawnedChild) {
    let _ = shadow.handle().signal_graceful();
    match timeout(GRACEFUL_STOP_TIMEOUT, shadow.child.wait()).await {
        Ok(_) => {}
        Err(_) => {
            let _ = shadow.handle().signal_kill();
            let _ = shadow.child.wait().await;
        }
    }
}
