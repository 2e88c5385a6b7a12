use std::collections::BTreeMap;

use serde::Serialize;

use crate::supervisor::Supervisor;

/// Counter snapshot for a metrics collaborator to pull periodically.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    /// Restart count per process id since daemon start.
    pub restarts: BTreeMap<String, u32>,
    /// Number of records per lifecycle status.
    pub status_counts: BTreeMap<String, usize>,
    /// Launch attempts that failed at the OS level.
    pub spawn_failures: u64,
}

impl Supervisor {
    pub fn metrics(&self) -> MetricsSnapshot {
        let mut restarts = BTreeMap::new();
        let mut status_counts = BTreeMap::new();
        for record in self.list() {
            restarts.insert(record.spec.id.clone(), record.restarts);
            *status_counts.entry(record.status.to_string()).or_insert(0) += 1;
        }
        MetricsSnapshot {
            restarts,
            status_counts,
            spawn_failures: self.spawn_failure_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::{SystemTime, UNIX_EPOCH};

    use crate::process::ProcessSpec;
    use crate::settings::Settings;
    use crate::supervisor::Supervisor;

    #[tokio::test]
    async fn metrics_reflect_registry_contents() {
        let nonce = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock failure")
            .as_nanos();
        let base = std::env::temp_dir().join(format!("gproc-metrics-{nonce}"));
        let supervisor =
            Supervisor::new(Settings::rooted_at(base.clone())).expect("failed to build supervisor");

        supervisor
            .add(ProcessSpec::new("web", "/bin/true"))
            .expect("failed to add web");
        supervisor
            .add(ProcessSpec::new("worker", "/bin/true"))
            .expect("failed to add worker");

        let metrics = supervisor.metrics();
        assert_eq!(metrics.restarts.len(), 2);
        assert_eq!(metrics.restarts.get("web"), Some(&0));
        assert_eq!(metrics.status_counts.get("stopped"), Some(&2));
        assert_eq!(metrics.spawn_failures, 0);

        let _ = std::fs::remove_dir_all(base);
    }
}
