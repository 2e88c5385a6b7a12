use std::env;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::logs::LogRotationPolicy;

/// Daemon-level configuration resolved from the environment.
///
/// Everything here describes the daemon itself, not managed processes;
/// the managed set lives in the config document (`gproc.json`).
#[derive(Debug, Clone)]
pub struct Settings {
    pub base_dir: PathBuf,
    pub config_path: PathBuf,
    pub log_dir: PathBuf,
    pub snapshots_dir: PathBuf,
    pub log_rotation: LogRotationPolicy,
    /// Keep persisted per-process restart counters across daemon
    /// restarts instead of resetting them to zero on load.
    pub persist_restart_counts: bool,
}

impl Settings {
    pub fn load() -> Result<Self> {
        let base_dir = env::var("GPROC_HOME")
            .map(PathBuf::from)
            .ok()
            .unwrap_or_else(|| {
                dirs::data_local_dir()
                    .unwrap_or_else(env::temp_dir)
                    .join("gproc")
            });

        let settings = Self {
            config_path: base_dir.join("gproc.json"),
            log_dir: base_dir.join("logs"),
            snapshots_dir: base_dir.join("snapshots"),
            log_rotation: LogRotationPolicy {
                max_size_bytes: env_u64("GPROC_LOG_MAX_SIZE_MB", 20)
                    .max(1)
                    .saturating_mul(1024 * 1024),
                max_files: env_u64("GPROC_LOG_MAX_FILES", 5).max(1) as u32,
            },
            persist_restart_counts: env_flag("GPROC_PERSIST_RESTARTS"),
            base_dir,
        };
        settings.ensure_layout()?;
        Ok(settings)
    }

    /// Settings rooted at an explicit directory; used by embedders and
    /// tests that must not touch the user's real data directory.
    pub fn rooted_at(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        Self {
            config_path: base_dir.join("gproc.json"),
            log_dir: base_dir.join("logs"),
            snapshots_dir: base_dir.join("snapshots"),
            log_rotation: LogRotationPolicy {
                max_size_bytes: 20 * 1024 * 1024,
                max_files: 5,
            },
            persist_restart_counts: false,
            base_dir,
        }
    }

    pub fn ensure_layout(&self) -> Result<()> {
        fs::create_dir_all(&self.base_dir)
            .with_context(|| format!("failed to create {}", self.base_dir.display()))?;
        fs::create_dir_all(&self.log_dir)
            .with_context(|| format!("failed to create {}", self.log_dir.display()))?;
        fs::create_dir_all(&self.snapshots_dir)
            .with_context(|| format!("failed to create {}", self.snapshots_dir.display()))?;
        Ok(())
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str) -> bool {
    env::var(key)
        .map(|value| matches!(value.trim(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    use super::Settings;

    #[test]
    fn rooted_settings_derive_expected_paths() {
        let base = temp_dir("settings-paths");
        let settings = Settings::rooted_at(&base);

        assert_eq!(settings.config_path, base.join("gproc.json"));
        assert_eq!(settings.log_dir, base.join("logs"));
        assert_eq!(settings.snapshots_dir, base.join("snapshots"));
        assert!(!settings.persist_restart_counts);
    }

    #[test]
    fn ensure_layout_creates_missing_directories() {
        let base = temp_dir("settings-layout");
        let settings = Settings::rooted_at(&base);

        settings
            .ensure_layout()
            .expect("expected ensure_layout to create directories");
        assert!(settings.log_dir.exists(), "log directory should exist");
        assert!(
            settings.snapshots_dir.exists(),
            "snapshots directory should exist"
        );

        let _ = fs::remove_dir_all(base);
    }

    fn temp_dir(prefix: &str) -> PathBuf {
        let nonce = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock failure")
            .as_nanos();
        std::env::temp_dir().join(format!("gproc-{prefix}-{nonce}"))
    }
}
