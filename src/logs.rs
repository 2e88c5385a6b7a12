use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Local;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};

/// Size/count caps applied when a log file is opened for a new run.
#[derive(Debug, Clone, Copy)]
pub struct LogRotationPolicy {
    pub max_size_bytes: u64,
    pub max_files: u32,
}

/// `<log_dir>/<process_id>.log`; stdout and stderr share the file.
pub fn process_log_path(log_dir: &Path, id: &str) -> PathBuf {
    log_dir.join(format!("{id}.log"))
}

/// `<log_dir>/task-<name>.log` for scheduled-task runs.
pub fn task_log_path(log_dir: &Path, name: &str) -> PathBuf {
    log_dir.join(format!("task-{name}.log"))
}

/// Opens the per-process log file for appending, rotating first if the
/// size cap was exceeded by the previous run.
pub fn open_sink(path: &Path, policy: LogRotationPolicy) -> Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    rotate_if_needed(path, policy)?;

    let mut options = OpenOptions::new();
    options.create(true).append(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options
        .open(path)
        .with_context(|| format!("failed opening {}", path.display()))
}

fn rotate_if_needed(path: &Path, policy: LogRotationPolicy) -> Result<()> {
    if policy.max_size_bytes == 0 || policy.max_files == 0 || !path.exists() {
        return Ok(());
    }

    let metadata =
        fs::metadata(path).with_context(|| format!("failed to stat {}", path.display()))?;
    if metadata.len() < policy.max_size_bytes {
        return Ok(());
    }

    // Shift <path>.1 -> <path>.2 ... dropping the oldest.
    for idx in (1..=policy.max_files).rev() {
        let candidate = rotated_path(path, idx);
        if !candidate.exists() {
            continue;
        }
        if idx == policy.max_files {
            let _ = fs::remove_file(&candidate);
        } else {
            let next = rotated_path(path, idx + 1);
            let _ = fs::remove_file(&next);
            fs::rename(&candidate, &next).with_context(|| {
                format!(
                    "failed to rotate {} -> {}",
                    candidate.display(),
                    next.display()
                )
            })?;
        }
    }

    let first = rotated_path(path, 1);
    let _ = fs::remove_file(&first);
    fs::rename(path, &first)
        .with_context(|| format!("failed to rotate {} -> {}", path.display(), first.display()))?;
    Ok(())
}

fn rotated_path(path: &Path, index: u32) -> PathBuf {
    PathBuf::from(format!("{}.{}", path.display(), index))
}

/// Returns up to `max_lines` trailing lines of `path`, reading the file
/// backwards in chunks so large logs are not loaded whole.
pub fn tail_lines(path: &Path, max_lines: usize) -> Result<Vec<String>> {
    if max_lines == 0 || !path.exists() {
        return Ok(Vec::new());
    }

    let mut file =
        File::open(path).with_context(|| format!("failed opening {}", path.display()))?;
    let total = file
        .metadata()
        .with_context(|| format!("failed to stat {}", path.display()))?
        .len();
    if total == 0 {
        return Ok(Vec::new());
    }

    const CHUNK: u64 = 16 * 1024;
    let mut offset = total;
    let mut newlines = 0usize;
    let mut collected: Vec<u8> = Vec::new();

    while offset > 0 && newlines <= max_lines {
        let len = CHUNK.min(offset) as usize;
        offset -= len as u64;
        file.seek(SeekFrom::Start(offset))
            .with_context(|| format!("failed seeking {}", path.display()))?;

        let mut chunk = vec![0_u8; len];
        file.read_exact(&mut chunk)
            .with_context(|| format!("failed reading {}", path.display()))?;
        newlines += chunk.iter().filter(|&&byte| byte == b'\n').count();
        chunk.extend_from_slice(&collected);
        collected = chunk;
    }

    let text = String::from_utf8_lossy(&collected);
    let mut lines: Vec<String> = text.lines().map(str::to_string).collect();
    if lines.len() > max_lines {
        lines.drain(..lines.len() - max_lines);
    }
    Ok(lines)
}

/// Tail-with-follow: sends the last `seed_lines` lines, then blocks on
/// file growth and emits each new line prefixed with a wall-clock
/// timestamp. Returns once the receiver side is dropped. Truncation
/// (rotation by a collaborator) causes a transparent reopen.
pub async fn follow(
    path: PathBuf,
    seed_lines: usize,
    tx: mpsc::Sender<String>,
) -> Result<()> {
    if !path.exists() {
        File::create(&path).with_context(|| format!("failed to create {}", path.display()))?;
    }

    for line in tail_lines(&path, seed_lines)? {
        if tx.send(stamp(&line)).await.is_err() {
            return Ok(());
        }
    }

    let mut file = tokio::fs::File::open(&path)
        .await
        .with_context(|| format!("failed to open {}", path.display()))?;
    file.seek(SeekFrom::End(0)).await?;
    let mut pending = String::new();

    loop {
        let mut buffer = Vec::new();
        let read = file.read_to_end(&mut buffer).await?;
        if read > 0 {
            pending.push_str(&String::from_utf8_lossy(&buffer));
            while let Some(pos) = pending.find('\n') {
                let line: String = pending.drain(..=pos).collect();
                if tx.send(stamp(line.trim_end_matches('\n'))).await.is_err() {
                    return Ok(());
                }
            }
        } else {
            let position = file.stream_position().await?;
            if let Ok(meta) = tokio::fs::metadata(&path).await {
                if meta.len() < position {
                    file = tokio::fs::File::open(&path)
                        .await
                        .with_context(|| format!("failed to reopen {}", path.display()))?;
                }
            }
            if tx.is_closed() {
                return Ok(());
            }
            sleep(Duration::from_millis(300)).await;
        }
    }
}

fn stamp(line: &str) -> String {
    format!("{} {line}", Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"))
}
