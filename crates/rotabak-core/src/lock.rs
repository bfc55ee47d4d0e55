//! Exclusive per-project run lock.
//!
//! The lock is a file created with `create_new`, holding the owner's pid and
//! start time. It is released when the [`RunLock`] guard drops. A lock whose
//! pid is gone, or which is older than the configured bound, is stale and is
//! taken over.

use crate::error::{BackupError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

/// Unparseable lock files younger than this are assumed to be mid-write.
const PARTIAL_WRITE_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LockRecord {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
}

impl LockRecord {
    fn current() -> Self {
        Self {
            pid: std::process::id(),
            started_at: Utc::now(),
        }
    }

    fn age(&self) -> Duration {
        (Utc::now() - self.started_at).to_std().unwrap_or_default()
    }
}

#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
    record: LockRecord,
}

impl RunLock {
    /// Take the lock at `path` or fail with [`BackupError::LockContention`].
    pub fn acquire(path: &Path, stale_after: Duration) -> Result<RunLock> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // Second pass only happens after a stale lock was cleared.
        for _ in 0..2 {
            match try_create(path) {
                Ok(record) => {
                    tracing::debug!(path = %path.display(), pid = record.pid, "run lock acquired");
                    return Ok(RunLock {
                        path: path.to_path_buf(),
                        record,
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    match holder_state(path, stale_after)? {
                        Holder::Gone => continue,
                        Holder::Stale { reason, record } => {
                            tracing::warn!(path = %path.display(), %reason, "taking over stale run lock");
                            match clear_stale(path, record.as_ref())? {
                                Cleared::Removed | Cleared::Gone => continue,
                                Cleared::Replaced(live) => return Err(contention(path, live)),
                            }
                        }
                        Holder::Live(record) => return Err(contention(path, Some(record))),
                        Holder::Unknown => return Err(contention(path, None)),
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(contention(path, read_record(path).ok().flatten()))
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        // Only remove the file if it is still ours; a takeover may have replaced it.
        match read_record(&self.path) {
            Ok(Some(r)) if r != self.record => {}
            _ => {
                let _ = std::fs::remove_file(&self.path);
            }
        }
    }
}

fn contention(path: &Path, holder: Option<LockRecord>) -> BackupError {
    BackupError::LockContention {
        path: path.to_path_buf(),
        pid: holder.as_ref().map(|r| r.pid).unwrap_or(0),
        started_at: holder
            .map(|r| r.started_at.to_rfc3339())
            .unwrap_or_else(|| "unknown".to_string()),
    }
}

fn try_create(path: &Path) -> std::io::Result<LockRecord> {
    let mut file = std::fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(path)?;
    let record = LockRecord::current();
    let data = serde_yaml::to_string(&record).map_err(std::io::Error::other)?;
    file.write_all(data.as_bytes())?;
    file.sync_all()?;
    Ok(record)
}

fn read_record(path: &Path) -> Result<Option<LockRecord>> {
    let data = match std::fs::read_to_string(path) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    Ok(serde_yaml::from_str(&data).ok())
}

enum Holder {
    /// File vanished between our create attempt and the read.
    Gone,
    /// `record` is what was read when judging; `None` if it was unreadable.
    Stale {
        reason: String,
        record: Option<LockRecord>,
    },
    Live(LockRecord),
    /// Unreadable but fresh; treat as held.
    Unknown,
}

fn holder_state(path: &Path, stale_after: Duration) -> Result<Holder> {
    match read_record(path)? {
        Some(record) => {
            if !is_pid_alive(record.pid) {
                Ok(Holder::Stale {
                    reason: format!("pid {} is not running", record.pid),
                    record: Some(record),
                })
            } else if record.age() > stale_after {
                Ok(Holder::Stale {
                    reason: format!(
                        "held for {}s (limit {}s)",
                        record.age().as_secs(),
                        stale_after.as_secs()
                    ),
                    record: Some(record),
                })
            } else {
                Ok(Holder::Live(record))
            }
        }
        None if !path.exists() => Ok(Holder::Gone),
        None => {
            let age = std::fs::metadata(path)
                .and_then(|m| m.modified())
                .ok()
                .and_then(|t| t.elapsed().ok())
                .unwrap_or_default();
            if age > PARTIAL_WRITE_GRACE {
                Ok(Holder::Stale {
                    reason: "lock file is unreadable".to_string(),
                    record: None,
                })
            } else {
                Ok(Holder::Unknown)
            }
        }
    }
}

#[derive(Debug, PartialEq)]
enum Cleared {
    /// The stale lock was moved aside and deleted.
    Removed,
    /// Someone else already cleared it.
    Gone,
    /// The file no longer held the judged record; it was put back.
    Replaced(Option<LockRecord>),
}

/// Remove a lock judged stale, but only if it still holds `judged`.
///
/// The file is renamed aside before it is compared. A lock that changed
/// since it was judged is put back.
fn clear_stale(path: &Path, judged: Option<&LockRecord>) -> Result<Cleared> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "run.lock".to_string());
    let aside = path.with_file_name(format!("{file_name}.stale-{}", Uuid::new_v4()));

    match std::fs::rename(path, &aside) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Cleared::Gone),
        Err(e) => return Err(e.into()),
    }

    let found = read_record(&aside)?;
    if found.as_ref() == judged {
        std::fs::remove_file(&aside)?;
        return Ok(Cleared::Removed);
    }

    // hard_link refuses to clobber, so a lock created meanwhile wins.
    if let Err(e) = std::fs::hard_link(&aside, path) {
        tracing::warn!(path = %path.display(), error = %e, "could not restore replaced run lock");
    }
    if let Err(e) = std::fs::remove_file(&aside) {
        tracing::warn!(path = %aside.display(), error = %e, "could not remove set-aside lock file");
    }
    Ok(Cleared::Replaced(found))
}

/// Returns true if the process is still alive (`kill -0 {pid}`).
pub fn is_pid_alive(pid: u32) -> bool {
    if pid == std::process::id() {
        return true;
    }
    #[cfg(unix)]
    {
        std::process::Command::new("kill")
            .args(["-0", &pid.to_string()])
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        // No cheap liveness probe here; the age bound handles crashed holders.
        pid != 0
    }
}
