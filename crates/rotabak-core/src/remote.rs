//! Remote store capability and its adapters.
//!
//! The manager only ever talks to [`RemoteStore`]; retries and timeouts are
//! layered on by the caller, so adapters make exactly one attempt per call.

use crate::config::{resolve_under, Config, RemoteBackend, TransferConfig};
use crate::error::{BackupError, Result};
use crate::exec::run_with_timeout;
use crate::io;
use crate::paths;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write as _;
use std::path::{Component, Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use tempfile::NamedTempFile;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// One object in a remote folder.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemoteEntry {
    pub name: String,
    /// Handle accepted by `delete` and `download` (`folder/name`).
    pub remote_id: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<DateTime<Utc>>,
}

pub trait RemoteStore {
    /// Human-readable target, e.g. `gdrive:backups`.
    fn describe(&self, folder: &str) -> String;

    /// Confirm the store is reachable and configured.
    fn check(&self) -> Result<()>;

    fn list(&self, folder: &str) -> Result<Vec<RemoteEntry>>;

    /// Copy `local` into `folder` under its own file name; returns the remote id.
    fn upload(&self, local: &Path, folder: &str) -> Result<String>;

    fn delete(&self, remote_id: &str) -> Result<()>;

    /// Copy `remote_id` to the local file `dest`.
    fn download(&self, remote_id: &str, dest: &Path) -> Result<()>;
}

/// Build the store described by `config`. Relative local roots resolve
/// against `project_root`.
pub fn from_config(config: &Config, project_root: &Path) -> Result<Box<dyn RemoteStore>> {
    match &config.backend {
        RemoteBackend::Rclone { binary } => Ok(Box::new(RcloneRemote::new(
            binary,
            &config.remote_name,
            &config.transfer,
        ))),
        RemoteBackend::Local { .. } => {
            let root = local_root(config, project_root)?.unwrap_or_default();
            Ok(Box::new(LocalDirRemote::new(root)))
        }
    }
}

/// Resolved root of a local backend, or `None` for remote backends.
pub fn local_root(config: &Config, project_root: &Path) -> Result<Option<PathBuf>> {
    let RemoteBackend::Local { root } = &config.backend else {
        return Ok(None);
    };
    Ok(Some(resolve_under(project_root, io::expand_home(root)?)))
}

fn file_name_of(path: &Path) -> Result<String> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| BackupError::InvalidConfig(format!("no file name: {}", path.display())))
}

// ---------------------------------------------------------------------------
// LocalDirRemote
// ---------------------------------------------------------------------------

/// A directory on a locally mounted filesystem.
#[derive(Debug, Clone)]
pub struct LocalDirRemote {
    root: PathBuf,
}

impl LocalDirRemote {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve a remote id, refusing anything that climbs out of the root.
    fn resolve(&self, remote_id: &str) -> Result<PathBuf> {
        let rel = Path::new(remote_id);
        if rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(BackupError::NotFound(remote_id.to_string()));
        }
        Ok(self.root.join(rel))
    }
}

impl RemoteStore for LocalDirRemote {
    fn describe(&self, folder: &str) -> String {
        self.root.join(folder).display().to_string()
    }

    fn check(&self) -> Result<()> {
        if self.root.is_dir() {
            Ok(())
        } else {
            Err(BackupError::RemoteUnavailable(format!(
                "local backup root does not exist: {}",
                self.root.display()
            )))
        }
    }

    fn list(&self, folder: &str) -> Result<Vec<RemoteEntry>> {
        let dir = self.resolve(folder)?;
        if !dir.is_dir() {
            return Ok(vec![]);
        }
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            if !meta.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            entries.push(RemoteEntry {
                remote_id: paths::remote_id(folder, &name),
                name,
                size: meta.len(),
                modified: meta.modified().ok().map(DateTime::<Utc>::from),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn upload(&self, local: &Path, folder: &str) -> Result<String> {
        let name = file_name_of(local)?;
        let dir = self.resolve(folder)?;
        io::ensure_dir(&dir)?;

        // Land under a temp name, then rename: readers never see half a file.
        let mut src = std::fs::File::open(local)?;
        let mut tmp = NamedTempFile::new_in(&dir)?;
        std::io::copy(&mut src, &mut tmp)?;
        tmp.flush()?;
        tmp.as_file().sync_all()?;
        tmp.persist(dir.join(&name)).map_err(|e| e.error)?;

        Ok(paths::remote_id(folder, &name))
    }

    fn delete(&self, remote_id: &str) -> Result<()> {
        let path = self.resolve(remote_id)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BackupError::NotFound(remote_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn download(&self, remote_id: &str, dest: &Path) -> Result<()> {
        let path = self.resolve(remote_id)?;
        if !path.is_file() {
            return Err(BackupError::NotFound(remote_id.to_string()));
        }
        if let Some(parent) = dest.parent() {
            io::ensure_dir(parent)?;
        }
        std::fs::copy(&path, dest)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// RcloneRemote
// ---------------------------------------------------------------------------

/// Drives the `rclone` binary against a configured remote (`rclone config`).
#[derive(Debug, Clone)]
pub struct RcloneRemote {
    binary: String,
    remote: String,
    upload_timeout: Duration,
    list_timeout: Duration,
    delete_timeout: Duration,
}

/// Subset of an `rclone lsjson` item.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct LsJsonItem {
    name: String,
    #[serde(default)]
    size: i64,
    #[serde(default)]
    mod_time: Option<String>,
    #[serde(default)]
    is_dir: bool,
}

impl RcloneRemote {
    pub fn new(binary: &str, remote: &str, transfer: &TransferConfig) -> Self {
        Self {
            binary: binary.to_string(),
            remote: remote.trim_end_matches(':').to_string(),
            upload_timeout: Duration::from_secs(transfer.upload_timeout_secs),
            list_timeout: Duration::from_secs(transfer.list_timeout_secs),
            delete_timeout: Duration::from_secs(transfer.delete_timeout_secs),
        }
    }

    fn command(&self) -> Result<Command> {
        let bin = which::which(&self.binary).map_err(|_| {
            BackupError::RemoteUnavailable(format!(
                "'{}' not found on PATH; install rclone and run `rclone config`",
                self.binary
            ))
        })?;
        Ok(Command::new(bin))
    }

    fn target(&self, path: &str) -> String {
        format!("{}:{}", self.remote, path)
    }
}

/// Parse `rclone lsjson` output for `folder`, dropping directories.
fn parse_lsjson(stdout: &str, folder: &str) -> Result<Vec<RemoteEntry>> {
    let items: Vec<LsJsonItem> = serde_json::from_str(stdout.trim())?;
    let mut entries: Vec<RemoteEntry> = items
        .into_iter()
        .filter(|i| !i.is_dir)
        .map(|i| RemoteEntry {
            remote_id: paths::remote_id(folder, &i.name),
            size: i.size.max(0) as u64,
            modified: i
                .mod_time
                .as_deref()
                .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
                .map(|t| t.with_timezone(&Utc)),
            name: i.name,
        })
        .collect();
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

impl RemoteStore for RcloneRemote {
    fn describe(&self, folder: &str) -> String {
        self.target(folder)
    }

    fn check(&self) -> Result<()> {
        let mut cmd = self.command()?;
        cmd.arg("listremotes");
        let out = run_with_timeout(cmd, self.list_timeout)
            .map_err(|e| BackupError::RemoteUnavailable(e.to_string()))?;
        let wanted = format!("{}:", self.remote);
        if out.stdout.lines().any(|l| l.trim() == wanted) {
            tracing::debug!(remote = %self.remote, "rclone remote found");
            Ok(())
        } else {
            let available: Vec<&str> = out.stdout.lines().map(str::trim).collect();
            Err(BackupError::RemoteUnavailable(format!(
                "rclone remote '{}' is not configured (available: {}); run `rclone config`",
                self.remote,
                available.join(", ")
            )))
        }
    }

    fn list(&self, folder: &str) -> Result<Vec<RemoteEntry>> {
        let mut cmd = self.command()?;
        cmd.args(["lsjson", "--files-only", "--no-mimetype"])
            .arg(self.target(folder));
        match run_with_timeout(cmd, self.list_timeout) {
            Ok(out) => parse_lsjson(&out.stdout, folder),
            // First run against an empty remote: the folder is created by the upload.
            Err(BackupError::Command { stderr, .. })
                if stderr.contains("directory not found") =>
            {
                Ok(vec![])
            }
            Err(e) => Err(e),
        }
    }

    fn upload(&self, local: &Path, folder: &str) -> Result<String> {
        let name = file_name_of(local)?;
        let remote_id = paths::remote_id(folder, &name);
        let mut cmd = self.command()?;
        cmd.arg("copyto").arg(local).arg(self.target(&remote_id));
        run_with_timeout(cmd, self.upload_timeout)?;
        Ok(remote_id)
    }

    fn delete(&self, remote_id: &str) -> Result<()> {
        let mut cmd = self.command()?;
        cmd.arg("deletefile").arg(self.target(remote_id));
        match run_with_timeout(cmd, self.delete_timeout) {
            Ok(_) => Ok(()),
            Err(BackupError::Command { stderr, .. }) if stderr.contains("not found") => {
                Err(BackupError::NotFound(remote_id.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    fn download(&self, remote_id: &str, dest: &Path) -> Result<()> {
        if let Some(parent) = dest.parent() {
            io::ensure_dir(parent)?;
        }
        let mut cmd = self.command()?;
        cmd.arg("copyto").arg(self.target(remote_id)).arg(dest);
        run_with_timeout(cmd, self.upload_timeout)?;
        if !dest.is_file() {
            return Err(BackupError::NotFound(remote_id.to_string()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn local_roundtrip() {
        let remote_dir = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let remote = LocalDirRemote::new(remote_dir.path());
        remote.check().unwrap();

        assert!(remote.list("backups").unwrap().is_empty());

        let local = work.path().join("a_full_backup_2026-01-01_00-00-00.tar.gz");
        std::fs::write(&local, b"payload").unwrap();
        let id = remote.upload(&local, "backups").unwrap();
        assert_eq!(id, "backups/a_full_backup_2026-01-01_00-00-00.tar.gz");

        let listed = remote.list("backups").unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].size, 7);
        assert_eq!(listed[0].remote_id, id);
        assert!(listed[0].modified.is_some());

        let back = work.path().join("restore/copy.tar.gz");
        remote.download(&id, &back).unwrap();
        assert_eq!(std::fs::read(&back).unwrap(), b"payload");

        remote.delete(&id).unwrap();
        assert!(remote.list("backups").unwrap().is_empty());
    }

    #[test]
    fn local_missing_objects_are_not_found() {
        let remote_dir = TempDir::new().unwrap();
        let remote = LocalDirRemote::new(remote_dir.path());
        assert!(matches!(
            remote.delete("backups/nope.tar.gz").unwrap_err(),
            BackupError::NotFound(_)
        ));
        assert!(matches!(
            remote
                .download("backups/nope.tar.gz", &remote_dir.path().join("x"))
                .unwrap_err(),
            BackupError::NotFound(_)
        ));
    }

    #[test]
    fn local_rejects_escaping_ids() {
        let remote_dir = TempDir::new().unwrap();
        let remote = LocalDirRemote::new(remote_dir.path().join("store"));
        assert!(remote.delete("../outside.tar.gz").is_err());
    }

    #[test]
    fn local_check_requires_root() {
        let remote_dir = TempDir::new().unwrap();
        let remote = LocalDirRemote::new(remote_dir.path().join("unmounted"));
        assert!(matches!(
            remote.check().unwrap_err(),
            BackupError::RemoteUnavailable(_)
        ));
    }

    #[test]
    fn lsjson_parsing_skips_dirs() {
        let json = r#"[
            {"Path":"old","Name":"old","Size":-1,"ModTime":"2026-02-01T03:00:00Z","IsDir":true},
            {"Path":"b_full_backup_2026-02-06_03-00-00.tar.gz","Name":"b_full_backup_2026-02-06_03-00-00.tar.gz","Size":2048,"ModTime":"2026-02-06T03:00:05.123+03:00","IsDir":false},
            {"Path":"a_db_backup_2026-02-05_03-00-00.tar.gz","Name":"a_db_backup_2026-02-05_03-00-00.tar.gz","Size":10,"ModTime":"2026-02-05T03:00:00Z","IsDir":false}
        ]"#;
        let entries = parse_lsjson(json, "backups").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "a_db_backup_2026-02-05_03-00-00.tar.gz");
        assert_eq!(entries[1].size, 2048);
        assert_eq!(
            entries[1].remote_id,
            "backups/b_full_backup_2026-02-06_03-00-00.tar.gz"
        );
        assert!(entries[1].modified.is_some());
    }

    #[test]
    fn rclone_missing_binary_is_unavailable() {
        let remote = RcloneRemote::new(
            "rclone-binary-that-does-not-exist",
            "gdrive",
            &TransferConfig::default(),
        );
        assert!(matches!(
            remote.check().unwrap_err(),
            BackupError::RemoteUnavailable(_)
        ));
    }

    #[cfg(unix)]
    #[test]
    fn rclone_check_requires_configured_remote() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let fake = dir.path().join("fake-rclone");
        std::fs::write(&fake, "#!/bin/sh\necho 'onedrive:'\necho 'gdrive:'\n").unwrap();
        std::fs::set_permissions(&fake, std::fs::Permissions::from_mode(0o755)).unwrap();
        let bin = fake.to_string_lossy().into_owned();

        let ok = RcloneRemote::new(&bin, "gdrive:", &TransferConfig::default());
        ok.check().unwrap();

        let missing = RcloneRemote::new(&bin, "s3", &TransferConfig::default());
        let err = missing.check().unwrap_err();
        assert!(err.to_string().contains("'s3' is not configured"));
    }
}
