//! The backup run and restore operations.
//!
//! A run walks `Idle → Staging → Validated → Uploaded → Pruned → Done`.
//! Construction and upload failures are fatal and stop the walk at `Failed`;
//! pruning problems become warnings and the run still reaches `Done`. The
//! newest archive already on the remote is never at risk: pruning only runs
//! after the new archive has landed, and never deletes it.

use crate::archive::{self, ArchiveInfo, ArchiveName, ExcludeSet, Snapshot};
use crate::config::Config;
use crate::error::{BackupError, Result};
use crate::history::History;
use crate::io;
use crate::lock::RunLock;
use crate::paths;
use crate::record::{RunRecord, WarningKind};
use crate::remote::{self, RemoteEntry, RemoteStore};
use crate::retention;
use crate::retry::RetryPolicy;
use crate::types::{RunPhase, Scope};
use chrono::{Local, NaiveDateTime, Timelike};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Options / reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    pub scope: Scope,
    /// Stage and validate locally, touch nothing remote.
    pub dry_run: bool,
    /// Enforce the retention bound after a successful upload.
    pub prune: bool,
    /// Keep the staged archive after a successful upload.
    pub keep_local: bool,
}

impl RunOptions {
    pub fn new(scope: Scope) -> Self {
        Self {
            scope,
            dry_run: false,
            prune: true,
            keep_local: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreReport {
    pub archive: String,
    pub remote_id: String,
    pub downloaded_to: PathBuf,
    pub unpacked_to: PathBuf,
    pub entries: usize,
}

// ---------------------------------------------------------------------------
// BackupManager
// ---------------------------------------------------------------------------

type Clock = Box<dyn Fn() -> NaiveDateTime>;
type Validator = Box<dyn Fn(&Path, Option<usize>) -> Result<ArchiveInfo>>;

pub struct BackupManager {
    root: PathBuf,
    config: Config,
    remote: Box<dyn RemoteStore>,
    history: History,
    retry: RetryPolicy,
    clock: Clock,
    validator: Validator,
}

impl BackupManager {
    /// Manager for the project at `root`, with the remote built from `config`.
    pub fn new(root: &Path, config: Config) -> Result<Self> {
        let remote = remote::from_config(&config, root)?;
        Self::with_remote(root, config, remote)
    }

    pub fn with_remote(root: &Path, config: Config, remote: Box<dyn RemoteStore>) -> Result<Self> {
        config.ensure_valid()?;
        let retry = RetryPolicy::from_config(&config.transfer);
        Ok(Self {
            root: root.to_path_buf(),
            history: History::for_project(root),
            config,
            remote,
            retry,
            clock: Box::new(|| Local::now().naive_local()),
            validator: Box::new(archive::validate),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Replace the wall clock used for archive timestamps.
    pub fn with_clock(mut self, clock: impl Fn() -> NaiveDateTime + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    /// Replace the read-back check run on every freshly built archive.
    pub fn with_validator(
        mut self,
        validator: impl Fn(&Path, Option<usize>) -> Result<ArchiveInfo> + 'static,
    ) -> Self {
        self.validator = Box::new(validator);
        self
    }

    // -----------------------------------------------------------------------
    // run
    // -----------------------------------------------------------------------

    /// Execute one backup run under the project's run lock.
    ///
    /// Every run that gets the lock is appended to the history, failed or
    /// not. Lock contention returns before anything is written.
    pub fn run(&self, opts: RunOptions) -> Result<RunRecord> {
        let stale_after = Duration::from_secs(self.config.lock.stale_after_secs);
        let _lock = RunLock::acquire(&paths::lock_path(&self.root), stale_after)?;

        let mut record = RunRecord::new(opts.scope, opts.dry_run);
        tracing::info!(
            run = %record.id,
            scope = %opts.scope,
            dry_run = opts.dry_run,
            remote = %self.remote.describe(&self.config.backup_folder),
            "backup started"
        );

        let result = self.execute(&opts, &mut record);
        if let Err(e) = &result {
            record.fail(e);
            tracing::error!(run = %record.id, phase = ?record.phase, error = %e, "backup failed");
        }

        if let Err(e) = self.history.append(&record) {
            tracing::warn!(path = %self.history.path().display(), error = %e, "could not write run history");
        }

        result.map(|()| {
            tracing::info!(
                run = %record.id,
                outcome = %record.outcome,
                archive = record.archive_name.as_deref().unwrap_or(""),
                pruned = record.pruned.len(),
                warnings = record.warnings.len(),
                "backup finished"
            );
            record
        })
    }

    fn execute(&self, opts: &RunOptions, record: &mut RunRecord) -> Result<()> {
        let folder = self.config.backup_folder.as_str();

        if !opts.dry_run {
            self.remote.check()?;
        }

        record.advance(RunPhase::Staging)?;
        let name = self.next_name(opts.scope)?;
        record.archive_name = Some(name.file_name());

        let staging = self.config.staging_dir(&self.root)?;
        io::ensure_dir(&staging)?;
        let snapshot = self.select(opts.scope, &staging)?;
        tracing::info!(
            archive = %name,
            entries = snapshot.entries.len(),
            files = snapshot.file_count(),
            "creating archive"
        );
        let path = archive::build(&snapshot, &staging, &name)?;

        let info = match (self.validator)(&path, Some(snapshot.entries.len())) {
            Ok(info) => info,
            Err(e) => {
                if let Err(rm) = std::fs::remove_file(&path) {
                    tracing::warn!(
                        path = %path.display(),
                        error = %rm,
                        "could not remove archive that failed validation"
                    );
                }
                return Err(e);
            }
        };
        tracing::info!(
            path = %path.display(),
            size = %archive::format_size(info.size_bytes),
            "archive created"
        );
        record.archive = Some(info);
        record.advance(RunPhase::Validated)?;

        if opts.dry_run {
            tracing::info!(
                "[dry-run] would upload {} to {}",
                name,
                self.remote.describe(folder)
            );
            record.advance(RunPhase::Uploaded)?;
            if opts.prune {
                self.plan_dry_run_prune(&name, &path, record);
            }
            record.advance(RunPhase::Pruned)?;
            return record.complete();
        }

        tracing::info!(to = %self.remote.describe(folder), "uploading {name}");
        let remote_id = self
            .retry
            .run("upload", || self.remote.upload(&path, folder))?;
        tracing::info!(%remote_id, "upload complete");
        record.uploaded = Some(remote_id);
        record.advance(RunPhase::Uploaded)?;

        if !opts.keep_local {
            match std::fs::remove_file(&path) {
                Ok(()) => tracing::debug!(path = %path.display(), "staged archive removed"),
                Err(e) => record.warn(
                    WarningKind::Cleanup,
                    format!("could not remove staged archive {}: {e}", path.display()),
                ),
            }
        }

        if opts.prune {
            self.prune(&name, record);
        }
        record.advance(RunPhase::Pruned)?;
        record.complete()
    }

    /// Timestamp for the next archive: now, but strictly after the last
    /// recorded archive of this scope.
    fn next_name(&self, scope: Scope) -> Result<ArchiveName> {
        let now = (self.clock)();
        let mut stamp = now.with_nanosecond(0).unwrap_or(now);
        if let Some(last) = self.history.last_stamp(scope)? {
            if stamp <= last {
                stamp = last + chrono::Duration::seconds(1);
                tracing::debug!(%stamp, "clock not past last archive, bumping timestamp");
            }
        }
        Ok(ArchiveName::new(&self.config.archive_prefix, scope, stamp))
    }

    fn select(&self, scope: Scope, staging: &Path) -> Result<Snapshot> {
        match scope {
            Scope::Full => {
                let exclude = ExcludeSet::new(&self.config.exclude)?;
                let mut skip = vec![staging.to_path_buf(), paths::lock_path(&self.root)];
                if let Some(local) = remote::local_root(&self.config, &self.root)? {
                    skip.push(local);
                }
                archive::select_tree(&self.root, &exclude, &skip)
            }
            Scope::DbOnly => {
                let db = self.config.database_path(&self.root)?;
                archive::select_file(&self.root, &db)
            }
        }
    }

    /// Delete archives beyond the retention bound. Failures are recorded
    /// and skipped; nothing here fails the run.
    fn prune(&self, name: &ArchiveName, record: &mut RunRecord) {
        let folder = self.config.backup_folder.as_str();
        tracing::info!(limit = self.config.max_backups, "checking old archives");

        let entries = match self.retry.run("list", || self.remote.list(folder)) {
            Ok(entries) => entries,
            Err(e) => {
                record.warn(
                    WarningKind::List,
                    format!("could not list remote archives, skipping prune: {e}"),
                );
                return;
            }
        };

        let plan = retention::plan(
            &entries,
            &self.config.archive_prefix,
            name.scope,
            self.config.max_backups,
            Some(&name.file_name()),
        );
        if plan.prune.is_empty() {
            tracing::info!(kept = plan.keep.len(), "nothing to prune");
            return;
        }

        for entry in &plan.prune {
            match self.retry.run("delete", || self.remote.delete(&entry.remote_id)) {
                Ok(()) => {
                    tracing::info!(archive = %entry.name, "deleted old archive");
                    record.pruned.push(entry.name.clone());
                }
                Err(BackupError::NotFound(_)) => {
                    tracing::debug!(archive = %entry.name, "old archive already gone");
                    record.pruned.push(entry.name.clone());
                }
                Err(e) => record.warn(
                    WarningKind::Prune,
                    format!("failed to delete {}: {e}", entry.name),
                ),
            }
        }
    }

    /// Work out what a real run would delete, counting the staged archive as
    /// if it had been uploaded. Read-only against the remote.
    fn plan_dry_run_prune(&self, name: &ArchiveName, staged: &Path, record: &mut RunRecord) {
        let folder = self.config.backup_folder.as_str();
        let mut entries = match self.retry.run("list", || self.remote.list(folder)) {
            Ok(entries) => entries,
            Err(e) => {
                record.warn(
                    WarningKind::List,
                    format!("could not list remote archives, prune plan unknown: {e}"),
                );
                return;
            }
        };

        let file_name = name.file_name();
        if !entries.iter().any(|e| e.name == file_name) {
            entries.push(RemoteEntry {
                remote_id: paths::remote_id(folder, &file_name),
                size: std::fs::metadata(staged).map(|m| m.len()).unwrap_or(0),
                modified: None,
                name: file_name.clone(),
            });
        }

        let plan = retention::plan(
            &entries,
            &self.config.archive_prefix,
            name.scope,
            self.config.max_backups,
            Some(&file_name),
        );
        for entry in &plan.prune {
            tracing::info!("[dry-run] would delete {}", entry.name);
            record.pruned.push(entry.name.clone());
        }
    }

    // -----------------------------------------------------------------------
    // restore / list / history
    // -----------------------------------------------------------------------

    /// Fetch `archive_name` into `destination` and unpack it beside the
    /// download in `destination/<stem>/`. The live project is never touched.
    /// A missing archive, or a name that is not one of ours, fails before
    /// anything is created locally.
    pub fn restore(&self, archive_name: &str, destination: &Path) -> Result<RestoreReport> {
        let folder = self.config.backup_folder.as_str();
        let parsed = ArchiveName::parse(archive_name)
            .filter(|_| !archive_name.contains(['/', '\\']))
            .ok_or_else(|| BackupError::NotFound(archive_name.to_string()))?;

        let entries = self.retry.run("list", || self.remote.list(folder))?;
        let entry = entries
            .into_iter()
            .find(|e| e.name == archive_name)
            .ok_or_else(|| BackupError::NotFound(archive_name.to_string()))?;

        let unpack_dir = destination.join(parsed.stem());
        if unpack_dir.exists() {
            return Err(BackupError::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("restore target already exists: {}", unpack_dir.display()),
            )));
        }

        io::ensure_dir(destination)?;
        let local = destination.join(&entry.name);
        tracing::info!(archive = %entry.name, to = %local.display(), "downloading archive");
        self.retry
            .run("download", || self.remote.download(&entry.remote_id, &local))?;

        archive::validate(&local, None)?;
        let entries = archive::unpack(&local, &unpack_dir)?;
        tracing::info!(to = %unpack_dir.display(), entries, "archive unpacked");

        Ok(RestoreReport {
            archive: entry.name,
            remote_id: entry.remote_id,
            downloaded_to: local,
            unpacked_to: unpack_dir,
            entries,
        })
    }

    /// Remote archives of this project, newest first, optionally for one scope.
    pub fn list(&self, scope: Option<Scope>) -> Result<Vec<(ArchiveName, RemoteEntry)>> {
        let folder = self.config.backup_folder.as_str();
        let entries = self.retry.run("list", || self.remote.list(folder))?;
        let mut ours: Vec<(ArchiveName, RemoteEntry)> = entries
            .into_iter()
            .filter_map(|e| ArchiveName::parse(&e.name).map(|n| (n, e)))
            .filter(|(n, _)| n.prefix == self.config.archive_prefix)
            .filter(|(n, _)| scope.is_none_or(|s| n.scope == s))
            .collect();
        ours.sort_by(|(a, _), (b, _)| b.stamp.cmp(&a.stamp));
        Ok(ours)
    }

    pub fn recent_runs(&self, limit: usize) -> Result<Vec<RunRecord>> {
        self.history.recent(limit)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
