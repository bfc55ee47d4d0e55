use crate::archive::ArchiveName;
use crate::error::Result;
use crate::io;
use crate::paths;
use crate::record::RunRecord;
use crate::types::Scope;
use chrono::NaiveDateTime;
use std::path::{Path, PathBuf};

/// Records kept when the log is compacted.
const DEFAULT_KEEP: usize = 1000;
/// File size past which an append triggers compaction.
const COMPACT_AFTER_BYTES: u64 = 1024 * 1024;

/// Append-only run log: one JSON [`RunRecord`] per line, compacted to the
/// newest `keep` records once the file grows past a size threshold.
#[derive(Debug, Clone)]
pub struct History {
    path: PathBuf,
    keep: usize,
    compact_after_bytes: u64,
}

impl History {
    pub fn for_project(root: &Path) -> Self {
        Self {
            path: paths::history_path(root),
            keep: DEFAULT_KEEP,
            compact_after_bytes: COMPACT_AFTER_BYTES,
        }
    }

    #[cfg(test)]
    fn with_limits(mut self, keep: usize, compact_after_bytes: u64) -> Self {
        self.keep = keep.max(1);
        self.compact_after_bytes = compact_after_bytes;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, record: &RunRecord) -> Result<()> {
        let line = serde_json::to_string(record)?;
        io::append_line(&self.path, &line)?;
        if std::fs::metadata(&self.path)?.len() > self.compact_after_bytes {
            self.compact()?;
        }
        Ok(())
    }

    /// Drop all but the newest `keep` records. Returns how many were dropped.
    pub fn compact(&self) -> Result<usize> {
        let records = self.load()?;
        let dropped = records.len().saturating_sub(self.keep);
        if dropped == 0 {
            return Ok(0);
        }
        let mut data = String::new();
        for record in &records[dropped..] {
            data.push_str(&serde_json::to_string(record)?);
            data.push('\n');
        }
        io::atomic_write(&self.path, data.as_bytes())?;
        tracing::debug!(path = %self.path.display(), dropped, "run history compacted");
        Ok(dropped)
    }

    /// All readable records, oldest first. Lines that fail to parse are
    /// skipped with a warning rather than poisoning the whole log.
    pub fn load(&self) -> Result<Vec<RunRecord>> {
        if !self.path.exists() {
            return Ok(vec![]);
        }
        let data = std::fs::read_to_string(&self.path)?;
        let mut records = Vec::new();
        for (i, line) in data.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<RunRecord>(line) {
                Ok(r) => records.push(r),
                Err(e) => tracing::warn!(
                    path = %self.path.display(),
                    line = i + 1,
                    error = %e,
                    "skipping unreadable history line"
                ),
            }
        }
        Ok(records)
    }

    /// The `limit` most recent records, newest first.
    pub fn recent(&self, limit: usize) -> Result<Vec<RunRecord>> {
        let mut records = self.load()?;
        records.reverse();
        records.truncate(limit);
        Ok(records)
    }

    /// Latest archive timestamp any recorded run used for `scope`.
    pub fn last_stamp(&self, scope: Scope) -> Result<Option<NaiveDateTime>> {
        Ok(self
            .load()?
            .iter()
            .filter(|r| r.scope == scope)
            .filter_map(|r| r.archive_name.as_deref())
            .filter_map(ArchiveName::parse)
            .map(|n| n.stamp)
            .max())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(scope: Scope, name: Option<&str>) -> RunRecord {
        let mut r = RunRecord::new(scope, false);
        r.archive_name = name.map(String::from);
        r
    }

    #[test]
    fn empty_history() {
        let dir = TempDir::new().unwrap();
        let history = History::for_project(dir.path());
        assert!(history.load().unwrap().is_empty());
        assert_eq!(history.last_stamp(Scope::Full).unwrap(), None);
    }

    #[test]
    fn append_and_recent() {
        let dir = TempDir::new().unwrap();
        let history = History::for_project(dir.path());
        let first = record(Scope::Full, None);
        let second = record(Scope::DbOnly, None);
        history.append(&first).unwrap();
        history.append(&second).unwrap();

        let recent = history.recent(1).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].id, second.id);
        assert_eq!(history.recent(10).unwrap().len(), 2);
    }

    #[test]
    fn corrupt_lines_are_skipped() {
        let dir = TempDir::new().unwrap();
        let history = History::for_project(dir.path());
        history.append(&record(Scope::Full, None)).unwrap();
        io::append_line(history.path(), "{not json").unwrap();
        history.append(&record(Scope::Full, None)).unwrap();
        assert_eq!(history.load().unwrap().len(), 2);
    }

    #[test]
    fn last_stamp_is_per_scope_max() {
        let dir = TempDir::new().unwrap();
        let history = History::for_project(dir.path());
        history
            .append(&record(Scope::Full, Some("p_full_backup_2026-02-06_03-00-00.tar.gz")))
            .unwrap();
        history
            .append(&record(Scope::Full, Some("p_full_backup_2026-02-05_03-00-00.tar.gz")))
            .unwrap();
        history
            .append(&record(Scope::DbOnly, Some("p_db_backup_2026-03-01_00-00-00.tar.gz")))
            .unwrap();

        let full = history.last_stamp(Scope::Full).unwrap().unwrap();
        assert_eq!(full.to_string(), "2026-02-06 03:00:00");
        let db = history.last_stamp(Scope::DbOnly).unwrap().unwrap();
        assert_eq!(db.to_string(), "2026-03-01 00:00:00");
    }

    #[test]
    fn append_compacts_past_threshold() {
        let dir = TempDir::new().unwrap();
        let history = History::for_project(dir.path()).with_limits(3, 1);
        let mut ids = Vec::new();
        for _ in 0..5 {
            let r = record(Scope::Full, None);
            ids.push(r.id);
            history.append(&r).unwrap();
        }
        let kept: Vec<_> = history.load().unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(kept, ids[2..].to_vec());
    }

    #[test]
    fn compact_under_limit_is_a_no_op() {
        let dir = TempDir::new().unwrap();
        let history = History::for_project(dir.path());
        history.append(&record(Scope::Full, None)).unwrap();
        assert_eq!(history.compact().unwrap(), 0);
        assert_eq!(history.load().unwrap().len(), 1);
    }
}
