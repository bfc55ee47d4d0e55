//! Archive naming, snapshot selection, and tar.gz construction.
//!
//! Names follow `<prefix>_<tag>_backup_<YYYY-MM-DD_HH-MM-SS>.tar.gz`, e.g.
//! `ozon_full_backup_2026-02-06_03-00-00.tar.gz`. The embedded timestamp is
//! the only ordering key retention uses.

use crate::error::{BackupError, Result};
use crate::io;
use crate::paths::ARCHIVE_EXT;
use crate::types::Scope;
use chrono::{NaiveDateTime, Timelike};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;
use tempfile::NamedTempFile;
use walkdir::WalkDir;

pub const STAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

// ---------------------------------------------------------------------------
// ArchiveName
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArchiveName {
    pub prefix: String,
    pub scope: Scope,
    pub stamp: NaiveDateTime,
}

static NAME_RE: OnceLock<Regex> = OnceLock::new();

fn name_re() -> &'static Regex {
    NAME_RE.get_or_init(|| {
        Regex::new(
            r"^(?P<prefix>.+)_(?P<tag>full|db)_backup_(?P<stamp>\d{4}-\d{2}-\d{2}_\d{2}-\d{2}-\d{2})\.tar\.gz$",
        )
        .unwrap()
    })
}

impl ArchiveName {
    pub fn new(prefix: impl Into<String>, scope: Scope, stamp: NaiveDateTime) -> Self {
        // Names carry second resolution only.
        let stamp = stamp.with_nanosecond(0).unwrap_or(stamp);
        Self {
            prefix: prefix.into(),
            scope,
            stamp,
        }
    }

    /// Parse a remote file name. Anything that is not one of our archives
    /// yields `None`.
    pub fn parse(file_name: &str) -> Option<Self> {
        let caps = name_re().captures(file_name)?;
        let scope = Scope::from_tag(&caps["tag"])?;
        let stamp = NaiveDateTime::parse_from_str(&caps["stamp"], STAMP_FORMAT).ok()?;
        Some(Self {
            prefix: caps["prefix"].to_string(),
            scope,
            stamp,
        })
    }

    pub fn file_name(&self) -> String {
        format!(
            "{}_{}_backup_{}{ARCHIVE_EXT}",
            self.prefix,
            self.scope.tag(),
            self.stamp.format(STAMP_FORMAT)
        )
    }

    /// File name without the `.tar.gz` extension; used as the unpack directory.
    pub fn stem(&self) -> String {
        let name = self.file_name();
        name.trim_end_matches(ARCHIVE_EXT).to_string()
    }
}

impl fmt::Display for ArchiveName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.file_name())
    }
}

// ---------------------------------------------------------------------------
// Exclude patterns
// ---------------------------------------------------------------------------

/// Compiled exclude list with tar-like semantics: a pattern without `/`
/// matches any single path component (`*.pyc`, `node_modules`); a pattern
/// with `/` matches the whole root-relative path (`.rotabak/run.lock`).
#[derive(Debug, Clone)]
pub struct ExcludeSet {
    component: Vec<Regex>,
    anchored: Vec<Regex>,
}

impl ExcludeSet {
    pub fn new(patterns: &[String]) -> Result<Self> {
        let mut component = Vec::new();
        let mut anchored = Vec::new();
        for pattern in patterns {
            let trimmed = pattern.trim().trim_start_matches("./").trim_end_matches('/');
            if trimmed.is_empty() {
                continue;
            }
            let re = Regex::new(&glob_to_regex(trimmed)).map_err(|e| {
                BackupError::InvalidConfig(format!("bad exclude pattern '{pattern}': {e}"))
            })?;
            if trimmed.contains('/') {
                anchored.push(re);
            } else {
                component.push(re);
            }
        }
        Ok(Self {
            component,
            anchored,
        })
    }

    /// `rel` is relative to the snapshot root.
    pub fn is_excluded(&self, rel: &Path) -> bool {
        let rel_str = to_slash(rel);
        if self.anchored.iter().any(|re| re.is_match(&rel_str)) {
            return true;
        }
        rel.components().any(|c| match c {
            Component::Normal(name) => {
                let name = name.to_string_lossy();
                self.component.iter().any(|re| re.is_match(&name))
            }
            _ => false,
        })
    }
}

fn glob_to_regex(glob: &str) -> String {
    let mut out = String::from("^");
    for ch in glob.chars() {
        match ch {
            '*' => out.push_str("[^/]*"),
            '?' => out.push_str("[^/]"),
            c => out.push_str(&regex::escape(&c.to_string())),
        }
    }
    out.push('$');
    out
}

fn to_slash(path: &Path) -> String {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

// ---------------------------------------------------------------------------
// Snapshot selection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    Dir,
    File,
    Symlink,
}

#[derive(Debug, Clone)]
pub struct SourceEntry {
    /// Path stored in the archive.
    pub rel: PathBuf,
    pub abs: PathBuf,
    pub kind: EntryKind,
}

/// The set of local paths a run will archive.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub root: PathBuf,
    pub entries: Vec<SourceEntry>,
}

impl Snapshot {
    pub fn file_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.kind != EntryKind::Dir)
            .count()
    }
}

/// Walk `root` and collect everything not excluded. Paths in `skip` (the
/// staging directory, the lock file) are left out regardless of patterns.
pub fn select_tree(root: &Path, exclude: &ExcludeSet, skip: &[PathBuf]) -> Result<Snapshot> {
    if !root.is_dir() {
        return Err(BackupError::SourceUnavailable {
            path: root.to_path_buf(),
            reason: "project directory does not exist".to_string(),
        });
    }

    // Skip paths compare in canonical form.
    let canonical_root = root.canonicalize()?;
    let skip: Vec<PathBuf> = skip
        .iter()
        .map(|s| s.canonicalize().unwrap_or_else(|_| s.clone()))
        .collect();

    let mut entries = Vec::new();
    let walker = WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            let rel = e.path().strip_prefix(root).unwrap_or(e.path());
            !exclude.is_excluded(rel)
                && !skip.iter().any(|s| canonical_root.join(rel).starts_with(s))
        });

    for entry in walker {
        let entry = entry.map_err(|e| BackupError::SourceUnavailable {
            path: e.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf()),
            reason: e.to_string(),
        })?;
        let ft = entry.file_type();
        let kind = if ft.is_dir() {
            EntryKind::Dir
        } else if ft.is_file() {
            EntryKind::File
        } else if ft.is_symlink() {
            EntryKind::Symlink
        } else {
            tracing::debug!(path = %entry.path().display(), "skipping special file");
            continue;
        };
        let rel = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .to_path_buf();
        entries.push(SourceEntry {
            rel,
            abs: entry.path().to_path_buf(),
            kind,
        });
    }

    if entries.is_empty() {
        return Err(BackupError::SourceUnavailable {
            path: root.to_path_buf(),
            reason: "nothing to archive after exclusions".to_string(),
        });
    }

    Ok(Snapshot {
        root: root.to_path_buf(),
        entries,
    })
}

/// Select a single file (the database). It must exist and be readable.
pub fn select_file(root: &Path, file: &Path) -> Result<Snapshot> {
    let unavailable = |reason: String| BackupError::SourceUnavailable {
        path: file.to_path_buf(),
        reason,
    };
    let meta = std::fs::metadata(file).map_err(|e| unavailable(e.to_string()))?;
    if !meta.is_file() {
        return Err(unavailable("not a regular file".to_string()));
    }
    File::open(file).map_err(|e| unavailable(e.to_string()))?;

    let rel = match file.strip_prefix(root) {
        Ok(rel) => rel.to_path_buf(),
        Err(_) => PathBuf::from(file.file_name().ok_or_else(|| unavailable("no file name".to_string()))?),
    };
    Ok(Snapshot {
        root: root.to_path_buf(),
        entries: vec![SourceEntry {
            rel,
            abs: file.to_path_buf(),
            kind: EntryKind::File,
        }],
    })
}

// ---------------------------------------------------------------------------
// Build / validate / unpack
// ---------------------------------------------------------------------------

/// A staged archive that passed validation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArchiveInfo {
    pub name: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub entries: usize,
}

/// Write `snapshot` as a gzip-compressed tar named `name` in `staging_dir`.
///
/// The archive is assembled in a temp file and renamed into place only once
/// the gzip stream is finished, so a failure never leaves a partial
/// `*.tar.gz` behind.
pub fn build(snapshot: &Snapshot, staging_dir: &Path, name: &ArchiveName) -> Result<PathBuf> {
    io::ensure_dir(staging_dir)?;
    let dest = staging_dir.join(name.file_name());

    let tmp = NamedTempFile::new_in(staging_dir)?;
    let encoder = GzEncoder::new(tmp, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);

    for entry in &snapshot.entries {
        let appended = match entry.kind {
            EntryKind::Dir => builder.append_dir(&entry.rel, &entry.abs),
            EntryKind::File | EntryKind::Symlink => {
                builder.append_path_with_name(&entry.abs, &entry.rel)
            }
        };
        appended.map_err(|e| BackupError::SourceUnavailable {
            path: entry.abs.clone(),
            reason: e.to_string(),
        })?;
    }

    let tmp = builder.into_inner()?.finish()?;
    tmp.as_file().sync_all()?;
    tmp.persist(&dest).map_err(|e| e.error)?;
    Ok(dest)
}

/// Read the archive back end to end. Every entry is decompressed, so a
/// truncated or bit-flipped gzip stream fails here rather than on restore.
pub fn validate(path: &Path, expected_entries: Option<usize>) -> Result<ArchiveInfo> {
    let corrupt = |reason: String| BackupError::ArchiveCorrupt {
        path: path.to_path_buf(),
        reason,
    };

    let size_bytes = std::fs::metadata(path)
        .map_err(|e| corrupt(e.to_string()))?
        .len();
    if size_bytes == 0 {
        return Err(corrupt("archive is empty".to_string()));
    }

    let file = File::open(path).map_err(|e| corrupt(e.to_string()))?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    let mut entries = 0usize;
    for entry in archive.entries().map_err(|e| corrupt(e.to_string()))? {
        let mut entry = entry.map_err(|e| corrupt(e.to_string()))?;
        std::io::copy(&mut entry, &mut std::io::sink()).map_err(|e| corrupt(e.to_string()))?;
        entries += 1;
    }

    if entries == 0 {
        return Err(corrupt("archive contains no entries".to_string()));
    }
    if let Some(expected) = expected_entries {
        if entries != expected {
            return Err(corrupt(format!(
                "expected {expected} entries, read back {entries}"
            )));
        }
    }

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(ArchiveInfo {
        name,
        path: path.to_path_buf(),
        size_bytes,
        entries,
    })
}

/// Extract `archive` into `dest`. Entries that would escape `dest` are
/// skipped. Returns the number of entries written.
pub fn unpack(archive: &Path, dest: &Path) -> Result<usize> {
    io::ensure_dir(dest)?;
    let file = File::open(archive)?;
    let mut tar = tar::Archive::new(GzDecoder::new(file));
    let mut written = 0usize;
    for entry in tar.entries()? {
        let mut entry = entry?;
        if entry.unpack_in(dest)? {
            written += 1;
        } else {
            tracing::warn!(path = ?entry.path().ok(), "skipping archive entry outside destination");
        }
    }
    Ok(written)
}

/// Megabytes with two decimals, for log lines.
pub fn format_size(bytes: u64) -> String {
    format!("{:.2} MB", bytes as f64 / (1024.0 * 1024.0))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use tempfile::TempDir;

    fn stamp(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 2, 6)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    fn project() -> TempDir {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("src")).unwrap();
        std::fs::create_dir_all(root.join(".git/objects")).unwrap();
        std::fs::create_dir_all(root.join("pkg/__pycache__")).unwrap();
        std::fs::write(root.join("src/app.py"), "print('hi')\n").unwrap();
        std::fs::write(root.join("src/app.pyc"), [0u8; 8]).unwrap();
        std::fs::write(root.join("pkg/__pycache__/x.pyc"), [0u8; 8]).unwrap();
        std::fs::write(root.join(".git/HEAD"), "ref: refs/heads/main\n").unwrap();
        std::fs::write(root.join(".env"), "SECRET=1\n").unwrap();
        std::fs::write(root.join("data.db"), b"SQLite format 3\0").unwrap();
        dir
    }

    fn excludes() -> ExcludeSet {
        ExcludeSet::new(&crate::config::default_exclude()).unwrap()
    }

    #[test]
    fn name_format_and_parse() {
        let name = ArchiveName::new("ozon", Scope::Full, stamp(3, 0, 0));
        assert_eq!(name.file_name(), "ozon_full_backup_2026-02-06_03-00-00.tar.gz");
        assert_eq!(name.stem(), "ozon_full_backup_2026-02-06_03-00-00");
        assert_eq!(ArchiveName::parse(&name.file_name()), Some(name));

        let db = ArchiveName::parse("my_app_db_backup_2026-02-07_23-59-01.tar.gz").unwrap();
        assert_eq!(db.prefix, "my_app");
        assert_eq!(db.scope, Scope::DbOnly);
        assert_eq!(db.stamp, NaiveDate::from_ymd_opt(2026, 2, 7).unwrap().and_hms_opt(23, 59, 1).unwrap());
    }

    #[test]
    fn foreign_names_do_not_parse() {
        for name in [
            "notes.txt",
            "ozon_full_backup_2026-02-06.tar.gz",
            "ozon_weekly_backup_2026-02-06_03-00-00.tar.gz",
            "ozon_full_backup_2026-13-40_03-00-00.tar.gz",
            "ozon_full_backup_2026-02-06_03-00-00.zip",
        ] {
            assert!(ArchiveName::parse(name).is_none(), "parsed: {name}");
        }
    }

    #[test]
    fn exclude_matches_components_and_anchored_paths() {
        let set = ExcludeSet::new(&[
            "*.pyc".to_string(),
            "node_modules".to_string(),
            ".rotabak/run.lock".to_string(),
        ])
        .unwrap();
        assert!(set.is_excluded(Path::new("a/b/c.pyc")));
        assert!(set.is_excluded(Path::new("web/node_modules/x/index.js")));
        assert!(set.is_excluded(Path::new(".rotabak/run.lock")));
        assert!(!set.is_excluded(Path::new(".rotabak/config.yaml")));
        assert!(!set.is_excluded(Path::new("src/pyc.rs")));
        assert!(!set.is_excluded(Path::new("other/.rotabak/run.lock")));
    }

    #[test]
    fn select_tree_honours_excludes() {
        let dir = project();
        let snap = select_tree(dir.path(), &excludes(), &[]).unwrap();
        let rels: Vec<String> = snap.entries.iter().map(|e| to_slash(&e.rel)).collect();
        assert!(rels.contains(&"src/app.py".to_string()));
        assert!(rels.contains(&"data.db".to_string()));
        assert!(!rels.iter().any(|r| r.starts_with(".git")));
        assert!(!rels.iter().any(|r| r.ends_with(".pyc")));
        assert!(!rels.iter().any(|r| r.contains("__pycache__")));
        assert!(!rels.contains(&".env".to_string()));
    }

    #[test]
    fn select_tree_skips_explicit_paths() {
        let dir = project();
        let staging = dir.path().join("staging");
        std::fs::create_dir_all(&staging).unwrap();
        std::fs::write(staging.join("old.tar.gz"), b"x").unwrap();
        let snap = select_tree(dir.path(), &excludes(), &[staging.clone()]).unwrap();
        assert!(!snap.entries.iter().any(|e| e.abs.starts_with(&staging)));
    }

    #[test]
    fn select_tree_skip_matches_other_spellings() {
        let dir = project();
        std::fs::create_dir_all(dir.path().join(".stage")).unwrap();
        std::fs::write(dir.path().join(".stage/old.tar.gz"), b"x").unwrap();
        let roundabout = dir.path().join("src/../.stage");
        let snap = select_tree(dir.path(), &excludes(), &[roundabout]).unwrap();
        assert!(!snap
            .entries
            .iter()
            .any(|e| e.rel.starts_with(".stage")));
    }

    #[test]
    fn select_tree_missing_root_is_unavailable() {
        let dir = TempDir::new().unwrap();
        let err = select_tree(&dir.path().join("gone"), &excludes(), &[]).unwrap_err();
        assert!(matches!(err, BackupError::SourceUnavailable { .. }));
    }

    #[test]
    fn select_file_requires_existing_file() {
        let dir = project();
        let snap = select_file(dir.path(), &dir.path().join("data.db")).unwrap();
        assert_eq!(snap.entries.len(), 1);
        assert_eq!(snap.entries[0].rel, PathBuf::from("data.db"));

        let err = select_file(dir.path(), &dir.path().join("missing.db")).unwrap_err();
        assert!(matches!(err, BackupError::SourceUnavailable { .. }));
        let err = select_file(dir.path(), &dir.path().join("src")).unwrap_err();
        assert!(matches!(err, BackupError::SourceUnavailable { .. }));
    }

    #[test]
    fn build_validate_unpack() {
        let dir = project();
        let staging = TempDir::new().unwrap();
        let snap = select_tree(dir.path(), &excludes(), &[]).unwrap();
        let name = ArchiveName::new("ozon", Scope::Full, stamp(3, 0, 0));

        let path = build(&snap, staging.path(), &name).unwrap();
        assert_eq!(path.file_name().unwrap().to_str().unwrap(), name.file_name());

        let info = validate(&path, Some(snap.entries.len())).unwrap();
        assert_eq!(info.entries, snap.entries.len());
        assert!(info.size_bytes > 0);

        // Only the finished archive is left in staging.
        let files: Vec<_> = std::fs::read_dir(staging.path()).unwrap().collect();
        assert_eq!(files.len(), 1);

        let out = TempDir::new().unwrap();
        let written = unpack(&path, out.path()).unwrap();
        assert_eq!(written, snap.entries.len());
        assert_eq!(
            std::fs::read_to_string(out.path().join("src/app.py")).unwrap(),
            "print('hi')\n"
        );
        assert!(!out.path().join(".env").exists());
    }

    #[test]
    fn validate_rejects_truncated_archive() {
        let dir = project();
        let staging = TempDir::new().unwrap();
        let snap = select_tree(dir.path(), &excludes(), &[]).unwrap();
        let name = ArchiveName::new("ozon", Scope::Full, stamp(3, 0, 0));
        let path = build(&snap, staging.path(), &name).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();
        let err = validate(&path, None).unwrap_err();
        assert!(matches!(err, BackupError::ArchiveCorrupt { .. }));
    }

    #[test]
    fn validate_rejects_empty_and_garbage_files() {
        let dir = TempDir::new().unwrap();
        let empty = dir.path().join("empty.tar.gz");
        std::fs::write(&empty, b"").unwrap();
        assert!(matches!(
            validate(&empty, None).unwrap_err(),
            BackupError::ArchiveCorrupt { .. }
        ));

        let garbage = dir.path().join("garbage.tar.gz");
        std::fs::write(&garbage, b"this is not gzip").unwrap();
        assert!(matches!(
            validate(&garbage, None).unwrap_err(),
            BackupError::ArchiveCorrupt { .. }
        ));
    }

    #[test]
    fn validate_checks_entry_count() {
        let dir = project();
        let staging = TempDir::new().unwrap();
        let snap = select_file(dir.path(), &dir.path().join("data.db")).unwrap();
        let name = ArchiveName::new("ozon", Scope::DbOnly, stamp(3, 0, 0));
        let path = build(&snap, staging.path(), &name).unwrap();
        assert!(validate(&path, Some(1)).is_ok());
        assert!(validate(&path, Some(2)).is_err());
    }

    #[test]
    fn format_size_in_megabytes() {
        assert_eq!(format_size(1024 * 1024 * 3 / 2), "1.50 MB");
    }
}
