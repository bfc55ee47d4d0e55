use crate::error::{BackupError, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const ROTABAK_DIR: &str = ".rotabak";
pub const CONFIG_FILE: &str = ".rotabak/config.yaml";
pub const HISTORY_FILE: &str = ".rotabak/history.jsonl";
pub const LOCK_FILE: &str = ".rotabak/run.lock";

pub const ARCHIVE_EXT: &str = ".tar.gz";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

pub fn history_path(root: &Path) -> PathBuf {
    root.join(HISTORY_FILE)
}

pub fn lock_path(root: &Path) -> PathBuf {
    root.join(LOCK_FILE)
}

/// Staging directory used when the config does not name one.
pub fn default_staging_dir(prefix: &str) -> PathBuf {
    std::env::temp_dir().join(format!("rotabak_{prefix}"))
}

/// Remote id of an archive inside a folder (`folder/name`).
pub fn remote_id(folder: &str, name: &str) -> String {
    let folder = folder.trim_end_matches('/');
    if folder.is_empty() {
        name.to_string()
    } else {
        format!("{folder}/{name}")
    }
}

// ---------------------------------------------------------------------------
// Prefix validation
// ---------------------------------------------------------------------------

static PREFIX_RE: OnceLock<Regex> = OnceLock::new();

fn prefix_re() -> &'static Regex {
    PREFIX_RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*$").unwrap())
}

pub fn validate_prefix(prefix: &str) -> Result<()> {
    if prefix.is_empty() || prefix.len() > 64 || !prefix_re().is_match(prefix) {
        return Err(BackupError::InvalidConfig(format!(
            "archive_prefix '{prefix}' must be alphanumeric with '.', '_' or '-'"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
