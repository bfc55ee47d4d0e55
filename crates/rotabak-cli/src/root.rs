use rotabak_core::paths::ROTABAK_DIR;
use std::path::{Path, PathBuf};

/// Resolve the project root to back up.
///
/// Priority:
/// 1. `--root` flag / `ROTABAK_ROOT` env var (passed in as `explicit`)
/// 2. Nearest ancestor of the cwd holding `.rotabak/`
/// 3. Nearest ancestor of the cwd holding `.git/`
/// 4. The cwd itself
pub fn resolve_root(explicit: Option<&Path>) -> PathBuf {
    if let Some(p) = explicit {
        return p.to_path_buf();
    }
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    find_upward(&cwd, ROTABAK_DIR)
        .or_else(|| find_upward(&cwd, ".git"))
        .unwrap_or(cwd)
}

fn find_upward(start: &Path, marker: &str) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| dir.join(marker).is_dir())
        .map(Path::to_path_buf)
}
