pub mod backup;
pub mod config;
pub mod history;
pub mod list;
pub mod restore;

use anyhow::Context;
use rotabak_core::config::Config;
use rotabak_core::BackupManager;
use std::path::Path;

/// Effective config: the `--config` file when given, else the project's own.
pub fn load_config(root: &Path, explicit: Option<&Path>) -> anyhow::Result<Config> {
    match explicit {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => Config::load(root).context("failed to load config"),
    }
}

pub fn open_manager(root: &Path, explicit: Option<&Path>) -> anyhow::Result<BackupManager> {
    let config = load_config(root, explicit)?;
    BackupManager::new(root, config).context("failed to set up backup")
}
