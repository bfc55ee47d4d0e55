use crate::error::{BackupError, Result};
use crate::io;
use crate::paths;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// RemoteBackend
// ---------------------------------------------------------------------------

/// How archives reach the remote store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RemoteBackend {
    /// Drive the `rclone` binary against the remote named by `remote_name`.
    Rclone {
        #[serde(default = "default_rclone_binary")]
        binary: String,
    },
    /// A plain directory (mounted share, second disk). `backup_folder` is
    /// created beneath `root`. Relative roots resolve against the project root.
    Local { root: PathBuf },
}

fn default_rclone_binary() -> String {
    "rclone".to_string()
}

impl Default for RemoteBackend {
    fn default() -> Self {
        RemoteBackend::Rclone {
            binary: default_rclone_binary(),
        }
    }
}

// ---------------------------------------------------------------------------
// TransferConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Total attempts per remote call, including the first.
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    /// Delay before the second attempt; doubles for each attempt after that.
    #[serde(default = "default_backoff_secs")]
    pub backoff_secs: u64,
    #[serde(default = "default_upload_timeout")]
    pub upload_timeout_secs: u64,
    #[serde(default = "default_list_timeout")]
    pub list_timeout_secs: u64,
    #[serde(default = "default_delete_timeout")]
    pub delete_timeout_secs: u64,
}

fn default_attempts() -> u32 {
    3
}

fn default_backoff_secs() -> u64 {
    2
}

fn default_upload_timeout() -> u64 {
    600
}

fn default_list_timeout() -> u64 {
    60
}

fn default_delete_timeout() -> u64 {
    30
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            backoff_secs: default_backoff_secs(),
            upload_timeout_secs: default_upload_timeout(),
            list_timeout_secs: default_list_timeout(),
            delete_timeout_secs: default_delete_timeout(),
        }
    }
}

// ---------------------------------------------------------------------------
// LockConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// A lock older than this is taken over even if its pid looks alive.
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,
}

fn default_stale_after() -> u64 {
    6 * 60 * 60
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: default_stale_after(),
        }
    }
}

// ---------------------------------------------------------------------------
// Config (top-level)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default = "default_remote_name")]
    pub remote_name: String,
    #[serde(default = "default_backup_folder")]
    pub backup_folder: String,
    #[serde(default = "default_max_backups")]
    pub max_backups: usize,
    #[serde(default = "default_archive_prefix")]
    pub archive_prefix: String,
    #[serde(default = "default_database_file")]
    pub database_file: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub staging_dir: Option<PathBuf>,
    #[serde(default = "default_exclude")]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub backend: RemoteBackend,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub lock: LockConfig,
}

fn default_version() -> u32 {
    1
}

fn default_remote_name() -> String {
    "gdrive".to_string()
}

fn default_backup_folder() -> String {
    "backups".to_string()
}

fn default_max_backups() -> usize {
    7
}

fn default_archive_prefix() -> String {
    "backup".to_string()
}

fn default_database_file() -> PathBuf {
    PathBuf::from("data.db")
}

pub fn default_exclude() -> Vec<String> {
    [
        ".git",
        "__pycache__",
        "*.pyc",
        ".env",
        "*.log",
        "node_modules",
        ".venv",
        "venv",
        "*.tmp",
        "target",
        paths::LOCK_FILE,
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: default_version(),
            remote_name: default_remote_name(),
            backup_folder: default_backup_folder(),
            max_backups: default_max_backups(),
            archive_prefix: default_archive_prefix(),
            database_file: default_database_file(),
            staging_dir: None,
            exclude: default_exclude(),
            backend: RemoteBackend::default(),
            transfer: TransferConfig::default(),
            lock: LockConfig::default(),
        }
    }
}

impl Config {
    /// Load `.rotabak/config.yaml` under `root`. A missing file yields defaults.
    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::config_path(root);
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    /// Load an explicitly named config file, which must exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(BackupError::InvalidConfig(format!(
                "config file not found: {}",
                path.display()
            )));
        }
        let data = std::fs::read_to_string(path)?;
        let cfg: Config = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let path = paths::config_path(root);
        let data = serde_yaml::to_string(self)?;
        io::atomic_write(&path, data.as_bytes())
    }

    /// Directory archives are built in before upload. Relative paths
    /// resolve against the project root.
    pub fn staging_dir(&self, root: &Path) -> Result<PathBuf> {
        match &self.staging_dir {
            Some(dir) => Ok(resolve_under(root, io::expand_home(dir)?)),
            None => Ok(paths::default_staging_dir(&self.archive_prefix)),
        }
    }

    /// Absolute path of the database file for a project rooted at `root`.
    pub fn database_path(&self, root: &Path) -> Result<PathBuf> {
        Ok(resolve_under(root, io::expand_home(&self.database_file)?))
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();
        let mut error = |message: String| {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message,
            })
        };

        if self.max_backups == 0 {
            error("max_backups must be at least 1".to_string());
        }
        if self.transfer.attempts == 0 {
            error("transfer.attempts must be at least 1".to_string());
        }
        if self.backup_folder.trim().trim_matches('/').is_empty() {
            error("backup_folder must not be empty".to_string());
        }
        if let Err(e) = paths::validate_prefix(&self.archive_prefix) {
            error(e.to_string());
        }
        if let RemoteBackend::Rclone { binary } = &self.backend {
            if binary.trim().is_empty() {
                error("backend.binary must not be empty".to_string());
            }
            if self.remote_name.trim().is_empty() {
                error("remote_name must not be empty for the rclone backend".to_string());
            }
        }

        if self.max_backups > 365 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "max_backups={} keeps more than a year of daily archives",
                    self.max_backups
                ),
            });
        }
        if self.transfer.attempts > 10 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "transfer.attempts={} (>10 is unusual)",
                    self.transfer.attempts
                ),
            });
        }
        if !self.exclude.iter().any(|p| p == ".git") {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "exclude does not list .git; full archives will carry history".to_string(),
            });
        }

        warnings
    }

    /// Fail with the first error-level validation finding.
    pub fn ensure_valid(&self) -> Result<()> {
        match self
            .validate()
            .into_iter()
            .find(|w| w.level == WarnLevel::Error)
        {
            Some(w) => Err(BackupError::InvalidConfig(w.message)),
            None => Ok(()),
        }
    }
}

/// `path` as-is when absolute, else joined onto `root`.
pub(crate) fn resolve_under(root: &Path, path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        root.join(path)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
