pub mod archive;
pub mod config;
pub mod error;
pub mod exec;
pub mod history;
pub mod io;
pub mod lock;
pub mod manager;
pub mod paths;
pub mod record;
pub mod remote;
pub mod retention;
pub mod retry;
pub mod types;

pub use error::{BackupError, Result};
pub use manager::{BackupManager, RestoreReport, RunOptions};
