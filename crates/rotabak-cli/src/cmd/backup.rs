use crate::output::print_json;
use anyhow::Context;
use clap::Args;
use rotabak_core::archive::format_size;
use rotabak_core::record::RunRecord;
use rotabak_core::types::{Outcome, Scope};
use rotabak_core::RunOptions;
use std::path::Path;

#[derive(Args, Debug, Clone, Copy)]
pub struct BackupArgs {
    /// Back up only the database file
    #[arg(long)]
    pub db_only: bool,

    /// Build and validate the archive, then report what would be uploaded and deleted
    #[arg(long)]
    pub dry_run: bool,

    /// Do not delete old archives from the remote
    #[arg(long)]
    pub no_cleanup: bool,

    /// Keep the local archive after a successful upload
    #[arg(long)]
    pub keep_local: bool,
}

impl BackupArgs {
    fn options(self) -> RunOptions {
        let scope = if self.db_only { Scope::DbOnly } else { Scope::Full };
        RunOptions {
            dry_run: self.dry_run,
            prune: !self.no_cleanup,
            keep_local: self.keep_local,
            ..RunOptions::new(scope)
        }
    }
}

pub fn run(
    root: &Path,
    config: Option<&Path>,
    args: BackupArgs,
    json: bool,
) -> anyhow::Result<()> {
    let manager = super::open_manager(root, config)?;
    let opts = args.options();
    let record = manager
        .run(opts)
        .with_context(|| format!("{} backup failed", opts.scope))?;

    if json {
        return print_json(&record);
    }
    print_summary(&record);
    Ok(())
}

fn print_summary(record: &RunRecord) {
    let prefix = if record.dry_run { "[dry-run] " } else { "" };
    let label = match record.outcome {
        Outcome::Success => "Backup complete",
        Outcome::Partial => "Backup complete with warnings",
        Outcome::Failure => "Backup failed",
    };
    println!("{prefix}{label}: {}", record.scope);

    if let Some(info) = &record.archive {
        println!(
            "  archive:  {} ({}, {} entries)",
            info.name,
            format_size(info.size_bytes),
            info.entries
        );
    }
    match &record.uploaded {
        Some(id) => println!("  uploaded: {id}"),
        None if record.dry_run => println!("  uploaded: skipped"),
        None => {}
    }
    let verb = if record.dry_run { "would delete" } else { "deleted" };
    if record.pruned.is_empty() {
        println!("  {verb}: nothing");
    }
    for name in &record.pruned {
        println!("  {verb}: {name}");
    }
    for w in &record.warnings {
        println!("  [warning] {}", w.message);
    }
}
