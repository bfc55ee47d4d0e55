use crate::output::{print_json, print_table};
use anyhow::Context;
use rotabak_core::archive::format_size;
use rotabak_core::types::Scope;
use serde::Serialize;
use std::path::Path;

#[derive(Serialize)]
struct ListedArchive {
    name: String,
    remote_id: String,
    scope: Scope,
    stamp: String,
    size: u64,
}

pub fn scope_filter(db_only: bool, full: bool) -> Option<Scope> {
    match (db_only, full) {
        (true, _) => Some(Scope::DbOnly),
        (false, true) => Some(Scope::Full),
        (false, false) => None,
    }
}

pub fn run(
    root: &Path,
    config: Option<&Path>,
    scope: Option<Scope>,
    json: bool,
) -> anyhow::Result<()> {
    let manager = super::open_manager(root, config)?;
    let archives = manager
        .list(scope)
        .context("failed to list remote archives")?;

    if json {
        let items: Vec<ListedArchive> = archives
            .into_iter()
            .map(|(name, entry)| ListedArchive {
                stamp: name.stamp.format("%Y-%m-%d %H:%M:%S").to_string(),
                scope: name.scope,
                name: entry.name,
                remote_id: entry.remote_id,
                size: entry.size,
            })
            .collect();
        return print_json(&items);
    }

    if archives.is_empty() {
        println!("No archives.");
        return Ok(());
    }
    let rows = archives
        .into_iter()
        .map(|(name, entry)| {
            vec![
                entry.name,
                name.scope.to_string(),
                name.stamp.format("%Y-%m-%d %H:%M:%S").to_string(),
                format_size(entry.size),
            ]
        })
        .collect();
    print_table(&["NAME", "SCOPE", "TAKEN", "SIZE"], rows);
    Ok(())
}
