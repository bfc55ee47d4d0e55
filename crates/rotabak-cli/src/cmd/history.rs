use crate::output::{print_json, print_table};
use anyhow::Context;
use rotabak_core::history::History;
use std::path::Path;

pub fn run(root: &Path, limit: usize, json: bool) -> anyhow::Result<()> {
    let history = History::for_project(root);
    let records = history
        .recent(limit)
        .with_context(|| format!("failed to read {}", history.path().display()))?;

    if json {
        return print_json(&records);
    }
    if records.is_empty() {
        println!("No runs recorded.");
        return Ok(());
    }

    let rows = records
        .into_iter()
        .map(|r| {
            vec![
                r.started_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                r.mode.to_string(),
                r.outcome.to_string(),
                r.archive_name.unwrap_or_else(|| "-".to_string()),
                r.pruned.len().to_string(),
                r.error
                    .or_else(|| r.warnings.first().map(|w| w.message.clone()))
                    .unwrap_or_default(),
            ]
        })
        .collect();
    print_table(
        &["STARTED", "MODE", "OUTCOME", "ARCHIVE", "PRUNED", "NOTE"],
        rows,
    );
    Ok(())
}
