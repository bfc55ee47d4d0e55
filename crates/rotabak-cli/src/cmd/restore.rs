use crate::output::print_json;
use anyhow::Context;
use std::path::Path;

pub fn run(
    root: &Path,
    config: Option<&Path>,
    name: &str,
    dest: &Path,
    json: bool,
) -> anyhow::Result<()> {
    let manager = super::open_manager(root, config)?;
    let report = manager
        .restore(name, dest)
        .with_context(|| format!("failed to restore '{name}'"))?;

    if json {
        return print_json(&report);
    }
    println!("Restored {}", report.archive);
    println!("  downloaded: {}", report.downloaded_to.display());
    println!(
        "  unpacked:   {} ({} entries)",
        report.unpacked_to.display(),
        report.entries
    );
    Ok(())
}
