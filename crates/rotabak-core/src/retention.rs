use crate::archive::ArchiveName;
use crate::remote::RemoteEntry;
use crate::types::Scope;
use serde::Serialize;

/// Which archives of one scope survive and which get deleted.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct RetentionPlan {
    /// Newest first.
    pub keep: Vec<RemoteEntry>,
    /// Newest first; deletion order does not matter.
    pub prune: Vec<RemoteEntry>,
}

/// Keep the `max_backups` newest archives of `prefix`/`scope` by embedded
/// timestamp. Entries that are not our archives, or belong to another
/// prefix or scope, are never touched. `protect` names an archive that must
/// survive regardless of ordering (the one this run just uploaded); it takes
/// one of the `max_backups` slots.
pub fn plan(
    entries: &[RemoteEntry],
    prefix: &str,
    scope: Scope,
    max_backups: usize,
    protect: Option<&str>,
) -> RetentionPlan {
    let mut ours: Vec<(ArchiveName, &RemoteEntry)> = entries
        .iter()
        .filter_map(|e| ArchiveName::parse(&e.name).map(|n| (n, e)))
        .filter(|(n, _)| n.prefix == prefix && n.scope == scope)
        .collect();
    ours.sort_by(|(a, ea), (b, eb)| b.stamp.cmp(&a.stamp).then_with(|| eb.name.cmp(&ea.name)));

    let is_protected = |e: &RemoteEntry| protect == Some(e.name.as_str());
    let mut slots = max_backups.max(1);
    if ours.iter().any(|(_, e)| is_protected(*e)) {
        slots -= 1;
    }

    let mut plan = RetentionPlan::default();
    for (_, entry) in ours {
        if is_protected(entry) {
            plan.keep.push(entry.clone());
        } else if slots > 0 {
            slots -= 1;
            plan.keep.push(entry.clone());
        } else {
            plan.prune.push(entry.clone());
        }
    }
    plan
}
