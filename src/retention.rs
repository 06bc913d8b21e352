//! Retention planner: decides which snapshots a count limit would remove,
//! then excludes everything still pinned as a live incremental parent or an
//! open lock-journal entry.
//!
//! The iteration style (walk the snapshot set newest-to-oldest, carrying
//! state — here, the pinned set — across the loop rather than computing it
//! as a separate pass) follows `utils::find_backups_to_be_deleted`. The
//! bucketed duration policy itself has no counterpart here: this retention
//! model is count-plus-pin, not duration-bucketed.

use std::collections::BTreeSet;

/// Basenames the source endpoint must keep regardless of `retain_count`:
/// every basename with an outstanding lock, plus the live incremental
/// parent for each destination (the greatest basename in `SourceSet ∩
/// DestSet_D`).
pub fn pinned_source_snapshots<'a>(
    source_set: &BTreeSet<String>,
    destination_sets: impl IntoIterator<Item = &'a BTreeSet<String>>,
    locked_basenames: impl IntoIterator<Item = &'a str>,
) -> BTreeSet<String> {
    let mut pinned: BTreeSet<String> = locked_basenames.into_iter().map(str::to_string).collect();

    for dest_set in destination_sets {
        if let Some(parent) = source_set.intersection(dest_set).max() {
            pinned.insert(parent.clone());
        }
    }

    pinned
}

/// The single basename a destination must keep regardless of
/// `retain_destination_count`: its own most recent snapshot, so a future
/// run can always use it as an incremental parent.
pub fn pinned_destination_snapshot(destination_set: &BTreeSet<String>) -> Option<String> {
    destination_set.iter().next_back().cloned()
}

/// Basenames to delete from a snapshot set, given a retention count and a
/// set of basenames that must never be deleted: sort descending, keep the
/// first `retain_count` plus anything pinned, delete the rest. Returned in
/// ascending order, matching the deletion order.
///
/// `retain_count = None` or `Some(0)` keeps everything ("0 or omitted =
/// keep all").
pub fn snapshots_to_delete(
    snapshot_set: &BTreeSet<String>,
    retain_count: Option<usize>,
    pinned: &BTreeSet<String>,
) -> Vec<String> {
    let Some(retain_count) = retain_count.filter(|n| *n > 0) else {
        return Vec::new();
    };

    let mut to_delete: Vec<String> = snapshot_set
        .iter()
        .rev()
        .enumerate()
        .filter(|(index, basename)| *index >= retain_count && !pinned.contains(*basename))
        .map(|(_, basename)| basename.clone())
        .collect();

    debug_assert!(
        to_delete.iter().all(|b| !pinned.contains(b)),
        "retention planner must never select a pinned snapshot for deletion"
    );

    to_delete.sort();
    to_delete
}
