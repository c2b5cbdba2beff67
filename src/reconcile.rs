//! Reconciliation Passes (spec §4.7 / §2 component 9): after (or instead of)
//! replication, destroys destination snapshots/datasets absent from the filtered
//! source tree.
//!
//! Grounded on the teacher's `comm.rs`, whose `itertools::Itertools::group_by` over
//! tagged `(Side, &SnapshotEntry)` pairs is reused here (via `dataset::merge_by_guid`
//! plus the same `group_by` idiom) to coalesce contiguous runs of to-be-destroyed
//! snapshots into a single `zfs destroy ds@a%b` range command per run, instead of one
//! subprocess per snapshot — the teacher's stub `retention.rs` never implemented
//! this, so the grouping technique is carried over from `comm.rs` alone.
//!
//! Uses `merge_by_guid`'s `right_tagged` output specifically: it preserves the
//! destination's own createtxg-ascending order with each entry tagged by whether its
//! GUID is also present on `src`, which is both the correct source of each entry's
//! own name (never `src`'s) and the only ordering that makes a contiguous run of
//! destroy-candidates "contiguous" in the sense `zfs destroy ds@first%last` requires
//! (no kept snapshot silently swept up in between).

use std::time::Duration;

use itertools::Itertools;

use crate::command;
use crate::config::PropertyRule;
use crate::dataset::{merge_by_guid, Side, SnapshotEntry};
use crate::endpoint::Endpoint;
use crate::error::EngineError;
use crate::filter::FilterSpec;

/// Plans which destination snapshots to destroy: those present on the destination
/// but whose GUID does not appear anywhere in `src`, restricted to names selected by
/// `snapshot_filter` (spec §4.7: "`Sdst` ... matching snapshot filter").
///
/// Returns destroy commands already coalesced into contiguous-run ranges, in the
/// `zfs destroy ds@first%last` form for runs of 2+, or a plain `ds@name` for
/// singletons.
pub fn plan_missing_snapshot_destroys(dataset: &str, src: &[SnapshotEntry], dst: &[SnapshotEntry], snapshot_filter: &FilterSpec) -> Vec<String> {
    let (_, dst_tagged, _) = merge_by_guid(src, dst);

    // Walk destination-side entries in original (createtxg-ascending) order,
    // partitioning into runs of "destroy" vs. "keep" exactly like `comm.rs` groups
    // runs of LEFT/BOTH/RIGHT for display. A `Both` entry is never a destroy
    // candidate regardless of what the name filter would say about it — it still
    // exists on `src`, so it is not "missing" — and it must stay in this list (rather
    // than being dropped) so it keeps acting as a boundary between separate runs of
    // destroy candidates that happen to sit on either side of it.
    let dst_tagged: Vec<(bool, &SnapshotEntry)> = dst_tagged
        .into_iter()
        .map(|(side, entry)| {
            let destroy = side == Side::Right && snapshot_filter.selects(&entry.name);
            (destroy, entry)
        })
        .collect();

    let mut commands = Vec::new();
    for (destroy, group) in &dst_tagged.into_iter().group_by(|(destroy, _)| *destroy) {
        if !destroy {
            continue;
        }
        let names: Vec<&str> = group.map(|(_, entry)| entry.name.as_str()).collect();
        commands.push(range_command(dataset, &names));
    }
    commands
}

fn range_command(dataset: &str, names: &[&str]) -> String {
    match names {
        [] => String::new(),
        [only] => format!("{dataset}@{only}"),
        _ => format!("{dataset}@{}%{}", names[0], names[names.len() - 1]),
    }
}

/// Executes a planned destroy command (spec §4.7). `force_unmount` maps to `zfs
/// destroy -f`, matching the replicator's CONFLICT? resolution semantics.
pub fn destroy(endpoint: &Endpoint, range_spec: &str, force_unmount: bool, timeout: Duration) -> anyhow::Result<()> {
    let mut inner = vec!["zfs".to_string(), "destroy".to_string()];
    if force_unmount {
        inner.push("-f".to_string());
    }
    inner.push(range_spec.to_string());
    let argv = endpoint.build_argv(&inner, true);
    let captured = command::run(&argv, Some(timeout))?;
    if !captured.success() {
        return Err(EngineError::CommandFailed(crate::error::FailedCommand {
            argv,
            exit_code: captured.exit_code,
            stderr_tail: captured.stderr,
        })
        .into());
    }
    Ok(())
}

/// The reconciliation passes' third gate (spec §4.7): whether `dataset` matches any
/// configured `--exclude-dataset-property` rule and should therefore be left alone
/// by `delete-missing-snapshots`/`delete-missing-datasets` regardless of what the
/// dataset-name and snapshot-set comparisons would otherwise condemn.
pub fn property_excludes(endpoint: &Endpoint, dataset: &str, rules: &[PropertyRule], timeout: Duration) -> anyhow::Result<bool> {
    for rule in rules {
        let inner = vec!["zfs".to_string(), "get".to_string(), "-Hp".to_string(), "-o".to_string(), "value".to_string(), rule.name.clone(), dataset.to_string()];
        let argv = endpoint.build_argv(&inner, false);
        let captured = command::run(&argv, Some(timeout))?;
        if !captured.success() {
            continue;
        }
        let value = captured.stdout_str();
        let value = value.trim();
        let matched = match &rule.value {
            Some(expected) => value == expected,
            None => matches!(value, "on" | "true" | "yes"),
        };
        if matched {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Destination datasets (already restricted to the filtered tree by the planner) to
/// destroy because they're absent from the source's selected tree, or because their
/// entire subtree has no snapshot (spec §4.7's second clause).
pub fn plan_missing_dataset_destroys<'a>(
    dst_tree: &'a [String],
    src_tree_relative: &[String],
    empty_subtrees: &[String],
) -> Vec<&'a str> {
    dst_tree
        .iter()
        .filter(|dst| !src_tree_relative.contains(dst) || empty_subtrees.contains(dst))
        .map(String::as_str)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Kind;
    use crate::filter::RuleList;

    fn entry(name: &str, guid: u64, createtxg: u64) -> SnapshotEntry {
        SnapshotEntry { name: name.into(), guid, createtxg, kind: Kind::Snapshot }
    }

    fn allow_all() -> FilterSpec {
        FilterSpec::new(RuleList::compile(&[]).unwrap(), RuleList::compile(&[]).unwrap())
    }

    #[test]
    fn coalesces_contiguous_run_into_range() {
        let src = vec![entry("s1", 1, 10)];
        let dst = vec![entry("s1", 1, 10), entry("s2", 2, 20), entry("s3", 3, 30), entry("s4", 4, 40)];
        let commands = plan_missing_snapshot_destroys("tank/foo", &src, &dst, &allow_all());
        assert_eq!(commands, vec!["tank/foo@s2%s4"]);
    }

    #[test]
    fn singleton_run_has_no_range_separator() {
        let src = vec![entry("s1", 1, 10), entry("s3", 3, 30)];
        let dst = vec![entry("s1", 1, 10), entry("s2", 2, 20), entry("s3", 3, 30)];
        let commands = plan_missing_snapshot_destroys("tank/foo", &src, &dst, &allow_all());
        assert_eq!(commands, vec!["tank/foo@s2"]);
    }

    #[test]
    fn nothing_to_destroy_when_all_shared() {
        let src = vec![entry("s1", 1, 10)];
        let dst = vec![entry("s1", 1, 10)];
        let commands = plan_missing_snapshot_destroys("tank/foo", &src, &dst, &allow_all());
        assert!(commands.is_empty());
    }

    #[test]
    fn missing_datasets_include_empty_subtrees() {
        let dst_tree = vec!["foo".to_string(), "bar".to_string(), "baz".to_string()];
        let src_tree = vec!["foo".to_string(), "baz".to_string()];
        let empty = vec!["baz".to_string()];
        let mut planned = plan_missing_dataset_destroys(&dst_tree, &src_tree, &empty);
        planned.sort();
        assert_eq!(planned, vec!["bar", "baz"]);
    }
}
