//! Common-Snapshot Resolver (spec §4.4): given a source inventory (snapshots, and
//! bookmarks if enabled) and a destination snapshot inventory, both createtxg-
//! ascending, finds the most recent source entity whose GUID also appears on the
//! destination — the base for the next incremental send.
//!
//! Grounded on `dataset::merge_by_guid`, which does the actual GUID-membership
//! tagging; this module supplies the tie-break the teacher's
//! `last_common_or_divergence` also applied (prefer a real snapshot over a bookmark
//! when both share a GUID) and the divergence check the teacher used to decide
//! between "rollback" and "bail".

use crate::dataset::{merge_by_guid, Kind, SnapshotEntry};

/// Outcome of resolving a dataset pair's relationship (spec §4.4, §4.5 CONFLICT?).
#[derive(Debug)]
pub enum Relationship<'a> {
    /// No destination dataset, or destination has no snapshots: full send from the
    /// oldest source candidate.
    Initial,
    /// A common base was found; transfer proceeds from it. Any destination
    /// snapshots after this point in createtxg order are listed as conflicting only
    /// if newer-than-base filtering in `conflicting_destination_entries` finds them.
    Common(&'a SnapshotEntry),
    /// Destination has snapshots but none share a GUID with anything on the source.
    Diverged,
}

/// Resolves the common base between `src` (snapshots, plus bookmarks if the caller
/// included them) and `dst` (destination snapshots only — bookmarks never exist as
/// destinations). Both slices must already be sorted ascending by createtxg (the
/// order `inventory::list_entries` returns).
pub fn resolve<'a>(src: &'a [SnapshotEntry], dst: &[SnapshotEntry]) -> Relationship<'a> {
    if dst.is_empty() {
        return Relationship::Initial;
    }
    let (src_tagged, _, last_common) = merge_by_guid(src, dst);
    let Some(idx) = last_common else {
        return Relationship::Diverged;
    };

    // Prefer a snapshot over a bookmark sharing the same GUID (spec §4.4): when the
    // merge landed on a bookmark, scan backward for a snapshot with the same guid —
    // `merge_by_guid` only ever returns one representative per shared GUID, taken
    // from `src`, so a tied snapshot (if the source still has it) sits immediately
    // alongside it with an identical guid.
    let (_, candidate) = src_tagged[idx];
    if candidate.kind == Kind::Bookmark {
        if let Some(snap) = src.iter().find(|e| e.guid == candidate.guid && e.kind == Kind::Snapshot) {
            return Relationship::Common(find_ref(src, snap.guid).unwrap_or(candidate));
        }
    }
    Relationship::Common(candidate)
}

fn find_ref<'a>(src: &'a [SnapshotEntry], guid: u64) -> Option<&'a SnapshotEntry> {
    src.iter().find(|e| e.guid == guid)
}

/// Destination snapshots with createtxg strictly greater than the base's, i.e.
/// state the destination has that the source's replicated history doesn't account
/// for — "conflicting" per spec §4.5 CONFLICT?. When there is no base
/// (`base_createtxg` is `None`), every destination snapshot is conflicting.
pub fn conflicting_destination_entries<'a>(dst: &'a [SnapshotEntry], base_createtxg: Option<u64>) -> Vec<&'a SnapshotEntry> {
    match base_createtxg {
        None => dst.iter().collect(),
        Some(base) => dst.iter().filter(|e| e.createtxg > base).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, guid: u64, createtxg: u64, kind: Kind) -> SnapshotEntry {
        SnapshotEntry { name: name.into(), guid, createtxg, kind }
    }

    #[test]
    fn empty_destination_is_initial() {
        let src = vec![entry("s1", 1, 10, Kind::Snapshot)];
        assert!(matches!(resolve(&src, &[]), Relationship::Initial));
    }

    #[test]
    fn no_shared_guid_is_diverged() {
        let src = vec![entry("s1", 1, 10, Kind::Snapshot)];
        let dst = vec![entry("x1", 99, 1, Kind::Snapshot)];
        assert!(matches!(resolve(&src, &dst), Relationship::Diverged));
    }

    #[test]
    fn finds_most_recent_common_base() {
        let src = vec![
            entry("s1", 1, 10, Kind::Snapshot),
            entry("s2", 2, 20, Kind::Snapshot),
            entry("s3", 3, 30, Kind::Snapshot),
        ];
        let dst = vec![entry("s1", 1, 10, Kind::Snapshot), entry("s2", 2, 20, Kind::Snapshot)];
        match resolve(&src, &dst) {
            Relationship::Common(base) => assert_eq!(base.guid, 2),
            other => panic!("expected Common, got {other:?}"),
        }
    }

    #[test]
    fn prefers_snapshot_over_bookmark_with_same_guid() {
        let src = vec![entry("s1", 1, 10, Kind::Bookmark), entry("s1", 1, 10, Kind::Snapshot)];
        let dst = vec![entry("s1", 1, 10, Kind::Snapshot)];
        match resolve(&src, &dst) {
            Relationship::Common(base) => assert_eq!(base.kind, Kind::Snapshot),
            other => panic!("expected Common, got {other:?}"),
        }
    }

    #[test]
    fn conflicting_entries_are_those_past_base() {
        let dst = vec![entry("s1", 1, 10, Kind::Snapshot), entry("s2", 2, 20, Kind::Snapshot)];
        let conflicts = conflicting_destination_entries(&dst, Some(10));
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].guid, 2);

        let all_conflict = conflicting_destination_entries(&dst, None);
        assert_eq!(all_conflict.len(), 2);
    }
}
