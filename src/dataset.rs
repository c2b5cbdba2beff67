//! Dataset specs, snapshot/bookmark entries, and the GUID-tagged comparison shared
//! by the Common-Snapshot Resolver (`resolver.rs`) and Reconciliation Passes
//! (`reconcile.rs`).
//!
//! Grounded on the teacher's `Dataset`/`Snap`/`Comm`/`comm()` (tagging two sorted
//! snapshot vectors LEFT/BOTH/RIGHT), generalized from "snapshot vs. snapshot" to
//! "source entity (snapshot or bookmark) vs. destination snapshot". Unlike the
//! teacher, whose two `Dataset`s always shared one pool's creation clock, this
//! crate's two sides can be entirely independent pools: `createtxg` is a per-pool
//! transaction-group counter, not comparable across them, so membership here is
//! decided purely by GUID-set membership, never by comparing one side's `createtxg`
//! against the other's.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::str::FromStr;

use thiserror::Error;

/// A ZFS dataset reference, with pool and relative path split out.
///
/// Example: `"tank/webdata"` has `pool() == "tank"` and `relative() == "webdata"`.
/// The pool root itself (`"tank"`) is a valid dataset; `relative()` is then empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetRef {
    /// Full dataset name, pool included, slashes normalized. Never contains the
    /// `user@host:` prefix — that lives on [`crate::endpoint::Endpoint`] instead.
    fullname: String,
    /// Byte index of the first `/`, or `fullname.len()` if this is a pool root.
    pool_idx: usize,
}

#[derive(Error, Debug)]
pub enum SpecParseError {
    #[error("{0}: dataset spec cannot be empty")]
    Empty(String),
    #[error("{0}: dataset spec cannot begin or end with a slash")]
    IllegalSlashes(String),
    #[error("{0}: no characters other than ASCII alphanumeric, dash, underscore, period and slash may appear in a dataset name")]
    IllegalCharacters(String),
    #[error("{0}: empty dataset path components (\"pool//child\") are not allowed")]
    EmptyComponent(String),
}

impl DatasetRef {
    pub fn fullname(&self) -> &str {
        &self.fullname
    }

    pub fn pool(&self) -> &str {
        &self.fullname[0..self.pool_idx]
    }

    pub fn relative(&self) -> &str {
        if self.pool_idx >= self.fullname.len() {
            ""
        } else {
            &self.fullname[self.pool_idx + 1..]
        }
    }

    pub fn is_pool_root(&self) -> bool {
        self.pool_idx >= self.fullname.len()
    }

    /// The path components of this dataset, pool included.
    pub fn components(&self) -> Vec<&str> {
        self.fullname.split('/').collect()
    }

    /// The depth of this dataset below its pool root (0 for the pool root itself).
    pub fn depth(&self) -> usize {
        self.components().len() - 1
    }

    /// Returns a new [`DatasetRef`] with `relative` appended under this dataset's
    /// name, used by the planner to derive a child's destination path from its
    /// source path's suffix relative to the pair's root.
    pub fn join(&self, relative: &str) -> DatasetRef {
        if relative.is_empty() {
            return self.clone();
        }
        let fullname = format!("{}/{}", self.fullname, relative);
        let pool_idx = fullname.find('/').unwrap_or(fullname.len());
        DatasetRef { fullname, pool_idx }
    }

    /// The dataset's own name relative to an ancestor `root`, or `None` if `root`
    /// isn't actually an ancestor (or is this dataset itself).
    pub fn relative_to(&self, root: &DatasetRef) -> Option<&str> {
        let prefix = root.fullname();
        if self.fullname == prefix {
            return Some("");
        }
        let with_slash = format!("{prefix}/");
        self.fullname.strip_prefix(&with_slash)
    }
}

impl FromStr for DatasetRef {
    type Err = SpecParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if value.is_empty() {
            return Err(SpecParseError::Empty(value.into()));
        }
        for ch in value.chars() {
            if !(ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '/' | '.')) {
                return Err(SpecParseError::IllegalCharacters(value.into()));
            }
        }
        let bytes = value.as_bytes();
        if bytes[0] == b'/' || bytes[bytes.len() - 1] == b'/' {
            return Err(SpecParseError::IllegalSlashes(value.into()));
        }
        if value.contains("//") {
            return Err(SpecParseError::EmptyComponent(value.into()));
        }
        let pool_idx = value.find('/').unwrap_or(value.len());
        Ok(DatasetRef { fullname: value.to_string(), pool_idx })
    }
}

impl std::fmt::Display for DatasetRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.fullname)
    }
}

/// Whether a [`SnapshotEntry`] came from `zfs list -t snapshot` or `-t bookmark`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Kind {
    Snapshot,
    Bookmark,
}

/// One snapshot or bookmark, as enumerated by the Inventory component
/// (`inventory.rs`). Bookmarks and their origin snapshot share a GUID by ZFS's own
/// guarantee (spec §4.4), which is what makes them interchangeable as a common base.
#[derive(Debug, Clone)]
pub struct SnapshotEntry {
    /// The name after `@`/`#` — never the full `dataset@name` form.
    pub name: String,
    pub guid: u64,
    pub createtxg: u64,
    pub kind: Kind,
}

impl SnapshotEntry {
    /// The fragment to append to a dataset's fullname to address this entry:
    /// `"@name"` for a snapshot, `"#name"` for a bookmark.
    pub fn addressed(&self) -> String {
        match self.kind {
            Kind::Snapshot => format!("@{}", self.name),
            Kind::Bookmark => format!("#{}", self.name),
        }
    }
}

impl PartialEq for SnapshotEntry {
    fn eq(&self, other: &Self) -> bool {
        self.guid == other.guid
    }
}
impl Eq for SnapshotEntry {}

impl PartialOrd for SnapshotEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.createtxg.cmp(&other.createtxg))
    }
}
impl Ord for SnapshotEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.createtxg.cmp(&other.createtxg)
    }
}

/// Tag produced by [`merge_by_guid`]: which side(s) a GUID was observed on.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Side {
    Left,
    Both,
    Right,
}

/// Tags `left` and `right` by GUID-set membership in the other side, each preserving
/// its own createtxg-ascending order.
///
/// This is the teacher's `Dataset::comm` algorithm, generalized from a value-compared
/// merge-join (which assumed both sides shared one pool's creation clock) to a
/// GUID-set lookup: `left`'s `createtxg` values are never compared against `right`'s,
/// since the two sides may be independent pools whose transaction-group counters
/// have no relationship to each other. Only equality by `guid` — which ZFS guarantees
/// is globally unique — decides membership.
///
/// Returns `(left_tagged, right_tagged, last_common)`. `left_tagged`/`right_tagged`
/// tag each side's own entries `Both` (GUID also present on the other side) or
/// `Left`/`Right` (present only on this side), in that side's own order. `last_common`
/// is the index into `left_tagged` of the last (most recent, in `left`'s own
/// createtxg order) `Both` entry — the Common-Snapshot Resolver's base candidate.
pub fn merge_by_guid<'a>(
    left: &'a [SnapshotEntry],
    right: &'a [SnapshotEntry],
) -> (Vec<(Side, &'a SnapshotEntry)>, Vec<(Side, &'a SnapshotEntry)>, Option<usize>) {
    let right_guids: HashSet<u64> = right.iter().map(|e| e.guid).collect();
    let left_guids: HashSet<u64> = left.iter().map(|e| e.guid).collect();

    let mut left_tagged = Vec::with_capacity(left.len());
    let mut last_common = None;
    for entry in left {
        let side = if right_guids.contains(&entry.guid) {
            last_common = Some(left_tagged.len());
            Side::Both
        } else {
            Side::Left
        };
        left_tagged.push((side, entry));
    }

    let mut right_tagged = Vec::with_capacity(right.len());
    for entry in right {
        let side = if left_guids.contains(&entry.guid) { Side::Both } else { Side::Right };
        right_tagged.push((side, entry));
    }

    (left_tagged, right_tagged, last_common)
}
