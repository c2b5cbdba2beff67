//! Snapshot & Bookmark Inventory (spec §4.4's input, §2 component 4): enumerates a
//! dataset's snapshots and bookmarks via `zfs list`, parsing the machine-readable
//! `-Hp` output into [`crate::dataset::SnapshotEntry`] values sorted by createtxg.
//!
//! Grounded on the teacher's `Machine::get_snaps` (which ran `zfs list -Hp -o
//! name,creation -t snapshot -s creation` and split on tab), generalized to also
//! list bookmarks, to read `guid` and `createtxg` instead of a creation timestamp,
//! and to route the command through `Endpoint`/`command::run_checked` rather than a
//! `Machine`-owned `Exec`.

use std::time::Duration;

use thiserror::Error;

use crate::command;
use crate::dataset::{Kind, SnapshotEntry};
use crate::endpoint::{Endpoint, ProgramRole};
use crate::error::EngineError;

#[derive(Error, Debug)]
pub enum InventoryError {
    #[error("dataset {0} does not exist")]
    NoDataset(String),
}

/// Fetches `dataset`'s snapshots (and, if `include_bookmarks`, its bookmarks too),
/// sorted ascending by createtxg — the order every other component in this crate
/// assumes. Returns [`InventoryError::NoDataset`] (not a generic command failure)
/// when the destination dataset simply doesn't exist yet, so callers can tell that
/// apart from a real ZFS error.
pub fn list_entries(endpoint: &Endpoint, dataset: &str, include_bookmarks: bool, timeout: Duration) -> anyhow::Result<Vec<SnapshotEntry>> {
    let types = if include_bookmarks { "snapshot,bookmark" } else { "snapshot" };
    let inner = vec![
        "zfs".to_string(),
        "list".to_string(),
        "-Hp".to_string(),
        "-o".to_string(),
        "name,guid,createtxg".to_string(),
        "-t".to_string(),
        types.to_string(),
        "-r".to_string(),
        dataset.to_string(),
    ];
    let argv = endpoint.build_argv(&inner, false);
    let captured = command::run(&argv, Some(timeout))?;

    if !captured.success() {
        if looks_like_missing_dataset(&captured.stderr) {
            return Err(InventoryError::NoDataset(dataset.to_string()).into());
        }
        return Err(EngineError::CommandFailed(crate::error::FailedCommand {
            argv,
            exit_code: captured.exit_code,
            stderr_tail: captured.stderr,
        })
        .into());
    }

    parse_listing(&captured.stdout_str(), dataset)
}

fn looks_like_missing_dataset(stderr: &str) -> bool {
    stderr.contains("dataset does not exist") || stderr.contains("does not exist")
}

/// Parses `zfs list -Hp -o name,guid,createtxg -t snapshot,bookmark` output: one
/// tab-separated row per line, `name` being `dataset@snap` or `dataset#bookmark`.
/// Rows for datasets other than `dataset` itself (possible with `-r` against a
/// dataset that turns out to have children) are dropped here — `-r` is only passed
/// so a single command also primes any nested call sites, but inventory only ever
/// reports on the one dataset it was asked about.
fn parse_listing(output: &str, dataset: &str) -> anyhow::Result<Vec<SnapshotEntry>> {
    let mut entries = Vec::new();
    for line in output.lines() {
        if line.is_empty() {
            continue;
        }
        let mut fields = line.splitn(3, '\t');
        let name = fields.next().ok_or_else(|| parse_err(line))?;
        let guid = fields.next().ok_or_else(|| parse_err(line))?;
        let createtxg = fields.next().ok_or_else(|| parse_err(line))?;

        let (ds_part, rest, kind) = if let Some(idx) = name.find('@') {
            (&name[..idx], &name[idx + 1..], Kind::Snapshot)
        } else if let Some(idx) = name.find('#') {
            (&name[..idx], &name[idx + 1..], Kind::Bookmark)
        } else {
            return Err(parse_err(line));
        };
        if ds_part != dataset {
            continue;
        }

        entries.push(SnapshotEntry {
            name: rest.to_string(),
            guid: guid.parse().map_err(|_| parse_err(line))?,
            createtxg: createtxg.parse().map_err(|_| parse_err(line))?,
            kind,
        });
    }
    entries.sort();
    Ok(entries)
}

fn parse_err(line: &str) -> anyhow::Error {
    EngineError::ProtocolError { context: "zfs list".into(), detail: format!("unparseable row: {line:?}") }.into()
}

/// Probes whether `dataset`'s pool has the bookmark feature enabled, per spec §4.2
/// (auto-detected capability). Run once per endpoint and cached via
/// [`Endpoint::set_bookmarks_supported`].
pub fn probe_bookmarks_supported(endpoint: &Endpoint, pool: &str, timeout: Duration) -> anyhow::Result<bool> {
    if endpoint.bookmarks_supported().is_none() {
        let inner = vec!["zfs".to_string(), "get".to_string(), "-Hp".to_string(), "-o".to_string(), "value".to_string(), "bookmarks".to_string(), pool.to_string()];
        let argv = endpoint.build_argv(&inner, false);
        let captured = command::run(&argv, Some(timeout))?;
        let supported = captured.success() && captured.stdout_str().trim() == "enabled";
        endpoint.set_bookmarks_supported(supported);
    }
    Ok(endpoint.bookmarks_supported().unwrap_or(false))
}

/// Whether `ProgramRole::Zfs`'s auxiliary capabilities should even be consulted for
/// this endpoint — kept here rather than in `endpoint.rs` since it's inventory-shaped
/// (a property query), not a binary-presence probe.
pub fn zfs_role() -> ProgramRole {
    ProgramRole::Zfs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_snapshot_and_bookmark_rows() {
        let output = "tank/foo@s1\t1\t10\ntank/foo#s0\t0\t5\n";
        let entries = parse_listing(output, "tank/foo").unwrap();
        assert_eq!(entries.len(), 2);
        // sorted ascending by createtxg
        assert_eq!(entries[0].name, "s0");
        assert_eq!(entries[0].kind, Kind::Bookmark);
        assert_eq!(entries[1].name, "s1");
        assert_eq!(entries[1].kind, Kind::Snapshot);
    }

    #[test]
    fn skips_rows_for_other_datasets() {
        let output = "tank/foo@s1\t1\t10\ntank/foo/child@s2\t2\t20\n";
        let entries = parse_listing(output, "tank/foo").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "s1");
    }

    #[test]
    fn rejects_malformed_row() {
        let err = parse_listing("garbage-no-tabs\n", "tank/foo").unwrap_err();
        assert!(format!("{err}").contains("unparseable"));
    }
}
