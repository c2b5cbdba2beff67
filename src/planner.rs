//! Replication Planner (spec §4.5 / §2 component 6): walks the source dataset tree
//! under `--recursive`, honoring the Filter Engine's sticky exclusion, and yields an
//! ordered list of `(src, dst)` work items with parents always preceding children.
//!
//! Grounded on the teacher's single-pair `replicate_dataset` entrypoint (no tree walk
//! existed in the teacher at all — recursion is new territory for this crate) and on
//! `other_examples/d816266a_tangybbq-rdump__src-zfs.rs.rs`'s `Exclusions`-gated
//! dataset-tree traversal (`zfs list -r -t filesystem,volume` then filtering each
//! child by name before recursing further).

use std::time::Duration;

use crate::command;
use crate::dataset::DatasetRef;
use crate::endpoint::Endpoint;
use crate::error::EngineError;
use crate::filter::FilterSpec;

/// One `(source, destination)` dataset pair to replicate, in planner emission order
/// (parents before children).
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub src: DatasetRef,
    pub dst: DatasetRef,
    pub depth: usize,
}

/// Builds the ordered work list for one `(src_root, dst_root)` pair.
///
/// Non-recursive: exactly one [`WorkItem`] for the pair itself. Recursive: the
/// source subtree is enumerated via `zfs list -r -t filesystem,volume`, each
/// candidate's path relative to `src_root` is checked against `dataset_filter`, and
/// an excluded dataset's descendants are never even listed as candidates — the
/// planner doesn't recurse into paths under the ZFS hierarchy that the filter has
/// already rejected, which is what makes exclusion sticky (spec §4.3).
pub fn plan(
    endpoint: &Endpoint,
    src_root: &DatasetRef,
    dst_root: &DatasetRef,
    recursive: bool,
    dataset_filter: &FilterSpec,
    timeout: Duration,
) -> anyhow::Result<Vec<WorkItem>> {
    let mut items = vec![WorkItem { src: src_root.clone(), dst: dst_root.clone(), depth: 0 }];
    if !recursive {
        return Ok(items);
    }

    let candidates = list_descendants(endpoint, src_root, timeout)?;
    for child_relative in select_descendants(candidates, dataset_filter) {
        let src = src_root.join(&child_relative);
        let dst = dst_root.join(&child_relative);
        let depth = child_relative.matches('/').count() + 1;
        items.push(WorkItem { src, dst, depth });
    }

    items.sort_by_key(|item| item.depth);
    Ok(items)
}

/// Applies `dataset_filter` to `candidates` with sticky exclusion (spec §4.3): once
/// a path is excluded, every path beneath it is dropped without the filter ever
/// being consulted again, regardless of whether the exclude rule would itself have
/// matched that descendant's own name. Pulled out of [`plan`] as a pure function so
/// stickiness is testable without a live `zfs` on `PATH`.
fn select_descendants(mut candidates: Vec<String>, dataset_filter: &FilterSpec) -> Vec<String> {
    // Ancestors must be decided before descendants so exclusion can stick without
    // re-evaluating the filter on each descendant: sort on path depth first rather
    // than trusting the caller's listing order to already be ancestor-first.
    candidates.sort_by_key(|rel| rel.matches('/').count());

    let mut excluded_prefixes: Vec<String> = Vec::new();
    let mut selected = Vec::new();
    for child_relative in candidates {
        if excluded_prefixes.iter().any(|prefix| is_descendant_of(&child_relative, prefix)) {
            continue;
        }
        if !dataset_filter.selects(&child_relative) {
            excluded_prefixes.push(child_relative);
            continue;
        }
        selected.push(child_relative);
    }
    selected
}

/// Whether `relpath` is a strict descendant of `ancestor_relpath` in the dataset
/// namespace (`/`-delimited path components, not a string prefix).
fn is_descendant_of(relpath: &str, ancestor_relpath: &str) -> bool {
    relpath.strip_prefix(ancestor_relpath).is_some_and(|rest| rest.starts_with('/'))
}

/// Lists every descendant of `root` (not including `root` itself), as paths
/// relative to `root`, in the order `zfs list -r` reports them (ancestors first).
/// `pub(crate)` so the Reconciliation Passes (`reconcile.rs`, driven from `main.rs`)
/// can enumerate the destination's actual tree the same way this planner enumerates
/// the source's, without duplicating the `zfs list -t filesystem,volume` parsing.
pub(crate) fn list_descendants(endpoint: &Endpoint, root: &DatasetRef, timeout: Duration) -> anyhow::Result<Vec<String>> {
    let inner = vec![
        "zfs".to_string(),
        "list".to_string(),
        "-Hp".to_string(),
        "-o".to_string(),
        "name".to_string(),
        "-t".to_string(),
        "filesystem,volume".to_string(),
        "-r".to_string(),
        root.fullname().to_string(),
    ];
    let argv = endpoint.build_argv(&inner, false);
    let captured = command::run(&argv, Some(timeout))?;
    if !captured.success() {
        return Err(EngineError::CommandFailed(crate::error::FailedCommand {
            argv,
            exit_code: captured.exit_code,
            stderr_tail: captured.stderr,
        })
        .into());
    }

    let mut descendants = Vec::new();
    for line in captured.stdout_str().lines() {
        let line = line.trim();
        if line.is_empty() || line == root.fullname() {
            continue;
        }
        let ds: DatasetRef = line
            .parse()
            .map_err(|e| EngineError::ProtocolError { context: "zfs list (tree walk)".into(), detail: format!("{e}") })?;
        if let Some(rel) = ds.relative_to(root) {
            if !rel.is_empty() {
                descendants.push(rel.to_string());
            }
        }
    }
    Ok(descendants)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{FilterSpec, RuleList};

    #[test]
    fn sticky_exclusion_drops_descendants_even_when_their_own_name_would_pass() {
        // An anchored literal exclude for "foo/tmp" matches only that exact path;
        // "foo/tmp/keep" would pass the filter taken on its own name. Stickiness
        // means it must still be dropped because its ancestor was excluded.
        let filter = FilterSpec::new(
            RuleList::compile(&[]).unwrap(),
            RuleList::compile(&["^foo/tmp$".to_string()]).unwrap(),
        );
        let candidates = vec!["foo".to_string(), "foo/tmp".to_string(), "foo/tmp/keep".to_string(), "bar".to_string()];
        let selected = select_descendants(candidates, &filter);
        assert_eq!(selected, vec!["foo".to_string(), "bar".to_string()]);
    }

    #[test]
    fn is_descendant_of_matches_path_components_not_string_prefix() {
        assert!(is_descendant_of("foo/tmp/keep", "foo/tmp"));
        assert!(!is_descendant_of("foo/tmpother", "foo/tmp"));
        assert!(!is_descendant_of("foo/tmp", "foo/tmp"));
    }

    #[test]
    fn non_recursive_yields_single_item() {
        let endpoint = local_test_endpoint();
        let src: DatasetRef = "tank/foo".parse().unwrap();
        let dst: DatasetRef = "tank2/foo".parse().unwrap();
        let filter = FilterSpec::new(RuleList::compile(&[]).unwrap(), RuleList::compile(&[]).unwrap());
        let items = plan(&endpoint, &src, &dst, false, &filter, Duration::from_secs(30)).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].src.fullname(), "tank/foo");
        assert_eq!(items[0].dst.fullname(), "tank2/foo");
    }

    // A real `Endpoint` can be constructed without reaching out to the network; the
    // tree walk itself is exercised by `list_descendants`'s parsing logic via the
    // planner integration tests under `tests/`, which stand up a fake `zfs` on PATH.
    fn local_test_endpoint() -> Endpoint {
        use crate::endpoint::{HostSpec, SshOpts, SudoPolicy};
        Endpoint::new(HostSpec::Local, SshOpts::default(), SudoPolicy::NeverElevate)
    }
}
