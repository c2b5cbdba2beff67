//! Error-Scope Controller (spec §4.9 / §2 component 11): given a failed dataset and
//! a `--skip-on-error` policy, decides whether the run aborts outright or only the
//! failing (sub)tree is abandoned.
//!
//! New territory for this crate (the teacher processed exactly one dataset pair per
//! invocation, so it never needed tree-scoped failure containment); modeled as a
//! plain decision function over the [`Outcome`] the Per-Dataset Replicator returns,
//! per spec §9's redesign flag replacing exception-for-control-flow with an explicit
//! outcome enum.

use crate::planner::WorkItem;

/// `--skip-on-error` policy (spec §4.9).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SkipOnError {
    Fail,
    Tree,
    Dataset,
}

impl Default for SkipOnError {
    fn default() -> Self {
        SkipOnError::Dataset
    }
}

/// What the top-level run loop should do after one [`WorkItem`] reports `Failed`.
#[derive(Debug, PartialEq, Eq)]
pub enum Verdict {
    /// Abort the whole run immediately.
    AbortRun,
    /// Mark `failed_item` and every descendant (anything whose source or
    /// destination path is nested under it) as skipped; continue with the next
    /// sibling subtree.
    SkipSubtree,
    /// Skip just `failed_item`; descendants may still be attempted, since their own
    /// destination might already exist independently.
    SkipDatasetOnly,
}

/// Decides the [`Verdict`] for `failed_item` under `policy`. `dst_existed` is
/// whether `failed_item`'s destination dataset already existed before this run
/// attempted it — the spec's `dataset` mode falls back to `tree` behavior when it
/// didn't, since a child can't meaningfully continue under a parent that was never
/// created.
pub fn decide(policy: SkipOnError, dst_existed: bool) -> Verdict {
    match policy {
        SkipOnError::Fail => Verdict::AbortRun,
        SkipOnError::Tree => Verdict::SkipSubtree,
        SkipOnError::Dataset => {
            if dst_existed {
                Verdict::SkipDatasetOnly
            } else {
                Verdict::SkipSubtree
            }
        }
    }
}

/// Whether `item`'s source dataset is `ancestor`'s source or a descendant of it —
/// the membership test a `SkipSubtree` verdict applies against the remaining work.
pub fn is_subtree_of(item: &WorkItem, ancestor: &WorkItem) -> bool {
    item.src.relative_to(&ancestor.src).is_some()
}

/// Filters `remaining` work items down to those not excluded by a `SkipSubtree`
/// verdict against `failed_item`: anything whose source dataset is `failed_item`'s
/// source or a descendant of it.
pub fn exclude_subtree<'a>(remaining: &'a [WorkItem], failed_item: &WorkItem) -> Vec<&'a WorkItem> {
    remaining.iter().filter(|item| !is_subtree_of(item, failed_item)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::DatasetRef;

    fn item(src: &str, dst: &str) -> WorkItem {
        WorkItem { src: src.parse::<DatasetRef>().unwrap(), dst: dst.parse::<DatasetRef>().unwrap(), depth: 0 }
    }

    #[test]
    fn fail_policy_always_aborts() {
        assert_eq!(decide(SkipOnError::Fail, true), Verdict::AbortRun);
        assert_eq!(decide(SkipOnError::Fail, false), Verdict::AbortRun);
    }

    #[test]
    fn tree_policy_always_skips_subtree() {
        assert_eq!(decide(SkipOnError::Tree, true), Verdict::SkipSubtree);
    }

    #[test]
    fn dataset_policy_depends_on_destination_existing() {
        assert_eq!(decide(SkipOnError::Dataset, true), Verdict::SkipDatasetOnly);
        assert_eq!(decide(SkipOnError::Dataset, false), Verdict::SkipSubtree);
    }

    #[test]
    fn exclude_subtree_drops_descendants_only() {
        let failed = item("tank/foo", "tank2/foo");
        let remaining = vec![item("tank/foo/child", "tank2/foo/child"), item("tank/bar", "tank2/bar")];
        let kept = exclude_subtree(&remaining, &failed);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].src.fullname(), "tank/bar");
    }
}
