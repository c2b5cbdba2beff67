//! Per-Dataset Replicator (spec §4.5 / §2 component 7): the `INSPECT → CONFLICT? →
//! PLAN → TRANSFER → BOOKMARK → DONE` state machine for one `(src, dst)` pair,
//! returning an explicit [`Outcome`] rather than unwinding via exceptions for the
//! expected "nothing to do" / "skip this one" cases (spec §9's redesign flag).
//!
//! Grounded on the teacher's `replicate_dataset` (`replicate.rs`): the
//! exists-check/rollback/full-vs-incremental branching is the same shape, each step
//! generalized per SPEC_FULL §4.5 — `last_common_or_divergence` becomes
//! `resolver::resolve`, the teacher's unconditional rollback-or-bail becomes the
//! `--force`/`--force-once` CONFLICT? resolution, and the hardcoded `sendside |
//! destside` pipe becomes `pipeline::build` + `command::spawn_pipeline`.

use std::time::Duration;

use crate::command;
use crate::config::SkipMissingSnapshots;
use crate::context::RunContext;
use crate::dataset::DatasetRef;
use crate::endpoint::Endpoint;
use crate::error::EngineError;
use crate::filter::FilterSpec;
use crate::inventory;
use crate::pipeline::{self, DryRun, PipelineOpts, SendMode};
use crate::planner::WorkItem;
use crate::reconcile;
use crate::resolver::{self, Relationship};
use crate::retry;

/// What the replicator reports for one [`WorkItem`] (spec §4.5, §9).
#[derive(Debug)]
pub enum Outcome {
    Done(String),
    Skipped(String),
    Failed(anyhow::Error),
}

/// Runs the state machine for one dataset pair. Never panics on an expected "skip";
/// only a programmer error (a parse failure on data this module itself produced)
/// would panic, and none of the paths below do.
///
/// The whole attempt is wrapped by the Retry Controller (§4.8): a transient failure
/// (a concurrent pruner, the destination not yet visible after a sibling just
/// created it, a dropped SSH connection) re-runs INSPECT through BOOKMARK from
/// scratch rather than trying to resume mid-pipeline, since re-inspecting is cheap
/// and resuming a half-sent stream is not something `zfs receive` supports anyway.
pub fn replicate_one(
    ctx: &RunContext,
    src_endpoint: &Endpoint,
    dst_endpoint: &Endpoint,
    item: &WorkItem,
    snapshot_filter: &FilterSpec,
) -> Outcome {
    let mut attempt = || replicate_one_inner(ctx, src_endpoint, dst_endpoint, item, snapshot_filter);
    match retry::retry_cancellable(&ctx.config.retry_policy, Some(ctx), &mut attempt) {
        Ok(outcome) => outcome,
        Err(err) => Outcome::Failed(err),
    }
}

fn replicate_one_inner(
    ctx: &RunContext,
    src_endpoint: &Endpoint,
    dst_endpoint: &Endpoint,
    item: &WorkItem,
    snapshot_filter: &FilterSpec,
) -> anyhow::Result<Outcome> {
    let cfg = &ctx.config;

    // INSPECT
    let include_bookmarks = cfg.include_bookmarks && bookmarks_usable(src_endpoint, item.src.pool(), cfg.metadata_timeout)?;
    let src_entries = inventory::list_entries(src_endpoint, item.src.fullname(), include_bookmarks, cfg.metadata_timeout)?;
    let candidates: Vec<_> = src_entries.into_iter().filter(|e| snapshot_filter.selects(&e.name)).collect();

    let dst_lookup = inventory::list_entries(dst_endpoint, item.dst.fullname(), false, cfg.metadata_timeout);
    let (dst_existed, dst_entries) = match dst_lookup {
        Ok(entries) => (true, entries),
        Err(err) if is_no_dataset(&err) => (false, Vec::new()),
        Err(err) => return Err(err),
    };

    if candidates.is_empty() {
        return handle_missing_candidates(ctx, src_endpoint, dst_endpoint, item, dst_existed, &dst_entries, cfg.metadata_timeout);
    }

    // CONFLICT?
    let relationship = resolver::resolve(&candidates, &dst_entries);
    let base_createtxg = match &relationship {
        Relationship::Common(base) => Some(base.createtxg),
        _ => None,
    };
    let conflicts = resolver::conflicting_destination_entries(&dst_entries, base_createtxg);
    let diverged = matches!(relationship, Relationship::Diverged);

    if (diverged || !conflicts.is_empty()) && dst_existed {
        if !cfg.force && !(cfg.force_once && ctx.try_claim_force_once()) {
            return Err(EngineError::PolicyConflict {
                dataset: item.dst.fullname().to_string(),
                detail: format!("{} conflicting snapshot(s) on destination", conflicts.len().max(1)),
            }
            .into());
        }
        let base_name = match &relationship {
            Relationship::Common(base) => Some(base.name.as_str()),
            _ => None,
        };
        resolve_conflicts(dst_endpoint, &item.dst, &dst_entries, base_createtxg, base_name, cfg.force_unmount, cfg.metadata_timeout)?;
    }

    // PLAN
    let newest = candidates.last().expect("checked non-empty above");
    let mode = match &relationship {
        Relationship::Initial | Relationship::Diverged => SendMode::Full { target: newest.name.clone() },
        Relationship::Common(base) if base.guid == newest.guid => {
            return Ok(Outcome::Skipped(format!("{} already up to date with {}", item.dst, newest.name)));
        }
        Relationship::Common(base) => {
            let base_spec = format!("{}{}", item.src.fullname(), base.addressed());
            if cfg.no_stream {
                SendMode::IncrementalSingle { base: base_spec, target: newest.name.clone() }
            } else {
                SendMode::IncrementalIntermediates { base: base_spec, target: newest.name.clone() }
            }
        }
    };

    if !dst_existed {
        create_ancestors(dst_endpoint, &item.dst, cfg.metadata_timeout)?;
    }

    if ctx.is_cancelled() {
        return Err(EngineError::Cancelled.into());
    }

    // TRANSFER
    let opts = PipelineOpts {
        dry_run: cfg.dry_run,
        verbose_send: cfg.verbose_send,
        verbose_recv: cfg.verbose_recv,
        force_rollback_recv: cfg.force || cfg.force_once,
        raw: false,
        show_progress: cfg.show_progress,
    };
    transfer(src_endpoint, dst_endpoint, item, &mode, &opts)?;

    // BOOKMARK
    if !cfg.no_create_bookmark && include_bookmarks && cfg.dry_run != DryRun::Send {
        create_bookmark(src_endpoint, &item.src, &newest.name, cfg.metadata_timeout)?;
    }

    Ok(Outcome::Done(format!("replicated {} -> {} through {}", item.src, item.dst, newest.name)))
}

fn bookmarks_usable(src_endpoint: &Endpoint, pool: &str, timeout: std::time::Duration) -> anyhow::Result<bool> {
    inventory::probe_bookmarks_supported(src_endpoint, pool, timeout)
}

fn is_no_dataset(err: &anyhow::Error) -> bool {
    err.downcast_ref::<inventory::InventoryError>().is_some()
}

/// INSPECT's "no candidate snapshots" branch (spec §4.5, and the Open Question
/// decided in SPEC_FULL §9: create the empty ancestor before descending, report the
/// ancestor itself as `Skipped` rather than `Failed`).
fn handle_missing_candidates(
    ctx: &RunContext,
    _src_endpoint: &Endpoint,
    dst_endpoint: &Endpoint,
    item: &WorkItem,
    dst_existed: bool,
    dst_entries: &[crate::dataset::SnapshotEntry],
    timeout: Duration,
) -> anyhow::Result<Outcome> {
    match ctx.config.skip_missing_snapshots {
        SkipMissingSnapshots::Fail => Err(EngineError::PolicyConflict {
            dataset: item.src.fullname().to_string(),
            detail: "no snapshots selected by the active filter".to_string(),
        }
        .into()),
        SkipMissingSnapshots::Dataset => Ok(Outcome::Skipped(format!("{}: no candidate snapshots", item.src))),
        SkipMissingSnapshots::Continue => {
            if ctx.config.force && dst_existed && !dst_entries.is_empty() {
                let range = format!("{}@{}%{}", item.dst.fullname(), dst_entries[0].name, dst_entries.last().unwrap().name);
                reconcile::destroy(dst_endpoint, &range, ctx.config.force_unmount, timeout)?;
            }
            if !dst_existed {
                create_ancestors(dst_endpoint, &item.dst, timeout)?;
            }
            Ok(Outcome::Skipped(format!("{}: no candidate snapshots, ancestor created for descendants", item.src)))
        }
    }
}

/// Clears conflicting destination state under `--force`. When a common base
/// exists, `zfs rollback -r` to that snapshot both reverts the live filesystem and
/// destroys every snapshot newer than it in one step; with no base at all
/// (complete divergence), there is nothing to roll back to, so the conflicting
/// snapshots are destroyed outright instead.
fn resolve_conflicts(
    dst_endpoint: &Endpoint,
    dst: &DatasetRef,
    dst_entries: &[crate::dataset::SnapshotEntry],
    base_createtxg: Option<u64>,
    base_name: Option<&str>,
    force_unmount: bool,
    timeout: Duration,
) -> anyhow::Result<()> {
    let conflicts = resolver::conflicting_destination_entries(dst_entries, base_createtxg);
    if conflicts.is_empty() {
        return Ok(());
    }

    match base_name {
        Some(name) => {
            let mut inner = vec!["zfs".to_string(), "rollback".to_string(), "-r".to_string()];
            if force_unmount {
                inner.push("-f".to_string());
            }
            inner.push(format!("{}@{name}", dst.fullname()));
            let argv = dst_endpoint.build_argv(&inner, true);
            command::run_checked(&argv, Some(timeout))?;
        }
        None => {
            let range = match conflicts.as_slice() {
                [only] => format!("{}@{}", dst.fullname(), only.name),
                many => format!("{}@{}%{}", dst.fullname(), many[0].name, many[many.len() - 1].name),
            };
            reconcile::destroy(dst_endpoint, &range, force_unmount, timeout)?;
        }
    }
    Ok(())
}

fn create_ancestors(dst_endpoint: &Endpoint, dst: &DatasetRef, timeout: Duration) -> anyhow::Result<()> {
    if dst.is_pool_root() {
        return Ok(());
    }
    let components = dst.components();
    for depth in 1..components.len() {
        let ancestor = components[..depth].join("/");
        let inner = vec!["zfs".to_string(), "list".to_string(), "-Hp".to_string(), "-o".to_string(), "name".to_string(), ancestor.clone()];
        let argv = dst_endpoint.build_argv(&inner, false);
        let probe = command::run(&argv, Some(timeout))?;
        if probe.success() {
            continue;
        }
        let create_inner = vec!["zfs".to_string(), "create".to_string(), "-p".to_string(), ancestor];
        let create_argv = dst_endpoint.build_argv(&create_inner, true);
        command::run_checked(&create_argv, Some(timeout))?;
    }
    Ok(())
}

fn transfer(src_endpoint: &Endpoint, dst_endpoint: &Endpoint, item: &WorkItem, mode: &SendMode, opts: &PipelineOpts) -> anyhow::Result<()> {
    let stages = pipeline::build(src_endpoint, dst_endpoint, item.src.fullname(), item.dst.fullname(), mode, opts);
    let running = command::spawn_pipeline(stages)?;
    running.join(None)
}

fn create_bookmark(src_endpoint: &Endpoint, src: &DatasetRef, snap_name: &str, timeout: Duration) -> anyhow::Result<()> {
    let inner = vec![
        "zfs".to_string(),
        "bookmark".to_string(),
        format!("{}@{snap_name}", src.fullname()),
        format!("{}#{snap_name}", src.fullname()),
    ];
    let argv = src_endpoint.build_argv(&inner, true);
    let captured = command::run(&argv, Some(timeout))?;
    // An existing bookmark of the same name is a no-op per spec §4.5 BOOKMARK; ZFS
    // itself reports that case as a non-zero exit with "bookmark already exists",
    // which this treats as success rather than surfacing a spurious failure.
    if captured.success() || captured.stderr.contains("already exists") {
        return Ok(());
    }
    Err(EngineError::CommandFailed(crate::error::FailedCommand {
        argv,
        exit_code: captured.exit_code,
        stderr_tail: captured.stderr,
    })
    .into())
}

