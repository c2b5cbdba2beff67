//! Pipeline Builder (spec §4.6 / §2 component 8): assembles the
//! send → [zstd] → [mbuffer] → [ssh] → [pv] → [ssh] → [mbuffer] → [zstd] → recv
//! stage list from each endpoint's auto-detected capabilities, collapsing to plain
//! `zfs send | zfs receive` in local mode and eliding whichever SSH leg the
//! initiator itself sits on.
//!
//! Grounded on the teacher's `Machine::fullsend_s`/`send_from_s_till_last` (building
//! the `zfs send` argv with `-R`/`-p`/`-I`/`-i`) and `Machine::recv`, and on its
//! `sendside | destside` pipe operator in `replicate.rs` — generalized from a fixed
//! two-stage pipe into an arbitrary stage list built from capability flags, per
//! `other_examples/d816266a_tangybbq-rdump__src-zfs.rs.rs`'s compressor/buffer
//! elision pattern.
//!
//! Each remote leg is exactly one [`Stage`], built via
//! [`crate::endpoint::Endpoint::build_pipeline_argv`]: the leg's own `zfs`
//! send/receive command plus whichever `zstd`/`mbuffer` stages its capabilities
//! enable are shell-joined and sent through a single SSH connection, since they run
//! on that endpoint's own machine, on the side of the network hop they exist to
//! shield. Only `pv`, which always runs on the initiator's own machine reading and
//! writing local pipes, is ever a separate local [`Stage`].

use crate::command::Stage;
use crate::endpoint::{Endpoint, ProgramRole};

/// Which snapshots to send, chosen by the replicator's PLAN state (spec §4.5).
#[derive(Debug, Clone)]
pub enum SendMode {
    /// No common base: full send of `target`.
    Full { target: String },
    /// `-i base target`: only the endpoints, no intermediates.
    IncrementalSingle { base: String, target: String },
    /// `-I base target`: base plus every intermediate snapshot up to target.
    IncrementalIntermediates { base: String, target: String },
}

/// How bytes are discarded/substituted under `--dryrun` (spec §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DryRun {
    #[default]
    Off,
    /// Replace both send and receive with no-ops.
    Send,
    /// Run the real send, but append `-n` to receive so nothing is committed.
    Recv,
}

#[derive(Debug, Clone, Default)]
pub struct PipelineOpts {
    pub dry_run: DryRun,
    pub verbose_send: bool,
    pub verbose_recv: bool,
    pub force_rollback_recv: bool,
    pub raw: bool,
    pub show_progress: bool,
}

/// Builds the ordered [`Stage`] list for one dataset transfer. `src_endpoint` and
/// `dst_endpoint` may be the same [`Endpoint`] (local mode) or distinct remote ones;
/// `initiator_is_src`/`initiator_is_dst` determine which SSH legs, if any, are
/// elided because the initiator itself already sits on that side.
pub fn build(
    src_endpoint: &Endpoint,
    dst_endpoint: &Endpoint,
    src_dataset: &str,
    dst_dataset: &str,
    mode: &SendMode,
    opts: &PipelineOpts,
) -> Vec<Stage> {
    let mut stages = Vec::new();

    stages.push(send_leg_stage(src_endpoint, src_dataset, mode, opts));

    if opts.show_progress && local_pv_available(src_endpoint, dst_endpoint) {
        stages.push(Stage::new("pv", vec!["pv".into(), "-petab".into()]));
    }

    stages.push(recv_leg_stage(dst_endpoint, dst_dataset, opts));
    stages
}

/// `pv` only ever runs on the initiator's own machine (it reads/writes local pipes
/// between whichever legs are adjacent to it); it is never itself wrapped in `ssh`.
/// It requires the initiator (the process running this code, always "local" from
/// its own point of view) to have `pv` on `$PATH` — modeled here as "either leg
/// reports the capability", since in local mode src/dst are the same endpoint.
fn local_pv_available(src_endpoint: &Endpoint, dst_endpoint: &Endpoint) -> bool {
    src_endpoint.capability(ProgramRole::Pv) || dst_endpoint.capability(ProgramRole::Pv)
}

/// Builds the source leg as a single [`Stage`]: the `zfs send` argv, plus — only
/// when the source is remote — any `zstd`/`mbuffer` segments its capabilities
/// enable, chained after it with a shell `|` and sent through one `ssh` connection
/// (spec §4.6). Compression/buffering run on the source's own machine, ahead of the
/// network hop they shield, never as separate un-wrapped local stages spliced in
/// after a second SSH connection.
fn send_leg_stage(endpoint: &Endpoint, dataset: &str, mode: &SendMode, opts: &PipelineOpts) -> Stage {
    if opts.dry_run == DryRun::Send {
        return Stage::new("send", endpoint.build_argv(&["true".to_string()], false));
    }

    let mut segments = vec![send_command_argv(dataset, mode, opts)];
    if !endpoint.is_local() {
        if endpoint.capability(ProgramRole::Zstd) {
            segments.push(vec!["zstd".into(), "-c".into(), "-1".into()]);
        }
        if endpoint.capability(ProgramRole::Mbuffer) {
            segments.push(vec!["mbuffer".into(), "-q".into()]);
        }
    }
    Stage::new("send", endpoint.build_pipeline_argv(&segments, Some(0)))
}

fn send_command_argv(dataset: &str, mode: &SendMode, opts: &PipelineOpts) -> Vec<String> {
    let mut argv = vec!["zfs".to_string(), "send".to_string()];
    if opts.verbose_send {
        argv.push("-v".to_string());
    }
    if opts.raw {
        argv.push("-w".to_string());
    }
    match mode {
        SendMode::Full { target } => {
            argv.push(format!("{dataset}@{target}"));
        }
        SendMode::IncrementalSingle { base, target } => {
            argv.push("-i".to_string());
            argv.push(base.clone());
            argv.push(format!("{dataset}@{target}"));
        }
        SendMode::IncrementalIntermediates { base, target } => {
            argv.push("-I".to_string());
            argv.push(base.clone());
            argv.push(format!("{dataset}@{target}"));
        }
    }
    argv
}

/// Builds the destination leg as a single [`Stage`], mirroring [`send_leg_stage`]:
/// when the destination is remote, `mbuffer`/`zstd -dc` segments run ahead of `zfs
/// receive` in the same shell-joined pipeline, all inside one `ssh` connection.
fn recv_leg_stage(endpoint: &Endpoint, dataset: &str, opts: &PipelineOpts) -> Stage {
    if opts.dry_run == DryRun::Send {
        return Stage::new("recv", endpoint.build_argv(&["true".to_string()], false));
    }

    let mut segments = Vec::new();
    if !endpoint.is_local() {
        if endpoint.capability(ProgramRole::Mbuffer) {
            segments.push(vec!["mbuffer".into(), "-q".into()]);
        }
        if endpoint.capability(ProgramRole::Zstd) {
            segments.push(vec!["zstd".into(), "-dc".into()]);
        }
    }
    let recv_index = segments.len();
    segments.push(recv_command_argv(dataset, opts));
    Stage::new("recv", endpoint.build_pipeline_argv(&segments, Some(recv_index)))
}

fn recv_command_argv(dataset: &str, opts: &PipelineOpts) -> Vec<String> {
    let mut argv = vec!["zfs".to_string(), "receive".to_string()];
    if opts.verbose_recv {
        argv.push("-v".to_string());
    }
    if opts.force_rollback_recv {
        argv.push("-F".to_string());
    }
    if opts.dry_run == DryRun::Recv {
        argv.push("-n".to_string());
    }
    argv.push(dataset.to_string());
    argv
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{HostSpec, SshOpts, SudoPolicy};

    fn local() -> Endpoint {
        Endpoint::new(HostSpec::Local, SshOpts::default(), SudoPolicy::NeverElevate)
    }

    #[test]
    fn local_mode_is_two_stages() {
        let src = local();
        let dst = local();
        let mode = SendMode::Full { target: "s1".into() };
        let stages = build(&src, &dst, "tank/foo", "tank2/foo", &mode, &PipelineOpts::default());
        assert_eq!(stages.len(), 2);
        assert_eq!(stages[0].label, "send");
        assert_eq!(stages[1].label, "recv");
    }

    #[test]
    fn full_mode_send_argv_has_no_base() {
        let src = local();
        let mode = SendMode::Full { target: "s1".into() };
        let opts = PipelineOpts::default();
        let stage = send_leg_stage(&src, "tank/foo", &mode, &opts);
        assert!(stage.argv.contains(&"tank/foo@s1".to_string()));
        assert!(!stage.argv.contains(&"-i".to_string()));
    }

    #[test]
    fn incremental_intermediates_uses_capital_i() {
        let src = local();
        let mode = SendMode::IncrementalIntermediates { base: "tank/foo@s1".into(), target: "s3".into() };
        let stage = send_leg_stage(&src, "tank/foo", &mode, &PipelineOpts::default());
        assert!(stage.argv.contains(&"-I".to_string()));
        assert!(stage.argv.contains(&"tank/foo@s1".to_string()));
    }

    #[test]
    fn dry_run_recv_appends_n_flag() {
        let dst = local();
        let opts = PipelineOpts { dry_run: DryRun::Recv, ..Default::default() };
        let stage = recv_leg_stage(&dst, "tank2/foo", &opts);
        assert!(stage.argv.contains(&"-n".to_string()));
    }

    /// A remote endpoint with `zstd`/`mbuffer` explicitly disabled, so `capability()`
    /// returns `false` without ever spawning a probe against the (nonexistent) host.
    fn remote(host: &str) -> Endpoint {
        use crate::endpoint::ProgramPath;
        let mut ep = Endpoint::new(HostSpec::Remote(host.into()), SshOpts::default(), SudoPolicy::NeverElevate);
        ep.set_program(ProgramRole::Zstd, ProgramPath::Disabled);
        ep.set_program(ProgramRole::Mbuffer, ProgramPath::Disabled);
        ep.set_program(ProgramRole::Pv, ProgramPath::Disabled);
        ep
    }

    /// With a remote source that has no `zstd`/`mbuffer` available, the send leg is
    /// still exactly one stage, and that stage is the single `ssh`-wrapped `zfs send`
    /// command — not a `zfs send` stage plus a second, separate `ssh ... cat` stage.
    #[test]
    fn remote_source_without_aux_programs_is_one_ssh_stage() {
        let src = remote("baal");
        let mode = SendMode::Full { target: "s1".into() };
        let stage = send_leg_stage(&src, "tank/foo", &mode, &PipelineOpts::default());
        assert_eq!(stage.argv[0], "ssh");
        assert_eq!(stage.argv.iter().filter(|a| a.as_str() == "ssh").count(), 1);
        assert_eq!(stage.argv.last().unwrap(), "zfs send tank/foo@s1");
    }

    /// The whole remote pipeline (source send, destination receive) is exactly two
    /// stages: one `ssh` hop per remote leg, never a second `ssh ... cat` stage
    /// spliced in alongside either one. `show_progress` is left off here since
    /// enabling `pv` would probe both (nonexistent) remote hosts over a real `ssh`
    /// invocation — that capability probe is exercised instead by the fake-`zfs`
    /// integration tests under `tests/`, which stand up a real `PATH` to answer it.
    #[test]
    fn remote_to_remote_pipeline_has_no_redundant_ssh_stages() {
        let src = remote("baal");
        let dst = remote("astaroth");
        let mode = SendMode::Full { target: "s1".into() };
        let stages = build(&src, &dst, "tank/foo", "tank2/foo", &mode, &PipelineOpts::default());
        let ssh_stage_count = stages.iter().filter(|s| s.argv.first().map(String::as_str) == Some("ssh")).count();
        assert_eq!(ssh_stage_count, 2, "exactly one ssh stage per remote leg, stages: {stages:?}");
        assert_eq!(stages.len(), 2);
    }
}
