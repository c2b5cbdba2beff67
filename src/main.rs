//! CLI & Process Entrypoint (spec §6 / §2 component 13): parses arguments into a
//! [`RunConfig`], initializes logging, constructs the source/destination/local
//! endpoints and the [`RunContext`], drives the planner → replicator →
//! reconciliation sequence, and maps the final outcome to a process exit code.
//!
//! Grounded on the teacher's `main.rs` (single `clap::App`, subcommand match,
//! `exit(0)`/`exit(1)` on `Result<String, anyhow::Error>`), generalized from three
//! subcommands into one `replicate` operation on the `clap` 4 builder API, with
//! `env_logger::init()` added per the ambient-stack requirement and exit codes
//! differentiated per spec §6 ("usage error", "ZFS error", "network/ssh error",
//! "interrupted").

mod command;
mod config;
mod context;
mod dataset;
mod endpoint;
mod error;
mod errscope;
mod filter;
mod inventory;
mod pipeline;
mod planner;
mod reconcile;
mod replicator;
mod resolver;
mod retry;

use std::process::ExitCode;
use std::sync::Arc;

use clap::{Arg, ArgAction, Command};

use crate::config::{RunConfig, SkipMissingSnapshots};
use crate::context::RunContext;
use crate::dataset::DatasetRef;
use crate::endpoint::{load_dataset_pairs_file, split_spec, Endpoint, HostSpec, SshOpts, SudoPolicy};
use crate::errscope::{self, SkipOnError};
use crate::filter::{load_rules_file, literal_dataset_rule, FilterSpec, RuleList};
use crate::pipeline::DryRun;
use crate::planner::WorkItem;
use crate::replicator::Outcome;

const EXIT_OK: u8 = 0;
const EXIT_USAGE: u8 = 1;
const EXIT_ZFS_ERROR: u8 = 2;
const EXIT_NETWORK_ERROR: u8 = 3;
const EXIT_INTERRUPTED: u8 = 4;

fn build_cli() -> Command {
    Command::new("zfs-replicate")
        .about("Recursively replicate ZFS snapshot trees between datasets, locally or over SSH.")
        .arg(Arg::new("source").index(1).required(true).help("Source dataset: [[user@]host:]pool/path, or +file of src<TAB>dst pairs."))
        .arg(Arg::new("destination").index(2).required(false).help("Destination dataset (omit when <source> is a +file)."))
        .arg(Arg::new("recursive").short('r').long("recursive").action(ArgAction::SetTrue))
        .arg(Arg::new("force").short('F').long("force").action(ArgAction::SetTrue))
        .arg(Arg::new("force-once").long("force-once").action(ArgAction::SetTrue))
        .arg(Arg::new("force-unmount").long("force-unmount").action(ArgAction::SetTrue))
        .arg(Arg::new("no-privilege-elevation").long("no-privilege-elevation").action(ArgAction::SetTrue))
        .arg(Arg::new("no-stream").long("no-stream").action(ArgAction::SetTrue))
        .arg(Arg::new("no-create-bookmark").long("no-create-bookmark").action(ArgAction::SetTrue))
        .arg(Arg::new("no-bookmarks").long("no-bookmarks").action(ArgAction::SetTrue).help("Never read or rely on bookmarks, even if supported."))
        .arg(Arg::new("skip-missing-snapshots").long("skip-missing-snapshots").value_parser(["fail", "dataset", "continue"]).default_value("fail"))
        .arg(Arg::new("skip-on-error").long("skip-on-error").value_parser(["fail", "tree", "dataset"]).default_value("dataset"))
        .arg(Arg::new("delete-missing-snapshots").long("delete-missing-snapshots").action(ArgAction::SetTrue))
        .arg(Arg::new("delete-missing-datasets").long("delete-missing-datasets").action(ArgAction::SetTrue))
        .arg(Arg::new("dryrun").long("dryrun").value_parser(["send", "recv"]))
        .arg(Arg::new("verbose").short('v').long("verbose").action(ArgAction::SetTrue))
        .arg(Arg::new("progress").long("progress").action(ArgAction::SetTrue).help("Pipe the transfer through pv for a progress display."))
        .arg(Arg::new("include-dataset").long("include-dataset").action(ArgAction::Append))
        .arg(Arg::new("exclude-dataset").long("exclude-dataset").action(ArgAction::Append))
        .arg(Arg::new("include-snapshot").long("include-snapshot").action(ArgAction::Append))
        .arg(Arg::new("exclude-snapshot").long("exclude-snapshot").action(ArgAction::Append))
        .arg(Arg::new("exclude-dataset-file").long("exclude-dataset-file"))
        .arg(Arg::new("src-user").long("src-user"))
        .arg(Arg::new("dst-user").long("dst-user"))
        .arg(Arg::new("src-port").long("src-port").value_parser(clap::value_parser!(u16)))
        .arg(Arg::new("dst-port").long("dst-port").value_parser(clap::value_parser!(u16)))
        .arg(Arg::new("src-identity-file").long("src-identity-file"))
        .arg(Arg::new("dst-identity-file").long("dst-identity-file"))
        .arg(Arg::new("exclude-envvar").long("exclude-envvar").action(ArgAction::Append))
        .arg(Arg::new("exclude-dataset-property").long("exclude-dataset-property").action(ArgAction::Append).help("Skip reconciliation for datasets where PROP (or PROP=VALUE) matches; repeatable."))
        .arg(Arg::new("metadata-timeout").long("metadata-timeout").value_parser(clap::value_parser!(u64)).help("Seconds before a metadata probe (zfs list, zfs get) is abandoned."))
        .arg(Arg::new("zfs-program").long("zfs-program").help("Program name for the zfs role, or \"-\" to disable."))
        .arg(Arg::new("ssh-program").long("ssh-program").help("Program name for the ssh role, or \"-\" to disable."))
        .arg(Arg::new("zstd-program").long("zstd-program").help("Program name for the zstd role, or \"-\" to disable."))
        .arg(Arg::new("mbuffer-program").long("mbuffer-program").help("Program name for the mbuffer role, or \"-\" to disable."))
        .arg(Arg::new("pv-program").long("pv-program").help("Program name for the pv role, or \"-\" to disable."))
        .arg(Arg::new("sudo-program").long("sudo-program").help("Program name for the sudo role, or \"-\" to disable."))
}

fn program_override(matches: &clap::ArgMatches, flag: &str, role: crate::endpoint::ProgramRole) -> Option<(crate::endpoint::ProgramRole, crate::endpoint::ProgramPath)> {
    matches.get_one::<String>(flag).map(|value| {
        let path = if value == "-" { crate::endpoint::ProgramPath::Disabled } else { crate::endpoint::ProgramPath::Named(value.clone()) };
        (role, path)
    })
}

fn main() -> ExitCode {
    env_logger::init();
    let matches = build_cli().get_matches();

    let config = match parse_run_config(&matches) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("usage error: {err:#}");
            return ExitCode::from(EXIT_USAGE);
        }
    };

    let pairs = match resolve_pairs(&matches) {
        Ok(pairs) => pairs,
        Err(err) => {
            eprintln!("usage error: {err:#}");
            return ExitCode::from(EXIT_USAGE);
        }
    };

    install_child_env(&config.exclude_envvars);
    let ctx = Arc::new(RunContext::new(config));
    install_signal_handler(Arc::clone(&ctx));
    run(&ctx, pairs)
}

/// Filters the process's own environment per spec §6 ("environment variables are
/// filtered per the include/exclude-envvar rules; default excludes nothing") and
/// installs the result as what every spawned child inherits from here on, rather
/// than the parent's full, unfiltered environment.
fn install_child_env(exclude_envvars: &[String]) {
    let exclude = match filter::RuleList::compile(exclude_envvars) {
        Ok(rules) => rules,
        Err(err) => {
            log::warn!("invalid --exclude-envvar pattern, excluding nothing: {err:#}");
            filter::RuleList::default()
        }
    };
    let spec = FilterSpec::new(filter::RuleList::default(), exclude);
    command::set_child_env(filter::filter_env_vars(std::env::vars(), &spec));
}

/// Installs the SIGINT/SIGTERM handler described in spec §5: flips `ctx`'s shared
/// cancellation flag rather than terminating the process outright, so in-flight
/// pipeline stages get torn down cleanly by the Command Runner instead of being
/// killed out from under a half-written `zfs receive`.
fn install_signal_handler(ctx: Arc<RunContext>) {
    if let Err(err) = ctrlc::set_handler(move || ctx.request_cancellation()) {
        log::warn!("could not install SIGINT/SIGTERM handler: {err}");
    }
}

fn resolve_pairs(matches: &clap::ArgMatches) -> anyhow::Result<Vec<(String, String)>> {
    let source = matches.get_one::<String>("source").expect("required");
    if let Some(path) = source.strip_prefix('+') {
        return load_dataset_pairs_file(std::path::Path::new(path));
    }
    let destination = matches
        .get_one::<String>("destination")
        .ok_or_else(|| anyhow::anyhow!("<destination> is required unless <source> is a +file"))?;
    Ok(vec![(source.clone(), destination.clone())])
}

fn parse_run_config(matches: &clap::ArgMatches) -> anyhow::Result<RunConfig> {
    let dry_run = match matches.get_one::<String>("dryrun").map(String::as_str) {
        Some("send") => DryRun::Send,
        Some("recv") => DryRun::Recv,
        _ => DryRun::Off,
    };
    let skip_missing_snapshots = match matches.get_one::<String>("skip-missing-snapshots").map(String::as_str) {
        Some("dataset") => SkipMissingSnapshots::Dataset,
        Some("continue") => SkipMissingSnapshots::Continue,
        _ => SkipMissingSnapshots::Fail,
    };
    let skip_on_error = match matches.get_one::<String>("skip-on-error").map(String::as_str) {
        Some("fail") => SkipOnError::Fail,
        Some("tree") => SkipOnError::Tree,
        _ => SkipOnError::Dataset,
    };

    let mut exclude_datasets: Vec<String> = matches
        .get_many::<String>("exclude-dataset")
        .unwrap_or_default()
        .map(|s| literal_dataset_rule(s))
        .collect();
    if let Some(path) = matches.get_one::<String>("exclude-dataset-file") {
        exclude_datasets.extend(load_rules_file(std::path::Path::new(path))?);
    }

    Ok(RunConfig {
        recursive: matches.get_flag("recursive"),
        force: matches.get_flag("force"),
        force_once: matches.get_flag("force-once"),
        force_unmount: matches.get_flag("force-unmount"),
        no_privilege_elevation: matches.get_flag("no-privilege-elevation"),
        no_stream: matches.get_flag("no-stream"),
        no_create_bookmark: matches.get_flag("no-create-bookmark"),
        include_bookmarks: !matches.get_flag("no-bookmarks"),
        skip_missing_snapshots,
        skip_on_error,
        delete_missing_snapshots: matches.get_flag("delete-missing-snapshots"),
        delete_missing_datasets: matches.get_flag("delete-missing-datasets"),
        dry_run,
        verbose_send: matches.get_flag("verbose"),
        verbose_recv: matches.get_flag("verbose"),
        show_progress: matches.get_flag("progress"),
        metadata_timeout: matches
            .get_one::<u64>("metadata-timeout")
            .map(|secs| std::time::Duration::from_secs(*secs))
            .unwrap_or_else(|| RunConfig::default().metadata_timeout),
        src_ssh: SshOpts {
            user: matches.get_one::<String>("src-user").cloned(),
            port: matches.get_one::<u16>("src-port").copied(),
            identity_file: matches.get_one::<String>("src-identity-file").cloned(),
            ..SshOpts::default()
        },
        dst_ssh: SshOpts {
            user: matches.get_one::<String>("dst-user").cloned(),
            port: matches.get_one::<u16>("dst-port").copied(),
            identity_file: matches.get_one::<String>("dst-identity-file").cloned(),
            ..SshOpts::default()
        },
        src_sudo: sudo_policy(matches),
        dst_sudo: sudo_policy(matches),
        include_datasets: matches.get_many::<String>("include-dataset").unwrap_or_default().map(|s| literal_dataset_rule(s)).collect(),
        exclude_datasets,
        include_snapshots: matches.get_many::<String>("include-snapshot").unwrap_or_default().cloned().collect(),
        exclude_snapshots: matches.get_many::<String>("exclude-snapshot").unwrap_or_default().cloned().collect(),
        exclude_envvars: matches.get_many::<String>("exclude-envvar").unwrap_or_default().cloned().collect(),
        exclude_dataset_properties: matches
            .get_many::<String>("exclude-dataset-property")
            .unwrap_or_default()
            .map(|s| s.parse().expect("PropertyRule::from_str is infallible"))
            .collect(),
        program_overrides: [
            program_override(matches, "zfs-program", crate::endpoint::ProgramRole::Zfs),
            program_override(matches, "ssh-program", crate::endpoint::ProgramRole::Ssh),
            program_override(matches, "zstd-program", crate::endpoint::ProgramRole::Zstd),
            program_override(matches, "mbuffer-program", crate::endpoint::ProgramRole::Mbuffer),
            program_override(matches, "pv-program", crate::endpoint::ProgramRole::Pv),
            program_override(matches, "sudo-program", crate::endpoint::ProgramRole::Sudo),
        ]
        .into_iter()
        .flatten()
        .collect(),
        ..RunConfig::default()
    })
}

fn sudo_policy(matches: &clap::ArgMatches) -> SudoPolicy {
    if matches.get_flag("no-privilege-elevation") {
        SudoPolicy::NeverElevate
    } else {
        SudoPolicy::WhenNeeded
    }
}

fn build_endpoint(spec: &str, ssh: SshOpts, sudo: SudoPolicy, program_overrides: &[(crate::endpoint::ProgramRole, crate::endpoint::ProgramPath)]) -> anyhow::Result<(Endpoint, DatasetRef)> {
    let (host_part, dataset_part) = split_spec(spec)?;
    let dataset: DatasetRef = dataset_part.parse()?;
    let host: HostSpec = host_part.parse()?;
    let mut endpoint = Endpoint::new(host, ssh, sudo);
    for (role, path) in program_overrides {
        endpoint.set_program(*role, path.clone());
    }
    Ok((endpoint, dataset))
}

fn run(ctx: &RunContext, pairs: Vec<(String, String)>) -> ExitCode {
    let dataset_filter = FilterSpec::new(
        RuleList::compile(&ctx.config.include_datasets).unwrap_or_default(),
        RuleList::compile(&ctx.config.exclude_datasets).unwrap_or_default(),
    );
    let snapshot_filter = FilterSpec::new(
        RuleList::compile(&ctx.config.include_snapshots).unwrap_or_default(),
        RuleList::compile(&ctx.config.exclude_snapshots).unwrap_or_default(),
    );

    let mut had_failure = false;
    let mut network_error = false;

    for (src_spec, dst_spec) in pairs {
        let (src_endpoint, src_root) = match build_endpoint(&src_spec, ctx.config.src_ssh.clone(), ctx.config.src_sudo) {
            Ok(v) => v,
            Err(err) => {
                eprintln!("usage error parsing {src_spec:?}: {err:#}");
                return ExitCode::from(EXIT_USAGE);
            }
        };
        let (dst_endpoint, dst_root) = match build_endpoint(&dst_spec, ctx.config.dst_ssh.clone(), ctx.config.dst_sudo) {
            Ok(v) => v,
            Err(err) => {
                eprintln!("usage error parsing {dst_spec:?}: {err:#}");
                return ExitCode::from(EXIT_USAGE);
            }
        };

        let items = match planner::plan(&src_endpoint, &src_root, &dst_root, ctx.config.recursive, &dataset_filter, ctx.config.metadata_timeout) {
            Ok(items) => items,
            Err(err) => {
                log::error!("{err:#}");
                return ExitCode::from(EXIT_ZFS_ERROR);
            }
        };

        let mut skip_subtrees: Vec<WorkItem> = Vec::new();
        for item in &items {
            if skip_subtrees.iter().any(|skipped| errscope::is_subtree_of(item, skipped)) {
                log::info!("{}: skipped (ancestor already failed)", item.src);
                continue;
            }

            if ctx.is_cancelled() {
                eprintln!("interrupted");
                return ExitCode::from(EXIT_INTERRUPTED);
            }

            let outcome = replicator::replicate_one(ctx, &src_endpoint, &dst_endpoint, item, &snapshot_filter);
            match outcome {
                Outcome::Done(msg) => {
                    log::info!("{msg}");
                    reconcile_snapshots(ctx, &src_endpoint, &dst_endpoint, item, &snapshot_filter);
                }
                Outcome::Skipped(msg) => log::info!("skipped: {msg}"),
                Outcome::Failed(err) => {
                    if matches!(err.downcast_ref::<error::EngineError>(), Some(error::EngineError::Cancelled)) {
                        eprintln!("interrupted");
                        return ExitCode::from(EXIT_INTERRUPTED);
                    }
                    log::error!("{}: {err:#}", item.src);
                    let is_network = err.downcast_ref::<error::EngineError>().map(is_endpoint_error).unwrap_or(false);
                    network_error |= is_network;

                    let dst_existed = inventory::list_entries(&dst_endpoint, item.dst.fullname(), false, ctx.config.metadata_timeout).is_ok();
                    match errscope::decide(ctx.config.skip_on_error, dst_existed) {
                        errscope::Verdict::AbortRun => {
                            had_failure = true;
                            break;
                        }
                        errscope::Verdict::SkipSubtree => {
                            skip_subtrees.push(item.clone());
                            had_failure = true;
                        }
                        errscope::Verdict::SkipDatasetOnly => {
                            had_failure = true;
                        }
                    }
                }
            }
        }

        if ctx.config.delete_missing_datasets {
            reconcile_datasets(ctx, &src_endpoint, &dst_endpoint, &src_root, &dst_root, ctx.config.recursive, &dataset_filter);
        }
    }

    if had_failure {
        return ExitCode::from(if network_error { EXIT_NETWORK_ERROR } else { EXIT_ZFS_ERROR });
    }
    ExitCode::from(EXIT_OK)
}

fn is_endpoint_error(err: &error::EngineError) -> bool {
    matches!(err, error::EngineError::EndpointError { .. })
}

/// `delete-missing-snapshots` (spec §4.7): runs right after a dataset replicates
/// cleanly, comparing its actual snapshot sets rather than reusing the candidates
/// INSPECT already filtered, since the destination may carry snapshots this run
/// never touched.
fn reconcile_snapshots(ctx: &RunContext, src_endpoint: &Endpoint, dst_endpoint: &Endpoint, item: &WorkItem, snapshot_filter: &FilterSpec) {
    if !ctx.config.delete_missing_snapshots {
        return;
    }
    if dataset_property_excluded(ctx, dst_endpoint, item.dst.fullname()) {
        log::info!("{}: excluded from reconciliation by dataset property", item.dst);
        return;
    }
    let src_entries = match inventory::list_entries(src_endpoint, item.src.fullname(), false, ctx.config.metadata_timeout) {
        Ok(entries) => entries,
        Err(err) => {
            log::error!("{}: could not list source snapshots for reconciliation: {err:#}", item.src);
            return;
        }
    };
    let dst_entries = match inventory::list_entries(dst_endpoint, item.dst.fullname(), false, ctx.config.metadata_timeout) {
        Ok(entries) => entries,
        Err(err) => {
            log::error!("{}: could not list destination snapshots for reconciliation: {err:#}", item.dst);
            return;
        }
    };
    let commands = reconcile::plan_missing_snapshot_destroys(item.dst.fullname(), &src_entries, &dst_entries, snapshot_filter);
    for range in &commands {
        match reconcile::destroy(dst_endpoint, range, ctx.config.force_unmount, ctx.config.metadata_timeout) {
            Ok(()) => log::info!("destroyed {range}"),
            Err(err) => log::error!("could not destroy {range}: {err:#}"),
        }
    }
}

/// `delete-missing-datasets` (spec §4.7): run once per `(src_root, dst_root)` pair
/// after every selected `WorkItem` has been attempted, so it sees the destination
/// tree's final shape rather than a snapshot mid-run.
fn reconcile_datasets(ctx: &RunContext, src_endpoint: &Endpoint, dst_endpoint: &Endpoint, src_root: &DatasetRef, dst_root: &DatasetRef, recursive: bool, dataset_filter: &FilterSpec) {
    if !recursive {
        return;
    }
    let timeout = ctx.config.metadata_timeout;
    let dst_tree = match planner::list_descendants(dst_endpoint, dst_root, timeout) {
        Ok(tree) => tree,
        Err(err) => {
            log::error!("{dst_root}: could not list destination tree for reconciliation: {err:#}");
            return;
        }
    };
    let src_tree: Vec<String> = match planner::list_descendants(src_endpoint, src_root, timeout) {
        Ok(tree) => tree.into_iter().filter(|rel| dataset_filter.selects(rel)).collect(),
        Err(err) => {
            log::error!("{src_root}: could not list source tree for reconciliation: {err:#}");
            return;
        }
    };

    let mut empty_subtrees = Vec::new();
    for rel in &dst_tree {
        let dst = dst_root.join(rel);
        match inventory::list_entries(dst_endpoint, dst.fullname(), false, timeout) {
            Ok(entries) if entries.is_empty() => empty_subtrees.push(rel.clone()),
            Ok(_) => {}
            Err(err) => log::error!("{dst}: could not probe for reconciliation: {err:#}"),
        }
    }

    let condemned = reconcile::plan_missing_dataset_destroys(&dst_tree, &src_tree, &empty_subtrees);
    for rel in condemned {
        let dst = dst_root.join(rel);
        if dataset_property_excluded(ctx, dst_endpoint, dst.fullname()) {
            log::info!("{dst}: excluded from reconciliation by dataset property");
            continue;
        }
        let inner = vec!["zfs".to_string(), "destroy".to_string(), "-r".to_string(), dst.fullname().to_string()];
        let argv = dst_endpoint.build_argv(&inner, true);
        match command::run_checked(&argv, Some(timeout)) {
            Ok(()) => log::info!("destroyed dataset {dst}"),
            Err(err) => log::error!("could not destroy dataset {dst}: {err:#}"),
        }
    }
}

/// The reconciliation passes' third gate (spec §4.7): probes `--exclude-dataset-property`
/// rules against `dataset` and reports whether it should be left alone. Probe failures are
/// treated as non-matching rather than aborting the reconciliation pass, since a dataset
/// that no longer exists (already destroyed by a prior rule, say) trivially has nothing
/// left to protect.
fn dataset_property_excluded(ctx: &RunContext, endpoint: &Endpoint, dataset: &str) -> bool {
    if ctx.config.exclude_dataset_properties.is_empty() {
        return false;
    }
    match reconcile::property_excludes(endpoint, dataset, &ctx.config.exclude_dataset_properties, ctx.config.metadata_timeout) {
        Ok(excluded) => excluded,
        Err(err) => {
            log::error!("{dataset}: could not probe exclude-dataset-property: {err:#}");
            false
        }
    }
}
