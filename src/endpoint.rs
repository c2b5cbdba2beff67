//! Host Endpoint (spec §4.2): decides whether a command needs SSH wrapping and/or
//! `sudo` wrapping, builds the resulting argv, and caches auxiliary-program
//! capability probes per endpoint.
//!
//! Grounded on the teacher's `Machine` (`Local`/`Remote { host }`, the
//! `ssh {host} -- '{cmd}'` wrapping in every `Machine` method), generalized from a
//! single shell string built by `format!` into an argv `Vec<String>` built without a
//! shell (per spec §4.1's contract and §9's redesign flag), with `user`/`port`/
//! `identity file`/`extra ssh opts` added, and with `other_examples/.../rdump`'s
//! `ssh host sudo zfs ...` pattern as the precedent for wrapping sudo *inside* the
//! ssh-delivered remote command rather than around the local `ssh` invocation.

use std::cell::OnceCell;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Which program role a capability probe or `--xxx-program` override concerns.
/// A role mapped to `Disabled` ("-") is treated identically to "probed and absent":
/// the Pipeline Builder downgrades gracefully rather than looking the role up and
/// finding nothing (spec §9's redesign flag on dynamic program-path substitution).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ProgramRole {
    Zfs,
    Ssh,
    Zstd,
    Mbuffer,
    Pv,
    Sudo,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProgramPath {
    /// Use this literal program name/path.
    Named(String),
    /// `--xxx-program=-`: the role is disabled outright.
    Disabled,
}

impl ProgramPath {
    pub fn as_enabled(&self) -> Option<&str> {
        match self {
            ProgramPath::Named(s) => Some(s.as_str()),
            ProgramPath::Disabled => None,
        }
    }
}

/// Per-run-constant SSH connection parameters. `None` fields fall back to the
/// user's own `ssh_config`/defaults.
#[derive(Clone, Debug, Default)]
pub struct SshOpts {
    pub user: Option<String>,
    pub port: Option<u16>,
    pub identity_file: Option<String>,
    pub config_file: Option<String>,
    pub cipher: Option<String>,
    pub extra_opts: Vec<String>,
}

/// Sudo policy for an endpoint (spec §4.2).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SudoPolicy {
    /// Wrap state-changing ZFS commands in `sudo` unless already root.
    WhenNeeded,
    /// Never add `sudo`, even if the command would then fail for lack of privilege.
    NeverElevate,
}

/// Auto-detected (or overridden) capabilities of one endpoint, probed once per run
/// and cached here rather than in a process-global (spec §9's redesign flag).
#[derive(Debug, Default)]
struct CapabilityCache {
    zstd: OnceCell<bool>,
    mbuffer: OnceCell<bool>,
    pv: OnceCell<bool>,
    bookmarks_supported: OnceCell<bool>,
}

/// A bundle of (user, host, port, private key, extra ssh opts, program paths, sudo
/// policy) describing how to invoke commands on one side of a replication. Three
/// logical endpoints exist per run: source, destination, local ("-").
pub struct Endpoint {
    host: HostSpec,
    ssh: SshOpts,
    sudo: SudoPolicy,
    programs: std::collections::HashMap<ProgramRole, ProgramPath>,
    caps: CapabilityCache,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostSpec {
    Local,
    Remote(String),
}

#[derive(Error, Debug)]
pub enum EndpointParseError {
    #[error("{0}: a colon is only allowed at the beginning of a spec, before any slash")]
    ColonAfterSlash(String),
    #[error("{0}: no characters after the host-separating colon")]
    EmptyAfterColon(String),
}

impl FromStr for HostSpec {
    type Err = EndpointParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.len() {
            0 => HostSpec::Local,
            _ if s == "-" => HostSpec::Local,
            _ => HostSpec::Remote(s.to_string()),
        })
    }
}

impl fmt::Display for HostSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostSpec::Local => write!(f, "localhost"),
            HostSpec::Remote(h) => write!(f, "{h}"),
        }
    }
}

/// Splits a `[[user@]host:]pool/path` spec into its host-spec and dataset-spec
/// halves. Grounded on the teacher's `parse_spec`, generalized to also recognize a
/// leading `user@` within the host portion (left for [`HostSpec`]/ssh argv
/// construction to interpret, since `user@host` is a single opaque token to `ssh`).
pub fn split_spec(value: &str) -> Result<(&str, &str), EndpointParseError> {
    let first_colon = value.find(':');
    let first_slash = value.find('/');

    if let (Some(cidx), Some(sidx)) = (first_colon, first_slash) {
        if cidx > sidx {
            return Err(EndpointParseError::ColonAfterSlash(value.into()));
        }
    }

    let (host_part, dataset_part) = match first_colon {
        None => ("", value),
        Some(idx) => (&value[..idx], &value[idx + 1..]),
    };
    if dataset_part.is_empty() {
        return Err(EndpointParseError::EmptyAfterColon(value.into()));
    }
    Ok((host_part, dataset_part))
}

impl Endpoint {
    pub fn new(host: HostSpec, ssh: SshOpts, sudo: SudoPolicy) -> Self {
        Endpoint { host, ssh, sudo, programs: Default::default(), caps: Default::default() }
    }

    pub fn is_local(&self) -> bool {
        matches!(self.host, HostSpec::Local)
    }

    pub fn host(&self) -> &HostSpec {
        &self.host
    }

    pub fn set_program(&mut self, role: ProgramRole, path: ProgramPath) {
        self.programs.insert(role, path);
    }

    fn program_name(&self, role: ProgramRole, default: &str) -> Option<String> {
        match self.programs.get(&role) {
            Some(ProgramPath::Disabled) => None,
            Some(ProgramPath::Named(name)) => Some(name.clone()),
            None => Some(default.to_string()),
        }
    }

    /// Whether `role` is usable on this endpoint: not explicitly disabled, and (for
    /// auxiliary programs) successfully probed. `zfs` and `ssh` are never probed —
    /// a missing `zfs` is fatal per spec §4.2, so callers simply invoke it and let
    /// that command fail with a clear error instead of silently downgrading.
    pub fn capability(&self, role: ProgramRole) -> bool {
        if self.programs.get(&role) == Some(&ProgramPath::Disabled) {
            return false;
        }
        let cache_cell = match role {
            ProgramRole::Zstd => &self.caps.zstd,
            ProgramRole::Mbuffer => &self.caps.mbuffer,
            ProgramRole::Pv => &self.caps.pv,
            ProgramRole::Zfs | ProgramRole::Ssh | ProgramRole::Sudo => return true,
        };
        *cache_cell.get_or_init(|| self.probe(role))
    }

    /// Probes for an auxiliary program's presence. Cached in `self.caps` so it runs
    /// at most once per endpoint per run, regardless of how many datasets are
    /// replicated through it.
    fn probe(&self, role: ProgramRole) -> bool {
        let Some(program) = self.program_name(role, default_program_name(role)) else {
            return false;
        };
        self.run_probe(&program)
    }

    fn run_probe(&self, program: &str) -> bool {
        let argv = self.build_argv(&[program.to_string(), "--version".to_string()], false);
        match subprocess::Exec::cmd(&argv[0])
            .args(&argv[1..])
            .stdout(subprocess::Redirection::Pipe)
            .stderr(subprocess::Redirection::Pipe)
            .capture()
        {
            Ok(captured) => captured.exit_status.success() || captured.exit_status == subprocess::ExitStatus::Exited(1),
            Err(_) => false,
        }
    }

    /// Records whether bookmarks are usable on this endpoint (some very old pools
    /// lack the bookmark feature flag). Populated once by `inventory.rs` after a
    /// `zfs get -Hp bookmarks <pool>` probe, then consulted by the replicator.
    pub fn set_bookmarks_supported(&self, supported: bool) {
        let _ = self.caps.bookmarks_supported.set(supported);
    }

    pub fn bookmarks_supported(&self) -> Option<bool> {
        self.caps.bookmarks_supported.get().copied()
    }

    /// Builds the final argv to actually spawn for a logical command `inner_argv`.
    /// `privileged` requests `sudo` wrapping per this endpoint's [`SudoPolicy`]; it is
    /// only ever `true` for the state-changing ZFS subcommands (create, rollback,
    /// destroy, send, receive, bookmark) per spec §4.2.
    ///
    /// Locally this is `inner_argv` unchanged (plus a `sudo` prefix). Remotely, per
    /// spec §4.1, the remote command line is built by shell-quoting each token of
    /// `inner_argv` (with the `sudo` prefix already applied) and passed as a single
    /// argument to `ssh` — never by interpolating names into one shell string.
    pub fn build_argv(&self, inner_argv: &[String], privileged: bool) -> Vec<String> {
        let mut inner = inner_argv.to_vec();
        if privileged && self.wants_sudo() {
            let sudo = self.program_name(ProgramRole::Sudo, "sudo").unwrap_or_else(|| "sudo".into());
            inner.insert(0, sudo);
        }

        match &self.host {
            HostSpec::Local => inner,
            HostSpec::Remote(host) => {
                let mut argv = vec![self.ssh_program()];
                argv.extend(self.ssh_flags());
                argv.push(self.ssh_destination(host));
                argv.push(shell_words::join(&inner));
                argv
            }
        }
    }

    /// Builds the final argv for a whole shell pipeline run on this endpoint (e.g.
    /// `zfs send ... | zstd -c -1 | mbuffer -q`), rather than a single program
    /// invocation. `segments` is each pipe stage's own argv in pipeline order;
    /// `privileged_index`, if any, names the one segment (the ZFS command) that gets
    /// `sudo`-prefixed, since wrapping the whole pipeline in `sudo` would also
    /// elevate stages that don't need it.
    ///
    /// Locally, a single segment passes through [`Self::build_argv`] unchanged (so
    /// existing single-command callers are unaffected); multiple segments are joined
    /// with `sh -c` so the shell, not this process, interprets the `|`. Remotely, the
    /// whole joined pipeline is shell-quoted once and passed as the single remote
    /// command to one `ssh` invocation — this is what keeps compression/buffering
    /// stages running on the side of the network hop they're meant to shield (spec
    /// §4.6), inside the one SSH connection for that leg, rather than as separate
    /// un-wrapped local stages after a second, redundant SSH hop.
    pub fn build_pipeline_argv(&self, segments: &[Vec<String>], privileged_index: Option<usize>) -> Vec<String> {
        assert!(!segments.is_empty(), "a pipeline needs at least one segment");
        if segments.len() == 1 {
            return self.build_argv(&segments[0], privileged_index == Some(0));
        }

        let quoted: Vec<String> = segments
            .iter()
            .enumerate()
            .map(|(i, seg)| {
                if privileged_index == Some(i) && self.wants_sudo() {
                    let sudo = self.program_name(ProgramRole::Sudo, "sudo").unwrap_or_else(|| "sudo".into());
                    let mut with_sudo = seg.clone();
                    with_sudo.insert(0, sudo);
                    shell_words::join(&with_sudo)
                } else {
                    shell_words::join(seg)
                }
            })
            .collect();
        let pipeline = quoted.join(" | ");

        match &self.host {
            HostSpec::Local => vec!["sh".to_string(), "-c".to_string(), pipeline],
            HostSpec::Remote(host) => {
                let mut argv = vec![self.ssh_program()];
                argv.extend(self.ssh_flags());
                argv.push(self.ssh_destination(host));
                argv.push(pipeline);
                argv
            }
        }
    }

    fn wants_sudo(&self) -> bool {
        matches!(self.sudo, SudoPolicy::WhenNeeded) && !running_as_root()
    }

    fn ssh_program(&self) -> String {
        self.program_name(ProgramRole::Ssh, "ssh").unwrap_or_else(|| "ssh".into())
    }

    fn ssh_destination(&self, host: &str) -> String {
        match &self.ssh.user {
            Some(user) if !host.contains('@') => format!("{user}@{host}"),
            _ => host.to_string(),
        }
    }

    fn ssh_flags(&self) -> Vec<String> {
        let mut flags = Vec::new();
        if let Some(port) = self.ssh.port {
            flags.push("-p".into());
            flags.push(port.to_string());
        }
        if let Some(key) = &self.ssh.identity_file {
            flags.push("-i".into());
            flags.push(key.clone());
        }
        if let Some(cipher) = &self.ssh.cipher {
            flags.push("-c".into());
            flags.push(cipher.clone());
        }
        if let Some(config) = &self.ssh.config_file {
            flags.push("-F".into());
            flags.push(config.clone());
        }
        // Connection multiplexing: every command issued against this endpoint over
        // the life of the run shares one TCP/auth handshake (spec §4.2, §5).
        flags.push("-o".into());
        flags.push("ControlMaster=auto".into());
        flags.push("-o".into());
        flags.push("ControlPath=~/.ssh/cm-zfs-replicate-%C".to_string());
        flags.push("-o".into());
        flags.push("ControlPersist=600".into());
        flags.extend(self.ssh.extra_opts.iter().cloned());
        flags
    }
}

fn default_program_name(role: ProgramRole) -> &'static str {
    match role {
        ProgramRole::Zfs => "zfs",
        ProgramRole::Ssh => "ssh",
        ProgramRole::Zstd => "zstd",
        ProgramRole::Mbuffer => "mbuffer",
        ProgramRole::Pv => "pv",
        ProgramRole::Sudo => "sudo",
    }
}

fn running_as_root() -> bool {
    nix::unistd::Uid::effective().is_root()
}

/// Reads one `src\tdst` pair per line from a `+file` dataset-list indirection (spec
/// §6, §9: "pure loaders... kept outside the Filter Engine proper"). Blank lines and
/// lines starting with `#` are skipped.
pub fn load_dataset_pairs_file(path: &std::path::Path) -> anyhow::Result<Vec<(String, String)>> {
    let contents = std::fs::read_to_string(path)?;
    let mut pairs = Vec::new();
    for (lineno, line) in contents.lines().enumerate() {
        let line = line.trim_end();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.splitn(2, '\t');
        let src = parts.next().unwrap_or_default();
        let dst = parts.next().ok_or_else(|| {
            anyhow::anyhow!("{}:{}: expected `src<TAB>dst`, got {:?}", path.display(), lineno + 1, line)
        })?;
        pairs.push((src.to_string(), dst.to_string()));
    }
    Ok(pairs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_local_spec() {
        let (host, ds) = split_spec("tank/foo").unwrap();
        assert_eq!(host, "");
        assert_eq!(ds, "tank/foo");
    }

    #[test]
    fn splits_remote_spec() {
        let (host, ds) = split_spec("root@baal:tank/foo").unwrap();
        assert_eq!(host, "root@baal");
        assert_eq!(ds, "tank/foo");
    }

    #[test]
    fn rejects_colon_after_slash() {
        let err = split_spec("tank/foo:bar").unwrap_err();
        assert!(matches!(err, EndpointParseError::ColonAfterSlash(_)));
    }

    #[test]
    fn local_argv_passes_through_unwrapped() {
        let ep = Endpoint::new(HostSpec::Local, SshOpts::default(), SudoPolicy::NeverElevate);
        let argv = ep.build_argv(&["zfs".into(), "list".into()], true);
        assert_eq!(argv, vec!["zfs", "list"]);
    }

    #[test]
    fn remote_argv_is_ssh_wrapped_and_shell_quoted() {
        let mut ssh = SshOpts::default();
        ssh.port = Some(2222);
        let ep = Endpoint::new(HostSpec::Remote("baal".into()), ssh, SudoPolicy::NeverElevate);
        let argv = ep.build_argv(&["zfs".into(), "list".into(), "tank/a b".into()], false);
        assert_eq!(argv[0], "ssh");
        assert!(argv.contains(&"-p".to_string()));
        assert!(argv.contains(&"2222".to_string()));
        assert_eq!(argv.last().unwrap(), "zfs list 'tank/a b'");
    }

    #[test]
    fn pipeline_argv_single_segment_matches_build_argv() {
        let ep = Endpoint::new(HostSpec::Remote("baal".into()), SshOpts::default(), SudoPolicy::NeverElevate);
        let segment = vec!["zfs".to_string(), "send".to_string(), "tank/foo@s1".to_string()];
        assert_eq!(ep.build_pipeline_argv(&[segment.clone()], Some(0)), ep.build_argv(&segment, true));
    }

    #[test]
    fn pipeline_argv_joins_remote_segments_into_one_ssh_hop() {
        let ep = Endpoint::new(HostSpec::Remote("baal".into()), SshOpts::default(), SudoPolicy::NeverElevate);
        let segments = vec![
            vec!["zfs".to_string(), "send".to_string(), "tank/foo@s1".to_string()],
            vec!["zstd".to_string(), "-c".to_string(), "-1".to_string()],
            vec!["mbuffer".to_string(), "-q".to_string()],
        ];
        let argv = ep.build_pipeline_argv(&segments, Some(0));
        assert_eq!(argv[0], "ssh");
        assert_eq!(argv.iter().filter(|a| a.as_str() == "ssh").count(), 1, "exactly one ssh hop for the whole pipeline");
        assert_eq!(argv.last().unwrap(), "zfs send tank/foo@s1 | zstd -c -1 | mbuffer -q");
    }

    #[test]
    fn pipeline_argv_privileged_index_need_not_be_first_segment() {
        let ep = Endpoint::new(HostSpec::Remote("baal".into()), SshOpts::default(), SudoPolicy::NeverElevate);
        let segments = vec![vec!["mbuffer".to_string(), "-q".to_string()], vec!["zfs".to_string(), "receive".to_string(), "tank2/foo".to_string()]];
        let argv = ep.build_pipeline_argv(&segments, Some(1));
        assert_eq!(argv.last().unwrap(), "mbuffer -q | zfs receive tank2/foo");
    }

    #[test]
    fn pipeline_argv_local_multi_segment_uses_sh_c() {
        let ep = Endpoint::new(HostSpec::Local, SshOpts::default(), SudoPolicy::NeverElevate);
        let segments = vec![vec!["zfs".to_string(), "send".to_string(), "tank/foo@s1".to_string()], vec!["zstd".to_string(), "-c".to_string()]];
        let argv = ep.build_pipeline_argv(&segments, Some(0));
        assert_eq!(argv, vec!["sh".to_string(), "-c".to_string(), "zfs send tank/foo@s1 | zstd -c".to_string()]);
    }

    #[test]
    fn program_disabled_role_reports_capability_false() {
        let mut ep = Endpoint::new(HostSpec::Local, SshOpts::default(), SudoPolicy::NeverElevate);
        ep.set_program(ProgramRole::Mbuffer, ProgramPath::Disabled);
        assert!(!ep.capability(ProgramRole::Mbuffer));
    }

    #[test]
    fn loads_dataset_pairs_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pairs.tsv");
        std::fs::write(&path, "tank/a\ttank2/a\n# comment\n\ntank/b\ttank2/b\n").unwrap();
        let pairs = load_dataset_pairs_file(&path).unwrap();
        assert_eq!(pairs, vec![
            ("tank/a".to_string(), "tank2/a".to_string()),
            ("tank/b".to_string(), "tank2/b".to_string()),
        ]);
    }
}
