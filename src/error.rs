//! The error taxonomy described in spec §7: a small set of *kinds*, not a pile of
//! one-off variants, so the Retry Controller and Error-Scope Controller can reason
//! about a failure without string-matching it a second time.

use thiserror::Error;

/// One entry of the retry-classification table (§4.8, §7 Open Question #1).
///
/// Checked in declaration order against a command's captured stderr; the first
/// substring match wins. Anything matching none of these is not retryable.
pub struct RetryRule {
    pub substring: &'static str,
    pub kind: RetryKind,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RetryKind {
    /// The destination dataset exists but ZFS hasn't caught up with a just-created
    /// parent yet; retrying after a short backoff usually succeeds.
    TransientNotYetVisible,
    /// Another process (a concurrent pruner, a stuck `zfs hold`) is touching the
    /// same dataset; retrying after backoff usually succeeds.
    TransientBusy,
    /// The network connection dropped mid-command; safe to retry the whole command.
    TransientNetwork,
}

/// Default transient/fatal table (§4.8). Operators may extend this via
/// [`crate::config::RunConfig::extra_retry_rules`]; this table is always consulted
/// first.
pub const RETRYABLE_PATTERNS: &[RetryRule] = &[
    RetryRule { substring: "dataset is busy", kind: RetryKind::TransientBusy },
    RetryRule { substring: "cannot receive", kind: RetryKind::TransientBusy },
    RetryRule { substring: "dataset does not exist", kind: RetryKind::TransientNotYetVisible },
    RetryRule { substring: "Connection reset by peer", kind: RetryKind::TransientNetwork },
    RetryRule { substring: "Connection timed out", kind: RetryKind::TransientNetwork },
    RetryRule { substring: "Broken pipe", kind: RetryKind::TransientNetwork },
];

/// Classify a subprocess's stderr tail against [`RETRYABLE_PATTERNS`] plus any
/// run-specific extra rules.
pub fn classify_stderr(stderr: &str, extra: &[RetryRule]) -> Option<RetryKind> {
    for rule in RETRYABLE_PATTERNS.iter().chain(extra.iter()) {
        if stderr.contains(rule.substring) {
            return Some(rule.kind);
        }
    }
    None
}

/// The argv of a failed command, for error reporting (§7: "dataset pair, last argv,
/// tail of stderr, decision taken").
#[derive(Debug, Clone)]
pub struct FailedCommand {
    pub argv: Vec<String>,
    pub exit_code: i32,
    pub stderr_tail: String,
}

impl std::fmt::Display for FailedCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "`{}` exited with code {}: {}",
            shell_words::join(&self.argv),
            self.exit_code,
            self.stderr_tail.trim_end()
        )
    }
}

#[derive(Error, Debug)]
pub enum EngineError {
    /// Invalid flag combination or unparseable dataset spec. Never retried, exits
    /// the process immediately.
    #[error("usage error: {0}")]
    UsageError(String),

    /// SSH cannot connect, or authentication fails. Retryable.
    #[error("endpoint {endpoint} unreachable: {detail}")]
    EndpointError { endpoint: String, detail: String },

    /// A subprocess exited non-zero. Retryable iff [`classify_stderr`] recognizes the
    /// stderr tail as transient.
    #[error("command failed: {0}")]
    CommandFailed(FailedCommand),

    /// `zfs list`/`zfs get` output didn't parse. Not retryable — a malformed-output
    /// bug should surface immediately, not get retried into an infinite loop.
    #[error("could not parse ZFS output for {context}: {detail}")]
    ProtocolError { context: String, detail: String },

    /// The destination has snapshots not present on the source and `--force` was not
    /// given. Not retryable; scoped via the Error-Scope Controller.
    #[error("{dataset}: destination diverges from source ({detail}); rerun with --force to allow rollback/destroy")]
    PolicyConflict { dataset: String, detail: String },

    /// External cancellation (signal, deadline). Not retryable; pipelines are torn
    /// down cleanly before this propagates.
    #[error("cancelled")]
    Cancelled,
}

impl EngineError {
    /// Whether this error is a candidate for the Retry Controller at all. Usage
    /// errors, protocol errors, policy conflicts, and cancellation are never retried
    /// regardless of their content; only `CommandFailed` and `EndpointError` are
    /// examined further.
    pub fn retry_kind(&self, extra: &[RetryRule]) -> Option<RetryKind> {
        match self {
            EngineError::CommandFailed(cmd) => classify_stderr(&cmd.stderr_tail, extra),
            EngineError::EndpointError { .. } => Some(RetryKind::TransientNetwork),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, anyhow::Error>;
