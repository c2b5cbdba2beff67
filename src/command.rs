//! Command Runner (spec §4.1): spawns subprocesses (local or SSH-wrapped), captures
//! output, enforces timeouts, and composes multi-stage OS-level pipe chains with
//! deterministic teardown.
//!
//! Grounded on the teacher's use of `subprocess::Exec` (including its `Exec | Exec`
//! pipeline operator in `replicate.rs`), generalized from "exactly one send, exactly
//! one recv" to an arbitrary-length stage list, with explicit SIGTERM→SIGKILL
//! teardown and per-stage tagged stderr draining — neither of which the teacher's
//! single-pipeline `.join()` call provided.

use std::io::{BufRead, BufReader};
use std::sync::{mpsc, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use subprocess::{ExitStatus, Popen, PopenConfig, Redirection};

use crate::error::{EngineError, FailedCommand};

/// The filtered environment every spawned child inherits (spec §6: "environment
/// variables are filtered per the include/exclude-envvar rules"), set once at
/// startup by [`set_child_env`]. `None` (the default, and every `#[cfg(test)]` path)
/// means "inherit the parent's environment unfiltered" — `subprocess`'s own default.
static CHILD_ENV: OnceLock<Vec<(String, String)>> = OnceLock::new();

/// Installs the environment every subsequently spawned child process sees, computed
/// once in `main` from `std::env::vars()` filtered by the active envvar
/// [`crate::filter::FilterSpec`]. Calling this more than once is a programming
/// error; only `main` does it, exactly once, before any command runs.
pub fn set_child_env(vars: Vec<(String, String)>) {
    let _ = CHILD_ENV.set(vars);
}

fn child_env() -> Option<Vec<(std::ffi::OsString, std::ffi::OsString)>> {
    CHILD_ENV.get().map(|vars| vars.iter().map(|(k, v)| (k.into(), v.into())).collect())
}

/// The result of running one command to completion (`Runner::run`).
pub struct Captured {
    pub stdout: Vec<u8>,
    pub stderr: String,
    pub exit_code: i32,
}

impl Captured {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

/// A line of tagged stderr from one stage of a running [`Pipeline`].
#[derive(Debug, Clone)]
pub struct StageLine {
    pub stage_label: String,
    pub line: String,
}

/// One process in a command pipeline, before it is spawned.
#[derive(Debug)]
pub struct Stage {
    pub label: String,
    pub argv: Vec<String>,
}

impl Stage {
    pub fn new(label: impl Into<String>, argv: Vec<String>) -> Self {
        Stage { label: label.into(), argv }
    }
}

/// Runs a single command to completion and captures its output. `timeout` is the
/// metadata-probe timeout described in spec §5; transfer-stage commands should use
/// `None` (no timeout — a slow link is not a bug).
pub fn run(argv: &[String], timeout: Option<Duration>) -> anyhow::Result<Captured> {
    if argv.is_empty() {
        anyhow::bail!("command runner: empty argv");
    }
    let mut popen = Popen::create(
        argv,
        PopenConfig {
            stdout: Redirection::Pipe,
            stderr: Redirection::Pipe,
            env: child_env(),
            ..Default::default()
        },
    )
    .with_context(|| format!("failed to spawn {}", shell_words::join(argv)))?;

    let (stdout, stderr) = wait_and_communicate(&mut popen, timeout)?;
    let exit_code = exit_code_of(popen.wait().context("failed to reap child")?);
    Ok(Captured { stdout, stderr: String::from_utf8_lossy(&stderr).into_owned(), exit_code })
}

/// Runs a single command, returning `Err(EngineError::CommandFailed)` on non-zero
/// exit, with the argv and stderr tail attached for diagnostics (spec §7).
pub fn run_checked(argv: &[String], timeout: Option<Duration>) -> anyhow::Result<Captured> {
    let captured = run(argv, timeout)?;
    if !captured.success() {
        return Err(EngineError::CommandFailed(FailedCommand {
            argv: argv.to_vec(),
            exit_code: captured.exit_code,
            stderr_tail: tail(&captured.stderr, 4096),
        })
        .into());
    }
    Ok(captured)
}

fn wait_and_communicate(popen: &mut Popen, timeout: Option<Duration>) -> anyhow::Result<(Vec<u8>, Vec<u8>)> {
    let communicator = popen.communicate_start(None);
    match timeout {
        None => communicator.read().context("failed to read child output").map(|(o, e)| (o.unwrap_or_default(), e.unwrap_or_default())),
        Some(d) => {
            let (out, err) = communicator
                .limit_time(d)
                .read()
                .with_context(|| format!("command timed out after {d:?}"))?;
            Ok((out.unwrap_or_default(), err.unwrap_or_default()))
        }
    }
}

fn exit_code_of(status: ExitStatus) -> i32 {
    match status {
        ExitStatus::Exited(code) => code as i32,
        ExitStatus::Signaled(sig) => -(sig as i32),
        ExitStatus::Other(code) => code,
        ExitStatus::Undetermined => -1,
    }
}

/// A live, multi-stage OS pipe chain: `stage[0].stdout -> stage[1].stdin`, etc.
/// Built and torn down per [`crate::pipeline::SendPlan`] (spec §3's `Pipeline`
/// entity); guarantees every child is signalled and reaped on every exit path.
pub struct RunningPipeline {
    children: Vec<(String, Popen)>,
    stderr_rx: mpsc::Receiver<StageLine>,
}

/// Spawns `stages` left to right, wiring stage `i`'s stdout into stage `i+1`'s
/// stdin via OS pipes, and draining each stage's stderr on its own thread, tagged
/// with that stage's label (spec §4.1, §5: "stderr... tagged with the stage name...
/// delivered in the order the child wrote it").
pub fn spawn_pipeline(stages: Vec<Stage>) -> anyhow::Result<RunningPipeline> {
    anyhow::ensure!(!stages.is_empty(), "pipeline must have at least one stage");

    let mut children: Vec<(String, Popen)> = Vec::with_capacity(stages.len());
    let (tx, rx) = mpsc::channel();
    let mut prev_stdout: Option<std::fs::File> = None;

    for (idx, stage) in stages.iter().enumerate() {
        let is_last = idx + 1 == stages.len();
        let stdin = match prev_stdout.take() {
            Some(f) => Redirection::File(f),
            None => Redirection::None,
        };
        let stdout = if is_last { Redirection::None } else { Redirection::Pipe };

        let mut popen = Popen::create(
            &stage.argv,
            PopenConfig { stdin, stdout, stderr: Redirection::Pipe, env: child_env(), ..Default::default() },
        )
        .with_context(|| format!("failed to spawn stage {} ({})", stage.label, shell_words::join(&stage.argv)))?;

        if !is_last {
            // Hand this stage's stdout pipe to the next stage's stdin, duplicating
            // the underlying fd into an owned `File` so `Popen` can take ownership
            // independently of this `popen` value's own lifetime.
            if let Some(out) = popen.stdout.take() {
                prev_stdout = Some(out);
            }
        }

        if let Some(err) = popen.stderr.take() {
            let label = stage.label.clone();
            let tx = tx.clone();
            thread::spawn(move || drain_stderr(label, err, tx));
        }

        children.push((stage.label.clone(), popen));
    }
    drop(tx);

    Ok(RunningPipeline { children, stderr_rx: rx })
}

fn drain_stderr(stage_label: String, stream: impl std::io::Read, tx: mpsc::Sender<StageLine>) {
    let reader = BufReader::new(stream);
    for line in reader.lines() {
        let Ok(line) = line else { break };
        if tx.send(StageLine { stage_label: stage_label.clone(), line }).is_err() {
            break;
        }
    }
}

impl RunningPipeline {
    /// Drains tagged stderr lines accumulated so far (non-blocking).
    pub fn drain_log_lines(&self) -> Vec<StageLine> {
        self.stderr_rx.try_iter().collect()
    }

    /// Waits for every stage to exit. Per spec §4.1, the *last* stage's exit code
    /// gates overall success; an earlier stage's non-zero exit is upgraded to a
    /// failure unless it looks like the known-benign SIGPIPE consequence of the
    /// downstream stage having exited early and cleanly (exit code 0 or the SIGPIPE
    /// signal itself).
    pub fn join(mut self, timeout: Option<Duration>) -> anyhow::Result<()> {
        let deadline = timeout.map(|d| Instant::now() + d);
        let mut statuses = Vec::with_capacity(self.children.len());
        for (label, child) in &mut self.children {
            let status = match deadline {
                None => child.wait().with_context(|| format!("failed to wait for stage {label}"))?,
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    match child.wait_timeout(remaining).with_context(|| format!("failed to wait for stage {label}"))? {
                        Some(status) => status,
                        None => {
                            terminate(child);
                            anyhow::bail!("stage {label} timed out");
                        }
                    }
                }
            };
            statuses.push((label.clone(), status));
        }

        // Remaining lines racing the final wait() calls above.
        let _ = self.drain_log_lines();

        let (last_label, last_status) = statuses.last().expect("non-empty pipeline");
        if !matches!(last_status, ExitStatus::Exited(0)) {
            anyhow::bail!("pipeline stage {last_label} failed: {:?}", last_status);
        }

        for (label, status) in &statuses[..statuses.len().saturating_sub(1)] {
            let benign = matches!(status, ExitStatus::Exited(0))
                || matches!(status, ExitStatus::Signaled(sig) if *sig == SIGPIPE as u8);
            if !benign {
                anyhow::bail!("upstream pipeline stage {label} failed: {:?}", status);
            }
        }
        Ok(())
    }

    /// Tears every live stage down: SIGTERM, a short grace period, then SIGKILL,
    /// applied in LIFO order (last-spawned stage first) so a killed downstream stage
    /// never leaves an upstream one blocked writing into a closed pipe forever
    /// (spec §4.1, §5).
    pub fn cancel(mut self) {
        for (_, child) in self.children.iter_mut().rev() {
            terminate(child);
        }
    }
}

const SIGPIPE: i32 = nix::sys::signal::Signal::SIGPIPE as i32;
const TERMINATE_GRACE: Duration = Duration::from_millis(500);

fn terminate(child: &mut Popen) {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.pid() else { return };
    let pid = Pid::from_raw(pid as i32);
    let _ = signal::kill(pid, Signal::SIGTERM);
    if child.wait_timeout(TERMINATE_GRACE).ok().flatten().is_some() {
        return;
    }
    let _ = signal::kill(pid, Signal::SIGKILL);
    let _ = child.wait();
}

fn tail(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let start = s.len() - max_bytes;
    let start = s.char_indices().map(|(i, _)| i).find(|&i| i >= start).unwrap_or(start);
    s[start..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_captures_stdout_and_exit_code() {
        let captured = run(&["echo".into(), "hello".into()], None).unwrap();
        assert!(captured.success());
        assert_eq!(captured.stdout_str().trim(), "hello");
    }

    #[test]
    fn run_checked_reports_failure_with_stderr_tail() {
        let err = run_checked(&["sh".into(), "-c".into(), "echo boom >&2; exit 3".into()], None).unwrap_err();
        let msg = format!("{err:#}");
        assert!(msg.contains("boom"), "message was: {msg}");
    }

    #[test]
    fn pipeline_joins_on_success() {
        let stages = vec![
            Stage::new("producer", vec!["echo".into(), "data".into()]),
            Stage::new("consumer", vec!["cat".into()]),
        ];
        let running = spawn_pipeline(stages).unwrap();
        running.join(Some(Duration::from_secs(5))).unwrap();
    }

    #[test]
    fn pipeline_fails_when_last_stage_fails() {
        let stages = vec![
            Stage::new("producer", vec!["echo".into(), "data".into()]),
            Stage::new("consumer", vec!["sh".into(), "-c".into(), "cat >/dev/null; exit 1".into()]),
        ];
        let running = spawn_pipeline(stages).unwrap();
        assert!(running.join(Some(Duration::from_secs(5))).is_err());
    }

    #[test]
    fn tail_truncates_to_last_bytes() {
        let s = "a".repeat(100);
        assert_eq!(tail(&s, 10).len(), 10);
        assert_eq!(tail("short", 10), "short");
    }
}
