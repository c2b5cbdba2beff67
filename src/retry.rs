//! Retry Controller (spec §4.8 / §2 component 10): wraps a retryable operation in
//! exponential backoff with jitter, bounded by a retry count and a wall-clock cap,
//! consulting [`crate::error::classify_stderr`] to decide whether a given failure is
//! worth retrying at all.
//!
//! New territory for this crate — the teacher had no retry logic of its own — built
//! on the `backoff` crate's `ExponentialBackoff`/`retry_notify`, the idiomatic choice
//! for this shape of problem (also present in several pack manifests, e.g.
//! `blockcaptain-blockcaptain`'s `Cargo.toml`).

use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;

use crate::context::RunContext;
use crate::error::{EngineError, RetryRule};

/// Per-run retry parameters (spec §3's `RetryPolicy`).
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub retries: u32,
    pub min_sleep: Duration,
    pub max_sleep: Duration,
    pub max_elapsed: Duration,
    /// Extra stderr-substring rules layered on top of [`crate::error::RETRYABLE_PATTERNS`].
    pub extra_rules: Vec<RetryRule>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            retries: 5,
            min_sleep: Duration::from_secs(1),
            max_sleep: Duration::from_secs(30),
            max_elapsed: Duration::from_secs(300),
            extra_rules: Vec::new(),
        }
    }
}

impl RetryPolicy {
    fn new_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.min_sleep,
            max_interval: self.max_sleep,
            max_elapsed_time: Some(self.max_elapsed),
            ..ExponentialBackoff::default()
        }
    }
}

/// Runs `op` until it succeeds, exhausts `policy`'s retry/elapsed budget, or fails
/// with an error [`EngineError::retry_kind`] doesn't recognize as transient.
///
/// A fresh [`ExponentialBackoff`] is created per call, so each dataset (or each
/// outer operation a caller wraps with this function) gets its own budget — per
/// spec §4.8, "retry counters reset per outer operation".
pub fn retry<T>(policy: &RetryPolicy, mut op: impl FnMut() -> anyhow::Result<T>) -> anyhow::Result<T> {
    retry_cancellable(policy, None, &mut op)
}

/// Like [`retry`], but also observes `ctx`'s cancellation flag between attempts and
/// while sleeping (spec §5: "the shared cancellation flag observed by the Command
/// Runner between pipeline-stage-spawns and inside the retry sleep"), returning
/// [`EngineError::Cancelled`] instead of sleeping through a requested shutdown.
pub fn retry_cancellable<T>(policy: &RetryPolicy, ctx: Option<&RunContext>, op: &mut dyn FnMut() -> anyhow::Result<T>) -> anyhow::Result<T> {
    let mut backoff_state = policy.new_backoff();
    let mut attempts = 0u32;

    loop {
        if ctx.is_some_and(RunContext::is_cancelled) {
            return Err(EngineError::Cancelled.into());
        }
        match op() {
            Ok(value) => return Ok(value),
            Err(err) => {
                if err.downcast_ref::<EngineError>().map(|e| matches!(e, EngineError::Cancelled)).unwrap_or(false) {
                    return Err(err);
                }
                let retryable = err
                    .downcast_ref::<EngineError>()
                    .map(|e| e.retry_kind(&policy.extra_rules).is_some())
                    .unwrap_or(false);

                if !retryable || attempts >= policy.retries {
                    return Err(err);
                }
                let Some(sleep_for) = backoff_state.next_backoff() else {
                    return Err(err);
                };
                log::warn!("retrying after transient failure (attempt {}/{}): {err:#}", attempts + 1, policy.retries);
                if sleep_cancellably(sleep_for, ctx) {
                    return Err(EngineError::Cancelled.into());
                }
                attempts += 1;
            }
        }
    }
}

/// Sleeps for `duration` in short slices so a cancellation request lands promptly
/// instead of only being noticed after the full backoff interval elapses. Returns
/// `true` if cancellation was observed mid-sleep.
fn sleep_cancellably(duration: Duration, ctx: Option<&RunContext>) -> bool {
    let Some(ctx) = ctx else {
        std::thread::sleep(duration);
        return false;
    };
    let slice = Duration::from_millis(100);
    let mut remaining = duration;
    while remaining > Duration::ZERO {
        if ctx.is_cancelled() {
            return true;
        }
        let step = remaining.min(slice);
        std::thread::sleep(step);
        remaining -= step;
    }
    ctx.is_cancelled()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailedCommand;
    use std::cell::Cell;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            retries: 3,
            min_sleep: Duration::from_millis(1),
            max_sleep: Duration::from_millis(5),
            max_elapsed: Duration::from_secs(5),
            extra_rules: Vec::new(),
        }
    }

    fn busy_error() -> anyhow::Error {
        EngineError::CommandFailed(FailedCommand {
            argv: vec!["zfs".into(), "destroy".into()],
            exit_code: 1,
            stderr_tail: "cannot destroy: dataset is busy".into(),
        })
        .into()
    }

    #[test]
    fn succeeds_without_retry_on_first_try() {
        let calls = Cell::new(0);
        let result = retry(&policy(), || {
            calls.set(calls.get() + 1);
            Ok::<_, anyhow::Error>(42)
        });
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn retries_transient_failures_then_succeeds() {
        let calls = Cell::new(0);
        let result = retry(&policy(), || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(busy_error())
            } else {
                Ok(())
            }
        });
        assert!(result.is_ok());
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn does_not_retry_non_transient_failures() {
        let calls = Cell::new(0);
        let result = retry(&policy(), || {
            calls.set(calls.get() + 1);
            Err::<(), _>(EngineError::UsageError("bad flag".into()).into())
        });
        assert!(result.is_err());
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn gives_up_after_retry_budget_exhausted() {
        let calls = Cell::new(0);
        let result = retry(&policy(), || {
            calls.set(calls.get() + 1);
            Err::<(), _>(busy_error())
        });
        assert!(result.is_err());
        assert!(calls.get() as u32 <= policy().retries + 1);
    }
}
