//! Run Context (spec §3, §9 redesign flag, §2 component 12): the single per-run
//! mutable value threaded by reference through the engine, replacing the module-
//! level mutable state the teacher never had reason to introduce (it only ever
//! processed one dataset pair per process invocation).
//!
//! The `--force-once` budget is the one piece of state genuinely shared across
//! concurrent stderr-draining threads (§5); it's an `AtomicU32` rather than behind a
//! mutex so a thread can claim it without blocking anything else mid-transfer.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::config::RunConfig;

/// Carries the active [`RunConfig`] plus the only mutable state shared across a run:
/// the `--force-once` budget and the cooperative cancellation flag (spec §5's
/// `ctrlc`-style handler). Endpoint capability caches live on each [`crate::endpoint::Endpoint`]
/// itself (interior-mutable, not duplicated here) since an `Endpoint` already outlives
/// the whole run and is shared by reference.
pub struct RunContext {
    pub config: RunConfig,
    force_once_budget: AtomicU32,
    cancelled: AtomicBool,
}

impl RunContext {
    pub fn new(config: RunConfig) -> Self {
        let budget = if config.force_once { 1 } else { 0 };
        RunContext { config, force_once_budget: AtomicU32::new(budget), cancelled: AtomicBool::new(false) }
    }

    /// Atomically claims one use of the `--force-once` budget. Returns `true` if a
    /// unit of budget was available and is now spent; `false` if the budget was
    /// already exhausted (or never granted). Safe to call from multiple threads:
    /// only one caller ever observes `true` for the same unit of budget.
    pub fn try_claim_force_once(&self) -> bool {
        self.force_once_budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |budget| budget.checked_sub(1))
            .is_ok()
    }

    pub fn request_cancellation(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunConfig;

    #[test]
    fn force_once_budget_is_claimed_exactly_once() {
        let ctx = RunContext::new(RunConfig { force_once: true, ..RunConfig::test_default() });
        assert!(ctx.try_claim_force_once());
        assert!(!ctx.try_claim_force_once());
    }

    #[test]
    fn force_once_budget_is_zero_when_flag_absent() {
        let ctx = RunContext::new(RunConfig { force_once: false, ..RunConfig::test_default() });
        assert!(!ctx.try_claim_force_once());
    }

    #[test]
    fn cancellation_flag_round_trips() {
        let ctx = RunContext::new(RunConfig::test_default());
        assert!(!ctx.is_cancelled());
        ctx.request_cancellation();
        assert!(ctx.is_cancelled());
    }
}
