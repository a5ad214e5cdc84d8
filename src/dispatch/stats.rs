//! Dispatcher counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters, updated with relaxed atomics.
#[derive(Debug, Default)]
pub struct DispatcherStats {
    submitted: AtomicU64,
    queued: AtomicU64,
    ran_inline: AtomicU64,
    rejected: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

/// Point-in-time copy of [`DispatcherStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Every call to `execute`, including rejected ones.
    pub submitted: u64,
    /// Accepted into the admission queue.
    pub queued: u64,
    /// Queue was full, ran on the caller's thread.
    pub ran_inline: u64,
    /// Refused because the dispatcher was shut down.
    pub rejected: u64,
    pub succeeded: u64,
    pub failed: u64,
}

impl StatsSnapshot {
    /// Tasks that have not reached a terminal state yet.
    pub fn in_flight(&self) -> u64 {
        (self.queued + self.ran_inline).saturating_sub(self.succeeded + self.failed)
    }
}

impl DispatcherStats {
    #[inline(always)]
    pub(crate) fn record_submit(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub(crate) fn record_queued(&self) {
        self.queued.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub(crate) fn record_inline(&self) {
        self.ran_inline.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub(crate) fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub(crate) fn record_outcome(&self, success: bool) {
        if success {
            self.succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            queued: self.queued.load(Ordering::Relaxed),
            ran_inline: self.ran_inline.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}
