use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters describing how calls were served by a [`CoalescingCache`](super::CoalescingCache).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// All calls.
    pub accesses: u64,
    /// Calls served from a fresh completed entry.
    pub hits: u64,
    /// Calls that waited for another caller's in-flight call.
    pub coalesced: u64,
    /// Calls that actually invoked their executor.
    pub computations: u64,
    /// Completed entries evicted to respect the size bound.
    pub evictions: u64,
    /// Stale entries that were replaced or swept.
    pub expirations: u64,
    /// Calls that gave up waiting because their deadline elapsed.
    pub wait_timeouts: u64,
    /// Waits that had to be retried because the call they waited for was abandoned.
    pub retries: u64,
}

#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    pub accesses: AtomicU64,
    pub hits: AtomicU64,
    pub coalesced: AtomicU64,
    pub computations: AtomicU64,
    pub evictions: AtomicU64,
    pub expirations: AtomicU64,
    pub wait_timeouts: AtomicU64,
    pub retries: AtomicU64,
}

impl StatsCounters {
    pub fn incr(counter: &AtomicU64) {
        Self::add(counter, 1);
    }

    pub fn add(counter: &AtomicU64, value: usize) {
        counter.fetch_add(value as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CacheStats {
        CacheStats {
            accesses: self.accesses.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            computations: self.computations.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            wait_timeouts: self.wait_timeouts.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
        }
    }
}
