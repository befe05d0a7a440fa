//! # Request coalescing cache
//!
//! Many clients often issue the same expensive call at nearly the same time, for example the same
//! HTTP request to a slow upstream. This module makes sure such a call only runs once, hands its
//! outcome to everybody who asked for it, and keeps it around for a short while so that the next
//! callers do not have to run it again.
//!
//! ## Lifecycle of a key
//!
//! Each key in the [`CoalescingCache`] goes through these states:
//!
//! - *absent*: nothing is known about the key. The first caller installs a placeholder and becomes
//!   the *issuer* of the call.
//! - *in progress*: a call is running. All further callers attach to it as *waiters* and block
//!   until its completion signal fires. No executor other than the issuer's runs.
//! - *done*: the call finished with a result or an error, which is served as-is while it is
//!   younger than its time-to-live. Once stale, the next caller replaces it with a fresh
//!   placeholder, and the key starts over as if it were absent.
//!
//! Errors are cached just like successful results, so a failing upstream is not hammered with
//! retries. A separate [`CacheConfig::error_ttl`] can shorten that window.
//!
//! The completed result is handed to waiters through the completion signal itself. Waiters thus
//! always observe the outcome of the call they attached to, even if its entry was evicted or
//! replaced right after publishing.
//!
//! ## Bounds and expiration
//!
//! The number of entries is bounded by [`CacheConfig::max_entries`]. When a new placeholder is
//! installed into a full cache, the least-recently-completed entries are evicted. In-flight calls
//! are never evicted, which means the cache may temporarily exceed its bound when it is saturated
//! with concurrent calls.
//!
//! Stale entries are always replaced on lookup. An optional background sweep, configured with
//! [`CacheConfig::eviction_sweep_interval`], removes them for keys that are never asked for again.
//!
//! ## Deadlines
//!
//! [`CoalescingCache::compute_memoized_timeout`] bounds how long one caller waits. A waiter that
//! gives up does not affect the call. An issuer that gives up cancels the call only if nobody is
//! waiting for it.
//!
//! ### Metrics
//!
//! Each metric is tagged with a `cache` field that corresponds to [`CacheConfig::name`]:
//!
//! - `caches.access`: All accesses.
//! - `caches.memory.hit`: Accesses served by a fresh completed entry.
//! - `caches.channel.hit`: Accesses that waited for an in-flight call.
//! - `caches.computation`: Executors actually being run.
//! - `caches.computation.duration`: How long executors took.
//! - `caches.memory.evicted`: Completed entries evicted to respect the bound.
//! - `caches.memory.expired`: Stale entries that were replaced or swept.
//! - `caches.wait_timeout`: Callers that gave up because their deadline elapsed.
//! - `caches.memory.entries`: The number of entries after each sweep.

mod cache_error;
mod config;
mod entry;
mod eviction;
mod memory;
mod stats;


pub use cache_error::{CacheEntry, CacheError};
pub use config::CacheConfig;
pub use memory::CoalescingCache;
pub use stats::CacheStats;
