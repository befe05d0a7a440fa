use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::channel::oneshot;
use parking_lot::RwLock;
use sentry::{Hub, SentryFutureExt};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::entry::{Completed, Entry, InFlight, Waiter};
use super::eviction::{Entries, Publish};
use super::stats::{CacheStats, StatsCounters};
use super::{CacheConfig, CacheEntry, CacheError};
use crate::utils::defer::CallOnDrop;

/// What a caller found when probing the map under the read lock.
enum Lookup<T, E> {
    Hit(Result<T, E>),
    Wait(Waiter<T, E>),
    Miss,
}

/// What a caller found when trying to install a placeholder under the write lock.
enum Install<T, E> {
    Hit(Result<T, E>),
    Wait(Waiter<T, E>),
    Issue(Issue<T, E>),
}

/// Proof that the caller won the race and installed the placeholder for call `id`.
struct Issue<T, E> {
    id: u64,
    sender: oneshot::Sender<Result<T, E>>,
}

#[derive(Debug, Clone, Copy)]
struct Deadline {
    at: Instant,
    timeout: Duration,
}

struct Inner<K, T, E> {
    config: CacheConfig,
    entries: RwLock<Entries<K, T, E>>,
    next_id: AtomicU64,
    stats: StatsCounters,
}

impl<K, T, E> Inner<K, T, E>
where
    K: Clone + Eq + Hash + fmt::Debug,
    T: Clone,
    E: Clone,
{
    fn name(&self) -> &str {
        &self.config.name
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn lookup(&self, key: &K) -> Lookup<T, E> {
        let entries = self.entries.read();
        match entries.get(key) {
            Some(Entry::Done(completed)) if completed.is_fresh(Instant::now()) => {
                Lookup::Hit(completed.result.clone())
            }
            Some(Entry::InProgress(in_flight)) => Lookup::Wait(in_flight.join()),
            _ => Lookup::Miss,
        }
    }

    /// Installs a placeholder for `key`, unless another caller got there first.
    ///
    /// The read lock is released between [`lookup`](Self::lookup) and this, so the entry has
    /// to be checked again.
    fn install(&self, key: &K) -> Install<T, E> {
        let mut entries = self.entries.write();
        match entries.get(key) {
            Some(Entry::Done(completed)) if completed.is_fresh(Instant::now()) => {
                return Install::Hit(completed.result.clone());
            }
            Some(Entry::Done(completed)) => {
                tracing::trace!(
                    cache = self.name(),
                    key = ?key,
                    age = ?completed.completed_at.elapsed(),
                    "Replacing expired entry",
                );
                metric!(counter("caches.memory.expired") += 1, "cache" => self.name());
                StatsCounters::incr(&self.stats.expirations);
            }
            Some(Entry::InProgress(in_flight)) => return Install::Wait(in_flight.join()),
            None => {}
        }

        let id = self.next_id();
        let (in_flight, sender) = InFlight::new(id);
        let evicted = entries.insert_in_flight(key.clone(), in_flight);
        drop(entries);

        self.record_evictions(evicted);
        Install::Issue(Issue { id, sender })
    }

    /// Replaces the placeholder of call `id` with its result.
    fn publish(&self, key: &K, id: u64, result: Result<T, E>) {
        let ttl = self.config.ttl_for(&result);
        let completed = Completed::new(result, ttl, self.next_id());
        let publish = self.entries.write().complete(key, id, completed);

        match publish {
            Publish::Stored { evicted } => self.record_evictions(evicted),
            Publish::Discarded => {
                tracing::debug!(
                    cache = self.name(),
                    key = ?key,
                    id,
                    "Placeholder is gone, result is not retained",
                );
            }
        }
    }

    /// Removes the placeholder of a call that ended without publishing a result.
    fn abandon(&self, key: &K, id: u64) {
        if self.entries.write().remove_in_flight(key, id) {
            tracing::debug!(cache = self.name(), key = ?key, id, "Abandoned in-flight call");
        }
    }

    /// Removes the placeholder of call `id` if nobody is waiting for it.
    ///
    /// Waiters are attached while holding a lock on the map, so once this returns `true`, no
    /// caller can join the call anymore.
    fn cancel_if_unshared(&self, key: &K, id: u64) -> bool {
        let mut entries = self.entries.write();
        let unshared = entries
            .get(key)
            .and_then(|entry| entry.in_flight(id))
            .is_some_and(|in_flight| in_flight.waiters() == 0);
        if unshared {
            entries.remove_in_flight(key, id);
        }
        unshared
    }

    fn sweep_expired(&self) -> usize {
        let mut entries = self.entries.write();
        let expired = entries.remove_expired(Instant::now());
        let len = entries.len();
        drop(entries);

        if expired > 0 {
            tracing::debug!(cache = self.name(), expired, "Swept expired entries");
            metric!(counter("caches.memory.expired") += expired as i64, "cache" => self.name());
            StatsCounters::add(&self.stats.expirations, expired);
        }
        metric!(gauge("caches.memory.entries") = len as u64, "cache" => self.name());
        expired
    }

    fn record_evictions(&self, evicted: usize) {
        if evicted == 0 {
            return;
        }
        tracing::trace!(cache = self.name(), evicted, "Evicted completed entries");
        metric!(counter("caches.memory.evicted") += evicted as i64, "cache" => self.name());
        StatsCounters::add(&self.stats.evictions, evicted);
    }
}

/// An in-memory cache that coalesces concurrent calls for the same key.
///
/// Every call goes through [`compute_memoized`](Self::compute_memoized) with a key and an
/// executor. For all callers sharing a key within one non-expired window, the executor of
/// exactly one caller (the issuer) runs. All other callers wait for and receive its outcome.
/// Both successful results and errors are retained for the configured time-to-live and the
/// number of retained entries is bounded.
///
/// Executors run in a task spawned on the current tokio runtime. This means that a caller
/// giving up never cancels a call that other callers are still waiting for.
///
/// The cache is cheap to clone, all clones share the same entries.
pub struct CoalescingCache<K, T, E> {
    inner: Arc<Inner<K, T, E>>,
}

impl<K, T, E> Clone for CoalescingCache<K, T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, T, E> fmt::Debug for CoalescingCache<K, T, E>
where
    K: Clone + Eq + Hash,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (entries, in_flight) = self
            .inner
            .entries
            .try_read()
            .map(|entries| (entries.len(), entries.in_flight()))
            .unwrap_or_default();
        f.debug_struct("CoalescingCache")
            .field("config", &self.inner.config)
            .field("entries", &entries)
            .field("in_flight", &in_flight)
            .finish()
    }
}

impl<K, T, E> CoalescingCache<K, T, E>
where
    K: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Creates a new cache.
    ///
    /// If an [`eviction_sweep_interval`](CacheConfig::eviction_sweep_interval) is configured,
    /// this spawns the background sweep on the current tokio runtime.
    pub fn new(config: CacheConfig) -> Self {
        let inner = Arc::new(Inner {
            entries: RwLock::new(Entries::new(config.effective_max_entries())),
            next_id: AtomicU64::new(0),
            stats: StatsCounters::default(),
            config,
        });

        if let Some(interval) = inner.config.eviction_sweep_interval {
            spawn_sweeper(Arc::downgrade(&inner), interval);
        }

        Self { inner }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// The number of entries, both in-flight and completed.
    pub fn len(&self) -> usize {
        self.inner.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The number of calls currently in flight.
    pub fn in_flight(&self) -> usize {
        self.inner.entries.read().in_flight()
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.stats.snapshot()
    }

    /// Drops the completed entry for `key`, so that the next call runs its executor again.
    ///
    /// In-flight calls are left alone. Returns whether an entry was removed.
    pub fn invalidate(&self, key: &K) -> bool {
        self.inner.entries.write().remove_completed(key)
    }

    /// Drops all completed entries, returning how many were removed.
    pub fn clear(&self) -> usize {
        self.inner.entries.write().clear_completed()
    }

    /// Removes all expired entries, returning how many were removed.
    ///
    /// This is what the background sweep runs periodically.
    pub fn sweep_expired(&self) -> usize {
        self.inner.sweep_expired()
    }

    /// Returns the result for `key`, running `executor` only if needed.
    ///
    /// - A fresh completed entry is returned as-is.
    /// - If a call for `key` is in flight, this waits for it and returns its outcome.
    /// - Otherwise, this caller becomes the issuer: it runs `executor`, stores the result and
    ///   wakes up all callers that are waiting for it.
    ///
    /// # Errors
    ///
    /// An executor error is returned as [`CacheError::Executor`], both to the issuer and all
    /// waiters, and is retained like a successful result.
    pub async fn compute_memoized<F, Fut>(&self, key: K, executor: F) -> CacheEntry<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        self.coalesce(key, executor, None).await
    }

    /// Like [`compute_memoized`](Self::compute_memoized), but gives up after `timeout`.
    ///
    /// The timeout only applies to this caller. A waiter that times out leaves the call running
    /// for everybody else. An issuer that times out cancels its call only when no other caller is
    /// waiting for it, otherwise the call completes and its result is published as usual.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::WaitTimeout`] if the deadline elapses.
    pub async fn compute_memoized_timeout<F, Fut>(
        &self,
        key: K,
        timeout: Duration,
        executor: F,
    ) -> CacheEntry<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        // a timeout beyond the clock's range never elapses
        let deadline = Instant::now()
            .checked_add(timeout)
            .map(|at| Deadline { at, timeout });
        self.coalesce(key, executor, deadline).await
    }

    async fn coalesce<F, Fut>(
        &self,
        key: K,
        executor: F,
        deadline: Option<Deadline>,
    ) -> CacheEntry<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let name = self.inner.name();
        metric!(counter("caches.access") += 1, "cache" => name);
        StatsCounters::incr(&self.inner.stats.accesses);

        let issue = loop {
            let waiter = match self.inner.lookup(&key) {
                Lookup::Hit(result) => return self.hit(result),
                Lookup::Wait(waiter) => waiter,
                Lookup::Miss => match self.inner.install(&key) {
                    Install::Hit(result) => return self.hit(result),
                    Install::Wait(waiter) => waiter,
                    Install::Issue(issue) => break issue,
                },
            };

            // A concurrent call was deduplicated.
            metric!(counter("caches.channel.hit") += 1, "cache" => name);
            StatsCounters::incr(&self.inner.stats.coalesced);

            if let Some(result) = self.wait(&key, waiter, deadline).await? {
                return result.map_err(CacheError::Executor);
            }

            // The call we waited for ended without a result, which makes this a fresh miss.
            tracing::debug!(cache = name, key = ?key, "In-flight call was abandoned, retrying");
            StatsCounters::incr(&self.inner.stats.retries);
        };

        self.issue(key, issue, executor, deadline).await
    }

    fn hit(&self, result: Result<T, E>) -> CacheEntry<T, E> {
        metric!(counter("caches.memory.hit") += 1, "cache" => self.inner.name());
        StatsCounters::incr(&self.inner.stats.hits);
        result.map_err(CacheError::Executor)
    }

    /// Waits for another caller's call.
    ///
    /// Returns `Ok(None)` if that call was abandoned and the caller should try again.
    async fn wait(
        &self,
        key: &K,
        waiter: Waiter<T, E>,
        deadline: Option<Deadline>,
    ) -> Result<Option<Result<T, E>>, CacheError<E>> {
        tracing::trace!(
            cache = self.inner.name(),
            key = ?key,
            id = waiter.id,
            "Waiting for in-flight call",
        );

        let Some(deadline) = deadline else {
            return Ok(waiter.wait().await);
        };

        match tokio::time::timeout_at(deadline.at, waiter.wait()).await {
            Ok(result) => Ok(result),
            Err(_elapsed) => {
                tracing::debug!(
                    cache = self.inner.name(),
                    key = ?key,
                    id = waiter.id,
                    "Gave up waiting for in-flight call",
                );
                Err(self.timed_out(deadline))
            }
        }
    }

    /// Runs the executor as the issuer and publishes its result.
    async fn issue<F, Fut>(
        &self,
        key: K,
        issue: Issue<T, E>,
        executor: F,
        deadline: Option<Deadline>,
    ) -> CacheEntry<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let Issue { id, sender } = issue;
        let name = self.inner.name();
        metric!(counter("caches.computation") += 1, "cache" => name);
        StatsCounters::incr(&self.inner.stats.computations);
        tracing::trace!(cache = name, key = ?key, id, "Issuing call");

        let abandon_token = CallOnDrop::new(|| self.inner.abandon(&key, id));
        let computation = executor();
        abandon_token.disarm();

        let inner = Arc::clone(&self.inner);
        let task_key = key.clone();
        let task = async move {
            // If the task is dropped before publishing, because it was aborted or the executor
            // panicked, this removes the placeholder. Dropping `sender` wakes up the waiters.
            let abandon_token = CallOnDrop::new({
                let inner = Arc::clone(&inner);
                let key = task_key.clone();
                move || inner.abandon(&key, id)
            });

            let start = Instant::now();
            let result = computation.await;
            metric!(
                timer("caches.computation.duration") = start.elapsed(),
                "cache" => inner.name(),
            );

            inner.publish(&task_key, id, result.clone());
            abandon_token.disarm();

            // This only fails if there are no waiters left.
            sender.send(result.clone()).ok();
            result
        }
        .bind_hub(Hub::new_from_top(Hub::current()));

        let mut handle = tokio::spawn(task);
        let joined = match deadline {
            None => handle.await,
            Some(deadline) => match tokio::time::timeout_at(deadline.at, &mut handle).await {
                Ok(joined) => joined,
                Err(_elapsed) => return Err(self.issuer_timed_out(&key, id, handle, deadline)),
            },
        };

        match joined {
            Ok(result) => result.map_err(CacheError::Executor),
            Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
            Err(err) => {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    cache = name,
                    key = ?key,
                    "In-flight call was aborted",
                );
                Err(CacheError::Aborted)
            }
        }
    }

    fn issuer_timed_out(
        &self,
        key: &K,
        id: u64,
        handle: JoinHandle<Result<T, E>>,
        deadline: Deadline,
    ) -> CacheError<E> {
        if self.inner.cancel_if_unshared(key, id) {
            tracing::debug!(
                cache = self.inner.name(),
                key = ?key,
                id,
                "Cancelling call without waiters",
            );
            handle.abort();
        } else {
            tracing::debug!(
                cache = self.inner.name(),
                key = ?key,
                id,
                "Leaving call running for its waiters",
            );
        }
        self.timed_out(deadline)
    }

    fn timed_out(&self, deadline: Deadline) -> CacheError<E> {
        metric!(counter("caches.wait_timeout") += 1, "cache" => self.inner.name());
        StatsCounters::incr(&self.inner.stats.wait_timeouts);
        CacheError::WaitTimeout(deadline.timeout)
    }
}

/// Spawns a task that periodically removes expired entries.
///
/// The task only holds a weak reference and stops once the cache is dropped.
fn spawn_sweeper<K, T, E>(inner: Weak<Inner<K, T, E>>, interval: Duration)
where
    K: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    if interval.is_zero() {
        tracing::warn!("Ignoring zero eviction sweep interval");
        return;
    }
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        tracing::warn!("No tokio runtime, expired entries are only replaced on lookup");
        return;
    };

    runtime.spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let Some(inner) = inner.upgrade() else {
                break;
            };
            inner.sweep_expired();
        }
    });
}
