use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::channel::oneshot;
use futures::future::{FutureExt, Shared};
use tokio::time::Instant;

/// A one-shot, multi-waiter completion signal.
///
/// The issuer holds the matching [`oneshot::Sender`]. Sending the result fires the signal for all
/// waiters at once. Dropping the sender without sending means that the call was abandoned, which
/// waiters observe as a cancelled channel.
pub(crate) type CompletionSignal<T, E> = Shared<oneshot::Receiver<Result<T, E>>>;

/// The cache's knowledge about one key.
///
/// A key is never moved from [`Done`](Self::Done) back to [`InProgress`](Self::InProgress).
/// Instead, a fresh call replaces the whole entry.
pub(crate) enum Entry<T, E> {
    InProgress(InFlight<T, E>),
    Done(Completed<T, E>),
}

impl<T, E> Entry<T, E> {
    /// Returns the in-flight state if the call identified by `id` is still running.
    pub fn in_flight(&self, id: u64) -> Option<&InFlight<T, E>> {
        match self {
            Self::InProgress(in_flight) if in_flight.id == id => Some(in_flight),
            _ => None,
        }
    }
}

/// A placeholder for a call that is currently running.
pub(crate) struct InFlight<T, E> {
    /// Uniquely identifies this call within its cache.
    pub id: u64,
    done: CompletionSignal<T, E>,
    waiters: Arc<AtomicUsize>,
}

impl<T: Clone, E: Clone> InFlight<T, E> {
    /// Creates a new placeholder along with the sender that fires its completion signal.
    pub fn new(id: u64) -> (Self, oneshot::Sender<Result<T, E>>) {
        let (sender, receiver) = oneshot::channel();
        let in_flight = Self {
            id,
            done: receiver.shared(),
            waiters: Default::default(),
        };
        (in_flight, sender)
    }

    /// Attaches a new waiter to this call.
    ///
    /// The waiter stays counted until the returned [`Waiter`] is dropped.
    pub fn join(&self) -> Waiter<T, E> {
        self.waiters.fetch_add(1, Ordering::AcqRel);
        Waiter {
            id: self.id,
            done: self.done.clone(),
            waiters: Arc::clone(&self.waiters),
        }
    }

    /// The number of callers currently waiting on this call.
    pub fn waiters(&self) -> usize {
        self.waiters.load(Ordering::Acquire)
    }
}

/// A caller that is waiting for somebody else's in-flight call.
pub(crate) struct Waiter<T, E> {
    pub id: u64,
    done: CompletionSignal<T, E>,
    waiters: Arc<AtomicUsize>,
}

impl<T: Clone, E: Clone> Waiter<T, E> {
    /// Waits for the call to complete.
    ///
    /// Returns `None` if the call was abandoned before it published a result.
    pub async fn wait(&self) -> Option<Result<T, E>> {
        self.done.clone().await.ok()
    }
}

impl<T, E> Drop for Waiter<T, E> {
    fn drop(&mut self) {
        self.waiters.fetch_sub(1, Ordering::AcqRel);
    }
}

/// The terminal state of a call.
///
/// Completed entries are immutable.
#[derive(Debug, Clone)]
pub(crate) struct Completed<T, E> {
    /// When the result was published.
    pub completed_at: Instant,
    /// When this entry goes stale, `None` if its time-to-live exceeds the clock's range.
    pub expires_at: Option<Instant>,
    /// Monotonic completion order, used to pick eviction victims.
    pub sequence: u64,
    pub result: Result<T, E>,
}

impl<T, E> Completed<T, E> {
    pub fn new(result: Result<T, E>, ttl: Duration, sequence: u64) -> Self {
        let completed_at = Instant::now();
        Self {
            completed_at,
            expires_at: completed_at.checked_add(ttl),
            sequence,
            result,
        }
    }

    /// A completed entry is fresh while its age is below its time-to-live.
    pub fn is_fresh(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|expires_at| now < expires_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_completed_freshness() {
        let entry = Completed::new(Ok::<_, ()>(1), Duration::from_secs(5), 0);
        assert!(entry.is_fresh(Instant::now()));

        tokio::time::advance(Duration::from_millis(4999)).await;
        assert!(entry.is_fresh(Instant::now()));

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(!entry.is_fresh(Instant::now()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_ttl_never_expires() {
        let entry = Completed::new(Ok::<_, ()>(1), Duration::MAX, 0);
        assert_eq!(entry.expires_at, None);

        tokio::time::advance(Duration::from_secs(365 * 24 * 60 * 60)).await;
        assert!(entry.is_fresh(Instant::now()));
    }

    #[tokio::test]
    async fn test_waiters_are_counted() {
        let (in_flight, sender) = InFlight::<u32, ()>::new(7);
        assert_eq!(in_flight.waiters(), 0);

        let first = in_flight.join();
        let second = in_flight.join();
        assert_eq!(in_flight.waiters(), 2);
        assert_eq!(first.id, 7);

        drop(second);
        assert_eq!(in_flight.waiters(), 1);

        sender.send(Ok(42)).ok();
        assert_eq!(first.wait().await, Some(Ok(42)));
        // waiting more than once observes the same result
        assert_eq!(first.wait().await, Some(Ok(42)));

        drop(first);
        assert_eq!(in_flight.waiters(), 0);
    }

    #[tokio::test]
    async fn test_abandoned_signal() {
        let (in_flight, sender) = InFlight::<u32, ()>::new(1);
        let waiter = in_flight.join();

        drop(sender);
        assert_eq!(waiter.wait().await, None);
    }

    #[test]
    fn test_in_flight_matches_id() {
        let (in_flight, _sender) = InFlight::<u32, ()>::new(3);
        let entry = Entry::InProgress(in_flight);
        assert!(entry.in_flight(3).is_some());
        assert!(entry.in_flight(4).is_none());

        let entry = Entry::<u32, ()>::Done(Completed::new(Ok(1), Duration::ZERO, 0));
        assert!(entry.in_flight(3).is_none());
    }
}
