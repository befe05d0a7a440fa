use std::time::Duration;

use thiserror::Error;

/// An error returned to callers of the [`CoalescingCache`](super::CoalescingCache).
///
/// Only the [`Executor`](Self::Executor) variant is ever persisted in the cache. The other
/// variants describe what happened to one particular caller and are never shared.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError<E> {
    /// The wrapped call itself failed.
    ///
    /// This error is replayed unchanged to every caller that shared the call, and it is served
    /// from the cache until it expires, just like a successful result.
    #[error("{0}")]
    Executor(E),
    /// The caller's deadline elapsed before the in-flight call completed.
    ///
    /// The call itself keeps running and is published for other callers.
    #[error("timed out after {0:?} waiting for in-flight call")]
    WaitTimeout(Duration),
    /// The task running the call was cancelled before it could publish a result.
    ///
    /// This only happens while the runtime is shutting down.
    #[error("in-flight call was aborted")]
    Aborted,
}

impl<E> CacheError<E> {
    /// Returns the executor error, if this is one.
    pub fn executor_error(&self) -> Option<&E> {
        match self {
            Self::Executor(err) => Some(err),
            _ => None,
        }
    }

    /// Converts this into the executor error, if this is one.
    pub fn into_executor_error(self) -> Option<E> {
        match self {
            Self::Executor(err) => Some(err),
            _ => None,
        }
    }

    /// Whether this is a [`WaitTimeout`](Self::WaitTimeout).
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::WaitTimeout(_))
    }
}

/// An entry in a cache, containing either `Ok(T)` or a [`CacheError`] denoting the reason why
/// the value could not be produced.
pub type CacheEntry<T, E> = Result<T, CacheError<E>>;
