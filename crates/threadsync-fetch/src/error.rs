//! Error types for fetching and actions.

use thiserror::Error;
use threadsync_cache::CacheError;

/// Outcome of a task that went through a [`ThrottleQueue`](crate::ThrottleQueue).
#[derive(Debug, Error)]
pub enum ThrottleError<E> {
    /// The queue was cleared before the task was dequeued.
    #[error("queued task was cancelled before it ran")]
    Cancelled,

    /// The task ran and failed.
    #[error(transparent)]
    Task(E),
}

impl<E> ThrottleError<E> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ThrottleError::Cancelled)
    }
}

/// Errors from a [`PaginatedFetcher`](crate::PaginatedFetcher).
#[derive(Debug, Error)]
pub enum FetchError<E> {
    /// The page fetch function failed; propagated unmodified.
    #[error(transparent)]
    Backend(E),

    /// The fetch was cancelled by teardown or a queue clear.
    #[error("fetch was cancelled")]
    Cancelled,

    /// Fetched items could not be written into the cache.
    #[error("failed to cache fetched page: {0}")]
    Cache(#[from] CacheError),
}

impl<E> FetchError<E> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, FetchError::Cancelled)
    }
}

impl<E> From<ThrottleError<E>> for FetchError<E> {
    fn from(err: ThrottleError<E>) -> Self {
        match err {
            ThrottleError::Cancelled => FetchError::Cancelled,
            ThrottleError::Task(e) => FetchError::Backend(e),
        }
    }
}

/// Errors reported by a normalized backend adapter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// The request never produced a response.
    #[error("network error: {0}")]
    Network(String),

    /// The response could not be mapped onto the normalized types.
    #[error("failed to parse backend response: {0}")]
    Parse(String),

    /// The instance answered with an error.
    #[error("backend rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// The fetch was abandoned before the instance answered.
    #[error("request was cancelled")]
    Cancelled,
}

/// Errors from an optimistic action.
#[derive(Debug, Error)]
pub enum ActionError {
    /// The backend call failed; the overlay has been rolled back.
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// Writing the overlay or the authoritative result failed.
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),
}
