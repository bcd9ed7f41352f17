//! Error types shared across the crate.

use crate::{ThreadId, TurnId};

pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error for service and store operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Nav(#[from] NavError),

    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Turn store failures.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Lookup of a turn that does not exist in the thread's log.
    #[error("turn {turn_id} not found in thread {thread_id}")]
    NotFound { thread_id: ThreadId, turn_id: TurnId },

    /// Append referenced a parent turn that does not exist. Integration
    /// error, never retried.
    #[error("parent turn {parent_id} does not exist in thread {thread_id}")]
    InvalidParent {
        thread_id: ThreadId,
        parent_id: TurnId,
    },

    #[error("storage backend error: {0}")]
    Backend(#[source] anyhow::Error),
}

/// Navigation failures. These never cross the service boundary; the service
/// translates them into sentinel responses for the UI layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum NavError {
    /// Navigation attempted with no branch line to navigate.
    #[error("no replies to navigate in this thread")]
    EmptyBranch,

    /// Cursor is already at the edge of the branch line.
    #[error("cursor is at the edge of the branch line")]
    Boundary,
}

/// Categorized failures from the external generation backend.
///
/// Server and rate-limit categories are worth retrying with backoff; auth
/// and validation failures are surfaced immediately.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GenerationError {
    #[error("upstream server error: {0}")]
    Server(String),

    #[error("rate limited by upstream: {0}")]
    RateLimit(String),

    #[error("authentication with upstream failed: {0}")]
    Auth(String),

    #[error("generation request rejected: {0}")]
    Validation(String),

    #[error("generation failed: {0}")]
    Unknown(String),
}

impl GenerationError {
    /// Whether the retry policy applies to this category.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GenerationError::Server(_) | GenerationError::RateLimit(_)
        )
    }
}
