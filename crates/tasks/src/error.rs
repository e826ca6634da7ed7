use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::task::TaskStatus;

/// Error returned by a task body.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// Worth another attempt (network hiccup, backend busy, ...).
    #[error("{0}")]
    Retryable(String),
    /// Retrying cannot help (malformed input, unsupported media, ...).
    #[error("{0}")]
    Fatal(String),
}

impl TaskError {
    pub fn retryable(msg: impl Into<String>) -> Self {
        Self::Retryable(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }
}

/// A lifecycle transition was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("task is {status}, not pending")]
    NotClaimable { status: TaskStatus },
    #[error("task is in backoff until {available_at}")]
    BackoffPending { available_at: DateTime<Utc> },
    #[error("lease is not held by the caller")]
    NotOwner,
    #[error("task already reached terminal status {status}")]
    AlreadyTerminal { status: TaskStatus },
}
