//! Error types for the sync client.

use thiserror::Error;
use tidemark_protocol::{ProtocolError, RecordId};

/// Result type for client sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can surface from a sync cycle.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The push kept conflicting after the bounded number of pull-then-push
    /// retries. Recoverable: a later sync starts the loop fresh.
    #[error("push conflicted after {attempts} attempt(s)")]
    Conflict {
        /// How many full pull-then-push attempts were made.
        attempts: u32,
    },

    /// The server rejected the request as malformed. Not retried.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Record-level validation failed server-side in all-or-nothing mode.
    #[error("server rejected {} record(s)", rejected.len())]
    ValidationRejected {
        /// Ids of the rejected records.
        rejected: Vec<RecordId>,
    },

    /// Network or transport failure.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// The server or its store is temporarily unavailable. Retryable.
    #[error("server unavailable: {0}")]
    Unavailable(String),

    /// A protocol payload failed to encode, decode or validate.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The local store failed to apply or collect changes.
    #[error("local store error: {0}")]
    LocalStore(String),

    /// The cursor store failed to persist.
    #[error("cursor store error: {0}")]
    Cursor(String),

    /// The sync was cancelled by the caller.
    #[error("sync cancelled")]
    Cancelled,

    /// A sync cycle is already running on this orchestrator.
    #[error("sync already in progress")]
    AlreadySyncing,
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if a backoff retry can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Unavailable(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(SyncError::transport_retryable("connection reset").is_retryable());
        assert!(SyncError::Unavailable("maintenance".into()).is_retryable());

        assert!(!SyncError::transport_fatal("bad certificate").is_retryable());
        assert!(!SyncError::Conflict { attempts: 3 }.is_retryable());
        assert!(!SyncError::Cancelled.is_retryable());
        assert!(!SyncError::InvalidRequest("nope".into()).is_retryable());
    }

    #[test]
    fn error_display() {
        let err = SyncError::Conflict { attempts: 4 };
        assert!(err.to_string().contains("4"));

        let err = SyncError::ValidationRejected {
            rejected: vec!["a".into()],
        };
        assert!(err.to_string().contains("1"));
    }
}
