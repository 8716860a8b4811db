//! Error types for the sync server.

use thiserror::Error;
use tidemark_protocol::{ProtocolError, RecordId};

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors a sync service can surface to the transport layer.
#[derive(Error, Debug)]
pub enum ServerError {
    /// The request referenced unknown tables or columns, carried duplicate
    /// ids, or was otherwise malformed. Not retryable.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Record-level validation failed in all-or-nothing mode; nothing was
    /// applied.
    #[error("validation rejected {} record(s)", rejected.len())]
    ValidationRejected {
        /// Ids of the records that failed validation.
        rejected: Vec<RecordId>,
    },

    /// The store is temporarily unavailable. Retryable.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A payload could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),
}

impl From<ProtocolError> for ServerError {
    fn from(error: ProtocolError) -> Self {
        match error {
            ProtocolError::Codec(e) => ServerError::Codec(e.to_string()),
            ProtocolError::TurboPayload(e) => ServerError::Codec(e),
            other => ServerError::InvalidRequest(other.to_string()),
        }
    }
}
