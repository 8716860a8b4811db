//! Error types for the protocol crate.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors that can occur while validating or encoding protocol data.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// An id appeared more than once across created/updated/deleted
    /// for a single table.
    #[error("duplicate id {id:?} in changes for table {table:?}")]
    DuplicateId {
        /// Table containing the duplicate.
        table: String,
        /// Offending record id.
        id: String,
    },

    /// A table name is not in the schema allow-list.
    #[error("unknown table {0:?}")]
    UnknownTable(String),

    /// A column name is not in the schema allow-list for its table.
    #[error("unknown column {column:?} in table {table:?}")]
    UnknownColumn {
        /// Table the column was referenced under.
        table: String,
        /// Offending column name.
        column: String,
    },

    /// A migration descriptor is structurally invalid.
    #[error("malformed migration descriptor: {0}")]
    MalformedMigration(String),

    /// JSON encoding or decoding failed.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// A turbo payload could not be reconstructed into a structured response.
    #[error("invalid turbo payload: {0}")]
    TurboPayload(String),
}
