//! # Tidemark Sync Protocol
//!
//! Shared protocol types and JSON codecs for Tidemark synchronization.
//!
//! This crate provides:
//! - `Record` and `FieldValue` for wire records
//! - `ChangeSet` / `TableChanges` batched change collections
//! - Protocol messages (Pull, Push) including the turbo bootstrap payload
//! - `Schema` allow-list of known tables and columns
//! - `MigrationDescriptor` and the `SchemaHistory` negotiator
//!
//! This is a pure protocol crate with no I/O operations. Both the client
//! engine and the server build on these types, which is what keeps the two
//! sides agreeing on the shape of a change-set and on migration expansion.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod changes;
mod error;
mod messages;
mod migration;
mod record;
mod schema;

pub use changes::{ChangeSet, TableChanges};
pub use error::{ProtocolError, ProtocolResult};
pub use messages::{PullRequest, PullResponse, PushRequest, PushResponse};
pub use migration::{MigrationDescriptor, SchemaHistory, SchemaStep};
pub use record::{FieldValue, Record, RecordId, TableName, Timestamp};
pub use schema::{is_bookkeeping_field, Schema, TableSchema, MAX_RECORD_ID_LEN};
