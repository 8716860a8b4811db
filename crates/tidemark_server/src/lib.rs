//! # Tidemark Sync Server
//!
//! Authoritative side of Tidemark synchronization.
//!
//! This crate provides:
//! - `LogicalClock` for unique, strictly increasing write timestamps
//! - `RecordStore` with all-or-nothing write transactions
//! - `PullService` (delta computation, turbo bootstrap, migration expansion)
//! - `PushService` (conflict detection, upsert, soft delete, strictness modes)
//! - `SyncServer` facade bundling the above
//!
//! # Architecture
//!
//! Pulls are read-only and capture their consistency point from the clock
//! before issuing any query; pushes run as one store transaction and either
//! commit everything or nothing. Conflict detection compares each targeted
//! record's `last_modified` against the client's `last_pulled_at`, so a
//! client can never blindly overwrite a remote edit it has not yet seen.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod clock;
mod config;
mod error;
mod pull;
mod push;
mod server;
mod store;

pub use clock::LogicalClock;
pub use config::{RejectionMode, ServerConfig};
pub use error::{ServerError, ServerResult};
pub use pull::PullService;
pub use push::PushService;
pub use server::SyncServer;
pub use store::{RecordStore, StoreTransaction, VersionedRecord};
