//! # Tidemark Sync Client
//!
//! Client-side orchestration for Tidemark synchronization.
//!
//! This crate provides:
//! - Sync state machine (idle → pulling → merging → pushing)
//! - `SyncCursor` persistence with corrupt-state recovery
//! - Bounded pull-retry on push conflict
//! - Retry with exponential backoff for transient failures
//! - `SyncTransport` abstraction with a scripted mock
//! - `LocalStore` abstraction with an in-memory implementation
//!
//! ## Architecture
//!
//! One sync cycle is pull → merge → push:
//! 1. Pull remote changes since the stored cursor (server is authoritative)
//! 2. Apply them atomically to the local store, then advance the cursor
//! 3. Push locally dirty records with the current cursor
//!
//! A push conflict means the server saw a newer write for some targeted
//! record; the cycle re-enters the pull phase to fetch it and tries again,
//! a bounded number of times.
//!
//! ## Key invariants
//!
//! - The cursor advances only after a fully successful local merge
//! - Dirty markers clear only on an unambiguous push success
//! - Cancellation never leaves a partial merge behind

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod cursor;
mod error;
mod orchestrator;
mod store;
mod transport;

pub use config::{RetryConfig, SyncConfig};
pub use cursor::{CursorStore, FileCursorStore, MemoryCursorStore, SyncCursor};
pub use error::{SyncError, SyncResult};
pub use orchestrator::{SyncOrchestrator, SyncReport, SyncState, SyncStats};
pub use store::{LocalStore, MemoryLocalStore};
pub use transport::{MockTransport, SyncTransport};
