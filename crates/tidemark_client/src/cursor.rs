//! The client's persistent sync position.

use crate::error::{SyncError, SyncResult};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tidemark_protocol::{MigrationDescriptor, Timestamp};

/// The client's sync position, persisted across restarts.
///
/// Mutated only by the orchestrator after a fully successful pull and
/// merge, never on push. A missing or corrupt cursor loads as the default,
/// which forces a fresh bootstrap pull — strictly safe, since pulls are
/// idempotent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncCursor {
    /// Timestamp of the last fully merged pull; `0` means never pulled.
    pub last_pulled_at: Timestamp,
    /// Schema version confirmed by that pull.
    pub schema_version: u32,
    /// Migration the server has not yet honored for this client.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_migration: Option<MigrationDescriptor>,
}

/// Persistence for the [`SyncCursor`].
pub trait CursorStore: Send + Sync {
    /// Loads the cursor. Implementations return the default cursor, never
    /// an error, when the persisted state is missing or unreadable.
    fn load(&self) -> SyncResult<SyncCursor>;

    /// Persists the cursor.
    fn save(&self, cursor: &SyncCursor) -> SyncResult<()>;
}

impl<C: CursorStore + ?Sized> CursorStore for std::sync::Arc<C> {
    fn load(&self) -> SyncResult<SyncCursor> {
        (**self).load()
    }

    fn save(&self, cursor: &SyncCursor) -> SyncResult<()> {
        (**self).save(cursor)
    }
}

/// An in-memory cursor store for tests and ephemeral clients.
#[derive(Debug, Default)]
pub struct MemoryCursorStore {
    cursor: RwLock<SyncCursor>,
}

impl MemoryCursorStore {
    /// Creates a store holding the default cursor.
    pub fn new() -> Self {
        Self::default()
    }
}

impl CursorStore for MemoryCursorStore {
    fn load(&self) -> SyncResult<SyncCursor> {
        Ok(self.cursor.read().clone())
    }

    fn save(&self, cursor: &SyncCursor) -> SyncResult<()> {
        *self.cursor.write() = cursor.clone();
        Ok(())
    }
}

/// A cursor store backed by a JSON file.
#[derive(Debug)]
pub struct FileCursorStore {
    path: PathBuf,
}

impl FileCursorStore {
    /// Creates a store at the given path. The file need not exist yet.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl CursorStore for FileCursorStore {
    fn load(&self) -> SyncResult<SyncCursor> {
        // Anything unreadable degrades to a fresh bootstrap.
        let cursor = std::fs::read_to_string(&self.path)
            .ok()
            .and_then(|text| serde_json::from_str(&text).ok())
            .unwrap_or_default();
        Ok(cursor)
    }

    fn save(&self, cursor: &SyncCursor) -> SyncResult<()> {
        let text = serde_json::to_string(cursor)
            .map_err(|e| SyncError::Cursor(e.to_string()))?;
        std::fs::write(&self.path, text).map_err(|e| SyncError::Cursor(e.to_string()))
    }
}
