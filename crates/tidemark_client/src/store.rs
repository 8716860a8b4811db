//! The local record store.

use crate::error::{SyncError, SyncResult};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tidemark_protocol::{ChangeSet, FieldValue, Record, RecordId, TableName};
use uuid::Uuid;

/// The embedded store the orchestrator syncs on behalf of.
///
/// Implementations track which records are dirty (created, updated or
/// deleted locally) since the last successful push, and apply a remote
/// change-set atomically: either the whole set is merged or none of it.
/// Readers may run concurrently with a sync cycle.
pub trait LocalStore: Send + Sync {
    /// Applies a pulled change-set atomically.
    fn apply_changes(&self, changes: &ChangeSet) -> SyncResult<()>;

    /// Collects the locally dirty records as a pushable change-set.
    fn collect_dirty(&self) -> SyncResult<ChangeSet>;

    /// Clears dirty markers for records a push unambiguously applied.
    fn mark_synced(&self, pushed: &ChangeSet) -> SyncResult<()>;

    /// Marks records as permanently failed so they stop blocking pushes.
    fn mark_failed(&self, rejected: &[RecordId]) -> SyncResult<()>;
}

impl<S: LocalStore + ?Sized> LocalStore for std::sync::Arc<S> {
    fn apply_changes(&self, changes: &ChangeSet) -> SyncResult<()> {
        (**self).apply_changes(changes)
    }

    fn collect_dirty(&self) -> SyncResult<ChangeSet> {
        (**self).collect_dirty()
    }

    fn mark_synced(&self, pushed: &ChangeSet) -> SyncResult<()> {
        (**self).mark_synced(pushed)
    }

    fn mark_failed(&self, rejected: &[RecordId]) -> SyncResult<()> {
        (**self).mark_failed(rejected)
    }
}

/// Local dirty state of one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DirtyState {
    /// In step with the server as of the last pull or push.
    Synced,
    /// Created locally, never pushed.
    Created,
    /// Modified locally since the last push.
    Updated,
    /// Rejected by the server; excluded from future pushes.
    Failed,
}

#[derive(Debug, Clone)]
struct LocalRecord {
    fields: BTreeMap<String, FieldValue>,
    state: DirtyState,
}

#[derive(Debug, Default)]
struct Inner {
    rows: BTreeMap<TableName, BTreeMap<RecordId, LocalRecord>>,
    /// Locally deleted, not yet pushed.
    tombstones: BTreeMap<TableName, BTreeSet<RecordId>>,
}

/// An in-memory [`LocalStore`].
///
/// Remote applies never clobber locally dirty rows: the local edit stays,
/// and the conflict-retry loop pushes it once the cursor has caught up with
/// the remote edit it raced against. Remote deletions win unconditionally —
/// the server is authoritative for deletes.
#[derive(Debug, Default)]
pub struct MemoryLocalStore {
    inner: RwLock<Inner>,
}

impl MemoryLocalStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a record with a fresh id and marks it dirty.
    pub fn create(
        &self,
        table: impl Into<TableName>,
        fields: BTreeMap<String, FieldValue>,
    ) -> RecordId {
        let id = Uuid::new_v4().to_string();
        self.insert_with_id(table, id.clone(), fields);
        id
    }

    /// Creates a record under a caller-chosen id and marks it dirty.
    pub fn insert_with_id(
        &self,
        table: impl Into<TableName>,
        id: impl Into<RecordId>,
        fields: BTreeMap<String, FieldValue>,
    ) {
        let mut inner = self.inner.write();
        inner.rows.entry(table.into()).or_default().insert(
            id.into(),
            LocalRecord {
                fields,
                state: DirtyState::Created,
            },
        );
    }

    /// Merges new field values into a record and marks it dirty.
    pub fn update(
        &self,
        table: &str,
        id: &str,
        fields: BTreeMap<String, FieldValue>,
    ) -> SyncResult<()> {
        let mut inner = self.inner.write();
        let record = inner
            .rows
            .get_mut(table)
            .and_then(|rows| rows.get_mut(id))
            .ok_or_else(|| SyncError::LocalStore(format!("no record {id:?} in {table:?}")))?;

        record.fields.extend(fields);
        if record.state != DirtyState::Created {
            record.state = DirtyState::Updated;
        }
        Ok(())
    }

    /// Deletes a record locally.
    ///
    /// A record that was never pushed simply disappears; anything else
    /// leaves a tombstone to carry the deletion to the server.
    pub fn delete(&self, table: &str, id: &str) -> SyncResult<()> {
        let mut inner = self.inner.write();
        let removed = inner
            .rows
            .get_mut(table)
            .and_then(|rows| rows.remove(id))
            .ok_or_else(|| SyncError::LocalStore(format!("no record {id:?} in {table:?}")))?;

        if removed.state != DirtyState::Created {
            inner
                .tombstones
                .entry(table.to_string())
                .or_default()
                .insert(id.to_string());
        }
        Ok(())
    }

    /// Reads a record's fields.
    pub fn get(&self, table: &str, id: &str) -> Option<BTreeMap<String, FieldValue>> {
        self.inner
            .read()
            .rows
            .get(table)?
            .get(id)
            .map(|record| record.fields.clone())
    }

    /// Returns the number of live local records.
    pub fn len(&self) -> usize {
        self.inner.read().rows.values().map(BTreeMap::len).sum()
    }

    /// Returns true if the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns every record of a table, for inspection.
    pub fn records(&self, table: &str) -> Vec<Record> {
        self.inner
            .read()
            .rows
            .get(table)
            .map(|rows| {
                rows.iter()
                    .map(|(id, record)| Record {
                        id: id.clone(),
                        fields: record.fields.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl LocalStore for MemoryLocalStore {
    fn apply_changes(&self, changes: &ChangeSet) -> SyncResult<()> {
        changes.validate()?;

        // One write guard for the whole merge keeps it atomic with respect
        // to readers and to a crash between tables.
        let mut inner = self.inner.write();

        for (table, table_changes) in &changes.tables {
            for record in table_changes.created.iter().chain(&table_changes.updated) {
                let locally_deleted = inner
                    .tombstones
                    .get(table)
                    .is_some_and(|ids| ids.contains(&record.id));
                if locally_deleted {
                    continue;
                }

                let rows = inner.rows.entry(table.clone()).or_default();
                match rows.get_mut(&record.id) {
                    Some(existing)
                        if matches!(
                            existing.state,
                            DirtyState::Created | DirtyState::Updated
                        ) =>
                    {
                        // Local edit wins locally; the push loop reconciles.
                    }
                    Some(existing) => {
                        existing.fields = record.fields.clone();
                        existing.state = DirtyState::Synced;
                    }
                    None => {
                        rows.insert(
                            record.id.clone(),
                            LocalRecord {
                                fields: record.fields.clone(),
                                state: DirtyState::Synced,
                            },
                        );
                    }
                }
            }

            for id in &table_changes.deleted {
                if let Some(rows) = inner.rows.get_mut(table) {
                    rows.remove(id);
                }
                if let Some(ids) = inner.tombstones.get_mut(table) {
                    ids.remove(id);
                }
            }
        }

        Ok(())
    }

    fn collect_dirty(&self) -> SyncResult<ChangeSet> {
        let inner = self.inner.read();
        let mut changes = ChangeSet::new();

        for (table, rows) in &inner.rows {
            for (id, record) in rows {
                let wire = Record {
                    id: id.clone(),
                    fields: record.fields.clone(),
                };
                match record.state {
                    DirtyState::Created => changes.table_mut(table.clone()).created.push(wire),
                    DirtyState::Updated => changes.table_mut(table.clone()).updated.push(wire),
                    DirtyState::Synced | DirtyState::Failed => {}
                }
            }
        }

        for (table, ids) in &inner.tombstones {
            changes
                .table_mut(table.clone())
                .deleted
                .extend(ids.iter().cloned());
        }

        changes.prune_empty();
        Ok(changes)
    }

    fn mark_synced(&self, pushed: &ChangeSet) -> SyncResult<()> {
        let mut inner = self.inner.write();

        for (table, table_changes) in &pushed.tables {
            if let Some(rows) = inner.rows.get_mut(table) {
                for record in table_changes.created.iter().chain(&table_changes.updated) {
                    if let Some(local) = rows.get_mut(&record.id) {
                        local.state = DirtyState::Synced;
                    }
                }
            }
            if let Some(ids) = inner.tombstones.get_mut(table) {
                for id in &table_changes.deleted {
                    ids.remove(id);
                }
            }
        }

        Ok(())
    }

    fn mark_failed(&self, rejected: &[RecordId]) -> SyncResult<()> {
        let rejected: HashSet<&RecordId> = rejected.iter().collect();
        let mut inner = self.inner.write();

        for rows in inner.rows.values_mut() {
            for (id, record) in rows.iter_mut() {
                if rejected.contains(id) {
                    record.state = DirtyState::Failed;
                }
            }
        }
        for ids in inner.tombstones.values_mut() {
            ids.retain(|id| !rejected.contains(id));
        }

        Ok(())
    }
}
