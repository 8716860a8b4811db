//! The remote record store.
//!
//! `RecordStore` is the authoritative store: every record keyed by table and
//! id, versioned with server-assigned timestamps, deletions kept as
//! tombstones. Writes go through [`StoreTransaction`]: stage, then commit
//! everything under one guard, or drop the transaction and nothing happened.
//! Pulls use the read-side query methods and only ever see committed state.

use parking_lot::{RwLock, RwLockWriteGuard};
use std::collections::BTreeMap;
use tidemark_protocol::{FieldValue, Record, RecordId, TableName, Timestamp};

/// A stored record with its server-side bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionedRecord {
    /// Column values.
    pub fields: BTreeMap<String, FieldValue>,
    /// Server timestamp of the last write to this record.
    pub last_modified: Timestamp,
    /// Server timestamp of the record's first insertion.
    pub server_created_at: Timestamp,
    /// Soft-delete tombstone flag.
    pub is_deleted: bool,
}

impl VersionedRecord {
    /// Converts to a wire record carrying the full field set.
    pub fn to_wire(&self, id: &str) -> Record {
        Record {
            id: id.to_string(),
            fields: self.fields.clone(),
        }
    }

    /// Returns true if the named column is absent or holds the default.
    pub fn field_is_default(&self, column: &str) -> bool {
        self.fields.get(column).is_none_or(FieldValue::is_default)
    }
}

type Tables = BTreeMap<TableName, BTreeMap<RecordId, VersionedRecord>>;

/// In-memory transactional record store.
pub struct RecordStore {
    tables: RwLock<Tables>,
}

impl RecordStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(BTreeMap::new()),
        }
    }

    /// Begins a write transaction.
    ///
    /// The transaction holds the store's write guard for its whole lifetime,
    /// which is what serializes concurrent pushes: a later push observes the
    /// earlier one's committed `last_modified` values.
    pub fn begin(&self) -> StoreTransaction<'_> {
        StoreTransaction {
            guard: self.tables.write(),
            staged: BTreeMap::new(),
        }
    }

    /// Returns a committed record, if present (tombstones included).
    pub fn get(&self, table: &str, id: &str) -> Option<VersionedRecord> {
        self.tables.read().get(table)?.get(id).cloned()
    }

    /// Returns the highest committed `last_modified`, `0` for an empty
    /// store. Used to seed the logical clock.
    pub fn max_last_modified(&self) -> Timestamp {
        self.tables
            .read()
            .values()
            .flat_map(|rows| rows.values())
            .map(|row| row.last_modified)
            .max()
            .unwrap_or(0)
    }

    /// Returns every record with `last_modified` in `(after, up_to]`,
    /// tombstones included.
    pub fn changed_since(
        &self,
        after: Timestamp,
        up_to: Timestamp,
    ) -> Vec<(TableName, RecordId, VersionedRecord)> {
        let tables = self.tables.read();
        let mut out = Vec::new();
        for (table, rows) in tables.iter() {
            for (id, row) in rows {
                if row.last_modified > after && row.last_modified <= up_to {
                    out.push((table.clone(), id.clone(), row.clone()));
                }
            }
        }
        out
    }

    /// Returns every live (non-deleted) record of a table committed at or
    /// before `up_to`.
    pub fn table_live(&self, table: &str, up_to: Timestamp) -> Vec<(RecordId, VersionedRecord)> {
        let tables = self.tables.read();
        let Some(rows) = tables.get(table) else {
            return Vec::new();
        };
        rows.iter()
            .filter(|(_, row)| !row.is_deleted && row.last_modified <= up_to)
            .map(|(id, row)| (id.clone(), row.clone()))
            .collect()
    }

    /// Returns the number of records, tombstones included.
    pub fn len(&self) -> usize {
        self.tables.read().values().map(BTreeMap::len).sum()
    }

    /// Returns true if the store holds no records at all.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RecordStore {
    fn default() -> Self {
        Self::new()
    }
}

/// A pending write transaction against a [`RecordStore`].
///
/// Reads observe staged writes first, then committed state. `commit`
/// publishes every staged write at once; dropping the transaction without
/// committing discards them all.
pub struct StoreTransaction<'a> {
    guard: RwLockWriteGuard<'a, Tables>,
    staged: BTreeMap<(TableName, RecordId), VersionedRecord>,
}

impl StoreTransaction<'_> {
    /// Reads a record, staged writes taking precedence.
    pub fn get(&self, table: &str, id: &str) -> Option<&VersionedRecord> {
        if let Some(staged) = self.staged.get(&(table.to_string(), id.to_string())) {
            return Some(staged);
        }
        self.guard.get(table)?.get(id)
    }

    /// Bulk-fetches the existing rows for a set of ids in one pass.
    pub fn get_many<'i>(
        &self,
        table: &str,
        ids: impl IntoIterator<Item = &'i RecordId>,
    ) -> BTreeMap<RecordId, VersionedRecord> {
        ids.into_iter()
            .filter_map(|id| self.get(table, id).map(|row| (id.clone(), row.clone())))
            .collect()
    }

    /// Returns every record of a table, staged writes folded in.
    pub fn records_in(&self, table: &str) -> Vec<(RecordId, VersionedRecord)> {
        let mut rows: BTreeMap<RecordId, VersionedRecord> = self
            .guard
            .get(table)
            .map(|rows| {
                rows.iter()
                    .map(|(id, row)| (id.clone(), row.clone()))
                    .collect()
            })
            .unwrap_or_default();

        for ((staged_table, id), row) in &self.staged {
            if staged_table == table {
                rows.insert(id.clone(), row.clone());
            }
        }

        rows.into_iter().collect()
    }

    /// Stages a write.
    pub fn put(&mut self, table: &str, id: &str, record: VersionedRecord) {
        self.staged
            .insert((table.to_string(), id.to_string()), record);
    }

    /// Number of staged writes.
    pub fn staged_len(&self) -> usize {
        self.staged.len()
    }

    /// Publishes every staged write atomically.
    pub fn commit(mut self) {
        let staged = std::mem::take(&mut self.staged);
        for ((table, id), record) in staged {
            self.guard.entry(table).or_default().insert(id, record);
        }
    }
}
