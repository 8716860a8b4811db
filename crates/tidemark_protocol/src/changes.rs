//! Batched change collections.

use crate::error::{ProtocolError, ProtocolResult};
use crate::record::{Record, RecordId, TableName};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Changes to a single table.
///
/// Invariant: an id appears in at most one of the three collections, and at
/// most once within it. `ChangeSet::validate` enforces this.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableChanges {
    /// Records first seen by the receiving side, with their full field set.
    #[serde(default)]
    pub created: Vec<Record>,
    /// Records the receiving side already has, with their full field set.
    #[serde(default)]
    pub updated: Vec<Record>,
    /// Ids of deleted records.
    #[serde(default)]
    pub deleted: Vec<RecordId>,
}

impl TableChanges {
    /// Returns true if there are no changes.
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    /// Returns the total number of changed records.
    pub fn len(&self) -> usize {
        self.created.len() + self.updated.len() + self.deleted.len()
    }

    /// Iterates over every id referenced by these changes.
    pub fn ids(&self) -> impl Iterator<Item = &RecordId> {
        self.created
            .iter()
            .map(|r| &r.id)
            .chain(self.updated.iter().map(|r| &r.id))
            .chain(self.deleted.iter())
    }
}

/// A per-table collection of changes, the unit of both pull and push.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeSet {
    /// Changes keyed by table name. Ordered for deterministic encoding.
    pub tables: BTreeMap<TableName, TableChanges>,
}

impl ChangeSet {
    /// Creates an empty change-set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the changes for a table, inserting an empty entry if needed.
    pub fn table_mut(&mut self, table: impl Into<TableName>) -> &mut TableChanges {
        self.tables.entry(table.into()).or_default()
    }

    /// Returns the changes for a table, if any.
    pub fn table(&self, table: &str) -> Option<&TableChanges> {
        self.tables.get(table)
    }

    /// Returns true if no table has any changes.
    pub fn is_empty(&self) -> bool {
        self.tables.values().all(TableChanges::is_empty)
    }

    /// Returns the total number of changed records across all tables.
    pub fn len(&self) -> usize {
        self.tables.values().map(TableChanges::len).sum()
    }

    /// Checks the at-most-once-id invariant for every table.
    pub fn validate(&self) -> ProtocolResult<()> {
        for (table, changes) in &self.tables {
            let mut seen: HashSet<&RecordId> = HashSet::with_capacity(changes.len());
            for id in changes.ids() {
                if !seen.insert(id) {
                    return Err(ProtocolError::DuplicateId {
                        table: table.clone(),
                        id: id.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Drops tables with no changes, keeping responses compact.
    pub fn prune_empty(&mut self) {
        self.tables.retain(|_, changes| !changes.is_empty());
    }
}
