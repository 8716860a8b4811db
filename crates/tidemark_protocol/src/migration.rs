//! Migration descriptors and schema negotiation.
//!
//! When a client upgrades its local schema it has rows missing for tables
//! and columns it did not previously know about. The client describes the
//! gap with a [`MigrationDescriptor`]; the server broadens the next pull to
//! backfill it. [`SchemaHistory`] is the shared, pure negotiation logic:
//! both sides can derive the same descriptor from a version range.

use crate::error::{ProtocolError, ProtocolResult};
use crate::record::TableName;
use crate::schema::Schema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Schema additions a client needs backfilled during pull.
///
/// Supplied by the client when its schema is newer than its last confirmed
/// sync state; consumed once by the server's pull path; never persisted
/// server-side.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MigrationDescriptor {
    /// Schema version the client last synced at.
    pub from_version: u32,
    /// Tables the client has no rows for yet.
    #[serde(default)]
    pub new_tables: BTreeSet<TableName>,
    /// Columns, per table, the client needs backfilled.
    #[serde(default)]
    pub new_columns: BTreeMap<TableName, BTreeSet<String>>,
}

impl MigrationDescriptor {
    /// Returns true if there is nothing to backfill.
    pub fn is_empty(&self) -> bool {
        self.new_tables.is_empty() && self.new_columns.is_empty()
    }

    /// Validates every referenced table and column against the allow-list.
    pub fn validate_against(&self, schema: &Schema) -> ProtocolResult<()> {
        for table in &self.new_tables {
            schema.check_table(table)?;
        }
        for (table, columns) in &self.new_columns {
            for column in columns {
                schema.check_column(table, column)?;
            }
        }
        Ok(())
    }
}

/// One additive schema step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaStep {
    /// The version this step upgrades to.
    pub to_version: u32,
    /// Tables introduced by this step.
    #[serde(default)]
    pub added_tables: BTreeSet<TableName>,
    /// Columns introduced by this step, per pre-existing table.
    #[serde(default)]
    pub added_columns: BTreeMap<TableName, BTreeSet<String>>,
}

impl SchemaStep {
    /// Creates an empty step targeting a version.
    pub fn to(version: u32) -> Self {
        Self {
            to_version: version,
            ..Self::default()
        }
    }

    /// Adds a new table, builder style.
    pub fn adds_table(mut self, table: impl Into<TableName>) -> Self {
        self.added_tables.insert(table.into());
        self
    }

    /// Adds a new column on an existing table, builder style.
    pub fn adds_column(mut self, table: impl Into<TableName>, column: impl Into<String>) -> Self {
        self.added_columns
            .entry(table.into())
            .or_default()
            .insert(column.into());
        self
    }
}

/// The ordered history of additive schema steps.
///
/// Stateless and side-effect free: negotiation is a pure fold over the
/// steps strictly after `from_version`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaHistory {
    steps: Vec<SchemaStep>,
}

impl SchemaHistory {
    /// Creates an empty history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a step, builder style. Steps must be added in version order.
    pub fn with_step(mut self, step: SchemaStep) -> ProtocolResult<Self> {
        if let Some(last) = self.steps.last() {
            if step.to_version <= last.to_version {
                return Err(ProtocolError::MalformedMigration(format!(
                    "step to version {} is not after {}",
                    step.to_version, last.to_version
                )));
            }
        }
        self.steps.push(step);
        Ok(self)
    }

    /// Returns the newest version the history describes.
    pub fn current_version(&self) -> u32 {
        self.steps.last().map(|s| s.to_version).unwrap_or(0)
    }

    /// Produces the descriptor covering every step after `from_version`.
    ///
    /// Returns `None` when the client is already current. Tables that are
    /// themselves new absorb their own later column additions: a column
    /// added to a table introduced inside the same range stays out of
    /// `new_columns`, since the whole table is already being backfilled.
    pub fn descriptor_since(&self, from_version: u32) -> Option<MigrationDescriptor> {
        if from_version >= self.current_version() {
            return None;
        }

        let mut descriptor = MigrationDescriptor {
            from_version,
            ..MigrationDescriptor::default()
        };

        for step in self.steps.iter().filter(|s| s.to_version > from_version) {
            descriptor.new_tables.extend(step.added_tables.iter().cloned());
            for (table, columns) in &step.added_columns {
                if descriptor.new_tables.contains(table) {
                    continue;
                }
                descriptor
                    .new_columns
                    .entry(table.clone())
                    .or_default()
                    .extend(columns.iter().cloned());
            }
        }

        if descriptor.is_empty() {
            None
        } else {
            Some(descriptor)
        }
    }
}
