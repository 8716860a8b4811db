//! The table/column allow-list.
//!
//! Every table and column a request may touch is enumerated here and checked
//! before any read or write reaches storage. There is no dynamic field
//! access: a name that is not in the schema is rejected as an invalid
//! request, never silently written.

use crate::error::{ProtocolError, ProtocolResult};
use crate::record::TableName;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Maximum accepted length of a record id, in bytes.
pub const MAX_RECORD_ID_LEN: usize = 64;

/// Returns true for protocol-internal bookkeeping fields that must never
/// reach storage (`_status`, `_changed`, and anything else underscored).
pub fn is_bookkeeping_field(name: &str) -> bool {
    name.starts_with('_')
}

/// Schema for one table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    /// Allowed column names.
    pub columns: BTreeSet<String>,
    /// Foreign-key edges: column name to the parent table it references.
    /// Used for descendant cleanup when a parent is soft-deleted.
    #[serde(default)]
    pub references: BTreeMap<String, TableName>,
}

impl TableSchema {
    /// Creates a table schema from column names.
    pub fn with_columns<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            references: BTreeMap::new(),
        }
    }

    /// Declares that `column` holds the id of a record in `parent_table`,
    /// builder style. The column itself must also be listed in `columns`.
    pub fn with_reference(
        mut self,
        column: impl Into<String>,
        parent_table: impl Into<TableName>,
    ) -> Self {
        self.references.insert(column.into(), parent_table.into());
        self
    }

    /// Returns true if the column is allowed.
    pub fn contains_column(&self, column: &str) -> bool {
        self.columns.contains(column)
    }
}

/// The full allow-list: every known table with its columns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    /// Schema version this allow-list describes.
    pub version: u32,
    /// Tables keyed by name.
    pub tables: BTreeMap<TableName, TableSchema>,
}

impl Schema {
    /// Creates an empty schema at a version.
    pub fn new(version: u32) -> Self {
        Self {
            version,
            tables: BTreeMap::new(),
        }
    }

    /// Adds a table, builder style.
    pub fn with_table(mut self, name: impl Into<TableName>, table: TableSchema) -> Self {
        self.tables.insert(name.into(), table);
        self
    }

    /// Returns the schema for a table, if known.
    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.get(name)
    }

    /// Returns true if the table is allowed.
    pub fn contains_table(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    /// Fails unless the table is in the allow-list.
    pub fn check_table(&self, name: &str) -> ProtocolResult<&TableSchema> {
        self.table(name)
            .ok_or_else(|| ProtocolError::UnknownTable(name.to_string()))
    }

    /// Fails unless the column is in the allow-list for the table.
    pub fn check_column(&self, table: &str, column: &str) -> ProtocolResult<()> {
        let table_schema = self.check_table(table)?;
        if table_schema.contains_column(column) {
            Ok(())
        } else {
            Err(ProtocolError::UnknownColumn {
                table: table.to_string(),
                column: column.to_string(),
            })
        }
    }

    /// Returns the tables that reference `parent`, with the referencing
    /// column: the immediate children for descendant cleanup.
    pub fn children_of(&self, parent: &str) -> Vec<(&TableName, &String)> {
        let mut children = Vec::new();
        for (name, table) in &self.tables {
            for (column, referenced) in &table.references {
                if referenced == parent {
                    children.push((name, column));
                }
            }
        }
        children
    }
}
