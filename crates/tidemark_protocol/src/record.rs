//! Wire records and field values.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Server-assigned logical timestamp in milliseconds.
///
/// `0` is reserved for "never pulled". Timestamps are assigned only by the
/// server's logical clock and are unique and strictly increasing across the
/// whole store, so two records can never tie inside one pull window.
pub type Timestamp = u64;

/// A globally unique, client-assigned record id.
pub type RecordId = String;

/// A table name from the schema allow-list.
pub type TableName = String;

/// A scalar column value.
///
/// `Null` is the default value: for migration backfill purposes a column
/// that is absent from a record's field map is equivalent to `Null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    /// Absent / default.
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Integer(i64),
    /// Double-precision float.
    Float(f64),
    /// UTF-8 text.
    Text(String),
}

impl FieldValue {
    /// Returns true if this is the default (null) value.
    pub fn is_default(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    /// Returns the text content, if this is a text value.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Integer(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Float(value)
    }
}

/// A record as it travels on the wire.
///
/// Serializes to a flat JSON object: the id plus one key per column. The
/// field map is ordered so encoding is deterministic, which is what makes
/// the turbo payload byte-for-byte reconstructable.
///
/// Server bookkeeping (`last_modified`, `server_created_at`, `is_deleted`)
/// never appears here; the server assigns and strips those itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Client-assigned globally unique id.
    pub id: RecordId,
    /// Column values, keyed by column name.
    #[serde(flatten)]
    pub fields: BTreeMap<String, FieldValue>,
}

impl Record {
    /// Creates a record with no fields.
    pub fn new(id: impl Into<RecordId>) -> Self {
        Self {
            id: id.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Adds a field, builder style.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Returns a field value, treating absent columns as `Null`.
    pub fn field(&self, name: &str) -> &FieldValue {
        self.fields.get(name).unwrap_or(&FieldValue::Null)
    }
}
