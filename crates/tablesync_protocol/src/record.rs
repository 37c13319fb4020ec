//! Table-shaped records.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// A record: a flat map of field names to JSON values.
pub type Record = serde_json::Map<String, Value>;

/// Name of the identifier field every record carries.
pub const ID_FIELD: &str = "id";

/// Returns the identifier of a record.
///
/// String ids are returned as-is; numeric ids are rendered in decimal.
/// Empty strings and any other value types count as missing.
pub fn record_id(record: &Record) -> Option<String> {
    match record.get(ID_FIELD)? {
        Value::String(id) if !id.is_empty() => Some(id.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Identifies a record across tables.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    /// Table name.
    pub table: String,
    /// Record identifier within the table.
    pub id: String,
}

impl RecordKey {
    /// Creates a key.
    pub fn new(table: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.table, self.id)
    }
}
