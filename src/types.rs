//! Shared row/value/query-argument types used across every component.
//!
//! A row is kept as a `serde_json::Map` rather than a bespoke struct so the
//! same shape can flow unmodified from the caller, through the change log,
//! through the conflict resolver, and into either backing store.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

pub type Row = Map<String, Value>;

/// JSON-serialized projection of a table's primary-key columns.
/// Used as the stable key in the change log and during sync.
pub type RowId = Value;

pub fn row_id_to_string(row_id: &RowId) -> String {
    serde_json::to_string(row_id).unwrap_or_else(|_| "null".to_string())
}

/// A single comparison in a `where` clause.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum Operator {
    Equals(Value),
    Not(Value),
    In(Vec<Value>),
    NotIn(Vec<Value>),
    Lt(Value),
    Lte(Value),
    Gt(Value),
    Gte(Value),
    Contains(String),
    StartsWith(String),
    EndsWith(String),
}

/// A structured `where` clause: `AND`/`OR`/`NOT` composition of field
/// comparisons. `Undefined` fields (omitted entirely from the caller's
/// object) are never represented here — they simply don't appear and are
/// ignored, matching the primary engine's semantics.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Where {
    pub fields: HashMap<String, Operator>,
    pub and: Vec<Where>,
    pub or: Vec<Where>,
    pub not: Vec<Where>,
}

impl Where {
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.and.is_empty() && self.or.is_empty() && self.not.is_empty()
    }

    /// Build a simple equality-only where clause from a row projection,
    /// e.g. the primary-key projection used throughout the sync path.
    pub fn from_equals(row: &Row) -> Self {
        let mut fields = HashMap::new();
        for (k, v) in row.iter() {
            fields.insert(k.clone(), Operator::Equals(v.clone()));
        }
        Where { fields, and: Vec::new(), or: Vec::new(), not: Vec::new() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct QueryArgs {
    pub where_: Where,
    pub data: Row,
    pub select: Option<Vec<String>>,
    pub order_by: Option<Vec<(String, SortDirection)>>,
    pub take: Option<i64>,
    pub skip: Option<i64>,
    pub distinct: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ChangeOperation {
    Insert,
    Update,
    Delete,
}

impl ChangeOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeOperation::Insert => "INSERT",
            ChangeOperation::Update => "UPDATE",
            ChangeOperation::Delete => "DELETE",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "INSERT" => ChangeOperation::Insert,
            "DELETE" => ChangeOperation::Delete,
            _ => ChangeOperation::Update,
        }
    }
}

/// A write dispatched to the Dual-Write Manager. `table` names the
/// fallback-side canonical table; relation shorthand has already been
/// normalized into plain foreign-key columns by the caller-facing layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WriteOperation {
    Insert {
        table: String,
        data: Row,
        operation_id: String,
        timestamp_ms: Option<u64>,
        critical: bool,
    },
    Update {
        table: String,
        where_: Where,
        data: Row,
        operation_id: String,
        timestamp_ms: Option<u64>,
        critical: bool,
    },
    Delete {
        table: String,
        where_: Where,
        operation_id: String,
        timestamp_ms: Option<u64>,
        critical: bool,
    },
    Upsert {
        table: String,
        where_: Where,
        create: Row,
        update: Row,
        operation_id: String,
        timestamp_ms: Option<u64>,
        critical: bool,
    },
    CreateMany {
        table: String,
        rows: Vec<Row>,
        skip_duplicates: bool,
        operation_id: String,
        timestamp_ms: Option<u64>,
        critical: bool,
    },
    UpdateMany {
        table: String,
        where_: Where,
        data: Row,
        operation_id: String,
        timestamp_ms: Option<u64>,
        critical: bool,
    },
    DeleteMany {
        table: String,
        where_: Where,
        operation_id: String,
        timestamp_ms: Option<u64>,
        critical: bool,
    },
}

impl WriteOperation {
    pub fn operation_id(&self) -> &str {
        match self {
            WriteOperation::Insert { operation_id, .. }
            | WriteOperation::Update { operation_id, .. }
            | WriteOperation::Delete { operation_id, .. }
            | WriteOperation::Upsert { operation_id, .. }
            | WriteOperation::CreateMany { operation_id, .. }
            | WriteOperation::UpdateMany { operation_id, .. }
            | WriteOperation::DeleteMany { operation_id, .. } => operation_id,
        }
    }

    pub fn table(&self) -> &str {
        match self {
            WriteOperation::Insert { table, .. }
            | WriteOperation::Update { table, .. }
            | WriteOperation::Delete { table, .. }
            | WriteOperation::Upsert { table, .. }
            | WriteOperation::CreateMany { table, .. }
            | WriteOperation::UpdateMany { table, .. }
            | WriteOperation::DeleteMany { table, .. } => table,
        }
    }

    pub fn is_critical(&self) -> bool {
        match self {
            WriteOperation::Insert { critical, .. }
            | WriteOperation::Update { critical, .. }
            | WriteOperation::Delete { critical, .. }
            | WriteOperation::Upsert { critical, .. }
            | WriteOperation::CreateMany { critical, .. }
            | WriteOperation::UpdateMany { critical, .. }
            | WriteOperation::DeleteMany { critical, .. } => *critical,
        }
    }

    pub fn timestamp_ms(&self) -> Option<u64> {
        match self {
            WriteOperation::Insert { timestamp_ms, .. }
            | WriteOperation::Update { timestamp_ms, .. }
            | WriteOperation::Delete { timestamp_ms, .. }
            | WriteOperation::Upsert { timestamp_ms, .. }
            | WriteOperation::CreateMany { timestamp_ms, .. }
            | WriteOperation::UpdateMany { timestamp_ms, .. }
            | WriteOperation::DeleteMany { timestamp_ms, .. } => *timestamp_ms,
        }
    }

    pub fn set_timestamp_ms(&mut self, ts: u64) {
        let slot = match self {
            WriteOperation::Insert { timestamp_ms, .. }
            | WriteOperation::Update { timestamp_ms, .. }
            | WriteOperation::Delete { timestamp_ms, .. }
            | WriteOperation::Upsert { timestamp_ms, .. }
            | WriteOperation::CreateMany { timestamp_ms, .. }
            | WriteOperation::UpdateMany { timestamp_ms, .. }
            | WriteOperation::DeleteMany { timestamp_ms, .. } => timestamp_ms,
        };
        *slot = Some(ts);
    }
}

pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn where_from_equals_builds_field_map() {
        let mut row = Row::new();
        row.insert("id".into(), Value::String("u1".into()));
        let where_ = Where::from_equals(&row);
        assert_eq!(where_.fields.get("id"), Some(&Operator::Equals(Value::String("u1".into()))));
    }

    #[test]
    fn operation_id_dispatches_across_variants() {
        let op = WriteOperation::Delete {
            table: "users".into(),
            where_: Where::default(),
            operation_id: "abc".into(),
            timestamp_ms: None,
            critical: false,
        };
        assert_eq!(op.operation_id(), "abc");
        assert_eq!(op.table(), "users");
    }
}
