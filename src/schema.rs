//! Schema Registry (C2): introspected table/column/primary-key metadata and
//! type coercion between the primary and fallback representations.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{PgPool, Row as _};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ColumnKind {
    String,
    Integer,
    Real,
    Bool,
    Timestamp,
    Blob,
    Json,
    BigInt,
    Enum,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DefaultSource {
    Constant,
    Now,
    Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub kind: ColumnKind,
    pub nullable: bool,
    pub has_default: bool,
    pub default_source: Option<DefaultSource>,
    pub is_updated_at: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSchema {
    pub table_name: String,
    pub columns: Vec<ColumnDef>,
    pub primary_key: Vec<String>,
    pub unique_keys: Vec<Vec<String>>,
}

impl TableSchema {
    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn updated_at_column(&self) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.is_updated_at)
    }

    /// Serializes the primary-key projection of `row` to the JSON-object
    /// string the change log stores as `row_id`, or `None` if `row` doesn't
    /// carry every primary-key column.
    pub fn row_id(&self, row: &crate::types::Row) -> Option<String> {
        let mut projection = serde_json::Map::new();
        for pk in &self.primary_key {
            projection.insert(pk.clone(), row.get(pk)?.clone());
        }
        serde_json::to_string(&projection).ok()
    }

    /// Same projection, read from a `where` clause's top-level equality
    /// fields instead of a row — used when the write only carries a
    /// `where_` (update/delete) rather than a full row.
    pub fn row_id_from_where(&self, where_: &crate::types::Where) -> Option<String> {
        let mut projection = serde_json::Map::new();
        for pk in &self.primary_key {
            match where_.fields.get(pk) {
                Some(crate::types::Operator::Equals(v)) => {
                    projection.insert(pk.clone(), v.clone());
                }
                _ => return None,
            }
        }
        serde_json::to_string(&projection).ok()
    }
}

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("unknown column: {0}")]
    UnknownColumn(String),
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),
    #[error("bigint overflow coercing {0}")]
    Overflow(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoerceDirection {
    ToFallback,
    FromFallback,
}

/// Identifiers are allowlisted against the registry before interpolation
/// into any SQL string. Table/column names are alphanumeric + underscore,
/// must not start with a digit, and must not already begin with `_` (the
/// proxy's own metadata tables use that prefix and are never user-facing).
pub fn is_valid_identifier(name: &str) -> bool {
    if name.is_empty() || name.len() > 128 {
        return false;
    }
    let mut chars = name.chars();
    let first = chars.next().unwrap();
    if !(first.is_ascii_alphabetic() || first == '_') {
        return false;
    }
    name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Hard-coded fallback map used for boot-time resolution before
/// introspection has completed (§4.2).
fn default_model_table_map() -> HashMap<&'static str, &'static str> {
    HashMap::from([
        ("user", "users"),
        ("session", "sessions"),
        ("post", "posts"),
    ])
}

#[derive(Clone)]
pub struct SchemaRegistry {
    tables: HashMap<String, TableSchema>,
    model_to_table: HashMap<String, String>,
}

impl SchemaRegistry {
    pub fn empty() -> Self {
        Self { tables: HashMap::new(), model_to_table: HashMap::new() }
    }

    pub fn from_tables(tables: Vec<TableSchema>) -> Self {
        let mut map = HashMap::new();
        for t in tables {
            map.insert(t.table_name.clone(), t);
        }
        Self { tables: map, model_to_table: HashMap::new() }
    }

    /// Declarative fallback load, used when live introspection is not
    /// available (e.g. before the primary connection exists).
    pub fn load(schema_json: &str) -> Result<Self, SchemaError> {
        let tables: Vec<TableSchema> = serde_json::from_str(schema_json)?;
        Ok(Self::from_tables(tables))
    }

    pub fn tables(&self) -> impl Iterator<Item = &TableSchema> {
        self.tables.values()
    }

    pub fn get_by_table_name(&self, table: &str) -> Option<&TableSchema> {
        self.tables.get(table)
    }

    pub fn table_name_for_model(&self, model: &str) -> Option<String> {
        if let Some(t) = self.model_to_table.get(model) {
            return Some(t.clone());
        }
        default_model_table_map().get(model).map(|s| s.to_string())
    }

    /// Introspects a Postgres primary via `information_schema` and produces
    /// one `TableSchema` per base table.
    pub async fn introspect(pool: &PgPool) -> Result<Self, SchemaError> {
        let table_rows = sqlx::query(
            "SELECT table_name FROM information_schema.tables \
             WHERE table_schema = 'public' AND table_type = 'BASE TABLE'",
        )
        .fetch_all(pool)
        .await?;

        let mut tables = Vec::with_capacity(table_rows.len());
        for row in table_rows {
            let table_name: String = row.try_get("table_name")?;
            if table_name.starts_with('_') {
                continue;
            }
            tables.push(introspect_table(pool, &table_name).await?);
        }

        Ok(Self::from_tables(tables))
    }

    pub fn coerce(
        &self,
        value: &Value,
        kind: ColumnKind,
        direction: CoerceDirection,
    ) -> Result<Value, SchemaError> {
        Ok(coerce_value(value, kind, direction))
    }
}

async fn introspect_table(pool: &PgPool, table_name: &str) -> Result<TableSchema, SchemaError> {
    let column_rows = sqlx::query(
        "SELECT column_name, data_type, is_nullable, column_default \
         FROM information_schema.columns \
         WHERE table_schema = 'public' AND table_name = $1 \
         ORDER BY ordinal_position",
    )
    .bind(table_name)
    .fetch_all(pool)
    .await?;

    let mut columns = Vec::with_capacity(column_rows.len());
    for row in &column_rows {
        let name: String = row.try_get("column_name")?;
        let data_type: String = row.try_get("data_type")?;
        let is_nullable: String = row.try_get("is_nullable")?;
        let column_default: Option<String> = row.try_get("column_default")?;

        let kind = pg_type_to_kind(&data_type);
        let has_default = column_default.is_some();
        let default_source = column_default.as_deref().map(classify_default);
        let is_updated_at = name == "updated_at" || name == "updatedAt";

        columns.push(ColumnDef {
            name,
            kind,
            nullable: is_nullable == "YES",
            has_default,
            default_source,
            is_updated_at,
        });
    }

    let pk_rows = sqlx::query(
        "SELECT kcu.column_name \
         FROM information_schema.table_constraints tc \
         JOIN information_schema.key_column_usage kcu \
           ON tc.constraint_name = kcu.constraint_name AND tc.table_schema = kcu.table_schema \
         WHERE tc.table_schema = 'public' AND tc.table_name = $1 AND tc.constraint_type = 'PRIMARY KEY' \
         ORDER BY kcu.ordinal_position",
    )
    .bind(table_name)
    .fetch_all(pool)
    .await?;

    let mut primary_key = Vec::with_capacity(pk_rows.len());
    for row in &pk_rows {
        primary_key.push(row.try_get::<String, _>("column_name")?);
    }

    Ok(TableSchema {
        table_name: table_name.to_string(),
        columns,
        primary_key,
        unique_keys: Vec::new(),
    })
}

fn pg_type_to_kind(data_type: &str) -> ColumnKind {
    match data_type {
        "integer" | "smallint" => ColumnKind::Integer,
        "bigint" => ColumnKind::BigInt,
        "boolean" => ColumnKind::Bool,
        "double precision" | "real" | "numeric" => ColumnKind::Real,
        "timestamp without time zone" | "timestamp with time zone" | "date" => ColumnKind::Timestamp,
        "jsonb" | "json" => ColumnKind::Json,
        "bytea" => ColumnKind::Blob,
        "USER-DEFINED" => ColumnKind::Enum,
        _ => ColumnKind::String,
    }
}

fn classify_default(expr: &str) -> DefaultSource {
    let lower = expr.to_lowercase();
    if lower.contains("uuid_generate") || lower.contains("gen_random_uuid") {
        DefaultSource::Uuid
    } else if lower.contains("now()") || lower.contains("current_timestamp") {
        DefaultSource::Now
    } else {
        DefaultSource::Constant
    }
}

/// Type coercion is total: an unknown kind mismatch falls back to
/// pass-through, but a JSON composite being stored in a string column is
/// coerced via JSON encoding rather than rejected outright.
fn coerce_value(value: &Value, kind: ColumnKind, direction: CoerceDirection) -> Value {
    if value.is_null() {
        return Value::Null;
    }

    match (kind, direction) {
        (ColumnKind::Bool, CoerceDirection::ToFallback) => match value.as_bool() {
            Some(b) => Value::from(if b { 1 } else { 0 }),
            None => value.clone(),
        },
        (ColumnKind::Bool, CoerceDirection::FromFallback) => match value.as_i64() {
            Some(n) => Value::Bool(n != 0),
            None => value.clone(),
        },
        (ColumnKind::Timestamp, _) => {
            // Already ISO-8601 on both sides by convention; pass through
            // strings, stringify anything else.
            if value.is_string() {
                value.clone()
            } else {
                Value::String(value.to_string())
            }
        }
        (ColumnKind::Json, CoerceDirection::ToFallback) => Value::String(value.to_string()),
        (ColumnKind::Json, CoerceDirection::FromFallback) => match value.as_str() {
            Some(s) => serde_json::from_str(s).unwrap_or(Value::Null),
            None => value.clone(),
        },
        (ColumnKind::BigInt, _) => value.clone(),
        (ColumnKind::Blob, _) => value.clone(),
        (ColumnKind::Enum, _) | (ColumnKind::String, _) => {
            if value.is_object() || value.is_array() {
                Value::String(value.to_string())
            } else {
                value.clone()
            }
        }
        _ => value.clone(),
    }
}
