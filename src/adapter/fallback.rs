//! SQLite-side adapter. Structurally mirrors `primary.rs`; raw-value
//! extraction dispatches on SQLite's dynamic column typing the way a
//! driver-level row-to-JSON helper does, since SQLite has no fixed
//! column type to read against.

use serde_json::{Map, Value};
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Row as _, Sqlite, SqlitePool, QueryBuilder, TypeInfo, ValueRef};

use super::{checked_ident, like_pattern, requires_where, sorted_columns, AdapterError};
use crate::schema::{ColumnKind, TableSchema};
use crate::types::{Operator, Row, Where};

pub async fn fetch_one(pool: &SqlitePool, schema: &TableSchema, where_: &Where) -> Result<Option<Row>, AdapterError> {
    requires_where(where_)?;
    let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM ");
    push_ident(&mut qb, &schema.table_name)?;
    qb.push(" WHERE ");
    push_where(&mut qb, schema, where_)?;
    qb.push(" LIMIT 1");

    let row: Option<SqliteRow> = qb.build().fetch_optional(pool).await?;
    Ok(row.as_ref().map(sqlite_row_to_json))
}

pub async fn insert(pool: &SqlitePool, schema: &TableSchema, data: &Row) -> Result<(), AdapterError> {
    let columns = sorted_columns(data);
    if columns.is_empty() {
        return Err(AdapterError::EmptyData);
    }

    let mut qb = QueryBuilder::<Sqlite>::new("INSERT INTO ");
    push_ident(&mut qb, &schema.table_name)?;
    qb.push(" (");
    for (idx, col) in columns.iter().enumerate() {
        if idx > 0 {
            qb.push(", ");
        }
        push_ident(&mut qb, col)?;
    }
    qb.push(") VALUES (");
    for (idx, col) in columns.iter().enumerate() {
        if idx > 0 {
            qb.push(", ");
        }
        push_value(&mut qb, data.get(*col).unwrap_or(&Value::Null), column_kind(schema, col)?)?;
    }
    qb.push(")");
    qb.build().execute(pool).await?;
    Ok(())
}

/// Same as `insert`, but tolerates a primary-key collision (used by
/// replication-mode replay of a captured `createMany` against the
/// fallback, where "skip duplicates" is the expected semantics).
pub async fn insert_or_ignore(pool: &SqlitePool, schema: &TableSchema, data: &Row) -> Result<(), AdapterError> {
    let columns = sorted_columns(data);
    if columns.is_empty() {
        return Err(AdapterError::EmptyData);
    }

    let mut qb = QueryBuilder::<Sqlite>::new("INSERT OR IGNORE INTO ");
    push_ident(&mut qb, &schema.table_name)?;
    qb.push(" (");
    for (idx, col) in columns.iter().enumerate() {
        if idx > 0 {
            qb.push(", ");
        }
        push_ident(&mut qb, col)?;
    }
    qb.push(") VALUES (");
    for (idx, col) in columns.iter().enumerate() {
        if idx > 0 {
            qb.push(", ");
        }
        push_value(&mut qb, data.get(*col).unwrap_or(&Value::Null), column_kind(schema, col)?)?;
    }
    qb.push(")");
    qb.build().execute(pool).await?;
    Ok(())
}

pub async fn update(pool: &SqlitePool, schema: &TableSchema, where_: &Where, data: &Row) -> Result<u64, AdapterError> {
    requires_where(where_)?;
    let columns = sorted_columns(data);
    if columns.is_empty() {
        return Err(AdapterError::EmptyData);
    }

    let mut qb = QueryBuilder::<Sqlite>::new("UPDATE ");
    push_ident(&mut qb, &schema.table_name)?;
    qb.push(" SET ");
    for (idx, col) in columns.iter().enumerate() {
        if idx > 0 {
            qb.push(", ");
        }
        push_ident(&mut qb, col)?;
        qb.push(" = ");
        push_value(&mut qb, data.get(*col).unwrap_or(&Value::Null), column_kind(schema, col)?)?;
    }
    qb.push(" WHERE ");
    push_where(&mut qb, schema, where_)?;
    let result = qb.build().execute(pool).await?;
    Ok(result.rows_affected())
}

pub async fn delete(pool: &SqlitePool, schema: &TableSchema, where_: &Where) -> Result<u64, AdapterError> {
    requires_where(where_)?;
    let mut qb = QueryBuilder::<Sqlite>::new("DELETE FROM ");
    push_ident(&mut qb, &schema.table_name)?;
    qb.push(" WHERE ");
    push_where(&mut qb, schema, where_)?;
    let result = qb.build().execute(pool).await?;
    Ok(result.rows_affected())
}

pub async fn upsert(
    pool: &SqlitePool,
    schema: &TableSchema,
    where_: &Where,
    create: &Row,
    update_data: &Row,
) -> Result<(), AdapterError> {
    requires_where(where_)?;

    let mut data = create.clone();
    for (k, v) in where_.fields.iter() {
        if let Operator::Equals(value) = v {
            data.entry(k.clone()).or_insert_with(|| value.clone());
        }
    }

    let columns = sorted_columns(&data);
    if columns.is_empty() {
        return Err(AdapterError::EmptyData);
    }
    let mut conflict_keys: Vec<&String> = where_.fields.keys().collect();
    conflict_keys.sort();

    let mut qb = QueryBuilder::<Sqlite>::new("INSERT INTO ");
    push_ident(&mut qb, &schema.table_name)?;
    qb.push(" (");
    for (idx, col) in columns.iter().enumerate() {
        if idx > 0 {
            qb.push(", ");
        }
        push_ident(&mut qb, col)?;
    }
    qb.push(") VALUES (");
    for (idx, col) in columns.iter().enumerate() {
        if idx > 0 {
            qb.push(", ");
        }
        push_value(&mut qb, data.get(*col).unwrap_or(&Value::Null), column_kind(schema, col)?)?;
    }
    qb.push(") ON CONFLICT (");
    for (idx, key) in conflict_keys.iter().enumerate() {
        if idx > 0 {
            qb.push(", ");
        }
        push_ident(&mut qb, key)?;
    }
    let update_cols = sorted_columns(update_data);
    if update_cols.is_empty() {
        qb.push(") DO NOTHING");
    } else {
        qb.push(") DO UPDATE SET ");
        for (idx, col) in update_cols.iter().enumerate() {
            if idx > 0 {
                qb.push(", ");
            }
            push_ident(&mut qb, col)?;
            qb.push(" = ");
            push_value(&mut qb, update_data.get(*col).unwrap_or(&Value::Null), column_kind(schema, col)?)?;
        }
    }

    qb.build().execute(pool).await?;
    Ok(())
}

fn column_kind(schema: &TableSchema, name: &str) -> Result<ColumnKind, AdapterError> {
    checked_ident(schema, name)?;
    Ok(schema.column(name).expect("checked above").kind)
}

fn push_ident(qb: &mut QueryBuilder<Sqlite>, name: &str) -> Result<(), AdapterError> {
    if !crate::schema::is_valid_identifier(name) {
        return Err(AdapterError::InvalidIdentifier(name.to_string()));
    }
    qb.push('"');
    qb.push(name);
    qb.push('"');
    Ok(())
}

fn push_value(qb: &mut QueryBuilder<Sqlite>, value: &Value, kind: ColumnKind) -> Result<(), AdapterError> {
    if value.is_null() {
        qb.push_bind(None::<String>);
        return Ok(());
    }
    match kind {
        ColumnKind::Integer | ColumnKind::BigInt => {
            qb.push_bind(value.as_i64());
        }
        ColumnKind::Real => {
            qb.push_bind(value.as_f64());
        }
        ColumnKind::Bool => {
            qb.push_bind(value.as_bool().map(|b| if b { 1i64 } else { 0i64 }));
        }
        ColumnKind::Json => {
            qb.push_bind(value.to_string());
        }
        ColumnKind::Blob => {
            let bytes = value.as_str().and_then(hex_decode);
            qb.push_bind(bytes);
        }
        ColumnKind::Timestamp | ColumnKind::Enum | ColumnKind::String => {
            qb.push_bind(value.as_str().map(|s| s.to_string()).unwrap_or_else(|| value.to_string()));
        }
    }
    Ok(())
}

fn push_where(qb: &mut QueryBuilder<Sqlite>, schema: &TableSchema, where_: &Where) -> Result<(), AdapterError> {
    requires_where(where_)?;
    let mut first = true;

    for (col, op) in &where_.fields {
        if !first {
            qb.push(" AND ");
        }
        first = false;
        push_operator(qb, schema, col, op)?;
    }
    for sub in &where_.and {
        if !first {
            qb.push(" AND ");
        }
        first = false;
        qb.push("(");
        push_where(qb, schema, sub)?;
        qb.push(")");
    }
    for sub in &where_.or {
        if !first {
            qb.push(" AND ");
        }
        first = false;
        qb.push("(");
        push_where_or(qb, schema, sub)?;
        qb.push(")");
    }
    for sub in &where_.not {
        if !first {
            qb.push(" AND ");
        }
        first = false;
        qb.push("NOT (");
        push_where(qb, schema, sub)?;
        qb.push(")");
    }
    Ok(())
}

fn push_where_or(qb: &mut QueryBuilder<Sqlite>, schema: &TableSchema, where_: &Where) -> Result<(), AdapterError> {
    let mut first = true;
    for (col, op) in &where_.fields {
        if !first {
            qb.push(" OR ");
        }
        first = false;
        push_operator(qb, schema, col, op)?;
    }
    Ok(())
}

fn push_operator(qb: &mut QueryBuilder<Sqlite>, schema: &TableSchema, col: &str, op: &Operator) -> Result<(), AdapterError> {
    let kind = column_kind(schema, col)?;
    push_ident(qb, col)?;
    if let Some(pattern) = like_pattern(op) {
        qb.push(" LIKE ");
        qb.push_bind(pattern);
        qb.push(" ESCAPE '\\'");
        return Ok(());
    }
    match op {
        Operator::Equals(v) => {
            qb.push(" = ");
            push_value(qb, v, kind)?;
        }
        Operator::Not(v) => {
            qb.push(" <> ");
            push_value(qb, v, kind)?;
        }
        Operator::Lt(v) => {
            qb.push(" < ");
            push_value(qb, v, kind)?;
        }
        Operator::Lte(v) => {
            qb.push(" <= ");
            push_value(qb, v, kind)?;
        }
        Operator::Gt(v) => {
            qb.push(" > ");
            push_value(qb, v, kind)?;
        }
        Operator::Gte(v) => {
            qb.push(" >= ");
            push_value(qb, v, kind)?;
        }
        Operator::In(values) => {
            qb.push(" IN (");
            for (idx, v) in values.iter().enumerate() {
                if idx > 0 {
                    qb.push(", ");
                }
                push_value(qb, v, kind)?;
            }
            qb.push(")");
        }
        Operator::NotIn(values) => {
            qb.push(" NOT IN (");
            for (idx, v) in values.iter().enumerate() {
                if idx > 0 {
                    qb.push(", ");
                }
                push_value(qb, v, kind)?;
            }
            qb.push(")");
        }
        Operator::Contains(_) | Operator::StartsWith(_) | Operator::EndsWith(_) => unreachable!("handled above"),
    }
    Ok(())
}

fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

fn encode_hex(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(HEX[(byte >> 4) as usize] as char);
        out.push(HEX[(byte & 0x0f) as usize] as char);
    }
    out
}

fn sqlite_row_to_json(row: &SqliteRow) -> Row {
    let mut map = Map::new();
    for column in row.columns() {
        let name = column.name();
        let raw = match row.try_get_raw(name) {
            Ok(raw) => raw,
            Err(_) => continue,
        };

        if raw.is_null() {
            map.insert(name.to_string(), Value::Null);
            continue;
        }

        let value = match raw.type_info().name() {
            "INTEGER" | "BOOLEAN" => row.try_get::<i64, _>(name).ok().map(Value::from).unwrap_or(Value::Null),
            "REAL" => row
                .try_get::<f64, _>(name)
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            "BLOB" => row.try_get::<Vec<u8>, _>(name).ok().map(|v| Value::String(encode_hex(&v))).unwrap_or(Value::Null),
            _ => row.try_get::<String, _>(name).ok().map(Value::String).unwrap_or(Value::Null),
        };

        map.insert(name.to_string(), value);
    }
    map
}
