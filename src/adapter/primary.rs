//! Postgres-side adapter. Mirrors `fallback.rs` column-for-column so the
//! same `WriteOperation` produces structurally equivalent SQL on either
//! store.

use serde_json::{Map, Value};
use sqlx::postgres::PgRow;
use sqlx::{Column as _, PgPool, Postgres, QueryBuilder, Row as _};

use super::{checked_ident, like_pattern, requires_where, sorted_columns, AdapterError};
use crate::schema::{ColumnKind, TableSchema};
use crate::types::{Operator, Row, Where};

pub async fn fetch_one(pool: &PgPool, schema: &TableSchema, where_: &Where) -> Result<Option<Row>, AdapterError> {
    requires_where(where_)?;
    let mut qb = QueryBuilder::<Postgres>::new("SELECT * FROM ");
    push_ident(&mut qb, &schema.table_name)?;
    qb.push(" WHERE ");
    push_where(&mut qb, schema, where_)?;
    qb.push(" LIMIT 1");

    let row: Option<PgRow> = qb.build().fetch_optional(pool).await?;
    Ok(row.as_ref().map(pg_row_to_json))
}

pub async fn insert(pool: &PgPool, schema: &TableSchema, data: &Row) -> Result<(), AdapterError> {
    let columns = sorted_columns(data);
    if columns.is_empty() {
        return Err(AdapterError::EmptyData);
    }

    let mut qb = QueryBuilder::<Postgres>::new("INSERT INTO ");
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

pub async fn update(pool: &PgPool, schema: &TableSchema, where_: &Where, data: &Row) -> Result<u64, AdapterError> {
    requires_where(where_)?;
    let columns = sorted_columns(data);
    if columns.is_empty() {
        return Err(AdapterError::EmptyData);
    }

    let mut qb = QueryBuilder::<Postgres>::new("UPDATE ");
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

pub async fn delete(pool: &PgPool, schema: &TableSchema, where_: &Where) -> Result<u64, AdapterError> {
    requires_where(where_)?;
    let mut qb = QueryBuilder::<Postgres>::new("DELETE FROM ");
    push_ident(&mut qb, &schema.table_name)?;
    qb.push(" WHERE ");
    push_where(&mut qb, schema, where_)?;
    let result = qb.build().execute(pool).await?;
    Ok(result.rows_affected())
}

pub async fn upsert(
    pool: &PgPool,
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

    let mut qb = QueryBuilder::<Postgres>::new("INSERT INTO ");
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

fn push_ident(qb: &mut QueryBuilder<Postgres>, name: &str) -> Result<(), AdapterError> {
    if !crate::schema::is_valid_identifier(name) {
        return Err(AdapterError::InvalidIdentifier(name.to_string()));
    }
    qb.push('"');
    qb.push(name);
    qb.push('"');
    Ok(())
}

fn push_value(qb: &mut QueryBuilder<Postgres>, value: &Value, kind: ColumnKind) -> Result<(), AdapterError> {
    if value.is_null() {
        qb.push_bind(None::<String>);
        return Ok(());
    }
    match kind {
        ColumnKind::Integer => {
            qb.push_bind(value.as_i64().map(|v| v as i32));
        }
        ColumnKind::BigInt => {
            qb.push_bind(value.as_i64());
        }
        ColumnKind::Real => {
            qb.push_bind(value.as_f64());
        }
        ColumnKind::Bool => {
            qb.push_bind(value.as_bool());
        }
        ColumnKind::Json => {
            qb.push_bind(value.clone());
        }
        ColumnKind::Blob => {
            let bytes = value.as_str().and_then(|s| hex_decode(s));
            qb.push_bind(bytes);
        }
        ColumnKind::Timestamp | ColumnKind::Enum | ColumnKind::String => {
            qb.push_bind(value.as_str().map(|s| s.to_string()).unwrap_or_else(|| value.to_string()));
        }
    }
    Ok(())
}

fn push_where(qb: &mut QueryBuilder<Postgres>, schema: &TableSchema, where_: &Where) -> Result<(), AdapterError> {
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

fn push_where_or(qb: &mut QueryBuilder<Postgres>, schema: &TableSchema, where_: &Where) -> Result<(), AdapterError> {
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

fn push_operator(qb: &mut QueryBuilder<Postgres>, schema: &TableSchema, col: &str, op: &Operator) -> Result<(), AdapterError> {
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

fn pg_row_to_json(row: &PgRow) -> Row {
    let mut map = Map::new();
    for column in row.columns() {
        let name = column.name();
        let value = row
            .try_get::<Option<String>, _>(name)
            .map(|v| v.map(Value::String).unwrap_or(Value::Null))
            .or_else(|_| row.try_get::<Option<i64>, _>(name).map(|v| v.map(Value::from).unwrap_or(Value::Null)))
            .or_else(|_| row.try_get::<Option<f64>, _>(name).map(|v| v.and_then(serde_json::Number::from_f64).map(Value::Number).unwrap_or(Value::Null)))
            .or_else(|_| row.try_get::<Option<bool>, _>(name).map(|v| v.map(Value::Bool).unwrap_or(Value::Null)))
            .or_else(|_| row.try_get::<Option<Value>, _>(name).map(|v| v.unwrap_or(Value::Null)))
            .unwrap_or(Value::Null);
        map.insert(name.to_string(), value);
    }
    map
}
