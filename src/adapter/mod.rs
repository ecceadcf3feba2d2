//! Database Adapter (C1): the only place raw SQL is built. Both the
//! primary (Postgres) and fallback (SQLite) adapters translate the same
//! `Where`/`Row` shapes into parametrized SQL via `sqlx::QueryBuilder`,
//! rejecting any identifier that the schema registry does not recognize.

pub mod fallback;
pub mod primary;

use thiserror::Error;

use crate::schema::{is_valid_identifier, SchemaError, TableSchema};
use crate::types::{Operator, Row, Where};

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("unknown column: {0}")]
    UnknownColumn(String),
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),
    #[error("where clause cannot be empty for this operation")]
    EmptyWhere,
    #[error("insert/update requires at least one column")]
    EmptyData,
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub(crate) fn checked_ident(schema: &TableSchema, name: &str) -> Result<(), AdapterError> {
    if !is_valid_identifier(name) {
        return Err(AdapterError::InvalidIdentifier(name.to_string()));
    }
    if schema.column(name).is_none() {
        return Err(AdapterError::UnknownColumn(name.to_string()));
    }
    Ok(())
}

pub(crate) fn sorted_columns(data: &Row) -> Vec<&String> {
    let mut cols: Vec<&String> = data.keys().collect();
    cols.sort();
    cols
}

/// Operators handled directly as a single SQL comparison. `Contains`/
/// `StartsWith`/`EndsWith` compile to `LIKE` with escaped wildcards.
pub(crate) fn like_pattern(op: &Operator) -> Option<String> {
    fn escape(s: &str) -> String {
        s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
    }
    match op {
        Operator::Contains(s) => Some(format!("%{}%", escape(s))),
        Operator::StartsWith(s) => Some(format!("{}%", escape(s))),
        Operator::EndsWith(s) => Some(format!("%{}", escape(s))),
        _ => None,
    }
}

pub(crate) fn requires_where(where_: &Where) -> Result<(), AdapterError> {
    if where_.is_empty() {
        return Err(AdapterError::EmptyWhere);
    }
    Ok(())
}
