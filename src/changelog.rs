//! Change Log Store (C3): an append-only record of every write accepted
//! while the primary is unavailable, kept in the fallback database itself
//! so it survives process restarts.
//!
//! Ordering is the global `(timestamp_ms, id)` pair, mirroring the
//! `change_id` monotonic-rowid + explicit-clock approach of a local oplog,
//! adapted here to run against `sqlx::SqlitePool` instead of a borrowed
//! `rusqlite::Connection`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{Row as _, SqlitePool};
use thiserror::Error;

use crate::types::{now_ms, ChangeOperation, Row, WriteOperation};

#[derive(Debug, Error)]
pub enum ChangeLogError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

/// A conflict the configured strategy could not settle automatically
/// (`manual`, or `version-based` with no usable ordering). Recorded for
/// operator review; the owning change-log entry is left unapplied until
/// `resolve_conflict` is called.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConflict {
    pub id: i64,
    pub changelog_id: i64,
    pub table_name: String,
    pub row_id: Option<String>,
    pub local_row: Value,
    pub remote_row: Value,
    pub strategy: String,
    /// The winner actually applied (`"local"`/`"remote"`), set at the same
    /// time as `resolved_at` for an auto-resolved conflict. `None` for a
    /// conflict still awaiting manual resolution.
    pub resolution: Option<String>,
    pub resolved_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeLogEntry {
    pub id: i64,
    pub table_name: String,
    pub row_id: Option<String>,
    pub operation: ChangeOperation,
    pub data: Option<Value>,
    pub idempotency_key: String,
    pub timestamp_ms: i64,
    pub applied: bool,
    /// Set for batch operations (`createMany`/`updateMany`/`deleteMany`)
    /// whose member rows were not individually expanded — see
    /// `is_batch_summary`.
    pub batch_where: Option<Value>,
    pub batch_count: Option<i64>,
}

impl ChangeLogEntry {
    pub fn is_batch_summary(&self) -> bool {
        self.batch_where.is_some()
    }
}

pub struct ChangeLogStore {
    pool: SqlitePool,
}

impl ChangeLogStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Creates the `_changelog` table. Safe to call multiple times.
    pub async fn init_schema(&self) -> Result<(), ChangeLogError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS _changelog (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                table_name TEXT NOT NULL,
                row_id TEXT,
                operation TEXT NOT NULL CHECK(operation IN ('INSERT','UPDATE','DELETE')),
                data TEXT,
                idempotency_key TEXT NOT NULL UNIQUE,
                timestamp_ms INTEGER NOT NULL,
                applied INTEGER NOT NULL DEFAULT 0,
                batch_where TEXT,
                batch_count INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_changelog_order ON _changelog(timestamp_ms, id);
            CREATE INDEX IF NOT EXISTS idx_changelog_applied ON _changelog(applied);
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS _sync_conflicts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                changelog_id INTEGER NOT NULL,
                table_name TEXT NOT NULL,
                row_id TEXT,
                local_row TEXT NOT NULL,
                remote_row TEXT NOT NULL,
                strategy TEXT NOT NULL,
                resolution TEXT,
                resolved_at INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_sync_conflicts_unresolved ON _sync_conflicts(resolved_at);
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Records a conflict the configured strategy left unsettled; `resolved_at`
    /// stays `NULL` until an operator calls `resolve_conflict`.
    pub async fn record_conflict(
        &self,
        changelog_id: i64,
        table_name: &str,
        row_id: Option<&str>,
        local_row: &Row,
        remote_row: &Row,
        strategy: &str,
    ) -> Result<i64, ChangeLogError> {
        self.insert_conflict_record(changelog_id, table_name, row_id, local_row, remote_row, strategy, None, None).await
    }

    /// Records a conflict the configured strategy settled automatically
    /// (local-wins, remote-wins, or a decided version-based comparison), for
    /// audit purposes: `resolution` names the winner actually applied and
    /// `resolved_at` is set immediately, distinguishing it from a conflict
    /// still awaiting manual resolution.
    pub async fn record_resolved_conflict(
        &self,
        changelog_id: i64,
        table_name: &str,
        row_id: Option<&str>,
        local_row: &Row,
        remote_row: &Row,
        strategy: &str,
        resolution: &str,
    ) -> Result<i64, ChangeLogError> {
        self.insert_conflict_record(changelog_id, table_name, row_id, local_row, remote_row, strategy, Some(resolution), Some(now_ms() as i64))
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn insert_conflict_record(
        &self,
        changelog_id: i64,
        table_name: &str,
        row_id: Option<&str>,
        local_row: &Row,
        remote_row: &Row,
        strategy: &str,
        resolution: Option<&str>,
        resolved_at: Option<i64>,
    ) -> Result<i64, ChangeLogError> {
        let local_json = serde_json::to_string(local_row)?;
        let remote_json = serde_json::to_string(remote_row)?;
        let result = sqlx::query(
            "INSERT INTO _sync_conflicts (changelog_id, table_name, row_id, local_row, remote_row, strategy, resolution, resolved_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(changelog_id)
        .bind(table_name)
        .bind(row_id)
        .bind(local_json)
        .bind(remote_json)
        .bind(strategy)
        .bind(resolution)
        .bind(resolved_at)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn unresolved_conflicts(&self) -> Result<Vec<SyncConflict>, ChangeLogError> {
        let rows = sqlx::query(
            "SELECT id, changelog_id, table_name, row_id, local_row, remote_row, strategy, resolution, resolved_at \
             FROM _sync_conflicts WHERE resolved_at IS NULL ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(SyncConflict {
                    id: row.try_get("id")?,
                    changelog_id: row.try_get("changelog_id")?,
                    table_name: row.try_get("table_name")?,
                    row_id: row.try_get("row_id")?,
                    local_row: serde_json::from_str(&row.try_get::<String, _>("local_row")?)?,
                    remote_row: serde_json::from_str(&row.try_get::<String, _>("remote_row")?)?,
                    strategy: row.try_get("strategy")?,
                    resolution: row.try_get("resolution")?,
                    resolved_at: row.try_get("resolved_at")?,
                })
            })
            .collect()
    }

    /// Marks a conflict resolved by an operator, on the assumption the
    /// operator has already applied the final row to the primary directly;
    /// the owning change-log entry is marked applied so sync stops
    /// re-surfacing it.
    pub async fn resolve_conflict(&self, conflict_id: i64) -> Result<(), ChangeLogError> {
        let row = sqlx::query("SELECT changelog_id FROM _sync_conflicts WHERE id = ?")
            .bind(conflict_id)
            .fetch_optional(&self.pool)
            .await?;
        sqlx::query("UPDATE _sync_conflicts SET resolved_at = ? WHERE id = ?")
            .bind(now_ms() as i64)
            .bind(conflict_id)
            .execute(&self.pool)
            .await?;
        if let Some(row) = row {
            let changelog_id: i64 = row.try_get("changelog_id")?;
            self.mark_applied(&[changelog_id]).await?;
        }
        Ok(())
    }

    /// Appends one entry for a single-row write. `idempotency_key` dedupes
    /// retried writes (e.g. a pending-write retry racing the original).
    pub async fn append(
        &self,
        table_name: &str,
        row_id: Option<&str>,
        operation: ChangeOperation,
        data: Option<&Row>,
        idempotency_key: &str,
    ) -> Result<i64, ChangeLogError> {
        let data_json = data.map(|r| serde_json::to_string(r)).transpose()?;
        let ts = now_ms() as i64;

        let existing = sqlx::query("SELECT id FROM _changelog WHERE idempotency_key = ?")
            .bind(idempotency_key)
            .fetch_optional(&self.pool)
            .await?;
        if let Some(row) = existing {
            return Ok(row.try_get::<i64, _>("id")?);
        }

        let result = sqlx::query(
            "INSERT INTO _changelog (table_name, row_id, operation, data, idempotency_key, timestamp_ms, applied) \
             VALUES (?, ?, ?, ?, ?, ?, 0)",
        )
        .bind(table_name)
        .bind(row_id)
        .bind(operation.as_str())
        .bind(data_json)
        .bind(idempotency_key)
        .bind(ts)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Appends a batch-summary entry for an expanded batch write whose
    /// per-row identities are not individually tracked (e.g. `updateMany`
    /// matched by a `where` clause rather than an id list).
    pub async fn append_batch_summary(
        &self,
        table_name: &str,
        operation: ChangeOperation,
        batch_where: &Value,
        data: Option<&Row>,
        batch_count: i64,
        idempotency_key: &str,
    ) -> Result<i64, ChangeLogError> {
        let data_json = data.map(|r| serde_json::to_string(r)).transpose()?;
        let where_json = serde_json::to_string(batch_where)?;
        let ts = now_ms() as i64;

        let result = sqlx::query(
            "INSERT INTO _changelog \
             (table_name, row_id, operation, data, idempotency_key, timestamp_ms, applied, batch_where, batch_count) \
             VALUES (?, NULL, ?, ?, ?, ?, 0, ?, ?)",
        )
        .bind(table_name)
        .bind(operation.as_str())
        .bind(data_json)
        .bind(idempotency_key)
        .bind(ts)
        .bind(where_json)
        .bind(batch_count)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Expands a batch `WriteOperation` into individual changelog entries
    /// when the caller supplied full row data (`CreateMany`), or into a
    /// single batch-summary entry otherwise (`UpdateMany`/`DeleteMany`,
    /// which only carry a `where` clause).
    pub async fn log_write_operation(&self, op: &WriteOperation) -> Result<Vec<i64>, ChangeLogError> {
        match op {
            WriteOperation::Insert { table, data, operation_id, .. } => {
                let row_id = data.get("id").map(|v| v.to_string());
                Ok(vec![
                    self.append(table, row_id.as_deref(), ChangeOperation::Insert, Some(data), operation_id)
                        .await?,
                ])
            }
            WriteOperation::Update { table, data, operation_id, .. } => {
                let row_id = data.get("id").map(|v| v.to_string());
                Ok(vec![
                    self.append(table, row_id.as_deref(), ChangeOperation::Update, Some(data), operation_id)
                        .await?,
                ])
            }
            WriteOperation::Delete { table, operation_id, .. } => Ok(vec![
                self.append(table, None, ChangeOperation::Delete, None, operation_id).await?,
            ]),
            WriteOperation::Upsert { table, create, operation_id, .. } => {
                let row_id = create.get("id").map(|v| v.to_string());
                Ok(vec![
                    self.append(table, row_id.as_deref(), ChangeOperation::Insert, Some(create), operation_id)
                        .await?,
                ])
            }
            WriteOperation::CreateMany { table, rows, operation_id, .. } => {
                let mut ids = Vec::with_capacity(rows.len());
                for (i, row) in rows.iter().enumerate() {
                    let row_id = row.get("id").map(|v| v.to_string());
                    let key = format!("{operation_id}:{i}");
                    ids.push(self.append(table, row_id.as_deref(), ChangeOperation::Insert, Some(row), &key).await?);
                }
                Ok(ids)
            }
            WriteOperation::UpdateMany { table, where_, data, operation_id, .. } => {
                let where_json = serde_json::to_value(where_).unwrap_or(Value::Null);
                Ok(vec![
                    self.append_batch_summary(table, ChangeOperation::Update, &where_json, Some(data), -1, operation_id)
                        .await?,
                ])
            }
            WriteOperation::DeleteMany { table, where_, operation_id, .. } => {
                let where_json = serde_json::to_value(where_).unwrap_or(Value::Null);
                Ok(vec![
                    self.append_batch_summary(table, ChangeOperation::Delete, &where_json, None, -1, operation_id)
                        .await?,
                ])
            }
        }
    }

    /// Returns unapplied entries in global `(timestamp_ms, id)` order.
    pub async fn unapplied(&self, limit: i64) -> Result<Vec<ChangeLogEntry>, ChangeLogError> {
        let rows = sqlx::query(
            "SELECT id, table_name, row_id, operation, data, idempotency_key, timestamp_ms, applied, batch_where, batch_count \
             FROM _changelog WHERE applied = 0 ORDER BY timestamp_ms ASC, id ASC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_entry).collect()
    }

    pub async fn mark_applied(&self, ids: &[i64]) -> Result<(), ChangeLogError> {
        let mut tx = self.pool.begin().await?;
        for id in ids {
            sqlx::query("UPDATE _changelog SET applied = 1 WHERE id = ?").bind(id).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn count_unapplied(&self) -> Result<i64, ChangeLogError> {
        let row = sqlx::query("SELECT COUNT(*) as c FROM _changelog WHERE applied = 0")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<i64, _>("c")?)
    }
}

fn row_to_entry(row: &sqlx::sqlite::SqliteRow) -> Result<ChangeLogEntry, ChangeLogError> {
    let data: Option<String> = row.try_get("data")?;
    let batch_where: Option<String> = row.try_get("batch_where")?;
    Ok(ChangeLogEntry {
        id: row.try_get("id")?,
        table_name: row.try_get("table_name")?,
        row_id: row.try_get("row_id")?,
        operation: ChangeOperation::from_str(&row.try_get::<String, _>("operation")?),
        data: data.map(|s| serde_json::from_str(&s)).transpose()?,
        idempotency_key: row.try_get("idempotency_key")?,
        timestamp_ms: row.try_get("timestamp_ms")?,
        applied: row.try_get::<i64, _>("applied")? != 0,
        batch_where: batch_where.map(|s| serde_json::from_str(&s)).transpose()?,
        batch_count: row.try_get("batch_count")?,
    })
}
