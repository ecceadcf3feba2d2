//! Sync Manager (C9): replays the change log into the primary on recovery,
//! and performs the initial bulk copy from primary into fallback when the
//! fallback starts out empty.

use std::sync::Arc;

use serde_json::Value;
use sqlx::{PgPool, Row as _, SqlitePool};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::adapter::{fallback as fb, primary as pg, AdapterError};
use crate::changelog::{ChangeLogEntry, ChangeLogError, ChangeLogStore};
use crate::conflict::{self, ConflictStrategy};
use crate::schema::{is_valid_identifier, SchemaRegistry};
use crate::types::{ChangeOperation, Row, Where};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    ChangeLog(#[from] ChangeLogError),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
    #[error("table {0} is not in the schema registry; entry skipped")]
    UnknownTable(String),
}

#[derive(Debug, Clone)]
pub struct SyncErrorEntry {
    pub changelog_id: i64,
    pub error: String,
}

#[derive(Debug, Clone, Default)]
pub struct SyncResult {
    pub success: bool,
    pub applied: usize,
    pub errors: Vec<SyncErrorEntry>,
}

#[derive(Debug)]
enum ApplyOutcome {
    Applied,
    PendingManualResolution,
}

fn strategy_label(strategy: ConflictStrategy) -> &'static str {
    match strategy {
        ConflictStrategy::LocalWins => "local-wins",
        ConflictStrategy::RemoteWins => "remote-wins",
        ConflictStrategy::VersionBased => "version-based",
        ConflictStrategy::Manual => "manual",
    }
}

fn resolution_label(winner: conflict::Winner) -> &'static str {
    match winner {
        conflict::Winner::Local => "local-wins",
        conflict::Winner::Remote => "remote-wins",
        conflict::Winner::Undecided => "undecided",
    }
}

pub struct SyncManager {
    primary: PgPool,
    fallback: SqlitePool,
    registry: Arc<RwLock<SchemaRegistry>>,
    changelog: Arc<ChangeLogStore>,
    conflict_strategy: ConflictStrategy,
    batch_size: i64,
    full_sync_page_size: i64,
}

impl SyncManager {
    pub fn new(
        primary: PgPool,
        fallback: SqlitePool,
        registry: Arc<RwLock<SchemaRegistry>>,
        changelog: Arc<ChangeLogStore>,
        conflict_strategy: ConflictStrategy,
        full_sync_page_size: i64,
    ) -> Self {
        Self {
            primary,
            fallback,
            registry,
            changelog,
            conflict_strategy,
            batch_size: 200,
            full_sync_page_size,
        }
    }

    /// Drains unapplied change-log entries into the primary in global
    /// `(timestamp_ms, id)` order, resolving a conflict whenever the
    /// primary row was independently modified since the entry was logged.
    /// An entry whose conflict is left `Undecided` (manual strategy, or
    /// version-based with no usable ordering) is recorded in
    /// `_sync_conflicts` and skipped rather than applied, so it keeps
    /// surfacing as unsynced until an operator resolves it.
    pub async fn sync(&self) -> SyncResult {
        let mut result = SyncResult { success: true, applied: 0, errors: Vec::new() };

        loop {
            let batch = match self.changelog.unapplied(self.batch_size).await {
                Ok(batch) => batch,
                Err(err) => {
                    result.success = false;
                    result.errors.push(SyncErrorEntry { changelog_id: -1, error: err.to_string() });
                    return result;
                }
            };
            if batch.is_empty() {
                break;
            }

            let mut applied_ids = Vec::new();
            for entry in &batch {
                match self.apply_entry(entry).await {
                    Ok(ApplyOutcome::Applied) => {
                        applied_ids.push(entry.id);
                        result.applied += 1;
                    }
                    Ok(ApplyOutcome::PendingManualResolution) => {
                        result.success = false;
                    }
                    Err(err) => {
                        result.success = false;
                        tracing::warn!(changelog_id = entry.id, error = %err, "replay entry failed");
                        result.errors.push(SyncErrorEntry { changelog_id: entry.id, error: err.to_string() });
                        // Mark it applied anyway so a single poison entry
                        // doesn't block the rest of the queue forever; it
                        // is recorded in `errors` for operator visibility.
                        applied_ids.push(entry.id);
                    }
                }
            }

            if applied_ids.is_empty() {
                // Nothing progressed this round (every remaining entry is
                // pending manual resolution); stop rather than loop forever.
                break;
            }

            if let Err(err) = self.changelog.mark_applied(&applied_ids).await {
                result.success = false;
                result.errors.push(SyncErrorEntry { changelog_id: -1, error: err.to_string() });
                return result;
            }
        }

        result
    }

    async fn apply_entry(&self, entry: &ChangeLogEntry) -> Result<ApplyOutcome, SyncError> {
        if !is_valid_identifier(&entry.table_name) {
            return Err(SyncError::UnknownTable(entry.table_name.clone()));
        }
        let schema = {
            let registry = self.registry.read().await;
            registry.get_by_table_name(&entry.table_name).cloned()
        };
        let Some(schema) = schema else {
            return Err(SyncError::UnknownTable(entry.table_name.clone()));
        };

        if entry.is_batch_summary() {
            // Batch entries (updateMany/deleteMany) replay as a single
            // statement against the same `where` that was originally
            // matched; if the matched set has since diverged on the
            // primary this reapplies by best-effort match rather than by
            // individual row identity, which is logged rather than
            // treated as an error.
            let where_: Where = entry
                .batch_where
                .as_ref()
                .map(|v| serde_json::from_value(v.clone()))
                .transpose()?
                .unwrap_or_default();

            match entry.operation {
                ChangeOperation::Update => {
                    let data: Row = entry.data.as_ref().and_then(|v| v.as_object().cloned()).unwrap_or_default();
                    pg::update(&self.primary, &schema, &where_, &data).await?;
                }
                ChangeOperation::Delete => {
                    pg::delete(&self.primary, &schema, &where_).await?;
                }
                ChangeOperation::Insert => {}
            }
            return Ok(ApplyOutcome::Applied);
        }

        let row_where = entry
            .row_id
            .as_ref()
            .and_then(|s| serde_json::from_str::<Value>(s).ok())
            .and_then(|v| v.as_object().cloned())
            .map(|fields| Where {
                fields: fields
                    .into_iter()
                    .map(|(k, v)| (k, crate::types::Operator::Equals(v)))
                    .collect(),
                ..Default::default()
            });

        match entry.operation {
            ChangeOperation::Insert => {
                let data: Row = entry.data.as_ref().and_then(|v| v.as_object().cloned()).unwrap_or_default();
                if let Some(where_) = &row_where {
                    if let Some(existing) = pg::fetch_one(&self.primary, &schema, where_).await.ok().flatten() {
                        return self.apply_conflicting_write(entry, &schema, where_, &data, &existing).await;
                    }
                }
                pg::insert(&self.primary, &schema, &data).await?;
            }
            ChangeOperation::Update => {
                let data: Row = entry.data.as_ref().and_then(|v| v.as_object().cloned()).unwrap_or_default();
                if let Some(where_) = &row_where {
                    if let Some(existing) = pg::fetch_one(&self.primary, &schema, where_).await.ok().flatten() {
                        return self.apply_conflicting_write(entry, &schema, where_, &data, &existing).await;
                    } else {
                        pg::insert(&self.primary, &schema, &data).await?;
                    }
                }
            }
            ChangeOperation::Delete => {
                if let Some(where_) = &row_where {
                    pg::delete(&self.primary, &schema, where_).await?;
                }
            }
        }
        Ok(ApplyOutcome::Applied)
    }

    /// `local` is the fallback-side row captured in the change-log entry;
    /// `remote` is the primary's current row for the same id. Per the
    /// conflict resolver's contract, `local` is always the first argument.
    async fn apply_conflicting_write(
        &self,
        entry: &ChangeLogEntry,
        schema: &crate::schema::TableSchema,
        where_: &Where,
        local: &Row,
        remote: &Row,
    ) -> Result<ApplyOutcome, SyncError> {
        let record = conflict::resolve(local, remote, self.conflict_strategy);
        if record.winner == conflict::Winner::Undecided {
            self.changelog
                .record_conflict(entry.id, &schema.table_name, entry.row_id.as_deref(), local, remote, strategy_label(self.conflict_strategy))
                .await?;
            return Ok(ApplyOutcome::PendingManualResolution);
        }
        tracing::info!(
            changelog_id = entry.id,
            table = %schema.table_name,
            winner = ?record.winner,
            fields = ?record.conflicting_fields,
            "conflict auto-resolved"
        );
        self.changelog
            .record_resolved_conflict(
                entry.id,
                &schema.table_name,
                entry.row_id.as_deref(),
                local,
                remote,
                strategy_label(self.conflict_strategy),
                resolution_label(record.winner),
            )
            .await?;
        pg::update(&self.primary, schema, where_, &record.resolved).await?;
        Ok(ApplyOutcome::Applied)
    }

    /// Initial bulk copy, run once when the fallback is first provisioned
    /// or on explicit request: every row of every known table is paged out
    /// of the primary and inserted (ignoring pre-existing rows) into the
    /// fallback.
    pub async fn full_sync_primary_to_fallback(&self) -> Result<(), SyncError> {
        let tables: Vec<_> = {
            let registry = self.registry.read().await;
            registry.tables().cloned().collect()
        };

        for schema in tables {
            if schema.table_name.starts_with('_') {
                continue;
            }

            let mut offset = 0i64;
            loop {
                let sql = format!("SELECT to_jsonb(t) AS row FROM \"{}\" t LIMIT $1 OFFSET $2", schema.table_name);
                let rows = sqlx::query(&sql)
                    .bind(self.full_sync_page_size)
                    .bind(offset)
                    .fetch_all(&self.primary)
                    .await?;

                if rows.is_empty() {
                    break;
                }

                for row in &rows {
                    let value: Value = row.try_get("row")?;
                    if let Some(object) = value.as_object() {
                        let _ = fb::insert_or_ignore(&self.fallback, &schema, object).await;
                    }
                }

                let fetched = rows.len() as i64;
                offset += self.full_sync_page_size;
                if fetched < self.full_sync_page_size {
                    break;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnDef, ColumnKind, TableSchema};
    use serde_json::json;

    fn users_schema() -> TableSchema {
        TableSchema {
            table_name: "users".into(),
            columns: vec![
                ColumnDef { name: "id".into(), kind: ColumnKind::String, nullable: false, has_default: false, default_source: None, is_updated_at: false },
                ColumnDef { name: "name".into(), kind: ColumnKind::String, nullable: true, has_default: false, default_source: None, is_updated_at: false },
            ],
            primary_key: vec!["id".into()],
            unique_keys: vec![],
        }
    }

    #[tokio::test]
    async fn apply_entry_rejects_unknown_table() {
        let fallback = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let changelog = Arc::new(ChangeLogStore::new(fallback.clone()));
        changelog.init_schema().await.unwrap();
        let registry = Arc::new(RwLock::new(SchemaRegistry::from_tables(vec![users_schema()])));
        let primary = PgPool::connect_lazy("postgres://localhost/nonexistent").unwrap();

        let manager = SyncManager::new(primary, fallback, registry, changelog, ConflictStrategy::RemoteWins, 100);

        let entry = ChangeLogEntry {
            id: 1,
            table_name: "ghost_table".into(),
            row_id: Some(json!({"id": "u1"}).to_string()),
            operation: ChangeOperation::Insert,
            data: Some(json!({"id": "u1"})),
            idempotency_key: "op-1".into(),
            timestamp_ms: 0,
            applied: false,
            batch_where: None,
            batch_count: None,
        };

        let err = manager.apply_entry(&entry).await.unwrap_err();
        assert!(matches!(err, SyncError::UnknownTable(_)));
    }
}
