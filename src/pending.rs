//! Pending-write store: durable record of writes accepted on the primary
//! but not yet mirrored to the fallback, so a process restart mid-retry
//! doesn't silently drop them.

use serde_json::Value;
use sqlx::{Row as _, SqlitePool};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PendingWriteError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct PendingWriteEntry {
    pub operation_id: String,
    pub operation_data: Value,
    pub attempts: i64,
    pub created_at_ms: i64,
}

pub struct PendingWriteStore {
    pool: SqlitePool,
}

impl PendingWriteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn init_schema(&self) -> Result<(), PendingWriteError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS _pending_writes (
                operation_id TEXT PRIMARY KEY,
                operation_data TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                created_at_ms INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn save(&self, operation_id: &str, operation_data: &Value) -> Result<(), PendingWriteError> {
        let data_json = serde_json::to_string(operation_data)?;
        sqlx::query(
            "INSERT INTO _pending_writes (operation_id, operation_data, attempts, created_at_ms) \
             VALUES (?, ?, 0, ?) \
             ON CONFLICT(operation_id) DO UPDATE SET operation_data = excluded.operation_data",
        )
        .bind(operation_id)
        .bind(data_json)
        .bind(crate::types::now_ms() as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn bump_attempts(&self, operation_id: &str) -> Result<(), PendingWriteError> {
        sqlx::query("UPDATE _pending_writes SET attempts = attempts + 1 WHERE operation_id = ?")
            .bind(operation_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn remove(&self, operation_id: &str) -> Result<(), PendingWriteError> {
        sqlx::query("DELETE FROM _pending_writes WHERE operation_id = ?")
            .bind(operation_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_all(&self) -> Result<Vec<PendingWriteEntry>, PendingWriteError> {
        let rows = sqlx::query("SELECT operation_id, operation_data, attempts, created_at_ms FROM _pending_writes")
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                let data_str: String = row.try_get("operation_data")?;
                Ok(PendingWriteEntry {
                    operation_id: row.try_get("operation_id")?,
                    operation_data: serde_json::from_str(&data_str)?,
                    attempts: row.try_get("attempts")?,
                    created_at_ms: row.try_get("created_at_ms")?,
                })
            })
            .collect()
    }

    pub async fn count(&self) -> Result<i64, PendingWriteError> {
        let row = sqlx::query("SELECT COUNT(*) as c FROM _pending_writes").fetch_one(&self.pool).await?;
        Ok(row.try_get("c")?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn memory_store() -> PendingWriteStore {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let store = PendingWriteStore::new(pool);
        store.init_schema().await.unwrap();
        store
    }

    #[tokio::test]
    async fn save_then_remove_round_trips() {
        let store = memory_store().await;
        store.save("op-1", &json!({"table": "users"})).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 1);
        store.remove("op-1").await.unwrap();
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn save_upserts_on_same_operation_id() {
        let store = memory_store().await;
        store.save("op-1", &json!({"v": 1})).await.unwrap();
        store.save("op-1", &json!({"v": 2})).await.unwrap();
        let all = store.get_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].operation_data, json!({"v": 2}));
    }
}
