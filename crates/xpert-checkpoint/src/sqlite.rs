//! SQLite checkpoint backend
//!
//! Durable [`CheckpointSaver`] over an append-only `checkpoints` table plus
//! a companion `checkpoint_writes` table, keyed by
//! `(thread_id, checkpoint_ns, checkpoint_id)` with a parent pointer and the
//! serialized channel snapshot as a JSON blob. Timestamps are stored as
//! ISO8601 strings; ordering uses the append sequence so same-millisecond
//! checkpoints never tie.

use crate::checkpoint::{
    Checkpoint, CheckpointConfig, CheckpointMetadata, CheckpointTuple, PendingWrite,
};
use crate::error::{CheckpointError, Result};
use crate::serializer::{CheckpointSerializer, JsonSerializer};
use crate::traits::CheckpointSaver;
use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::{FromRow, Row};
use std::sync::Arc;

#[derive(Debug, FromRow)]
struct CheckpointRow {
    thread_id: String,
    checkpoint_ns: String,
    checkpoint_id: String,
    parent_id: Option<String>,
    checkpoint: Vec<u8>,
    metadata: String,
}

/// Checkpoint backend over SQLite
pub struct SqliteCheckpointSaver {
    pool: SqlitePool,
    serializer: Arc<dyn CheckpointSerializer>,
}

impl SqliteCheckpointSaver {
    /// Connect to a SQLite database and run the schema migration.
    ///
    /// Use `"sqlite::memory:"` for an ephemeral database in tests.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect(url)
            .await?;
        let saver = Self {
            pool,
            serializer: Arc::new(JsonSerializer),
        };
        saver.migrate().await?;
        Ok(saver)
    }

    pub fn with_serializer(mut self, serializer: Arc<dyn CheckpointSerializer>) -> Self {
        self.serializer = serializer;
        self
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS checkpoints (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                thread_id TEXT NOT NULL,
                checkpoint_ns TEXT NOT NULL DEFAULT '',
                checkpoint_id TEXT NOT NULL,
                parent_id TEXT,
                checkpoint BLOB NOT NULL,
                metadata TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE (thread_id, checkpoint_ns, checkpoint_id)
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS checkpoint_writes (
                thread_id TEXT NOT NULL,
                checkpoint_ns TEXT NOT NULL DEFAULT '',
                checkpoint_id TEXT NOT NULL,
                task_id TEXT NOT NULL,
                idx INTEGER NOT NULL,
                channel TEXT NOT NULL,
                value TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_checkpoints_thread
             ON checkpoints (thread_id, checkpoint_ns, seq DESC)",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_writes(
        &self,
        config: &CheckpointConfig,
        checkpoint_id: &str,
    ) -> Result<Vec<PendingWrite>> {
        let rows = sqlx::query(
            "SELECT task_id, channel, value FROM checkpoint_writes
             WHERE thread_id = ? AND checkpoint_ns = ? AND checkpoint_id = ?
             ORDER BY idx ASC",
        )
        .bind(&config.thread_id)
        .bind(&config.checkpoint_ns)
        .bind(checkpoint_id)
        .fetch_all(&self.pool)
        .await?;

        let mut writes = Vec::with_capacity(rows.len());
        for row in rows {
            let task_id: String = row.get("task_id");
            let channel: String = row.get("channel");
            let value: String = row.get("value");
            writes.push((task_id, channel, serde_json::from_str(&value)?));
        }
        Ok(writes)
    }

    async fn row_to_tuple(&self, row: CheckpointRow) -> Result<CheckpointTuple> {
        let checkpoint = self.serializer.loads(&row.checkpoint)?;
        let metadata: CheckpointMetadata = serde_json::from_str(&row.metadata)?;
        let config = CheckpointConfig {
            thread_id: row.thread_id.clone(),
            checkpoint_ns: row.checkpoint_ns.clone(),
            checkpoint_id: Some(row.checkpoint_id.clone()),
        };
        let writes = self.load_writes(&config, &row.checkpoint_id).await?;

        let mut tuple = CheckpointTuple::new(config, checkpoint, metadata)
            .with_pending_writes(writes);
        if let Some(parent_id) = row.parent_id {
            tuple = tuple.with_parent_config(CheckpointConfig {
                thread_id: row.thread_id,
                checkpoint_ns: row.checkpoint_ns,
                checkpoint_id: Some(parent_id),
            });
        }
        Ok(tuple)
    }

    async fn seq_of(&self, config: &CheckpointConfig) -> Result<Option<i64>> {
        let Some(id) = &config.checkpoint_id else {
            return Ok(None);
        };
        let row = sqlx::query(
            "SELECT seq FROM checkpoints
             WHERE thread_id = ? AND checkpoint_ns = ? AND checkpoint_id = ?",
        )
        .bind(&config.thread_id)
        .bind(&config.checkpoint_ns)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get("seq")))
    }
}

#[async_trait]
impl CheckpointSaver for SqliteCheckpointSaver {
    async fn get_tuple(&self, config: &CheckpointConfig) -> Result<Option<CheckpointTuple>> {
        let row = match &config.checkpoint_id {
            Some(id) => {
                sqlx::query_as::<_, CheckpointRow>(
                    "SELECT thread_id, checkpoint_ns, checkpoint_id, parent_id, checkpoint, metadata
                     FROM checkpoints
                     WHERE thread_id = ? AND checkpoint_ns = ? AND checkpoint_id = ?",
                )
                .bind(&config.thread_id)
                .bind(&config.checkpoint_ns)
                .bind(id)
                .fetch_optional(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, CheckpointRow>(
                    "SELECT thread_id, checkpoint_ns, checkpoint_id, parent_id, checkpoint, metadata
                     FROM checkpoints
                     WHERE thread_id = ? AND checkpoint_ns = ?
                     ORDER BY seq DESC LIMIT 1",
                )
                .bind(&config.thread_id)
                .bind(&config.checkpoint_ns)
                .fetch_optional(&self.pool)
                .await?
            }
        };

        match row {
            Some(row) => Ok(Some(self.row_to_tuple(row).await?)),
            None => Ok(None),
        }
    }

    async fn list(
        &self,
        config: &CheckpointConfig,
        before: Option<&CheckpointConfig>,
        limit: Option<usize>,
    ) -> Result<Vec<CheckpointTuple>> {
        let before_seq = match before {
            Some(before) => self.seq_of(before).await?,
            None => None,
        };
        let limit = limit.map(|l| l as i64).unwrap_or(i64::MAX);

        let rows = sqlx::query_as::<_, CheckpointRow>(
            "SELECT thread_id, checkpoint_ns, checkpoint_id, parent_id, checkpoint, metadata
             FROM checkpoints
             WHERE thread_id = ? AND checkpoint_ns = ? AND seq < ?
             ORDER BY seq DESC LIMIT ?",
        )
        .bind(&config.thread_id)
        .bind(&config.checkpoint_ns)
        .bind(before_seq.unwrap_or(i64::MAX))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut tuples = Vec::with_capacity(rows.len());
        for row in rows {
            tuples.push(self.row_to_tuple(row).await?);
        }
        Ok(tuples)
    }

    async fn put(
        &self,
        config: &CheckpointConfig,
        checkpoint: Checkpoint,
        metadata: CheckpointMetadata,
    ) -> Result<CheckpointConfig> {
        let blob = self.serializer.dumps(&checkpoint)?;
        let metadata_json = serde_json::to_string(&metadata)?;
        let resolved = CheckpointConfig {
            thread_id: config.thread_id.clone(),
            checkpoint_ns: config.checkpoint_ns.clone(),
            checkpoint_id: Some(checkpoint.id.clone()),
        };

        sqlx::query(
            "INSERT INTO checkpoints
                (thread_id, checkpoint_ns, checkpoint_id, parent_id, checkpoint, metadata, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (thread_id, checkpoint_ns, checkpoint_id) DO UPDATE SET
                checkpoint = excluded.checkpoint,
                metadata = excluded.metadata",
        )
        .bind(&config.thread_id)
        .bind(&config.checkpoint_ns)
        .bind(&checkpoint.id)
        .bind(&checkpoint.parent_id)
        .bind(&blob)
        .bind(&metadata_json)
        .bind(checkpoint.ts.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(resolved)
    }

    async fn put_writes(
        &self,
        config: &CheckpointConfig,
        writes: Vec<PendingWrite>,
    ) -> Result<()> {
        let Some(checkpoint_id) = &config.checkpoint_id else {
            return Err(CheckpointError::Invalid(
                "put_writes requires a checkpoint_id".to_string(),
            ));
        };

        let mut tx = self.pool.begin().await?;
        for (idx, (task_id, channel, value)) in writes.into_iter().enumerate() {
            sqlx::query(
                "INSERT INTO checkpoint_writes
                    (thread_id, checkpoint_ns, checkpoint_id, task_id, idx, channel, value)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&config.thread_id)
            .bind(&config.checkpoint_ns)
            .bind(checkpoint_id)
            .bind(&task_id)
            .bind(idx as i64)
            .bind(&channel)
            .bind(serde_json::to_string(&value)?)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM checkpoints WHERE thread_id = ?")
            .bind(thread_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM checkpoint_writes WHERE thread_id = ?")
            .bind(thread_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    async fn saver() -> SqliteCheckpointSaver {
        SqliteCheckpointSaver::connect("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn test_put_get_round_trip() {
        let saver = saver().await;
        let config = CheckpointConfig::new("t1");

        let mut values = HashMap::new();
        values.insert("messages".to_string(), serde_json::json!([{"id": "m1"}]));
        let checkpoint = Checkpoint::new(values.clone(), None);
        let id = checkpoint.id.clone();

        saver
            .put(&config, checkpoint, CheckpointMetadata::new().with_step(0))
            .await
            .unwrap();

        let tuple = saver.get_tuple(&config).await.unwrap().unwrap();
        assert_eq!(tuple.checkpoint.id, id);
        assert_eq!(tuple.checkpoint.channel_values, values);
        assert_eq!(tuple.metadata.step, Some(0));
    }

    #[tokio::test]
    async fn test_put_is_idempotent() {
        let saver = saver().await;
        let config = CheckpointConfig::new("t1");
        let checkpoint = Checkpoint::empty();

        saver.put(&config, checkpoint.clone(), CheckpointMetadata::new()).await.unwrap();
        saver.put(&config, checkpoint, CheckpointMetadata::new()).await.unwrap();

        let listed = saver.list(&config, None, None).await.unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn test_list_with_before_cursor() {
        let saver = saver().await;
        let config = CheckpointConfig::new("t1");

        let mut parent = None;
        let mut ids = Vec::new();
        for _ in 0..3 {
            let cp = Checkpoint::new(HashMap::new(), parent.clone());
            ids.push(cp.id.clone());
            parent = Some(cp.id.clone());
            saver.put(&config, cp, CheckpointMetadata::new()).await.unwrap();
        }

        let before = config.clone().with_checkpoint_id(ids[2].clone());
        let earlier = saver.list(&config, Some(&before), None).await.unwrap();
        assert_eq!(earlier.len(), 2);
        assert_eq!(earlier[0].checkpoint.id, ids[1]);
    }

    #[tokio::test]
    async fn test_writes_and_delete_thread() {
        let saver = saver().await;
        let config = CheckpointConfig::new("t1");
        let resolved = saver
            .put(&config, Checkpoint::empty(), CheckpointMetadata::new())
            .await
            .unwrap();

        saver
            .put_writes(
                &resolved,
                vec![("task".into(), "messages".into(), serde_json::json!({"id": "m1"}))],
            )
            .await
            .unwrap();
        let tuple = saver.get_tuple(&config).await.unwrap().unwrap();
        assert_eq!(tuple.pending_writes.len(), 1);

        saver.delete_thread("t1").await.unwrap();
        assert!(saver.get_tuple(&config).await.unwrap().is_none());
    }
}
