//! Agent execution ledger
//!
//! Append-only audit rows for every agent step: the `call_model` node of an
//! agent, the entry of a sub-agent, and each workflow tool invocation open a
//! row at start and close it at end with status, elapsed time, inputs,
//! outputs and model usage. Parent/child rows mirror the graph hierarchy;
//! tool turns record `predecessor = caller agent key` so cyclic execution
//! graphs never produce cyclic ledgers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use std::collections::HashMap;
use std::sync::RwLock;
use uuid::Uuid;

/// Status of a recorded execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Running,
    Success,
    Error,
    Interrupted,
    Aborted,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Running => "RUNNING",
            ExecutionStatus::Success => "SUCCESS",
            ExecutionStatus::Error => "ERROR",
            ExecutionStatus::Interrupted => "INTERRUPTED",
            ExecutionStatus::Aborted => "ABORTED",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "SUCCESS" => ExecutionStatus::Success,
            "ERROR" => ExecutionStatus::Error,
            "INTERRUPTED" => ExecutionStatus::Interrupted,
            "ABORTED" => ExecutionStatus::Aborted,
            _ => ExecutionStatus::Running,
        }
    }
}

/// Model usage accounting attached to an execution
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// One agent-step row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: String,
    pub thread_id: String,
    /// Checkpoint namespace the step ran under
    pub checkpoint_ns: String,
    /// Parent execution for sub-agents and tool turns
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Agent key of the caller that led into this step
    #[serde(skip_serializing_if = "Option::is_none")]
    pub predecessor: Option<String>,
    pub agent_key: String,
    pub status: ExecutionStatus,
    pub inputs: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<ModelUsage>,
    pub created_at: DateTime<Utc>,
}

impl Execution {
    pub fn open(thread_id: impl Into<String>, agent_key: impl Into<String>, inputs: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            thread_id: thread_id.into(),
            checkpoint_ns: String::new(),
            parent_id: None,
            predecessor: None,
            agent_key: agent_key.into(),
            status: ExecutionStatus::Running,
            inputs,
            outputs: None,
            error: None,
            elapsed_ms: None,
            checkpoint_id: None,
            usage: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_predecessor(mut self, predecessor: impl Into<String>) -> Self {
        self.predecessor = Some(predecessor.into());
        self
    }

    pub fn with_namespace(mut self, ns: impl Into<String>) -> Self {
        self.checkpoint_ns = ns.into();
        self
    }
}

/// Closing half of an execution row
#[derive(Debug, Clone, Default)]
pub struct ExecutionOutcome {
    pub status: Option<ExecutionStatus>,
    pub outputs: Option<Value>,
    pub error: Option<String>,
    pub checkpoint_id: Option<String>,
    pub usage: Option<ModelUsage>,
}

impl ExecutionOutcome {
    pub fn success(outputs: Value) -> Self {
        Self {
            status: Some(ExecutionStatus::Success),
            outputs: Some(outputs),
            ..Default::default()
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self {
            status: Some(ExecutionStatus::Error),
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn with_usage(mut self, usage: ModelUsage) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn with_checkpoint(mut self, checkpoint_id: impl Into<String>) -> Self {
        self.checkpoint_id = Some(checkpoint_id.into());
        self
    }
}

/// Append-only ledger of agent executions
#[async_trait]
pub trait ExecutionLedger: Send + Sync {
    /// Record a newly opened execution
    async fn open(&self, execution: Execution) -> Result<(), LedgerError>;

    /// Close an execution with its outcome; elapsed time is computed from
    /// the opening timestamp
    async fn close(&self, id: &str, outcome: ExecutionOutcome) -> Result<(), LedgerError>;

    async fn get(&self, id: &str) -> Result<Option<Execution>, LedgerError>;

    async fn children(&self, parent_id: &str) -> Result<Vec<Execution>, LedgerError>;

    /// All executions of a thread, oldest first
    async fn list_by_thread(&self, thread_id: &str) -> Result<Vec<Execution>, LedgerError>;
}

/// Errors from ledger backends
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Unknown execution '{0}'")]
    UnknownExecution(String),

    #[error("Ledger storage error: {0}")]
    Storage(String),
}

impl From<sqlx::Error> for LedgerError {
    fn from(e: sqlx::Error) -> Self {
        LedgerError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for LedgerError {
    fn from(e: serde_json::Error) -> Self {
        LedgerError::Storage(e.to_string())
    }
}

/// In-memory ledger for tests and ephemeral deployments
#[derive(Default)]
pub struct InMemoryLedger {
    rows: RwLock<HashMap<String, Execution>>,
    order: RwLock<Vec<String>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionLedger for InMemoryLedger {
    async fn open(&self, execution: Execution) -> Result<(), LedgerError> {
        let mut rows = self
            .rows
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut order = self
            .order
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        order.push(execution.id.clone());
        rows.insert(execution.id.clone(), execution);
        Ok(())
    }

    async fn close(&self, id: &str, outcome: ExecutionOutcome) -> Result<(), LedgerError> {
        let mut rows = self
            .rows
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let row = rows
            .get_mut(id)
            .ok_or_else(|| LedgerError::UnknownExecution(id.to_string()))?;
        if let Some(status) = outcome.status {
            row.status = status;
        }
        row.outputs = outcome.outputs.or(row.outputs.take());
        row.error = outcome.error.or(row.error.take());
        row.checkpoint_id = outcome.checkpoint_id.or(row.checkpoint_id.take());
        row.usage = outcome.usage.or(row.usage.take());
        row.elapsed_ms = Some((Utc::now() - row.created_at).num_milliseconds());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Execution>, LedgerError> {
        let rows = self
            .rows
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(rows.get(id).cloned())
    }

    async fn children(&self, parent_id: &str) -> Result<Vec<Execution>, LedgerError> {
        let rows = self
            .rows
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let order = self
            .order
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(order
            .iter()
            .filter_map(|id| rows.get(id))
            .filter(|row| row.parent_id.as_deref() == Some(parent_id))
            .cloned()
            .collect())
    }

    async fn list_by_thread(&self, thread_id: &str) -> Result<Vec<Execution>, LedgerError> {
        let rows = self
            .rows
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let order = self
            .order
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(order
            .iter()
            .filter_map(|id| rows.get(id))
            .filter(|row| row.thread_id == thread_id)
            .cloned()
            .collect())
    }
}

/// SQLite-backed ledger over an append table
pub struct SqliteLedger {
    pool: SqlitePool,
}

impl SqliteLedger {
    pub async fn connect(url: &str) -> Result<Self, LedgerError> {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(4)
            .connect(url)
            .await?;
        let ledger = Self { pool };
        ledger.migrate().await?;
        Ok(ledger)
    }

    /// Build a ledger on an existing pool (shared with the checkpoint saver)
    pub async fn with_pool(pool: SqlitePool) -> Result<Self, LedgerError> {
        let ledger = Self { pool };
        ledger.migrate().await?;
        Ok(ledger)
    }

    async fn migrate(&self) -> Result<(), LedgerError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS executions (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                thread_id TEXT NOT NULL,
                checkpoint_ns TEXT NOT NULL DEFAULT '',
                parent_id TEXT,
                predecessor TEXT,
                agent_key TEXT NOT NULL,
                status TEXT NOT NULL,
                inputs TEXT NOT NULL,
                outputs TEXT,
                error TEXT,
                elapsed_ms INTEGER,
                checkpoint_id TEXT,
                usage TEXT,
                created_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn row_to_execution(row: &sqlx::sqlite::SqliteRow) -> Result<Execution, LedgerError> {
        let usage: Option<String> = row.get("usage");
        let outputs: Option<String> = row.get("outputs");
        let created_at: String = row.get("created_at");
        Ok(Execution {
            id: row.get("id"),
            thread_id: row.get("thread_id"),
            checkpoint_ns: row.get("checkpoint_ns"),
            parent_id: row.get("parent_id"),
            predecessor: row.get("predecessor"),
            agent_key: row.get("agent_key"),
            status: ExecutionStatus::parse(row.get("status")),
            inputs: serde_json::from_str(row.get("inputs"))?,
            outputs: outputs.map(|o| serde_json::from_str(&o)).transpose()?,
            error: row.get("error"),
            elapsed_ms: row.get("elapsed_ms"),
            checkpoint_id: row.get("checkpoint_id"),
            usage: usage.map(|u| serde_json::from_str(&u)).transpose()?,
            created_at: created_at
                .parse()
                .map_err(|e| LedgerError::Storage(format!("bad timestamp: {e}")))?,
        })
    }
}

#[async_trait]
impl ExecutionLedger for SqliteLedger {
    async fn open(&self, execution: Execution) -> Result<(), LedgerError> {
        sqlx::query(
            "INSERT INTO executions
                (id, thread_id, checkpoint_ns, parent_id, predecessor, agent_key,
                 status, inputs, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&execution.id)
        .bind(&execution.thread_id)
        .bind(&execution.checkpoint_ns)
        .bind(&execution.parent_id)
        .bind(&execution.predecessor)
        .bind(&execution.agent_key)
        .bind(execution.status.as_str())
        .bind(serde_json::to_string(&execution.inputs)?)
        .bind(execution.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn close(&self, id: &str, outcome: ExecutionOutcome) -> Result<(), LedgerError> {
        let existing = self
            .get(id)
            .await?
            .ok_or_else(|| LedgerError::UnknownExecution(id.to_string()))?;
        let elapsed = (Utc::now() - existing.created_at).num_milliseconds();
        let status = outcome.status.unwrap_or(existing.status);

        sqlx::query(
            "UPDATE executions SET
                status = ?, outputs = COALESCE(?, outputs), error = COALESCE(?, error),
                elapsed_ms = ?, checkpoint_id = COALESCE(?, checkpoint_id),
                usage = COALESCE(?, usage)
             WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(outcome.outputs.map(|o| serde_json::to_string(&o)).transpose()?)
        .bind(outcome.error)
        .bind(elapsed)
        .bind(outcome.checkpoint_id)
        .bind(outcome.usage.map(|u| serde_json::to_string(&u)).transpose()?)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Execution>, LedgerError> {
        let row = sqlx::query("SELECT * FROM executions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_execution).transpose()
    }

    async fn children(&self, parent_id: &str) -> Result<Vec<Execution>, LedgerError> {
        let rows = sqlx::query("SELECT * FROM executions WHERE parent_id = ? ORDER BY seq ASC")
            .bind(parent_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_execution).collect()
    }

    async fn list_by_thread(&self, thread_id: &str) -> Result<Vec<Execution>, LedgerError> {
        let rows = sqlx::query("SELECT * FROM executions WHERE thread_id = ? ORDER BY seq ASC")
            .bind(thread_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_execution).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_open_close_in_memory() {
        let ledger = InMemoryLedger::new();
        let execution = Execution::open("t1", "researcher", json!({"input": "hi"}));
        let id = execution.id.clone();
        ledger.open(execution).await.unwrap();

        ledger
            .close(
                &id,
                ExecutionOutcome::success(json!({"content": "done"}))
                    .with_usage(ModelUsage { input_tokens: 10, output_tokens: 5 }),
            )
            .await
            .unwrap();

        let row = ledger.get(&id).await.unwrap().unwrap();
        assert_eq!(row.status, ExecutionStatus::Success);
        assert!(row.elapsed_ms.is_some());
        assert_eq!(row.usage.unwrap().input_tokens, 10);
    }

    #[tokio::test]
    async fn test_parent_child_rows() {
        let ledger = InMemoryLedger::new();
        let parent = Execution::open("t1", "leader", json!({}));
        let parent_id = parent.id.clone();
        ledger.open(parent).await.unwrap();

        let child = Execution::open("t1", "follower", json!({}))
            .with_parent(parent_id.clone())
            .with_predecessor("leader");
        ledger.open(child).await.unwrap();

        let children = ledger.children(&parent_id).await.unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].predecessor.as_deref(), Some("leader"));
    }

    #[tokio::test]
    async fn test_sqlite_ledger_round_trip() {
        let ledger = SqliteLedger::connect("sqlite::memory:").await.unwrap();
        let execution = Execution::open("t1", "agent", json!({"q": 1}));
        let id = execution.id.clone();
        ledger.open(execution).await.unwrap();
        ledger
            .close(&id, ExecutionOutcome::error("model failed"))
            .await
            .unwrap();

        let rows = ledger.list_by_thread("t1").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, ExecutionStatus::Error);
        assert_eq!(rows[0].error.as_deref(), Some("model failed"));
    }
}
