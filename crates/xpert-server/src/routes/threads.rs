//! Thread endpoints

use crate::entities::{IfExists, Thread, ThreadCreate, ThreadSearch, ThreadState};
use crate::error::{Result, ServerError};
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};
use uuid::Uuid;
use xpert_checkpoint::CheckpointConfig;

/// POST /threads — create a thread, idempotent under `if_exists=do_nothing`
pub async fn create_thread(
    State(state): State<AppState>,
    Json(payload): Json<ThreadCreate>,
) -> Result<(StatusCode, Json<Thread>)> {
    let thread_id = payload
        .thread_id
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    if let Some(existing) = state.threads.get(&thread_id) {
        return match payload.if_exists {
            IfExists::DoNothing => Ok((StatusCode::OK, Json(existing.clone()))),
            IfExists::Raise => Err(ServerError::Conflict(format!(
                "thread '{thread_id}' already exists"
            ))),
        };
    }

    let thread = Thread::new(thread_id.clone(), payload.metadata);
    state.threads.insert(thread_id, thread.clone());
    Ok((StatusCode::CREATED, Json(thread)))
}

/// POST /threads/search — AND of metadata conditions
pub async fn search_threads(
    State(state): State<AppState>,
    Json(payload): Json<ThreadSearch>,
) -> Json<Vec<Thread>> {
    let mut found: Vec<Thread> = state
        .threads
        .iter()
        .filter(|entry| {
            payload
                .metadata
                .iter()
                .all(|(key, value)| entry.metadata.get(key) == Some(value))
        })
        .map(|entry| entry.clone())
        .collect();
    found.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    if let Some(limit) = payload.limit {
        found.truncate(limit);
    }
    Json(found)
}

/// GET /threads/:id
pub async fn get_thread(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
) -> Result<Json<Thread>> {
    state
        .threads
        .get(&thread_id)
        .map(|t| Json(t.clone()))
        .ok_or_else(|| ServerError::NotFound(format!("thread '{thread_id}'")))
}

/// DELETE /threads/:id — accepted; deletion runs in the background
pub async fn delete_thread(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
) -> Result<StatusCode> {
    if state.threads.remove(&thread_id).is_none() {
        return Err(ServerError::NotFound(format!("thread '{thread_id}'")));
    }
    state.runs.retain(|_, run| run.thread_id != thread_id);

    let checkpointer = state.checkpointer.clone();
    tokio::spawn(async move {
        if let Err(e) = checkpointer.delete_thread(&thread_id).await {
            tracing::warn!(thread_id = %thread_id, error = %e, "thread checkpoint deletion failed");
        }
    });
    Ok(StatusCode::ACCEPTED)
}

/// GET /threads/:id/state — latest checkpoint snapshot
pub async fn thread_state(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
) -> Result<Json<ThreadState>> {
    if !state.threads.contains_key(&thread_id) {
        return Err(ServerError::NotFound(format!("thread '{thread_id}'")));
    }

    let tuple = state
        .checkpointer
        .get_tuple(&CheckpointConfig::new(thread_id.clone()))
        .await
        .map_err(|e| ServerError::Internal(e.to_string()))?
        .ok_or_else(|| ServerError::NotFound(format!("no state for thread '{thread_id}'")))?;

    let config_json = |config: &CheckpointConfig| -> Value {
        json!({
            "thread_id": config.thread_id,
            "checkpoint_ns": config.checkpoint_ns,
            "checkpoint_id": config.checkpoint_id,
        })
    };

    Ok(Json(ThreadState {
        values: serde_json::to_value(&tuple.checkpoint.channel_values)
            .unwrap_or(Value::Null),
        checkpoint: config_json(&tuple.config),
        parent_checkpoint: tuple.parent_config.as_ref().map(config_json),
        metadata: serde_json::to_value(&tuple.metadata).unwrap_or(Value::Null),
        created_at: tuple.checkpoint.ts,
    }))
}
