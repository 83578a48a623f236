//! Run endpoints: background, SSE streaming, and wait
//!
//! The SSE stream frames every run event as `data: {type, event, data}`, a
//! keep-alive comment goes out every 30 seconds, and a client disconnect
//! aborts the run through its abort handle.

use crate::entities::{Run, RunCreateStateful};
use crate::error::{Result, ServerError};
use crate::runs::{abort_run, execute_run};
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures::Stream;
use serde_json::json;
use std::convert::Infallible;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use xpert_core::{EventBus, MutePolicy, RunEvent};

fn make_run(state: &AppState, thread_id: &str, payload: &RunCreateStateful) -> Result<Run> {
    if !state.threads.contains_key(thread_id) {
        return Err(ServerError::NotFound(format!("thread '{thread_id}'")));
    }
    if !state.assistants.contains_key(&payload.assistant_id) {
        return Err(ServerError::NotFound(format!(
            "assistant '{}'",
            payload.assistant_id
        )));
    }

    let mut run = Run::new(
        thread_id.to_string(),
        payload.assistant_id.clone(),
        serde_json::to_value(&payload.input).unwrap_or_default(),
    );
    run.metadata = payload.metadata.clone();
    state.runs.insert(run.id.clone(), run.clone());
    Ok(run)
}

/// POST /threads/:id/runs — create a background run, return immediately
pub async fn create_run(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
    Json(payload): Json<RunCreateStateful>,
) -> Result<Json<Run>> {
    let run = make_run(&state, &thread_id, &payload)?;

    let task_state = state.clone();
    let task_run = run.clone();
    let request = payload.input.clone();
    tokio::spawn(async move {
        if let Err(e) = execute_run(&task_state, &task_run, &request, EventBus::sink()).await {
            tracing::error!(run_id = %task_run.id, error = %e, "background run failed");
        }
    });

    Ok(Json(run))
}

/// GET /threads/:id/runs/:run_id
pub async fn get_run(
    State(state): State<AppState>,
    Path((thread_id, run_id)): Path<(String, String)>,
) -> Result<Json<Run>> {
    state
        .runs
        .get(&run_id)
        .filter(|run| run.thread_id == thread_id)
        .map(|run| Json(run.clone()))
        .ok_or_else(|| ServerError::NotFound(format!("run '{run_id}'")))
}

/// POST /threads/:id/runs/wait — create and await the final AI text
pub async fn wait_run(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
    Json(payload): Json<RunCreateStateful>,
) -> Result<Json<serde_json::Value>> {
    let run = make_run(&state, &thread_id, &payload)?;
    let outcome = execute_run(&state, &run, &payload.input, EventBus::sink()).await?;
    Ok(Json(json!({
        "role": "ai",
        "content": outcome.final_text().unwrap_or_default(),
    })))
}

/// POST /threads/:id/runs/stream — create and stream as SSE
pub async fn stream_run(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
    Json(payload): Json<RunCreateStateful>,
) -> Result<Sse<RunEventStream>> {
    let run = make_run(&state, &thread_id, &payload)?;
    let (bus, rx) = EventBus::channel(MutePolicy::default());

    let task_state = state.clone();
    let task_run = run.clone();
    let request = payload.input.clone();
    tokio::spawn(async move {
        if let Err(e) = execute_run(&task_state, &task_run, &request, bus).await {
            tracing::error!(run_id = %task_run.id, error = %e, "streamed run failed");
        }
    });

    let stream = RunEventStream {
        rx,
        _guard: DisconnectGuard {
            state,
            run_id: run.id,
        },
    };
    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(30))
            .text("keep-alive"),
    ))
}

/// Aborts the run when the SSE body is dropped (client went away). A no-op
/// once the run finished, since its abort handle is gone by then.
struct DisconnectGuard {
    state: AppState,
    run_id: String,
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        if abort_run(&self.state, &self.run_id) {
            tracing::info!(run_id = %self.run_id, "client disconnected, run aborted");
        }
    }
}

/// SSE adapter over the run's event receiver
pub struct RunEventStream {
    rx: mpsc::UnboundedReceiver<RunEvent>,
    _guard: DisconnectGuard,
}

impl Stream for RunEventStream {
    type Item = std::result::Result<Event, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(event)) => Poll::Ready(Some(Ok(frame(event)))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Frame a run event as `{type, event, data}`
fn frame(event: RunEvent) -> Event {
    let serialized = serde_json::to_value(&event).unwrap_or(json!({}));
    let body = json!({
        "type": "event",
        "event": event.event_name(),
        "data": serialized.get("data").cloned().unwrap_or(json!({})),
    });
    Event::default().json_data(body).unwrap_or_else(|_| Event::default().data("{}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_shape() {
        let event = RunEvent::RunStart {
            run_id: "r1".to_string(),
        };
        // The framed event is a valid SSE data payload
        let framed = frame(event);
        let rendered = format!("{framed:?}");
        assert!(rendered.contains("on_run_start"));
    }
}
