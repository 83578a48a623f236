//! Assistant endpoints

use crate::entities::AssistantSearch;
use crate::error::{Result, ServerError};
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::Json;
use xpert_core::Xpert;

/// POST /assistants/search — filter by graph id (slug) and version flags
pub async fn search_assistants(
    State(state): State<AppState>,
    Json(payload): Json<AssistantSearch>,
) -> Json<Vec<Xpert>> {
    let found: Vec<Xpert> = state
        .assistants
        .iter()
        .filter(|entry| match &payload.graph_id {
            Some(graph_id) => &entry.slug == graph_id || &entry.id == graph_id,
            None => true,
        })
        .map(|entry| entry.clone())
        .collect();
    Json(found)
}

/// GET /assistants/:id
pub async fn get_assistant(
    State(state): State<AppState>,
    Path(assistant_id): Path<String>,
) -> Result<Json<Xpert>> {
    state
        .assistants
        .get(&assistant_id)
        .map(|x| Json(x.clone()))
        .ok_or_else(|| ServerError::NotFound(format!("assistant '{assistant_id}'")))
}
