//! Memory KV store endpoints

use crate::error::{Result, ServerError};
use crate::state::AppState;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::Value;
use xpert_core::StoreItem;

#[derive(Debug, Deserialize)]
pub struct PutItem {
    pub namespace: Vec<String>,
    pub key: String,
    pub value: Value,
}

#[derive(Debug, Deserialize)]
pub struct ItemRef {
    /// Dotted namespace, e.g. `memories.user-1`
    pub namespace: String,
    pub key: String,
}

#[derive(Debug, Deserialize)]
pub struct SearchItems {
    #[serde(default)]
    pub namespace_prefix: Vec<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

fn split_namespace(dotted: &str) -> Vec<String> {
    dotted
        .split('.')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// POST /store/items
pub async fn put_item(
    State(state): State<AppState>,
    Json(payload): Json<PutItem>,
) -> Result<StatusCode> {
    state
        .store
        .put(&payload.namespace, &payload.key, payload.value)
        .await
        .map_err(|e| ServerError::Internal(e.to_string()))?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /store/items?namespace=a.b&key=k
pub async fn get_item(
    State(state): State<AppState>,
    Query(query): Query<ItemRef>,
) -> Result<Json<StoreItem>> {
    let namespace = split_namespace(&query.namespace);
    state
        .store
        .get(&namespace, &query.key)
        .await
        .map_err(|e| ServerError::Internal(e.to_string()))?
        .map(Json)
        .ok_or_else(|| {
            ServerError::NotFound(format!("item '{}/{}'", query.namespace, query.key))
        })
}

/// DELETE /store/items?namespace=a.b&key=k
pub async fn delete_item(
    State(state): State<AppState>,
    Query(query): Query<ItemRef>,
) -> Result<StatusCode> {
    let namespace = split_namespace(&query.namespace);
    state
        .store
        .delete(&namespace, &query.key)
        .await
        .map_err(|e| ServerError::Internal(e.to_string()))?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /store/items/search
pub async fn search_items(
    State(state): State<AppState>,
    Json(payload): Json<SearchItems>,
) -> Result<Json<Vec<StoreItem>>> {
    let items = state
        .store
        .search(&payload.namespace_prefix, payload.limit)
        .await
        .map_err(|e| ServerError::Internal(e.to_string()))?;
    Ok(Json(items))
}
