//! `/v1/memory/*` — backed directly by the hybrid memory store.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use serde::Deserialize;
use uuid::Uuid;

use orc_memory::MemoryEntry;

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct SearchRequest {
    pub query: String,
    #[serde(default = "default_search_limit")]
    pub limit: usize,
}

fn default_search_limit() -> usize {
    5
}

pub async fn search(
    State(state): State<AppState>,
    Json(req): Json<SearchRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let results = state.memory.search(&req.query, req.limit).await?;
    Ok(Json(serde_json::json!({ "results": results })))
}

#[derive(Deserialize)]
pub struct StoreRequest {
    pub user_message: String,
    pub assistant_message: String,
    #[serde(default)]
    pub session_id: Option<String>,
}

pub async fn store(
    State(state): State<AppState>,
    Json(req): Json<StoreRequest>,
) -> Result<Json<MemoryEntry>, ApiError> {
    let mut entry = MemoryEntry::new(req.user_message, req.assistant_message);
    if let Some(session_id) = req.session_id {
        entry = entry.with_session(session_id);
    }
    let stored = state.memory.add(entry).await?;
    Ok(Json(stored))
}

#[derive(Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub limit: usize,
}

pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Json<serde_json::Value> {
    let entries = state.memory.list(query.limit).await;
    Json(serde_json::json!({ "entries": entries }))
}

pub async fn count(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "count": state.memory.count().await }))
}

pub async fn delete_one(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let removed = state.memory.delete(id).await?;
    Ok(if removed { StatusCode::NO_CONTENT } else { StatusCode::NOT_FOUND })
}

pub async fn delete_all(State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    state.memory.clear().await?;
    Ok(StatusCode::NO_CONTENT)
}
