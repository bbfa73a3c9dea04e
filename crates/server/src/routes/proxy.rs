//! Thin proxy routes that forward to the inference subprocess and hand the
//! response straight back, unparsed — `/tokenize`, `GET /v1/models`,
//! `/v1/embeddings`.

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;

use crate::error::ApiError;
use crate::state::AppState;

pub async fn tokenize(
    State(state): State<AppState>,
    Json(body): Json<serde_json::Value>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let (status, body) = state.inference.forward_post("/tokenize", body).await?;
    Ok((status_from(status), Json(body)))
}

pub async fn list_models(
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let (status, body) = state.inference.forward_get("/v1/models").await?;
    Ok((status_from(status), Json(body)))
}

pub async fn embeddings(
    State(state): State<AppState>,
    Json(body): Json<serde_json::Value>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let (status, body) = state.embedding_client().forward_post("/v1/embeddings", body).await?;
    Ok((status_from(status), Json(body)))
}

fn status_from(code: u16) -> StatusCode {
    StatusCode::from_u16(code).unwrap_or(StatusCode::BAD_GATEWAY)
}
