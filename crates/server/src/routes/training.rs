//! `GET /v1/training/:id` — type-checks against [`orc_core::TrainingRun`]
//! but has nothing behind it: the fine-tuning pipeline is an external
//! Python sidecar, out of scope here.

use axum::extract::Path;
use axum::http::StatusCode;
use uuid::Uuid;

pub async fn status(Path(_id): Path<Uuid>) -> StatusCode {
    StatusCode::NOT_IMPLEMENTED
}
