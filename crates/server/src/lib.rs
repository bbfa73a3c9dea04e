//! The orchestration server's inbound HTTP surface: an `axum` router
//! proxying the inference subprocess and exposing the memory store.

pub mod error;
mod routes;
pub mod state;

use axum::Router;
use axum::routing::{delete, get, post};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(routes::chat::chat_completions))
        .route("/tokenize", post(routes::proxy::tokenize))
        .route("/v1/models", get(routes::proxy::list_models))
        .route("/v1/embeddings", post(routes::proxy::embeddings))
        .route("/v1/memory/search", post(routes::memory::search))
        .route("/v1/memory/store", post(routes::memory::store))
        .route("/v1/memory/list", get(routes::memory::list))
        .route("/v1/memory/count", get(routes::memory::count))
        .route("/v1/memory/:id", delete(routes::memory::delete_one))
        .route("/v1/memory", delete(routes::memory::delete_all))
        .route("/v1/training/:id", get(routes::training::status))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
