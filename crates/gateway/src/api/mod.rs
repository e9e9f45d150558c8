//! API surface.
//!
//! - `POST /chat`          — SSE: run an agent turn
//! - `POST /chat/resume`   — SSE: resume an interrupted run
//! - `POST /chat/complete` — non-streaming aggregate of a run
//! - `GET  /healthz`       — readiness probe

pub mod chat;

use axum::extract::State;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/chat", post(chat::chat_stream))
        .route("/chat/resume", post(chat::chat_resume))
        .route("/chat/complete", post(chat::chat_complete))
        .route("/healthz", get(healthz))
}

async fn healthz(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "model_configured": state.runtime.is_some(),
        "tools": state.registry.names(),
        "repositories": state.config.repositories.len(),
        "watch_sessions": state.watch_sessions,
        "active_threads": state.thread_locks.thread_count(),
        "started_at": state.started_at,
    }))
}
