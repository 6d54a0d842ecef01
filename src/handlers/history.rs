use crate::session::Turn;
use crate::state::AppState;
use axum::{
    extract::{Path, State},
    Json,
};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub session_id: String,
    pub history: Vec<Turn>,
}

#[derive(Debug, Serialize)]
pub struct ClearResponse {
    pub message: String,
}

/// GET /api/chat-history/:session_id - Turns of a session, oldest first.
pub async fn history_handler(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Json<HistoryResponse> {
    let history = state.sessions.get(&session_id);
    Json(HistoryResponse {
        session_id,
        history,
    })
}

/// DELETE /api/chat-history/:session_id - Clear a session. Idempotent.
pub async fn clear_history_handler(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Json<ClearResponse> {
    state.sessions.clear(&session_id);
    tracing::info!(session_id = %session_id, "Chat history cleared");
    Json(ClearResponse {
        message: format!("Chat history cleared for session {}", session_id),
    })
}
