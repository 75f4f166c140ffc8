// crates/server/src/routes/sessions.rs
//! User session REST endpoints.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use claude_web_core::SessionSummary;
use serde::Serialize;

use crate::auth::AuthUser;
use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct NewSessionResponse {
    pub session_id: String,
}

#[derive(Debug, Serialize)]
pub struct SessionsResponse {
    pub sessions: Vec<SessionSummary>,
}

/// POST /api/session/new - Mint a user session and bring up its terminals.
pub async fn new_session(
    State(state): State<Arc<AppState>>,
    AuthUser(principal): AuthUser,
) -> ApiResult<Json<NewSessionResponse>> {
    let session = state.engine.new_user_session(&principal.user_id).await?;
    tracing::info!(session_id = %session.id, user = %principal.username, "session created");
    Ok(Json(NewSessionResponse {
        session_id: session.id,
    }))
}

/// GET /api/sessions - List registered sessions.
pub async fn list_sessions(
    State(state): State<Arc<AppState>>,
    AuthUser(_): AuthUser,
) -> Json<SessionsResponse> {
    Json(SessionsResponse {
        sessions: state.engine.list_sessions().await,
    })
}

/// DELETE /api/sessions/{id} - Terminate a session.
pub async fn terminate_session(
    State(state): State<Arc<AppState>>,
    AuthUser(principal): AuthUser,
    Path(session_id): Path<String>,
) -> ApiResult<StatusCode> {
    state.engine.terminate(&session_id).await?;
    tracing::info!(session_id = %session_id, user = %principal.username, "session terminated via API");
    Ok(StatusCode::NO_CONTENT)
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/session/new", post(new_session))
        .route("/sessions", get(list_sessions))
        .route("/sessions/{id}", delete(terminate_session))
}
