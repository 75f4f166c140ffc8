// crates/server/src/routes/projects.rs
//! Project session REST endpoints.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    routing::post,
    Json, Router,
};
use serde::Serialize;

use crate::auth::AuthUser;
use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct ProjectSessionResponse {
    pub session_id: String,
    pub project_id: String,
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct ProjectCleanupResponse {
    pub project_id: String,
    /// Session that was removed, if the project had one registered.
    pub session_id: Option<String>,
}

/// POST /api/projects/{project_id}/session - Get or create the project's session.
pub async fn open_project_session(
    State(state): State<Arc<AppState>>,
    AuthUser(principal): AuthUser,
    Path(project_id): Path<String>,
) -> ApiResult<Json<ProjectSessionResponse>> {
    let session = state
        .engine
        .open_project(&project_id, &principal.user_id)
        .await?;
    Ok(Json(ProjectSessionResponse {
        session_id: session.id,
        project_id,
    }))
}

/// DELETE /api/projects/{project_id}/session - Destroy the project's terminal.
pub async fn cleanup_project_session(
    State(state): State<Arc<AppState>>,
    AuthUser(_): AuthUser,
    Path(project_id): Path<String>,
) -> ApiResult<Json<ProjectCleanupResponse>> {
    let removed = state.engine.cleanup_project(&project_id).await?;
    Ok(Json(ProjectCleanupResponse {
        project_id,
        session_id: removed.map(|s| s.id),
    }))
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route(
        "/projects/{project_id}/session",
        post(open_project_session).delete(cleanup_project_session),
    )
}
