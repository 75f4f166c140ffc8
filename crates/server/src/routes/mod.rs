//! HTTP and WebSocket route handlers.

pub mod health;
pub mod projects;
pub mod sessions;
pub mod ws;

use std::sync::Arc;

use axum::Router;

use crate::state::AppState;

/// Create the combined router.
///
/// Routes:
/// - GET    /api/health - Health check
/// - POST   /api/session/new - Create a user session
/// - GET    /api/sessions - List registered sessions
/// - DELETE /api/sessions/{id} - Terminate a session
/// - POST   /api/projects/{project_id}/session - Get or create a project session
/// - DELETE /api/projects/{project_id}/session - Destroy a project session
/// - GET    /ws - Realtime channel (WebSocket)
pub fn api_routes(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .merge(health::router())
        .merge(sessions::router())
        .merge(projects::router());

    Router::new()
        .nest("/api", api)
        .merge(ws::router())
        .with_state(state)
}
