// crates/server/src/state.rs
//! Application state for the Axum server.

use std::sync::Arc;
use std::time::Instant;

use claude_web_core::Engine;

use crate::auth::TokenVerifier;

/// Shared application state accessible from all route handlers.
pub struct AppState {
    /// Server start time for uptime tracking.
    pub start_time: Instant,
    /// Session engine: registry, pollers, broadcast hub.
    pub engine: Arc<Engine>,
    /// Checks bearer and event tokens.
    pub verifier: Arc<dyn TokenVerifier>,
}

impl AppState {
    pub fn new(engine: Arc<Engine>, verifier: Arc<dyn TokenVerifier>) -> Arc<Self> {
        Arc::new(Self {
            start_time: Instant::now(),
            engine,
            verifier,
        })
    }

    /// Get the server uptime in seconds.
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
