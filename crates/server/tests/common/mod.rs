//! Shared harness: an app wired to an in-memory terminal.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use claude_web_core::testing::FakeTerminal;
use claude_web_core::{Engine, EngineConfig, LivenessConfig};
use claude_web_server::auth::JwtVerifier;
use claude_web_server::{create_app, AppState};
use tempfile::TempDir;

pub const SECRET: &str = "test-secret";

pub struct TestApp {
    pub app: axum::Router,
    pub state: Arc<AppState>,
    pub fake: Arc<FakeTerminal>,
    pub projects_root: TempDir,
}

/// App with a `demo` project on disk and a fast settle delay.
pub fn test_app() -> TestApp {
    let projects_root = TempDir::new().unwrap();
    std::fs::create_dir(projects_root.path().join("demo")).unwrap();

    let fake = Arc::new(FakeTerminal::new());
    fake.respond_to("claude", "│ cwd: /srv/apps/demo │");

    let config = EngineConfig {
        projects_root: projects_root.path().to_path_buf(),
        liveness: LivenessConfig {
            settle_delay: Duration::from_millis(10),
            ..LivenessConfig::default()
        },
        ..EngineConfig::default()
    };
    let engine = Arc::new(Engine::new(fake.clone(), config));
    let state = AppState::new(engine, Arc::new(JwtVerifier::new(SECRET)));
    let app = create_app(state.clone(), &[]);

    TestApp {
        app,
        state,
        fake,
        projects_root,
    }
}

pub fn token_for(user_id: &str) -> String {
    JwtVerifier::new(SECRET)
        .issue(user_id, "tester", chrono::Duration::hours(1))
        .unwrap()
}
