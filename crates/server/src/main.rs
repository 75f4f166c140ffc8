// crates/server/src/main.rs
//! claude-web server binary.
//!
//! Cleans up terminals orphaned by a previous run, then serves the REST API
//! and the realtime channel.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use claude_web_core::{Engine, TerminalAdapter};
use claude_web_server::auth::JwtVerifier;
use claude_web_server::config::ServerArgs;
use claude_web_server::{create_app, AppState};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_LOG_FILTER: &str = "warn,claude_web_server=info,claude_web_core=info,tower_http=info";

/// Log to stderr, and also to `log_file` when given. The returned guard
/// flushes the file writer on drop and must live until exit.
fn init_tracing(log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_LOG_FILTER.into());

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
            let name = path
                .file_name()
                .context("log file path has no file name")?;
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating log directory {}", dir.display()))?;
            let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
            let layer = fmt::layer().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();
    Ok(guard)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = ServerArgs::parse().into_config();
    let _log_guard = init_tracing(config.log_file.as_deref())?;

    if config.uses_default_secret() {
        tracing::warn!("AUTH_SECRET is not set; using the built-in default secret");
    }

    let terminal: Arc<dyn TerminalAdapter> = Arc::new(config.terminal());
    let engine = Arc::new(Engine::new(terminal, config.engine.clone()));

    if !config.keep_stale_mirrors {
        match engine.cleanup_stale_mirrors().await {
            Ok(removed) => tracing::info!(count = removed.len(), "startup cleanup complete"),
            Err(e) => tracing::warn!(error = %e, "startup cleanup failed (non-fatal)"),
        }
    }

    let verifier = Arc::new(JwtVerifier::new(&config.auth_secret));
    let state = AppState::new(engine, verifier);
    let app = create_app(state, &config.cors_origins);

    let addr = config.addr();
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!(
        addr = %addr,
        projects_root = %config.engine.projects_root.display(),
        primary = %config.engine.primary_session,
        "claude-web listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;
    Ok(())
}
