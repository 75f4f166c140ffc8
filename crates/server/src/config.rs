// crates/server/src/config.rs
//! Command-line and environment configuration.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use claude_web_core::liveness::DEFAULT_LIVENESS_MARKERS;
use claude_web_core::{EngineConfig, LivenessConfig, PollerConfig, TmuxAdapter};

/// Secret used when none is configured. Tokens signed with it are trivially
/// forgeable, so startup warns about it.
pub const DEFAULT_AUTH_SECRET: &str = "claude-web-secret-key";

/// Default port for the server.
pub const DEFAULT_PORT: u16 = 5000;

#[derive(Debug, Clone, Parser)]
#[command(name = "claude-web", version, about = "Shared tmux terminals for the Claude Code assistant over WebSocket")]
pub struct ServerArgs {
    /// Address to listen on.
    #[arg(long, env = "CLAUDE_WEB_BIND", default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub bind: IpAddr,

    /// Port to listen on. Falls back to `PORT`, then 5000.
    #[arg(long, env = "CLAUDE_WEB_PORT")]
    pub port: Option<u16>,

    /// HS256 secret used to verify bearer and event tokens.
    #[arg(long, env = "AUTH_SECRET", default_value = DEFAULT_AUTH_SECRET, hide_env_values = true)]
    pub auth_secret: String,

    /// Directory holding one sub-directory per project.
    #[arg(long, env = "CLAUDE_WEB_PROJECTS_ROOT", default_value = "/root/docker/apps")]
    pub projects_root: PathBuf,

    /// tmux control socket (`tmux -S`). Uses tmux's default server when unset.
    #[arg(long, env = "CLAUDE_WEB_TMUX_SOCKET")]
    pub tmux_socket: Option<PathBuf>,

    #[arg(long, env = "CLAUDE_WEB_TMUX_BIN", default_value = "tmux")]
    pub tmux_bin: String,

    /// Command typed into a terminal to start the assistant.
    #[arg(long, env = "CLAUDE_WEB_LAUNCH_COMMAND", default_value = "claude")]
    pub launch_command: String,

    /// Name of the shared terminal every user session mirrors.
    #[arg(long, env = "CLAUDE_WEB_PRIMARY_SESSION", default_value = "claude-code-session")]
    pub primary_session: String,

    #[arg(long, env = "CLAUDE_WEB_USER_POLL_MS", default_value_t = 300)]
    pub user_poll_ms: u64,

    #[arg(long, env = "CLAUDE_WEB_PROJECT_POLL_MS", default_value_t = 500)]
    pub project_poll_ms: u64,

    #[arg(long, env = "CLAUDE_WEB_ERROR_BACKOFF_MS", default_value_t = 1000)]
    pub error_backoff_ms: u64,

    /// Wait after launching the assistant before its output is trusted.
    #[arg(long, env = "CLAUDE_WEB_SETTLE_MS", default_value_t = 3000)]
    pub settle_ms: u64,

    /// Scroll-back lines included in every capture.
    #[arg(long, env = "CLAUDE_WEB_HISTORY_LINES", default_value_t = 1000)]
    pub history_lines: usize,

    /// Allowed CORS origin. Repeatable; any origin when none is given.
    #[arg(long = "cors-origin", env = "CORS_ALLOW_ORIGINS", value_delimiter = ',')]
    pub cors_origins: Vec<String>,

    /// Also write logs to this file.
    #[arg(long, env = "CLAUDE_WEB_LOG_FILE")]
    pub log_file: Option<PathBuf>,

    /// Do not destroy mirror terminals left over from a previous run.
    #[arg(long, env = "CLAUDE_WEB_KEEP_STALE_MIRRORS")]
    pub keep_stale_mirrors: bool,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: IpAddr,
    pub port: u16,
    pub auth_secret: String,
    pub cors_origins: Vec<String>,
    pub log_file: Option<PathBuf>,
    pub tmux_bin: String,
    pub tmux_socket: Option<PathBuf>,
    pub keep_stale_mirrors: bool,
    pub engine: EngineConfig,
}

impl ServerArgs {
    pub fn into_config(self) -> ServerConfig {
        let port = self
            .port
            .or_else(|| std::env::var("PORT").ok().and_then(|p| p.parse().ok()))
            .unwrap_or(DEFAULT_PORT);

        let engine = EngineConfig {
            primary_session: self.primary_session,
            projects_root: self.projects_root,
            poller: PollerConfig {
                user_interval: Duration::from_millis(self.user_poll_ms),
                project_interval: Duration::from_millis(self.project_poll_ms),
                error_backoff: Duration::from_millis(self.error_backoff_ms),
                history_lines: self.history_lines,
            },
            liveness: LivenessConfig {
                markers: DEFAULT_LIVENESS_MARKERS.iter().map(|m| m.to_string()).collect(),
                settle_delay: Duration::from_millis(self.settle_ms),
                launch_command: self.launch_command,
                history_lines: self.history_lines,
            },
        };

        ServerConfig {
            bind: self.bind,
            port,
            auth_secret: self.auth_secret,
            cors_origins: self
                .cors_origins
                .into_iter()
                .map(|o| o.trim().to_string())
                .filter(|o| !o.is_empty())
                .collect(),
            log_file: self.log_file,
            tmux_bin: self.tmux_bin,
            tmux_socket: self.tmux_socket,
            keep_stale_mirrors: self.keep_stale_mirrors,
            engine,
        }
    }
}

impl ServerConfig {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }

    pub fn uses_default_secret(&self) -> bool {
        self.auth_secret == DEFAULT_AUTH_SECRET
    }

    pub fn terminal(&self) -> TmuxAdapter {
        let adapter = TmuxAdapter::new(&self.tmux_bin);
        match &self.tmux_socket {
            Some(socket) => adapter.with_socket(socket),
            None => adapter,
        }
    }
}
