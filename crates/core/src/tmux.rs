// crates/core/src/tmux.rs
//! Terminal multiplexer adapter.
//!
//! Every interaction with tmux is one of the [`TmuxCommand`] variants. The
//! variants carry structured arguments; turning them into an argv (targets,
//! literal-mode flags, escaping) happens in [`TmuxCommand::args`] and nowhere
//! else. Commands are executed directly, never through a shell.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::TerminalError;

/// Scroll-back lines captured in addition to the visible pane.
pub const DEFAULT_HISTORY_LINES: usize = 1000;

/// The closed set of multiplexer operations the engine issues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TmuxCommand {
    Create {
        name: String,
        start_dir: Option<PathBuf>,
    },
    SendInput {
        name: String,
        text: String,
    },
    Capture {
        name: String,
        history_lines: usize,
    },
    HasSession {
        name: String,
    },
    Destroy {
        name: String,
    },
    ListSessions,
}

impl TmuxCommand {
    /// tmux verb, used for logging and error reporting.
    pub fn verb(&self) -> &'static str {
        match self {
            TmuxCommand::Create { .. } => "new-session",
            TmuxCommand::SendInput { .. } => "send-keys",
            TmuxCommand::Capture { .. } => "capture-pane",
            TmuxCommand::HasSession { .. } => "has-session",
            TmuxCommand::Destroy { .. } => "kill-session",
            TmuxCommand::ListSessions => "list-sessions",
        }
    }

    /// Handle name this command addresses (empty for `ListSessions`).
    pub fn target(&self) -> &str {
        match self {
            TmuxCommand::Create { name, .. }
            | TmuxCommand::SendInput { name, .. }
            | TmuxCommand::Capture { name, .. }
            | TmuxCommand::HasSession { name }
            | TmuxCommand::Destroy { name } => name,
            TmuxCommand::ListSessions => "",
        }
    }

    /// Build the tmux argv (without the program and socket flags).
    ///
    /// Session targets use the `=` prefix so tmux only accepts an exact name;
    /// otherwise `has-session -t claude_1` would match `claude_12`.
    pub fn args(&self) -> Vec<String> {
        match self {
            TmuxCommand::Create { name, start_dir } => {
                let mut args = vec![
                    "new-session".to_string(),
                    "-d".to_string(),
                    "-s".to_string(),
                    name.clone(),
                ];
                if let Some(dir) = start_dir {
                    args.push("-c".to_string());
                    args.push(dir.to_string_lossy().into_owned());
                }
                args
            }
            TmuxCommand::SendInput { name, text } => {
                let pane = pane_target(name);
                vec![
                    "send-keys".to_string(),
                    "-t".to_string(),
                    pane.clone(),
                    "-l".to_string(),
                    "--".to_string(),
                    escape_literal(text),
                    ";".to_string(),
                    "send-keys".to_string(),
                    "-t".to_string(),
                    pane,
                    "Enter".to_string(),
                ]
            }
            TmuxCommand::Capture {
                name,
                history_lines,
            } => vec![
                "capture-pane".to_string(),
                "-p".to_string(),
                "-S".to_string(),
                format!("-{history_lines}"),
                "-t".to_string(),
                pane_target(name),
            ],
            TmuxCommand::HasSession { name } => vec![
                "has-session".to_string(),
                "-t".to_string(),
                session_target(name),
            ],
            TmuxCommand::Destroy { name } => vec![
                "kill-session".to_string(),
                "-t".to_string(),
                session_target(name),
            ],
            TmuxCommand::ListSessions => vec![
                "list-sessions".to_string(),
                "-F".to_string(),
                "#{session_name}".to_string(),
            ],
        }
    }
}

fn session_target(name: &str) -> String {
    format!("={name}")
}

fn pane_target(name: &str) -> String {
    format!("={name}:")
}

/// Escape text for `send-keys -l`.
///
/// The text is already a single argv element, so the only thing tmux itself
/// interprets is a trailing `;`, which it would treat as a command separator.
pub fn escape_literal(text: &str) -> String {
    match text.strip_suffix(';') {
        Some(head) if !head.ends_with('\\') => format!("{head}\\;"),
        _ => text.to_string(),
    }
}

/// Quote a value for a POSIX shell line typed into a pane.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

/// Adapter over a terminal multiplexer, addressed by handle name.
///
/// Implementations must never panic on a failed external call: every
/// operation reports failure as a [`TerminalError`] and the caller decides
/// whether to retry.
#[async_trait]
pub trait TerminalAdapter: Send + Sync + 'static {
    /// Create a detached session. Fails with `AlreadyExists` if the name is taken.
    async fn create(&self, name: &str, start_dir: Option<&Path>) -> Result<(), TerminalError>;

    /// Type `text` literally, then press Enter.
    async fn send_input(&self, name: &str, text: &str) -> Result<(), TerminalError>;

    /// Capture visible content plus up to `history_lines` of scroll-back.
    async fn try_capture(&self, name: &str, history_lines: usize)
        -> Result<String, TerminalError>;

    /// Whether the session exists. `Ok(false)` only when the multiplexer
    /// answered that it does not; an error means it could not be asked.
    async fn try_has_session(&self, name: &str) -> Result<bool, TerminalError>;

    /// Destroy a session. Destroying a missing session succeeds.
    async fn destroy(&self, name: &str) -> Result<(), TerminalError>;

    /// Names of every session on the multiplexer server.
    async fn list_sessions(&self) -> Result<Vec<String>, TerminalError>;

    /// Like [`try_has_session`](Self::try_has_session), treating failure as
    /// absent.
    async fn has_session(&self, name: &str) -> bool {
        match self.try_has_session(name).await {
            Ok(exists) => exists,
            Err(e) => {
                warn!(handle = %name, error = %e, "has-session failed, treating as absent");
                false
            }
        }
    }

    /// Like [`try_capture`](Self::try_capture) but returns an empty string on
    /// failure. Empty means "unknown", not "intentionally blank".
    async fn capture_snapshot(&self, name: &str, history_lines: usize) -> String {
        match self.try_capture(name, history_lines).await {
            Ok(text) => text,
            Err(e) => {
                debug!(handle = %name, error = %e, "capture failed, treating as empty");
                String::new()
            }
        }
    }
}

/// [`TerminalAdapter`] backed by the `tmux` binary.
#[derive(Debug, Clone)]
pub struct TmuxAdapter {
    program: String,
    socket: Option<PathBuf>,
}

impl Default for TmuxAdapter {
    fn default() -> Self {
        Self {
            program: "tmux".to_string(),
            socket: None,
        }
    }
}

impl TmuxAdapter {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            socket: None,
        }
    }

    /// Address a specific server through its control socket (`tmux -S`).
    pub fn with_socket(mut self, socket: impl Into<PathBuf>) -> Self {
        self.socket = Some(socket.into());
        self
    }

    pub fn socket(&self) -> Option<&Path> {
        self.socket.as_deref()
    }

    async fn run(&self, command: &TmuxCommand) -> Result<std::process::Output, TerminalError> {
        let mut cmd = tokio::process::Command::new(&self.program);
        if let Some(socket) = &self.socket {
            cmd.arg("-S").arg(socket);
        }
        cmd.args(command.args())
            // Running inside a tmux client would otherwise make tmux refuse
            // to nest or target the wrong server.
            .env_remove("TMUX")
            .stdin(Stdio::null())
            .kill_on_drop(true);

        cmd.output().await.map_err(|source| TerminalError::Spawn {
            program: self.program.clone(),
            source,
        })
    }

    /// Run a command and map a non-zero exit to a `TerminalError`.
    async fn run_checked(&self, command: &TmuxCommand) -> Result<String, TerminalError> {
        let output = self.run(command).await?;
        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(classify_failure(command, stderr))
    }
}

/// Map tmux stderr to the adapter's error taxonomy.
fn classify_failure(command: &TmuxCommand, stderr: String) -> TerminalError {
    let name = command.target().to_string();
    if stderr.contains("duplicate session") {
        return TerminalError::AlreadyExists { name };
    }
    if stderr.contains("can't find")
        || stderr.contains("no server running")
        || stderr.contains("session not found")
    {
        return TerminalError::NotFound { name };
    }
    TerminalError::CommandFailed {
        command: command.verb(),
        name,
        stderr,
    }
}

#[async_trait]
impl TerminalAdapter for TmuxAdapter {
    async fn create(&self, name: &str, start_dir: Option<&Path>) -> Result<(), TerminalError> {
        if self.has_session(name).await {
            return Err(TerminalError::already_exists(name));
        }
        let command = TmuxCommand::Create {
            name: name.to_string(),
            start_dir: start_dir.map(Path::to_path_buf),
        };
        self.run_checked(&command).await?;
        debug!(handle = %name, "tmux session created");
        Ok(())
    }

    async fn send_input(&self, name: &str, text: &str) -> Result<(), TerminalError> {
        let command = TmuxCommand::SendInput {
            name: name.to_string(),
            text: text.to_string(),
        };
        self.run_checked(&command).await.map(|_| ())
    }

    async fn try_capture(
        &self,
        name: &str,
        history_lines: usize,
    ) -> Result<String, TerminalError> {
        let command = TmuxCommand::Capture {
            name: name.to_string(),
            history_lines,
        };
        self.run_checked(&command).await
    }

    async fn try_has_session(&self, name: &str) -> Result<bool, TerminalError> {
        let command = TmuxCommand::HasSession {
            name: name.to_string(),
        };
        match self.run_checked(&command).await {
            Ok(_) => Ok(true),
            Err(TerminalError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn destroy(&self, name: &str) -> Result<(), TerminalError> {
        let command = TmuxCommand::Destroy {
            name: name.to_string(),
        };
        match self.run_checked(&command).await {
            Ok(_) | Err(TerminalError::NotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn list_sessions(&self) -> Result<Vec<String>, TerminalError> {
        match self.run_checked(&TmuxCommand::ListSessions).await {
            Ok(stdout) => Ok(stdout
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect()),
            // No server means no sessions.
            Err(TerminalError::NotFound { .. }) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }
}
