// crates/core/src/error.rs
use std::path::PathBuf;
use thiserror::Error;

/// Errors from the terminal multiplexer control interface.
#[derive(Debug, Error)]
pub enum TerminalError {
    #[error("Multiplexer session already exists: {name}")]
    AlreadyExists { name: String },

    #[error("Multiplexer session not found: {name}")]
    NotFound { name: String },

    #[error("tmux {command} failed for {name}: {stderr}")]
    CommandFailed {
        command: &'static str,
        name: String,
        stderr: String,
    },

    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

impl TerminalError {
    pub fn not_found(name: impl Into<String>) -> Self {
        Self::NotFound { name: name.into() }
    }

    pub fn already_exists(name: impl Into<String>) -> Self {
        Self::AlreadyExists { name: name.into() }
    }
}

/// Errors resolving a project on disk.
#[derive(Debug, Error)]
pub enum ProjectError {
    #[error("Invalid project id: {id:?}")]
    InvalidId { id: String },

    #[error("Project not found: {id} ({path})")]
    NotFound { id: String, path: PathBuf },

    #[error("IO error accessing project {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ProjectError {
    pub fn io(id: &str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        match source.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound {
                id: id.to_string(),
                path,
            },
            _ => Self::Io { path, source },
        }
    }
}

/// Errors surfaced by the session engine to the transport layer.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Session terminated: {0}")]
    Terminated(String),

    #[error(transparent)]
    Project(#[from] ProjectError),

    #[error(transparent)]
    Terminal(#[from] TerminalError),
}

impl SessionError {
    /// Short message suitable for an `error` event. Never includes
    /// filesystem paths or multiplexer stderr.
    pub fn client_message(&self) -> String {
        match self {
            SessionError::NotFound(_) => "Session not found".to_string(),
            SessionError::Terminated(_) => "Session has been terminated".to_string(),
            SessionError::Project(ProjectError::InvalidId { .. }) => "Invalid project id".to_string(),
            SessionError::Project(ProjectError::NotFound { .. }) => "Project not found".to_string(),
            SessionError::Project(ProjectError::Io { .. }) => "Project is not accessible".to_string(),
            SessionError::Terminal(TerminalError::AlreadyExists { .. }) => {
                "Terminal session already exists".to_string()
            }
            SessionError::Terminal(TerminalError::NotFound { .. }) => {
                "Terminal session is not available".to_string()
            }
            SessionError::Terminal(_) => "Terminal operation failed".to_string(),
        }
    }
}
