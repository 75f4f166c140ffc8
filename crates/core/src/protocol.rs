// crates/core/src/protocol.rs
//! Realtime channel events.
//!
//! Every frame is one JSON object `{"event": "<name>", "data": {...}}`.

use serde::{Deserialize, Serialize};

/// Events sent by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Join (creating if absent) a user session.
    Join { session_id: String, token: String },
    /// Forward input to both handles of a user session.
    Message {
        session_id: String,
        message: String,
        token: String,
    },
    /// Join a project room, ensuring the backing session is healthy.
    JoinProject {
        #[serde(default)]
        session_id: Option<String>,
        project_id: String,
        token: String,
    },
    /// Forward input to a project session.
    ProjectMessage {
        #[serde(default)]
        session_id: Option<String>,
        project_id: String,
        message: String,
        token: String,
    },
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::Join { .. } => "join",
            ClientEvent::Message { .. } => "message",
            ClientEvent::JoinProject { .. } => "join_project",
            ClientEvent::ProjectMessage { .. } => "project_message",
        }
    }

    pub fn token(&self) -> &str {
        match self {
            ClientEvent::Join { token, .. }
            | ClientEvent::Message { token, .. }
            | ClientEvent::JoinProject { token, .. }
            | ClientEvent::ProjectMessage { token, .. } => token,
        }
    }
}

/// Events sent by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    Joined {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        project_id: Option<String>,
        initial_output: String,
    },
    /// Full current snapshot of a user session.
    TmuxOutput { session_id: String, output: String },
    /// Full current snapshot of a project session.
    Output {
        project_id: String,
        session_name: String,
        output: String,
    },
    Error { message: String },
}

impl ServerEvent {
    pub fn error(message: impl Into<String>) -> Self {
        ServerEvent::Error {
            message: message.into(),
        }
    }

    /// The snapshot text carried by an output event, if any.
    pub fn output(&self) -> Option<&str> {
        match self {
            ServerEvent::TmuxOutput { output, .. } | ServerEvent::Output { output, .. } => {
                Some(output)
            }
            _ => None,
        }
    }
}
