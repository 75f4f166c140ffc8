// crates/core/src/testing.rs
//! In-memory [`TerminalAdapter`] for tests.
//!
//! Each session is a plain text buffer. Input is echoed into the buffer the
//! way a shell would show it, `echo X` also prints `X`, and scripted
//! responses can be attached to specific input lines (e.g. make the launch
//! command print a liveness marker).

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::TerminalError;
use crate::tmux::{TerminalAdapter, TmuxCommand};

#[derive(Debug, Default)]
struct FakeSession {
    buffer: String,
    start_dir: Option<PathBuf>,
}

#[derive(Debug, Default)]
struct FakeState {
    sessions: HashMap<String, FakeSession>,
    commands: Vec<TmuxCommand>,
    responses: HashMap<String, String>,
    failing_captures: HashSet<String>,
    fail_all_captures: bool,
    fail_inputs: bool,
    fail_session_checks: bool,
    /// Applied once, to the next capture: content is read immediately but
    /// returned only after the delay.
    next_capture_delay: Option<Duration>,
}

#[derive(Debug, Default)]
pub struct FakeTerminal {
    state: Mutex<FakeState>,
}

impl FakeTerminal {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Pre-create a session with existing content, without recording a command.
    pub fn with_session(self, name: &str, content: &str) -> Self {
        self.seed(name, content);
        self
    }

    pub fn seed(&self, name: &str, content: &str) {
        self.state().sessions.insert(
            name.to_string(),
            FakeSession {
                buffer: content.to_string(),
                start_dir: None,
            },
        );
    }

    /// Append `response` to the buffer whenever exactly `input` is sent.
    pub fn respond_to(&self, input: &str, response: &str) {
        self.state()
            .responses
            .insert(input.to_string(), response.to_string());
    }

    /// Replace a session's content (the process inside printed something).
    pub fn set_output(&self, name: &str, content: &str) {
        if let Some(session) = self.state().sessions.get_mut(name) {
            session.buffer = content.to_string();
        }
    }

    pub fn append_output(&self, name: &str, content: &str) {
        if let Some(session) = self.state().sessions.get_mut(name) {
            session.buffer.push_str(content);
        }
    }

    /// Remove a session behind the engine's back (e.g. `tmux kill-server`).
    pub fn kill_externally(&self, name: &str) {
        self.state().sessions.remove(name);
    }

    pub fn fail_captures(&self, fail: bool) {
        self.state().fail_all_captures = fail;
    }

    pub fn fail_capture_for(&self, name: &str, fail: bool) {
        let mut state = self.state();
        if fail {
            state.failing_captures.insert(name.to_string());
        } else {
            state.failing_captures.remove(name);
        }
    }

    pub fn fail_inputs(&self, fail: bool) {
        self.state().fail_inputs = fail;
    }

    /// Make `has-session` fail as if the tmux server could not be reached.
    pub fn fail_session_checks(&self, fail: bool) {
        self.state().fail_session_checks = fail;
    }

    /// Make the next capture slow to return (a busy tmux server).
    pub fn delay_next_capture(&self, delay: Duration) {
        self.state().next_capture_delay = Some(delay);
    }

    pub fn output(&self, name: &str) -> Option<String> {
        self.state().sessions.get(name).map(|s| s.buffer.clone())
    }

    pub fn start_dir(&self, name: &str) -> Option<PathBuf> {
        self.state()
            .sessions
            .get(name)
            .and_then(|s| s.start_dir.clone())
    }

    pub fn session_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state().sessions.keys().cloned().collect();
        names.sort();
        names
    }

    /// Every command issued so far, in order.
    pub fn commands(&self) -> Vec<TmuxCommand> {
        self.state().commands.clone()
    }

    pub fn clear_commands(&self) {
        self.state().commands.clear();
    }

    /// Lines typed into `name`, in order.
    pub fn inputs_to(&self, name: &str) -> Vec<String> {
        self.state()
            .commands
            .iter()
            .filter_map(|c| match c {
                TmuxCommand::SendInput { name: n, text } if n == name => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn captures_of(&self, name: &str) -> usize {
        self.state()
            .commands
            .iter()
            .filter(|c| matches!(c, TmuxCommand::Capture { name: n, .. } if n == name))
            .count()
    }

    pub fn count(&self, verb: &str) -> usize {
        self.state()
            .commands
            .iter()
            .filter(|c| c.verb() == verb)
            .count()
    }
}

#[async_trait]
impl TerminalAdapter for FakeTerminal {
    async fn create(&self, name: &str, start_dir: Option<&Path>) -> Result<(), TerminalError> {
        let mut state = self.state();
        state.commands.push(TmuxCommand::Create {
            name: name.to_string(),
            start_dir: start_dir.map(Path::to_path_buf),
        });
        if state.sessions.contains_key(name) {
            return Err(TerminalError::already_exists(name));
        }
        state.sessions.insert(
            name.to_string(),
            FakeSession {
                buffer: String::new(),
                start_dir: start_dir.map(Path::to_path_buf),
            },
        );
        Ok(())
    }

    async fn send_input(&self, name: &str, text: &str) -> Result<(), TerminalError> {
        let mut state = self.state();
        state.commands.push(TmuxCommand::SendInput {
            name: name.to_string(),
            text: text.to_string(),
        });
        if state.fail_inputs {
            return Err(TerminalError::CommandFailed {
                command: "send-keys",
                name: name.to_string(),
                stderr: "scripted failure".to_string(),
            });
        }
        let response = state.responses.get(text).cloned();
        let session = state
            .sessions
            .get_mut(name)
            .ok_or_else(|| TerminalError::not_found(name))?;

        session.buffer.push_str("$ ");
        session.buffer.push_str(text);
        session.buffer.push('\n');
        if let Some(echoed) = text.strip_prefix("echo ") {
            session.buffer.push_str(echoed.trim_matches(|c| c == '\'' || c == '"'));
            session.buffer.push('\n');
        }
        if let Some(response) = response {
            session.buffer.push_str(&response);
            session.buffer.push('\n');
        }
        Ok(())
    }

    async fn try_capture(&self, name: &str, history_lines: usize) -> Result<String, TerminalError> {
        let (result, delay) = {
            let mut state = self.state();
            state.commands.push(TmuxCommand::Capture {
                name: name.to_string(),
                history_lines,
            });
            let result = if state.fail_all_captures || state.failing_captures.contains(name) {
                Err(TerminalError::CommandFailed {
                    command: "capture-pane",
                    name: name.to_string(),
                    stderr: "scripted failure".to_string(),
                })
            } else {
                state
                    .sessions
                    .get(name)
                    .map(|s| s.buffer.clone())
                    .ok_or_else(|| TerminalError::not_found(name))
            };
            (result, state.next_capture_delay.take())
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        result
    }

    async fn try_has_session(&self, name: &str) -> Result<bool, TerminalError> {
        let mut state = self.state();
        state.commands.push(TmuxCommand::HasSession {
            name: name.to_string(),
        });
        if state.fail_session_checks {
            return Err(TerminalError::CommandFailed {
                command: "has-session",
                name: name.to_string(),
                stderr: "scripted failure".to_string(),
            });
        }
        Ok(state.sessions.contains_key(name))
    }

    async fn destroy(&self, name: &str) -> Result<(), TerminalError> {
        let mut state = self.state();
        state.commands.push(TmuxCommand::Destroy {
            name: name.to_string(),
        });
        state.sessions.remove(name);
        Ok(())
    }

    async fn list_sessions(&self) -> Result<Vec<String>, TerminalError> {
        let mut state = self.state();
        state.commands.push(TmuxCommand::ListSessions);
        let mut names: Vec<String> = state.sessions.keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}
