// crates/core/src/liveness.rs
//! Ensure the interactive assistant is actually running inside a project's
//! backing terminal, relaunching it when its liveness marker is missing.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use tracing::{debug, info};

use crate::error::TerminalError;
use crate::tmux::{shell_quote, TerminalAdapter, DEFAULT_HISTORY_LINES};

/// Strings the assistant prints once its interactive UI is up.
pub const DEFAULT_LIVENESS_MARKERS: &[&str] = &["Try \"how do I log an error?\"", "cwd:"];

#[derive(Debug, Clone)]
pub struct LivenessConfig {
    pub markers: Vec<String>,
    /// Wait after issuing the launch command before the pane is trusted.
    pub settle_delay: Duration,
    pub launch_command: String,
    pub history_lines: usize,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            markers: DEFAULT_LIVENESS_MARKERS.iter().map(|m| m.to_string()).collect(),
            settle_delay: Duration::from_secs(3),
            launch_command: "claude".to_string(),
            history_lines: DEFAULT_HISTORY_LINES,
        }
    }
}

/// Where and how to bring up a project's assistant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub backing_name: String,
    pub project_id: String,
    pub project_path: PathBuf,
    /// Project context file, exported as `CLAUDE_PROJECT_CONTEXT` when present.
    pub context_file: Option<PathBuf>,
}

impl LaunchSpec {
    /// Shell lines that put a fresh or stale pane into the project's context.
    pub fn setup_lines(&self) -> Vec<String> {
        let path = self.project_path.to_string_lossy();
        let mut lines = vec![
            format!("cd {}", shell_quote(&path)),
            format!("export PROJECT_NAME={}", shell_quote(&self.project_id)),
            format!("export PROJECT_PATH={}", shell_quote(&path)),
        ];
        if let Some(context) = &self.context_file {
            lines.push(format!(
                "export CLAUDE_PROJECT_CONTEXT={}",
                shell_quote(&context.to_string_lossy())
            ));
        }
        lines
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessOutcome {
    /// The backing terminal did not exist and was created and launched.
    Created,
    /// The marker was present; nothing was sent.
    Healthy,
    /// The marker was missing and the launch command was re-issued once.
    Relaunched,
    /// Another check is already launching this terminal.
    RelaunchInProgress,
}

/// Marks a backing name as being launched until dropped.
struct LaunchGuard<'a> {
    launching: &'a DashSet<String>,
    name: String,
}

impl<'a> LaunchGuard<'a> {
    fn acquire(launching: &'a DashSet<String>, name: &str) -> Option<Self> {
        launching.insert(name.to_string()).then(|| Self {
            launching,
            name: name.to_string(),
        })
    }
}

impl Drop for LaunchGuard<'_> {
    fn drop(&mut self) {
        self.launching.remove(&self.name);
    }
}

pub struct LivenessMonitor {
    terminal: Arc<dyn TerminalAdapter>,
    config: LivenessConfig,
    launching: DashSet<String>,
}

impl LivenessMonitor {
    pub fn new(terminal: Arc<dyn TerminalAdapter>, config: LivenessConfig) -> Self {
        Self {
            terminal,
            config,
            launching: DashSet::new(),
        }
    }

    pub fn config(&self) -> &LivenessConfig {
        &self.config
    }

    pub fn is_alive(&self, snapshot: &str) -> bool {
        self.config
            .markers
            .iter()
            .any(|marker| snapshot.contains(marker.as_str()))
    }

    /// Check (and if needed heal) the project's backing terminal.
    ///
    /// Any path that issues the launch command waits the settle delay before
    /// returning. A check that races an in-flight launch for the same name
    /// does not launch again.
    pub async fn ensure_healthy(&self, spec: &LaunchSpec) -> Result<LivenessOutcome, TerminalError> {
        let name = spec.backing_name.as_str();

        if !self.terminal.try_has_session(name).await? {
            let Some(_guard) = LaunchGuard::acquire(&self.launching, name) else {
                return Ok(self.wait_for_inflight(name).await);
            };
            match self.terminal.create(name, Some(&spec.project_path)).await {
                Ok(()) => {}
                Err(TerminalError::AlreadyExists { .. }) => {
                    debug!(handle = %name, "terminal appeared concurrently, reusing");
                }
                Err(e) => return Err(e),
            }
            info!(handle = %name, project_id = %spec.project_id, "creating project terminal");
            for line in spec.setup_lines() {
                self.terminal.send_input(name, &line).await?;
            }
            self.terminal.send_input(name, "clear").await?;
            self.launch(name).await?;
            return Ok(LivenessOutcome::Created);
        }

        let snapshot = self
            .terminal
            .capture_snapshot(name, self.config.history_lines)
            .await;
        if self.is_alive(&snapshot) {
            debug!(handle = %name, "assistant is running");
            return Ok(LivenessOutcome::Healthy);
        }

        let Some(_guard) = LaunchGuard::acquire(&self.launching, name) else {
            return Ok(self.wait_for_inflight(name).await);
        };
        info!(handle = %name, project_id = %spec.project_id, "liveness marker missing, relaunching");
        for line in spec.setup_lines() {
            self.terminal.send_input(name, &line).await?;
        }
        self.launch(name).await?;
        Ok(LivenessOutcome::Relaunched)
    }

    async fn launch(&self, name: &str) -> Result<(), TerminalError> {
        self.terminal
            .send_input(name, &self.config.launch_command)
            .await?;
        tokio::time::sleep(self.config.settle_delay).await;
        Ok(())
    }

    async fn wait_for_inflight(&self, name: &str) -> LivenessOutcome {
        debug!(handle = %name, "launch already in progress");
        tokio::time::sleep(self.config.settle_delay).await;
        LivenessOutcome::RelaunchInProgress
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeTerminal;
    use crate::tmux::TmuxCommand;

    fn spec() -> LaunchSpec {
        LaunchSpec {
            backing_name: "claude_project_demo".into(),
            project_id: "demo".into(),
            project_path: PathBuf::from("/srv/apps/demo"),
            context_file: None,
        }
    }

    fn monitor(fake: &Arc<FakeTerminal>) -> LivenessMonitor {
        LivenessMonitor::new(fake.clone(), LivenessConfig::default())
    }

    fn launches(fake: &FakeTerminal) -> usize {
        fake.inputs_to("claude_project_demo")
            .iter()
            .filter(|line| *line == "claude")
            .count()
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_terminal_is_created_and_launched() {
        let fake = Arc::new(FakeTerminal::new());
        let outcome = monitor(&fake).ensure_healthy(&spec()).await.unwrap();
        assert_eq!(outcome, LivenessOutcome::Created);

        assert!(fake.commands().contains(&TmuxCommand::Create {
            name: "claude_project_demo".into(),
            start_dir: Some(PathBuf::from("/srv/apps/demo")),
        }));
        assert_eq!(
            fake.inputs_to("claude_project_demo"),
            vec![
                "cd '/srv/apps/demo'",
                "export PROJECT_NAME='demo'",
                "export PROJECT_PATH='/srv/apps/demo'",
                "clear",
                "claude",
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_launch_waits_settle_delay() {
        let fake = Arc::new(FakeTerminal::new());
        let start = tokio::time::Instant::now();
        monitor(&fake).ensure_healthy(&spec()).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_marker_present_sends_nothing() {
        let fake = Arc::new(
            FakeTerminal::new().with_session("claude_project_demo", "╭────╮\n│ cwd: /srv/apps/demo │"),
        );
        let outcome = monitor(&fake).ensure_healthy(&spec()).await.unwrap();
        assert_eq!(outcome, LivenessOutcome::Healthy);
        assert!(fake.inputs_to("claude_project_demo").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_marker_missing_relaunches_exactly_once() {
        let fake = Arc::new(FakeTerminal::new().with_session("claude_project_demo", "$ "));
        let outcome = monitor(&fake).ensure_healthy(&spec()).await.unwrap();
        assert_eq!(outcome, LivenessOutcome::Relaunched);
        assert_eq!(launches(&fake), 1);
        assert_eq!(fake.count("new-session"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_checks_launch_once() {
        let fake = Arc::new(FakeTerminal::new().with_session("claude_project_demo", "$ "));
        let monitor = monitor(&fake);
        let spec = spec();

        let (a, b) = tokio::join!(monitor.ensure_healthy(&spec), monitor.ensure_healthy(&spec));
        let mut outcomes = vec![a.unwrap(), b.unwrap()];
        outcomes.sort_by_key(|o| *o == LivenessOutcome::Relaunched);
        assert_eq!(
            outcomes,
            vec![LivenessOutcome::RelaunchInProgress, LivenessOutcome::Relaunched]
        );
        assert_eq!(launches(&fake), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_relaunched_assistant_is_healthy_on_next_check() {
        let fake = Arc::new(FakeTerminal::new().with_session("claude_project_demo", "$ "));
        fake.respond_to("claude", "│ cwd: /srv/apps/demo │");
        let monitor = monitor(&fake);

        assert_eq!(
            monitor.ensure_healthy(&spec()).await.unwrap(),
            LivenessOutcome::Relaunched
        );
        assert_eq!(
            monitor.ensure_healthy(&spec()).await.unwrap(),
            LivenessOutcome::Healthy
        );
        assert_eq!(launches(&fake), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_server_does_not_recreate() {
        let fake = Arc::new(FakeTerminal::new().with_session("claude_project_demo", "$ "));
        fake.fail_session_checks(true);
        let err = monitor(&fake).ensure_healthy(&spec()).await.unwrap_err();
        assert!(matches!(err, TerminalError::CommandFailed { .. }));
        assert_eq!(fake.count("new-session"), 0);
        assert!(fake.inputs_to("claude_project_demo").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_input_failure_is_reported() {
        let fake = Arc::new(FakeTerminal::new().with_session("claude_project_demo", "$ "));
        fake.fail_inputs(true);
        let err = monitor(&fake).ensure_healthy(&spec()).await.unwrap_err();
        assert!(matches!(err, TerminalError::CommandFailed { .. }));
    }

    #[test]
    fn test_setup_lines_quote_values() {
        let spec = LaunchSpec {
            context_file: Some(PathBuf::from("/srv/apps/it's/CLAUDE.md")),
            project_path: PathBuf::from("/srv/apps/it's"),
            ..spec()
        };
        let lines = spec.setup_lines();
        assert_eq!(lines[0], "cd '/srv/apps/it'\\''s'");
        assert_eq!(
            lines[3],
            "export CLAUDE_PROJECT_CONTEXT='/srv/apps/it'\\''s/CLAUDE.md'"
        );
    }
}
