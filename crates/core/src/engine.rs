// crates/core/src/engine.rs
//! Composition of the session components, driven by the transport layer.
//!
//! The transport calls one method per client event and forwards whatever
//! [`ServerEvent`] comes back; everything that streams afterwards arrives
//! through the connection's hub queue.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::error::{SessionError, TerminalError};
use crate::hub::BroadcastHub;
use crate::liveness::{LivenessConfig, LivenessMonitor};
use crate::poller::{OutputPoller, PollerConfig};
use crate::project::{ProjectSessionManager, PROJECT_HANDLE_PREFIX};
use crate::protocol::ServerEvent;
use crate::reconcile::WELCOME_PLACEHOLDER;
use crate::registry::{Session, SessionKind, SessionRegistry, SessionState, SessionSummary, TerminalHandles};
use crate::tmux::{shell_quote, TerminalAdapter};

/// Prefix of per-session mirror terminals.
pub const MIRROR_HANDLE_PREFIX: &str = "claude_";

const BANNER: &[&str] = &[
    "Welcome to Claude Code Web",
    "Interactive terminal for Claude Code",
    "--------------------------------------",
];

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Shared terminal every user session reads and writes.
    pub primary_session: String,
    pub projects_root: PathBuf,
    pub poller: PollerConfig,
    pub liveness: LivenessConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            primary_session: "claude-code-session".to_string(),
            projects_root: PathBuf::from("/root/docker/apps"),
            poller: PollerConfig::default(),
            liveness: LivenessConfig::default(),
        }
    }
}

pub fn mirror_name(session_id: &str) -> String {
    format!("{MIRROR_HANDLE_PREFIX}{session_id}")
}

pub struct Engine {
    terminal: Arc<dyn TerminalAdapter>,
    registry: Arc<SessionRegistry>,
    hub: Arc<BroadcastHub>,
    poller: OutputPoller,
    projects: ProjectSessionManager,
    config: EngineConfig,
    /// Serializes user-session bring-up so concurrent joins for the same id
    /// create one mirror.
    bring_up: Mutex<()>,
}

impl Engine {
    pub fn new(terminal: Arc<dyn TerminalAdapter>, config: EngineConfig) -> Self {
        let registry = Arc::new(SessionRegistry::new());
        let hub = Arc::new(BroadcastHub::new());
        let poller = OutputPoller::new(
            terminal.clone(),
            registry.clone(),
            hub.clone(),
            config.poller.clone(),
        );
        let liveness = Arc::new(LivenessMonitor::new(
            terminal.clone(),
            config.liveness.clone(),
        ));
        let projects = ProjectSessionManager::new(
            config.projects_root.clone(),
            terminal.clone(),
            liveness,
            registry.clone(),
        );
        Self {
            terminal,
            registry,
            hub,
            poller,
            projects,
            config,
            bring_up: Mutex::new(()),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn hub(&self) -> &Arc<BroadcastHub> {
        &self.hub
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Attach a connection's outbound queue.
    pub fn connect(&self, connection_id: &str, tx: mpsc::UnboundedSender<ServerEvent>) {
        self.hub.register(connection_id, tx);
    }

    /// Drop every subscription the connection holds.
    pub async fn disconnect(&self, connection_id: &str) {
        self.leave(connection_id).await;
        self.hub.unregister(connection_id);
        debug!(connection_id = %connection_id, "connection closed");
    }

    /// Leave the current session/room without closing the connection.
    pub async fn leave(&self, connection_id: &str) -> Option<Session> {
        let session = self.registry.unsubscribe(connection_id).await?;
        self.hub.unsubscribe(&session.room(), connection_id);
        Some(session)
    }

    /// Mint a user session and bring up its handles.
    pub async fn new_user_session(&self, owner_id: &str) -> Result<Session, SessionError> {
        let session_id = uuid::Uuid::new_v4().to_string();
        let (session, _) = self.ensure_user_session(&session_id, owner_id).await?;
        Ok(session)
    }

    /// Join a user session, creating it if absent.
    pub async fn join_user(
        &self,
        connection_id: &str,
        session_id: &str,
        owner_id: &str,
    ) -> Result<ServerEvent, SessionError> {
        let (session, _) = self.ensure_user_session(session_id, owner_id).await?;
        self.attach(connection_id, &session).await?;
        let initial_output = self.initial_output(&session).await;
        self.poller.ensure_started(&session).await;

        Ok(ServerEvent::Joined {
            session_id: session.id,
            project_id: None,
            initial_output,
        })
    }

    /// Forward input to both handles of a user session.
    pub async fn send_user_input(&self, session_id: &str, message: &str) -> Result<(), SessionError> {
        let session = self
            .registry
            .get(session_id)
            .await
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;

        let mut last_error = None;
        let mut delivered = 0;
        for handle in session.handles.iter() {
            match self.terminal.send_input(handle, message).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(session_id = %session_id, handle = %handle, error = %e, "input not delivered");
                    last_error = Some(e);
                }
            }
        }
        match last_error {
            Some(e) if delivered == 0 => Err(e.into()),
            _ => Ok(()),
        }
    }

    /// Join a project's room, ensuring its backing terminal is healthy.
    pub async fn join_project(
        &self,
        connection_id: &str,
        project_id: &str,
        owner_id: &str,
    ) -> Result<ServerEvent, SessionError> {
        let project = self.projects.get_or_create(project_id, owner_id).await?;
        let session = project.session;
        self.attach(connection_id, &session).await?;
        let initial_output = self.initial_output(&session).await;
        self.poller.ensure_started(&session).await;

        Ok(ServerEvent::Joined {
            session_id: session.id,
            project_id: Some(project_id.to_string()),
            initial_output,
        })
    }

    /// Ensure a project session exists without subscribing anyone.
    pub async fn open_project(&self, project_id: &str, owner_id: &str) -> Result<Session, SessionError> {
        Ok(self.projects.get_or_create(project_id, owner_id).await?.session)
    }

    /// Forward input to a project session, then broadcast its content
    /// immediately.
    pub async fn send_project_input(&self, project_id: &str, message: &str) -> Result<(), SessionError> {
        let session = self
            .projects
            .session(project_id)
            .await
            .ok_or_else(|| SessionError::NotFound(project_id.to_string()))?;

        self.terminal
            .send_input(&session.handles.primary, message)
            .await?;
        match self.poller.broadcast_now(&session).await {
            Ok(delivered) => debug!(session_id = %session.id, delivered, "post-input broadcast"),
            Err(e) => warn!(session_id = %session.id, error = %e, "post-input capture failed"),
        }
        Ok(())
    }

    /// Tear a session down: stop its poller, notify and drop its
    /// subscribers, and destroy the handles it owns. The shared primary is
    /// never destroyed.
    pub async fn terminate(&self, session_id: &str) -> Result<Session, SessionError> {
        let session = self
            .registry
            .get(session_id)
            .await
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;

        let room = session.room();
        self.hub
            .publish(&room, ServerEvent::error("Session has been terminated"));

        match &session.kind {
            SessionKind::Project { project_id } => {
                self.projects.cleanup(project_id).await?;
            }
            SessionKind::User => {
                self.registry.remove(session_id).await;
                if let Some(mirror) = &session.handles.mirror {
                    self.terminal.destroy(mirror).await?;
                }
            }
        }
        self.hub.clear_room(&room);
        info!(session_id = %session_id, "session terminated");
        Ok(session)
    }

    /// Destroy a project's backing terminal and forget its session.
    pub async fn cleanup_project(&self, project_id: &str) -> Result<Option<Session>, SessionError> {
        let removed = self.projects.cleanup(project_id).await?;
        if let Some(session) = &removed {
            self.hub.clear_room(&session.room());
        }
        Ok(removed)
    }

    pub async fn list_sessions(&self) -> Vec<SessionSummary> {
        self.registry.list().await
    }

    /// Destroy mirror terminals left behind by a previous process. Session
    /// ids are not persisted, so nothing can reach them any more.
    pub async fn cleanup_stale_mirrors(&self) -> Result<Vec<String>, TerminalError> {
        let mut removed = Vec::new();
        for name in self.terminal.list_sessions().await? {
            let stale = name.starts_with(MIRROR_HANDLE_PREFIX)
                && !name.starts_with(PROJECT_HANDLE_PREFIX)
                && name != self.config.primary_session;
            if !stale {
                continue;
            }
            match self.terminal.destroy(&name).await {
                Ok(()) => removed.push(name),
                Err(e) => warn!(handle = %name, error = %e, "failed to remove stale mirror"),
            }
        }
        if !removed.is_empty() {
            info!(count = removed.len(), "removed stale mirror terminals");
        }
        Ok(removed)
    }

    async fn ensure_user_session(
        &self,
        session_id: &str,
        owner_id: &str,
    ) -> Result<(Session, bool), SessionError> {
        if let Some(existing) = self.registry.get(session_id).await {
            return Ok((existing, false));
        }
        let _bring_up = self.bring_up.lock().await;
        if let Some(existing) = self.registry.get(session_id).await {
            return Ok((existing, false));
        }

        self.ensure_primary().await?;

        let mirror = mirror_name(session_id);
        if self.terminal.has_session(&mirror).await {
            info!(handle = %mirror, "destroying stale mirror before reuse");
            self.terminal.destroy(&mirror).await?;
        }
        self.terminal.create(&mirror, None).await?;

        let session = Session::user(
            session_id,
            owner_id,
            TerminalHandles::dual(&self.config.primary_session, &mirror),
        );
        let (session, created) = self.registry.get_or_insert(session).await;
        self.registry.set_state(&session.id, SessionState::Ready).await;
        info!(session_id = %session.id, owner_id = %owner_id, "user session ready");
        Ok((session, created))
    }

    /// Create the shared primary terminal if it is missing, print the banner
    /// and start the assistant in it.
    async fn ensure_primary(&self) -> Result<(), TerminalError> {
        let primary = self.config.primary_session.as_str();
        if self.terminal.has_session(primary).await {
            return Ok(());
        }
        match self.terminal.create(primary, None).await {
            Ok(()) => {}
            Err(TerminalError::AlreadyExists { .. }) => return Ok(()),
            Err(e) => return Err(e),
        }
        info!(handle = %primary, "shared terminal created");

        self.terminal.send_input(primary, "clear").await?;
        for line in BANNER {
            self.terminal
                .send_input(primary, &format!("echo {}", shell_quote(line)))
                .await?;
        }
        self.terminal
            .send_input(primary, &self.config.liveness.launch_command)
            .await?;
        Ok(())
    }

    /// Subscribe in the registry and the hub, leaving any previous room.
    async fn attach(&self, connection_id: &str, session: &Session) -> Result<(), SessionError> {
        let subscription = self.registry.subscribe(&session.id, connection_id).await?;
        if let Some(previous) = subscription.previous {
            self.hub.unsubscribe(&previous.room(), connection_id);
            debug!(connection_id = %connection_id, left = %previous.id, "moved to another session");
        }
        self.hub.subscribe(&session.room(), connection_id);
        Ok(())
    }

    async fn initial_output(&self, session: &Session) -> String {
        match self.poller.capture(&session.handles).await {
            Ok(output) => output,
            Err(e) => {
                warn!(session_id = %session.id, error = %e, "initial capture failed");
                WELCOME_PLACEHOLDER.to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeTerminal;
    use std::time::Duration;
    use tempfile::TempDir;

    fn engine(fake: &Arc<FakeTerminal>, root: &TempDir) -> Engine {
        let config = EngineConfig {
            projects_root: root.path().to_path_buf(),
            ..EngineConfig::default()
        };
        Engine::new(fake.clone(), config)
    }

    fn connect(engine: &Engine, id: &str) -> mpsc::UnboundedReceiver<ServerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        engine.connect(id, tx);
        rx
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_brings_up_primary_and_mirror() {
        let root = TempDir::new().unwrap();
        let fake = Arc::new(FakeTerminal::new());
        let engine = engine(&fake, &root);
        let _rx = connect(&engine, "c1");

        let joined = engine.join_user("c1", "s1", "u1").await.unwrap();
        match joined {
            ServerEvent::Joined {
                session_id,
                project_id,
                initial_output,
            } => {
                assert_eq!(session_id, "s1");
                assert!(project_id.is_none());
                assert!(initial_output.contains("Welcome to Claude Code Web"));
            }
            other => panic!("unexpected event: {other:?}"),
        }

        assert_eq!(
            fake.session_names(),
            vec!["claude-code-session".to_string(), "claude_s1".to_string()]
        );
        let launches = fake
            .inputs_to("claude-code-session")
            .into_iter()
            .filter(|l| l == "claude")
            .count();
        assert_eq!(launches, 1);
        assert!(engine.registry().has_poller("s1").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_existing_primary_is_reused_untouched() {
        let root = TempDir::new().unwrap();
        let fake = Arc::new(FakeTerminal::new().with_session("claude-code-session", "long-running work"));
        let engine = engine(&fake, &root);
        let _rx = connect(&engine, "c1");

        engine.join_user("c1", "s1", "u1").await.unwrap();
        assert!(fake.inputs_to("claude-code-session").is_empty());
        assert_eq!(fake.count("new-session"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_mirror_is_destroyed_before_create() {
        let root = TempDir::new().unwrap();
        let fake = Arc::new(FakeTerminal::new().with_session("claude_s1", "old process output"));
        let engine = engine(&fake, &root);
        let _rx = connect(&engine, "c1");

        engine.join_user("c1", "s1", "u1").await.unwrap();
        assert_eq!(fake.count("kill-session"), 1);
        assert_eq!(fake.output("claude_s1").as_deref(), Some(""));
    }

    #[tokio::test(start_paused = true)]
    async fn test_message_reaches_both_handles_and_streams_back() {
        let root = TempDir::new().unwrap();
        let fake = Arc::new(FakeTerminal::new());
        let engine = engine(&fake, &root);
        let mut rx = connect(&engine, "c1");

        engine.join_user("c1", "s1", "u1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        drain(&mut rx);

        engine.send_user_input("s1", "echo hi").await.unwrap();
        assert_eq!(fake.inputs_to("claude_s1"), vec!["echo hi"]);
        assert!(fake.inputs_to("claude-code-session").contains(&"echo hi".to_string()));

        tokio::time::sleep(Duration::from_millis(600)).await;
        let events = drain(&mut rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, ServerEvent::TmuxOutput { output, .. } if output.contains("hi"))));
    }

    #[tokio::test]
    async fn test_message_to_unknown_session() {
        let root = TempDir::new().unwrap();
        let fake = Arc::new(FakeTerminal::new());
        let engine = engine(&fake, &root);
        let err = engine.send_user_input("nope", "ls").await.unwrap_err();
        assert!(matches!(err, SessionError::NotFound(_)));
        assert!(fake.commands().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_moves_connection_between_rooms() {
        let root = TempDir::new().unwrap();
        std::fs::create_dir(root.path().join("demo")).unwrap();
        let fake = Arc::new(FakeTerminal::new());
        fake.respond_to("claude", "│ cwd: demo │");
        let engine = engine(&fake, &root);
        let _rx = connect(&engine, "c1");

        engine.join_user("c1", "s1", "u1").await.unwrap();
        assert_eq!(engine.hub().room_size("s1"), 1);

        let joined = engine.join_project("c1", "demo", "u1").await.unwrap();
        assert!(matches!(
            joined,
            ServerEvent::Joined { project_id: Some(ref p), .. } if p == "demo"
        ));
        assert_eq!(engine.hub().room_size("s1"), 0);
        assert_eq!(engine.hub().room_size("project_demo"), 1);
        assert!(engine.registry().subscribers("s1").await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_project_message_broadcasts_immediately() {
        let root = TempDir::new().unwrap();
        std::fs::create_dir(root.path().join("demo")).unwrap();
        let fake = Arc::new(FakeTerminal::new());
        fake.respond_to("claude", "│ cwd: demo │");
        let engine = engine(&fake, &root);
        let mut rx_a = connect(&engine, "a");
        let mut rx_b = connect(&engine, "b");

        engine.join_project("a", "demo", "u1").await.unwrap();
        engine.join_project("b", "demo", "u2").await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        drain(&mut rx_a);
        drain(&mut rx_b);

        engine.send_project_input("demo", "echo built").await.unwrap();
        // No time has passed: this is the post-input broadcast, not a tick.
        for rx in [&mut rx_a, &mut rx_b] {
            let events = drain(rx);
            assert_eq!(events.len(), 1);
            assert!(events[0].output().unwrap().contains("built"));
        }
    }

    #[tokio::test]
    async fn test_project_message_requires_join() {
        let root = TempDir::new().unwrap();
        let fake = Arc::new(FakeTerminal::new());
        let engine = engine(&fake, &root);
        let err = engine.send_project_input("demo", "ls").await.unwrap_err();
        assert!(matches!(err, SessionError::NotFound(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_removes_every_subscription() {
        let root = TempDir::new().unwrap();
        let fake = Arc::new(FakeTerminal::new());
        let engine = engine(&fake, &root);
        let _rx = connect(&engine, "c1");

        engine.join_user("c1", "s1", "u1").await.unwrap();
        engine.disconnect("c1").await;
        assert_eq!(engine.hub().room_size("s1"), 0);
        assert_eq!(engine.hub().connection_count(), 0);
        assert!(engine.registry().subscribers("s1").await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminate_user_session_keeps_primary() {
        let root = TempDir::new().unwrap();
        let fake = Arc::new(FakeTerminal::new());
        let engine = engine(&fake, &root);
        let mut rx = connect(&engine, "c1");

        let session = engine.new_user_session("u1").await.unwrap();
        engine.join_user("c1", &session.id, "u1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        drain(&mut rx);

        engine.terminate(&session.id).await.unwrap();
        assert_eq!(fake.session_names(), vec!["claude-code-session".to_string()]);
        assert!(!engine.registry().contains(&session.id).await);
        assert_eq!(drain(&mut rx), vec![ServerEvent::error("Session has been terminated")]);
        assert_eq!(engine.hub().room_size(&session.id), 0);
        assert!(matches!(
            engine.terminate(&session.id).await,
            Err(SessionError::NotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejoin_after_terminate_runs_a_single_poller() {
        let root = TempDir::new().unwrap();
        let fake = Arc::new(FakeTerminal::new());
        let engine = engine(&fake, &root);
        let _rx = connect(&engine, "c1");

        engine.join_user("c1", "s1", "u1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        engine.terminate("s1").await.unwrap();
        engine.join_user("c1", "s1", "u1").await.unwrap();

        // The cancelled loop exits after the new one has claimed the slot.
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert!(engine.registry().has_poller("s1").await);
        assert_eq!(engine.registry().poller_count().await, 1);

        let _rx2 = connect(&engine, "c2");
        engine.join_user("c2", "s1", "u2").await.unwrap();
        let before = fake.captures_of("claude_s1");
        tokio::time::sleep(Duration::from_millis(3_000)).await;
        // One loop ticking every 300ms.
        assert!(fake.captures_of("claude_s1") - before <= 11);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_project_releases_its_viewers() {
        let root = TempDir::new().unwrap();
        std::fs::create_dir(root.path().join("demo")).unwrap();
        let fake = Arc::new(FakeTerminal::new());
        fake.respond_to("claude", "│ cwd: demo │");
        let engine = engine(&fake, &root);
        let mut rx = connect(&engine, "c1");

        engine.join_project("c1", "demo", "u1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        drain(&mut rx);

        fake.kill_externally("claude_project_demo");
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(drain(&mut rx), vec![ServerEvent::error("Session has been terminated")]);
        assert!(engine.hub().rooms_of("c1").is_empty());

        engine.join_user("c1", "s1", "u1").await.unwrap();
        assert_eq!(engine.hub().rooms_of("c1"), vec!["s1".to_string()]);
        assert_eq!(engine.hub().room_size("project_demo"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_joining_live_session_skips_bring_up_lock() {
        let root = TempDir::new().unwrap();
        let fake = Arc::new(FakeTerminal::new());
        let engine = engine(&fake, &root);
        let _rx1 = connect(&engine, "c1");
        let _rx2 = connect(&engine, "c2");
        engine.join_user("c1", "s1", "u1").await.unwrap();

        let _held = engine.bring_up.lock().await;
        let joined = tokio::time::timeout(
            Duration::from_secs(1),
            engine.join_user("c2", "s1", "u2"),
        )
        .await
        .expect("join of a live session waited on bring-up");
        assert!(joined.is_ok());
        assert_eq!(engine.hub().room_size("s1"), 2);
    }

    #[tokio::test]
    async fn test_cleanup_stale_mirrors_spares_primary_and_projects() {
        let root = TempDir::new().unwrap();
        let fake = Arc::new(
            FakeTerminal::new()
                .with_session("claude-code-session", "")
                .with_session("claude_old-1", "")
                .with_session("claude_old-2", "")
                .with_session("claude_project_demo", "")
                .with_session("unrelated", ""),
        );
        let engine = engine(&fake, &root);

        let removed = engine.cleanup_stale_mirrors().await.unwrap();
        assert_eq!(removed, vec!["claude_old-1".to_string(), "claude_old-2".to_string()]);
        assert_eq!(
            fake.session_names(),
            vec![
                "claude-code-session".to_string(),
                "claude_project_demo".to_string(),
                "unrelated".to_string()
            ]
        );
    }
}
