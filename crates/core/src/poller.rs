// crates/core/src/poller.rs
//! Per-session capture → compare → broadcast loop.
//!
//! One task per session. Each tick captures the session's handles, reconciles
//! them into one snapshot and publishes it only if it differs from the last
//! broadcast one. The loop stops when its cancellation token fires (the
//! registry cancels it on removal) or when the session is no longer
//! registered, whichever it observes first.
//!
//! Capture, compare and publish for one session run under that session's
//! publish lock, both in the loop and in [`OutputPoller::broadcast_now`], so
//! snapshots are published in capture order.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::TerminalError;
use crate::hub::BroadcastHub;
use crate::protocol::ServerEvent;
use crate::reconcile::DualSnapshot;
use crate::registry::{PollerClaim, Session, SessionKind, SessionRegistry, TerminalHandles};
use crate::tmux::{TerminalAdapter, DEFAULT_HISTORY_LINES};

#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub user_interval: Duration,
    pub project_interval: Duration,
    /// Sleep after a failed capture before retrying.
    pub error_backoff: Duration,
    pub history_lines: usize,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            user_interval: Duration::from_millis(300),
            project_interval: Duration::from_millis(500),
            error_backoff: Duration::from_secs(1),
            history_lines: DEFAULT_HISTORY_LINES,
        }
    }
}

impl PollerConfig {
    pub fn interval_for(&self, kind: &SessionKind) -> Duration {
        match kind {
            SessionKind::User => self.user_interval,
            SessionKind::Project { .. } => self.project_interval,
        }
    }
}

/// What one poll tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Published,
    Unchanged,
    /// Every handle failed to capture, or the multiplexer could not be
    /// asked about the backing handle; retry after the backoff.
    Failed,
    /// The session left the registry.
    Gone,
    /// The multiplexer reports a project session's backing handle missing.
    HandleLost,
}

#[derive(Clone)]
pub struct OutputPoller {
    terminal: Arc<dyn TerminalAdapter>,
    registry: Arc<SessionRegistry>,
    hub: Arc<BroadcastHub>,
    config: PollerConfig,
}

impl OutputPoller {
    pub fn new(
        terminal: Arc<dyn TerminalAdapter>,
        registry: Arc<SessionRegistry>,
        hub: Arc<BroadcastHub>,
        config: PollerConfig,
    ) -> Self {
        Self {
            terminal,
            registry,
            hub,
            config,
        }
    }

    pub fn config(&self) -> &PollerConfig {
        &self.config
    }

    /// Start the loop for `session` unless one is already running.
    /// Returns whether a new loop was spawned.
    pub async fn ensure_started(&self, session: &Session) -> bool {
        let Some(claim) = self.registry.claim_poller(&session.id).await else {
            debug!(session_id = %session.id, "poller already running");
            return false;
        };
        tokio::spawn(self.clone().run(session.clone(), claim));
        true
    }

    async fn run(self, session: Session, claim: PollerClaim) {
        let cancel: &CancellationToken = &claim.cancel;
        let interval = self.config.interval_for(&session.kind);
        info!(session_id = %session.id, interval_ms = interval.as_millis() as u64, "poller started");

        // Initial broadcast so a joining client is never left without content.
        let mut tick = self.poll_once(&session).await;
        loop {
            let delay = match tick {
                Tick::Gone => break,
                Tick::HandleLost => {
                    warn!(
                        session_id = %session.id,
                        handle = %session.handles.primary,
                        "backing terminal disappeared, terminating session"
                    );
                    self.terminate_lost(&session).await;
                    break;
                }
                Tick::Failed => self.config.error_backoff,
                Tick::Published | Tick::Unchanged => interval,
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            tick = self.poll_once(&session).await;
        }

        self.registry
            .release_poller(&session.id, claim.generation)
            .await;
        info!(session_id = %session.id, "poller stopped");
    }

    /// Drop a session whose backing terminal is gone and tell its viewers.
    async fn terminate_lost(&self, session: &Session) {
        if self.registry.remove(&session.id).await.is_none() {
            return;
        }
        let room = session.room();
        self.hub
            .publish(&room, ServerEvent::error("Session has been terminated"));
        self.hub.clear_room(&room);
    }

    /// Run a single tick: capture, compare, publish on change.
    pub async fn poll_once(&self, session: &Session) -> Tick {
        let Some(lock) = self.registry.publish_lock(&session.id).await else {
            return Tick::Gone;
        };
        let _publishing = lock.lock().await;

        if matches!(session.kind, SessionKind::Project { .. }) {
            match self.terminal.try_has_session(&session.handles.primary).await {
                Ok(true) => {}
                Ok(false) => return Tick::HandleLost,
                Err(e) => {
                    warn!(session_id = %session.id, error = %e, "cannot check backing terminal");
                    return Tick::Failed;
                }
            }
        }

        let snapshot = match self.capture(&session.handles).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(session_id = %session.id, error = %e, "capture failed");
                return Tick::Failed;
            }
        };

        match self.registry.update_snapshot(&session.id, &snapshot).await {
            None => Tick::Gone,
            Some(false) => Tick::Unchanged,
            Some(true) => {
                let delivered = self.publish(session, snapshot);
                debug!(session_id = %session.id, delivered, "snapshot published");
                Tick::Published
            }
        }
    }

    /// Capture every handle and reconcile. A handle that fails contributes
    /// an empty snapshot; only all handles failing is an error.
    pub async fn capture(&self, handles: &TerminalHandles) -> Result<String, TerminalError> {
        let primary = self
            .terminal
            .try_capture(&handles.primary, self.config.history_lines)
            .await;
        let mirror = match &handles.mirror {
            Some(name) => Some(
                self.terminal
                    .try_capture(name, self.config.history_lines)
                    .await,
            ),
            None => None,
        };

        let snapshot = match (primary, mirror) {
            (Err(e), None) | (Err(_), Some(Err(e))) => return Err(e),
            (Ok(primary), None) => DualSnapshot::single(primary),
            (Ok(primary), Some(mirror)) => DualSnapshot::new(primary, mirror.unwrap_or_default()),
            (Err(_), Some(Ok(mirror))) => DualSnapshot::new(String::new(), mirror),
        };
        Ok(snapshot.reconcile())
    }

    /// Capture and publish immediately, even if unchanged. Used right after
    /// input is forwarded so the sender sees its effect without waiting for
    /// the next tick.
    pub async fn broadcast_now(&self, session: &Session) -> Result<usize, TerminalError> {
        let Some(lock) = self.registry.publish_lock(&session.id).await else {
            return Ok(0);
        };
        let _publishing = lock.lock().await;
        let snapshot = self.capture(&session.handles).await?;
        self.registry.update_snapshot(&session.id, &snapshot).await;
        Ok(self.publish(session, snapshot))
    }

    fn publish(&self, session: &Session, output: String) -> usize {
        let event = match &session.kind {
            SessionKind::User => ServerEvent::TmuxOutput {
                session_id: session.id.clone(),
                output,
            },
            SessionKind::Project { project_id } => ServerEvent::Output {
                project_id: project_id.clone(),
                session_name: session.handles.primary.clone(),
                output,
            },
        };
        self.hub.publish(&session.room(), event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::WELCOME_PLACEHOLDER;
    use crate::testing::FakeTerminal;
    use tokio::sync::mpsc;

    struct Harness {
        fake: Arc<FakeTerminal>,
        registry: Arc<SessionRegistry>,
        hub: Arc<BroadcastHub>,
        poller: OutputPoller,
        rx: mpsc::UnboundedReceiver<ServerEvent>,
    }

    async fn harness(session: &Session) -> Harness {
        let fake = Arc::new(FakeTerminal::new());
        let registry = Arc::new(SessionRegistry::new());
        let hub = Arc::new(BroadcastHub::new());
        let poller = OutputPoller::new(
            fake.clone(),
            registry.clone(),
            hub.clone(),
            PollerConfig::default(),
        );
        registry.get_or_insert(session.clone()).await;
        let (tx, rx) = mpsc::unbounded_channel();
        hub.register("c1", tx);
        hub.subscribe(&session.room(), "c1");
        Harness {
            fake,
            registry,
            hub,
            poller,
            rx,
        }
    }

    fn user_session() -> Session {
        Session::user("s1", "u1", TerminalHandles::dual("main", "claude_s1"))
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test(start_paused = true)]
    async fn test_static_snapshot_publishes_once() {
        let session = user_session();
        let mut h = harness(&session).await;
        h.fake.seed("main", "$ claude\nReady and waiting");
        h.fake.seed("claude_s1", "");

        assert!(h.poller.ensure_started(&session).await);
        // Five user ticks plus slack.
        tokio::time::sleep(Duration::from_millis(300 * 5 + 50)).await;

        let events = drain(&mut h.rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].output(), Some("$ claude\nReady and waiting"));
        assert!(h.fake.captures_of("main") >= 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_change_is_published_on_next_tick() {
        let session = user_session();
        let mut h = harness(&session).await;
        h.fake.seed("main", "");
        h.fake.seed("claude_s1", "");

        h.poller.ensure_started(&session).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(drain(&mut h.rx)[0].output(), Some(WELCOME_PLACEHOLDER));

        h.fake.set_output("claude_s1", "$ echo hi\nhi\n");
        tokio::time::sleep(Duration::from_millis(300)).await;
        let events = drain(&mut h.rx);
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0],
            ServerEvent::TmuxOutput {
                session_id: "s1".into(),
                output: "$ echo hi\nhi".into()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_start_is_a_noop() {
        let session = user_session();
        let h = harness(&session).await;
        h.fake.seed("main", "");

        let (a, b) = tokio::join!(
            h.poller.ensure_started(&session),
            h.poller.ensure_started(&session)
        );
        assert!(a ^ b);
        assert_eq!(h.registry.poller_count().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_failure_backs_off_and_recovers() {
        let session = user_session();
        let mut h = harness(&session).await;
        h.fake.seed("main", "first snapshot of main");
        h.fake.fail_captures(true);

        h.poller.ensure_started(&session).await;
        tokio::time::sleep(Duration::from_millis(2_500)).await;

        // Initial attempt plus two retries a second apart; no fast ticking.
        assert_eq!(h.fake.captures_of("main"), 3);
        assert!(drain(&mut h.rx).is_empty());
        assert!(h.registry.has_poller("s1").await);

        h.fake.fail_captures(false);
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        let events = drain(&mut h.rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].output(), Some("first snapshot of main"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_failing_handle_is_not_an_error() {
        let session = user_session();
        let mut h = harness(&session).await;
        h.fake.seed("main", "main handle content");
        h.fake.fail_capture_for("claude_s1", true);

        h.poller.ensure_started(&session).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(drain(&mut h.rx)[0].output(), Some("main handle content"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_removal_stops_the_loop() {
        let session = user_session();
        let h = harness(&session).await;
        h.fake.seed("main", "");

        h.poller.ensure_started(&session).await;
        tokio::time::sleep(Duration::from_millis(650)).await;
        h.registry.remove("s1").await;
        let captures = h.fake.captures_of("main");

        tokio::time::sleep(Duration::from_millis(3_000)).await;
        assert_eq!(h.fake.captures_of("main"), captures);
        assert_eq!(h.registry.poller_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_project_poller_stops_when_backing_handle_vanishes() {
        let session = Session::project("p1", "u1", "demo", "claude_project_demo");
        let mut h = harness(&session).await;
        h.fake.seed("claude_project_demo", "project pane content");

        h.poller.ensure_started(&session).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        match &drain(&mut h.rx)[0] {
            ServerEvent::Output {
                project_id,
                session_name,
                output,
            } => {
                assert_eq!(project_id, "demo");
                assert_eq!(session_name, "claude_project_demo");
                assert_eq!(output, "project pane content");
            }
            other => panic!("unexpected event: {other:?}"),
        }

        h.fake.kill_externally("claude_project_demo");
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(!h.registry.contains("p1").await);
        assert_eq!(h.registry.poller_count().await, 0);
        assert_eq!(
            drain(&mut h.rx),
            vec![ServerEvent::error("Session has been terminated")]
        );
        assert_eq!(h.hub.room_size("project_demo"), 0);
        assert!(h.hub.rooms_of("c1").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_server_is_not_a_lost_handle() {
        let session = Session::project("p1", "u1", "demo", "claude_project_demo");
        let mut h = harness(&session).await;
        h.fake.seed("claude_project_demo", "project pane content");

        h.poller.ensure_started(&session).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(drain(&mut h.rx).len(), 1);

        h.fake.fail_session_checks(true);
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert!(h.registry.contains("p1").await);
        assert!(h.registry.has_poller("p1").await);
        assert_eq!(h.hub.room_size("project_demo"), 1);

        h.fake.fail_session_checks(false);
        h.fake.set_output("claude_project_demo", "project pane after recovery");
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        let events = drain(&mut h.rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].output(), Some("project pane after recovery"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_broadcast_waits_for_inflight_tick() {
        let session = Session::project("p1", "u1", "demo", "claude_project_demo");
        let mut h = harness(&session).await;
        h.fake.seed("claude_project_demo", "first version of the pane");

        h.poller.ensure_started(&session).await;
        tokio::time::sleep(Duration::from_millis(400)).await;

        // The tick at 500ms reads this content but returns it only at 700ms.
        h.fake.set_output("claude_project_demo", "second version of the pane");
        h.fake.delay_next_capture(Duration::from_millis(200));
        tokio::time::sleep(Duration::from_millis(150)).await;

        h.fake.set_output("claude_project_demo", "third version of the pane");
        assert_eq!(h.poller.broadcast_now(&session).await.unwrap(), 1);

        tokio::time::sleep(Duration::from_millis(1_000)).await;
        let outputs: Vec<String> = drain(&mut h.rx)
            .iter()
            .filter_map(|e| e.output().map(str::to_string))
            .collect();
        assert_eq!(
            outputs,
            vec![
                "first version of the pane",
                "second version of the pane",
                "third version of the pane",
            ]
        );
        assert_eq!(
            h.registry.last_snapshot("p1").await.as_deref(),
            Some("third version of the pane")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcast_now_publishes_unchanged_content() {
        let session = user_session();
        let mut h = harness(&session).await;
        h.fake.seed("main", "same content as before");

        assert_eq!(h.poller.broadcast_now(&session).await.unwrap(), 1);
        assert_eq!(h.poller.broadcast_now(&session).await.unwrap(), 1);
        assert_eq!(drain(&mut h.rx).len(), 2);
        assert_eq!(
            h.registry.last_snapshot("s1").await.as_deref(),
            Some("same content as before")
        );
    }
}
