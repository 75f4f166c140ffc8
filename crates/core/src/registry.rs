// crates/core/src/registry.rs
//! Process-wide session registry.
//!
//! The registry is the only shared mutable state in the engine. Every
//! insert, lookup and removal goes through one async mutex, including the
//! poller's per-tick "am I still registered" check and its snapshot
//! compare-and-update.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::SessionError;
use crate::hub::{project_room, ConnectionId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionKind {
    User,
    Project { project_id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Starting,
    Ready,
    Terminated,
}

/// Multiplexer handles backing one logical session.
///
/// User sessions have a shared primary and a per-session mirror; project
/// sessions have only a primary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TerminalHandles {
    pub primary: String,
    pub mirror: Option<String>,
}

impl TerminalHandles {
    pub fn single(primary: impl Into<String>) -> Self {
        Self {
            primary: primary.into(),
            mirror: None,
        }
    }

    pub fn dual(primary: impl Into<String>, mirror: impl Into<String>) -> Self {
        Self {
            primary: primary.into(),
            mirror: Some(mirror.into()),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.primary.as_str()).chain(self.mirror.as_deref())
    }
}

/// Immutable metadata of a logical terminal conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    pub id: String,
    pub owner_id: String,
    #[serde(flatten)]
    pub kind: SessionKind,
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    pub handles: TerminalHandles,
}

impl Session {
    pub fn user(id: impl Into<String>, owner_id: impl Into<String>, handles: TerminalHandles) -> Self {
        Self {
            id: id.into(),
            owner_id: owner_id.into(),
            kind: SessionKind::User,
            created_at: Utc::now(),
            handles,
        }
    }

    pub fn project(
        id: impl Into<String>,
        owner_id: impl Into<String>,
        project_id: impl Into<String>,
        backing_name: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            owner_id: owner_id.into(),
            kind: SessionKind::Project {
                project_id: project_id.into(),
            },
            created_at: Utc::now(),
            handles: TerminalHandles::single(backing_name),
        }
    }

    pub fn project_id(&self) -> Option<&str> {
        match &self.kind {
            SessionKind::Project { project_id } => Some(project_id),
            SessionKind::User => None,
        }
    }

    /// Broadcast room: the session id for user sessions, `project_<id>` for
    /// project sessions.
    pub fn room(&self) -> String {
        match &self.kind {
            SessionKind::User => self.id.clone(),
            SessionKind::Project { project_id } => project_room(project_id),
        }
    }
}

/// Listing row returned by [`SessionRegistry::list`].
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    #[serde(flatten)]
    pub session: Session,
    pub state: SessionState,
    pub subscribers: usize,
}

/// A claimed poller slot. The generation tells a finished loop whether the
/// slot it is releasing is still its own.
#[derive(Debug, Clone)]
pub struct PollerClaim {
    pub generation: u64,
    pub cancel: CancellationToken,
}

struct SessionEntry {
    session: Session,
    state: SessionState,
    last_broadcast_snapshot: Option<String>,
    subscribers: HashSet<ConnectionId>,
    poller: Option<PollerClaim>,
    /// Held across capture, compare and publish.
    publish_lock: Arc<Mutex<()>>,
}

impl SessionEntry {
    fn new(session: Session) -> Self {
        Self {
            session,
            state: SessionState::Starting,
            last_broadcast_snapshot: None,
            subscribers: HashSet::new(),
            poller: None,
            publish_lock: Arc::new(Mutex::new(())),
        }
    }
}

#[derive(Default)]
struct RegistryInner {
    sessions: HashMap<String, SessionEntry>,
    /// connection id -> the one session it is subscribed to.
    connections: HashMap<ConnectionId, String>,
    next_poller_generation: u64,
}

/// Result of [`SessionRegistry::subscribe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub session: Session,
    /// Session the connection was moved away from, if any.
    pub previous: Option<Session>,
}

#[derive(Default)]
pub struct SessionRegistry {
    inner: Mutex<RegistryInner>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `session` unless its id is taken. Returns the registered
    /// metadata and whether this call inserted it.
    pub async fn get_or_insert(&self, session: Session) -> (Session, bool) {
        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner.sessions.get(&session.id) {
            return (existing.session.clone(), false);
        }
        info!(session_id = %session.id, kind = ?session.kind, "session registered");
        inner
            .sessions
            .insert(session.id.clone(), SessionEntry::new(session.clone()));
        (session, true)
    }

    pub async fn get(&self, session_id: &str) -> Option<Session> {
        let inner = self.inner.lock().await;
        inner.sessions.get(session_id).map(|e| e.session.clone())
    }

    pub async fn contains(&self, session_id: &str) -> bool {
        self.inner.lock().await.sessions.contains_key(session_id)
    }

    pub async fn state(&self, session_id: &str) -> Option<SessionState> {
        let inner = self.inner.lock().await;
        inner.sessions.get(session_id).map(|e| e.state)
    }

    /// Advance the lifecycle state. A terminated session never moves back.
    pub async fn set_state(&self, session_id: &str, state: SessionState) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.sessions.get_mut(session_id) {
            Some(entry) if entry.state != SessionState::Terminated => {
                entry.state = state;
                true
            }
            _ => false,
        }
    }

    /// Subscribe a connection to a session, leaving whatever session it was
    /// subscribed to before.
    pub async fn subscribe(
        &self,
        session_id: &str,
        connection_id: &str,
    ) -> Result<Subscription, SessionError> {
        let mut inner = self.inner.lock().await;
        let session = match inner.sessions.get(session_id) {
            Some(entry) if entry.state == SessionState::Terminated => {
                return Err(SessionError::Terminated(session_id.to_string()));
            }
            Some(entry) => entry.session.clone(),
            None => return Err(SessionError::NotFound(session_id.to_string())),
        };

        let previous_id = inner
            .connections
            .insert(connection_id.to_string(), session_id.to_string());
        let previous = match previous_id {
            Some(prev) if prev != session_id => inner.sessions.get_mut(&prev).map(|entry| {
                entry.subscribers.remove(connection_id);
                entry.session.clone()
            }),
            _ => None,
        };

        if let Some(entry) = inner.sessions.get_mut(session_id) {
            entry.subscribers.insert(connection_id.to_string());
        }
        debug!(session_id = %session_id, connection_id = %connection_id, "subscriber added");
        Ok(Subscription { session, previous })
    }

    /// Remove a connection from whatever session it is subscribed to.
    pub async fn unsubscribe(&self, connection_id: &str) -> Option<Session> {
        let mut inner = self.inner.lock().await;
        let session_id = inner.connections.remove(connection_id)?;
        let entry = inner.sessions.get_mut(&session_id)?;
        entry.subscribers.remove(connection_id);
        Some(entry.session.clone())
    }

    /// Session a connection is currently subscribed to.
    pub async fn subscription_of(&self, connection_id: &str) -> Option<String> {
        self.inner.lock().await.connections.get(connection_id).cloned()
    }

    pub async fn subscribers(&self, session_id: &str) -> Vec<ConnectionId> {
        let inner = self.inner.lock().await;
        inner
            .sessions
            .get(session_id)
            .map(|e| e.subscribers.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Claim the poller slot for a session. Returns `None` when the session
    /// is missing, terminated or already has a poller.
    pub async fn claim_poller(&self, session_id: &str) -> Option<PollerClaim> {
        let mut inner = self.inner.lock().await;
        inner.next_poller_generation += 1;
        let generation = inner.next_poller_generation;
        let entry = inner.sessions.get_mut(session_id)?;
        if entry.poller.is_some() || entry.state == SessionState::Terminated {
            return None;
        }
        let claim = PollerClaim {
            generation,
            cancel: CancellationToken::new(),
        };
        entry.poller = Some(claim.clone());
        Some(claim)
    }

    /// Clear the poller slot when a loop exits on its own. A slot claimed by
    /// a newer loop (same id, re-registered session) is left alone.
    pub async fn release_poller(&self, session_id: &str, generation: u64) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.sessions.get_mut(session_id) {
            Some(entry) if entry.poller.as_ref().map(|p| p.generation) == Some(generation) => {
                entry.poller = None;
                true
            }
            _ => false,
        }
    }

    /// Per-session lock serializing snapshot capture and publication.
    /// `None` when the session is not registered.
    pub async fn publish_lock(&self, session_id: &str) -> Option<Arc<Mutex<()>>> {
        let inner = self.inner.lock().await;
        inner
            .sessions
            .get(session_id)
            .map(|e| e.publish_lock.clone())
    }

    pub async fn has_poller(&self, session_id: &str) -> bool {
        let inner = self.inner.lock().await;
        inner
            .sessions
            .get(session_id)
            .is_some_and(|e| e.poller.is_some())
    }

    pub async fn poller_count(&self) -> usize {
        let inner = self.inner.lock().await;
        inner.sessions.values().filter(|e| e.poller.is_some()).count()
    }

    /// Compare `snapshot` with the last broadcast one and record it if it
    /// differs. Returns `None` when the session is gone, `Some(changed)`
    /// otherwise.
    pub async fn update_snapshot(&self, session_id: &str, snapshot: &str) -> Option<bool> {
        let mut inner = self.inner.lock().await;
        let entry = inner.sessions.get_mut(session_id)?;
        if entry.last_broadcast_snapshot.as_deref() == Some(snapshot) {
            return Some(false);
        }
        entry.last_broadcast_snapshot = Some(snapshot.to_string());
        Some(true)
    }

    pub async fn last_snapshot(&self, session_id: &str) -> Option<String> {
        let inner = self.inner.lock().await;
        inner
            .sessions
            .get(session_id)
            .and_then(|e| e.last_broadcast_snapshot.clone())
    }

    /// Remove a session, cancel its poller and drop its subscriptions.
    /// Returns the metadata and the subscribers it had.
    pub async fn remove(&self, session_id: &str) -> Option<(Session, Vec<ConnectionId>)> {
        let mut inner = self.inner.lock().await;
        let mut entry = inner.sessions.remove(session_id)?;
        entry.state = SessionState::Terminated;
        if let Some(poller) = entry.poller.take() {
            poller.cancel.cancel();
        }
        let subscribers: Vec<ConnectionId> = entry.subscribers.into_iter().collect();
        for conn in &subscribers {
            if inner.connections.get(conn).map(String::as_str) == Some(session_id) {
                inner.connections.remove(conn);
            }
        }
        info!(session_id = %session_id, "session removed");
        Some((entry.session, subscribers))
    }

    pub async fn list(&self) -> Vec<SessionSummary> {
        let inner = self.inner.lock().await;
        let mut rows: Vec<SessionSummary> = inner
            .sessions
            .values()
            .map(|e| SessionSummary {
                session: e.session.clone(),
                state: e.state,
                subscribers: e.subscribers.len(),
            })
            .collect();
        rows.sort_by(|a, b| a.session.created_at.cmp(&b.session.created_at));
        rows
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.sessions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
