// crates/core/src/project.rs
//! Create-or-reuse for project-scoped sessions.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::{ProjectError, SessionError};
use crate::liveness::{LaunchSpec, LivenessMonitor, LivenessOutcome};
use crate::registry::{Session, SessionRegistry, SessionState};
use crate::tmux::TerminalAdapter;

/// Prefix of every project backing terminal.
pub const PROJECT_HANDLE_PREFIX: &str = "claude_project_";

/// File exported into the session environment when a project has one.
pub const CONTEXT_FILE_NAME: &str = "CLAUDE.md";

pub fn backing_name(project_id: &str) -> String {
    format!("{PROJECT_HANDLE_PREFIX}{project_id}")
}

/// Project ids name a directory directly under the projects root, so they
/// must not be able to escape it.
pub fn validate_project_id(project_id: &str) -> Result<(), ProjectError> {
    let valid = !project_id.is_empty()
        && project_id != "."
        && project_id != ".."
        && project_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(ProjectError::InvalidId {
            id: project_id.to_string(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct ProjectSession {
    pub session: Session,
    pub outcome: LivenessOutcome,
}

pub struct ProjectSessionManager {
    projects_root: PathBuf,
    terminal: Arc<dyn TerminalAdapter>,
    liveness: Arc<LivenessMonitor>,
    registry: Arc<SessionRegistry>,
    /// backing name -> session id, for the life of the process.
    session_ids: Mutex<HashMap<String, String>>,
}

impl ProjectSessionManager {
    pub fn new(
        projects_root: impl Into<PathBuf>,
        terminal: Arc<dyn TerminalAdapter>,
        liveness: Arc<LivenessMonitor>,
        registry: Arc<SessionRegistry>,
    ) -> Self {
        Self {
            projects_root: projects_root.into(),
            terminal,
            liveness,
            registry,
            session_ids: Mutex::new(HashMap::new()),
        }
    }

    pub fn projects_root(&self) -> &Path {
        &self.projects_root
    }

    /// Validate the id and locate the project directory.
    pub async fn resolve(&self, project_id: &str) -> Result<LaunchSpec, ProjectError> {
        validate_project_id(project_id)?;
        let project_path = self.projects_root.join(project_id);

        let metadata = tokio::fs::metadata(&project_path)
            .await
            .map_err(|e| ProjectError::io(project_id, &project_path, e))?;
        if !metadata.is_dir() {
            return Err(ProjectError::NotFound {
                id: project_id.to_string(),
                path: project_path,
            });
        }

        let context = project_path.join(CONTEXT_FILE_NAME);
        let context_file = match tokio::fs::try_exists(&context).await {
            Ok(true) => Some(context),
            Ok(false) => None,
            Err(e) => {
                warn!(project_id = %project_id, error = %e, "cannot check context file");
                None
            }
        };

        Ok(LaunchSpec {
            backing_name: backing_name(project_id),
            project_id: project_id.to_string(),
            project_path,
            context_file,
        })
    }

    /// Ensure the project's backing terminal is healthy and return its
    /// registered session. The session id is minted once per backing name.
    pub async fn get_or_create(
        &self,
        project_id: &str,
        owner_id: &str,
    ) -> Result<ProjectSession, SessionError> {
        let spec = self.resolve(project_id).await?;
        let outcome = self.liveness.ensure_healthy(&spec).await?;

        let session_id = {
            let mut ids = self.session_ids.lock().await;
            ids.entry(spec.backing_name.clone())
                .or_insert_with(|| uuid::Uuid::new_v4().to_string())
                .clone()
        };

        let (session, created) = self
            .registry
            .get_or_insert(Session::project(
                &session_id,
                owner_id,
                project_id,
                &spec.backing_name,
            ))
            .await;
        if created {
            info!(session_id = %session_id, project_id = %project_id, outcome = ?outcome, "project session ready");
        }
        self.registry.set_state(&session_id, SessionState::Ready).await;

        Ok(ProjectSession { session, outcome })
    }

    /// Registered session for a project, if it has been joined.
    pub async fn session(&self, project_id: &str) -> Option<Session> {
        let session_id = self
            .session_ids
            .lock()
            .await
            .get(&backing_name(project_id))
            .cloned()?;
        self.registry.get(&session_id).await
    }

    /// Destroy the project's backing terminal and forget its session.
    /// Returns the removed session, if one was registered.
    pub async fn cleanup(&self, project_id: &str) -> Result<Option<Session>, SessionError> {
        validate_project_id(project_id)?;
        let name = backing_name(project_id);
        self.terminal.destroy(&name).await?;

        let session_id = self.session_ids.lock().await.remove(&name);
        let removed = match session_id {
            Some(id) => self.registry.remove(&id).await.map(|(session, _)| session),
            None => None,
        };
        info!(project_id = %project_id, handle = %name, "project session cleaned up");
        Ok(removed)
    }
}
