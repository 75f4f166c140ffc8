// crates/core/src/reconcile.rs
//! Pick the authoritative snapshot from a session's two terminal handles.
//!
//! The handles can drift (the mirror may lag or be recreated), and capture
//! exposes no per-line timestamps, so content length is the freshness proxy.

/// Minimum visible characters (after trimming) for a snapshot to count.
pub const MIN_CONTENT_CHARS: usize = 10;

/// Shown instead of a blank pane while a session is being brought up.
pub const WELCOME_PLACEHOLDER: &str = "Welcome to Claude Code Web\n\
\n\
Interactive terminal for Claude Code\n\
--------------------------------------\n\
\n\
Ready for input...";

/// Snapshots captured from the primary (shared, durable) and mirror
/// (per-session) handles of one logical session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DualSnapshot {
    pub primary: String,
    pub mirror: String,
}

impl DualSnapshot {
    pub fn new(primary: impl Into<String>, mirror: impl Into<String>) -> Self {
        Self {
            primary: primary.into(),
            mirror: mirror.into(),
        }
    }

    /// A session with only one handle (project sessions).
    pub fn single(primary: impl Into<String>) -> Self {
        Self::new(primary, String::new())
    }

    /// Select the content to broadcast.
    ///
    /// 1. Both handles under [`MIN_CONTENT_CHARS`] visible characters: the
    ///    fixed [`WELCOME_PLACEHOLDER`].
    /// 2. Otherwise the strictly longer snapshot; ties go to the primary.
    /// 3. Trailing whitespace is trimmed from the result.
    pub fn reconcile(&self) -> String {
        if !is_meaningful(&self.primary) && !is_meaningful(&self.mirror) {
            return WELCOME_PLACEHOLDER.to_string();
        }

        let primary = self.primary.trim_end();
        let mirror = self.mirror.trim_end();
        let chosen = if mirror.chars().count() > primary.chars().count() {
            mirror
        } else {
            primary
        };
        chosen.to_string()
    }
}

fn is_meaningful(snapshot: &str) -> bool {
    snapshot.trim().chars().count() >= MIN_CONTENT_CHARS
}
