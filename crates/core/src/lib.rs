// crates/core/src/lib.rs
//! Session lifecycle and output synchronization for tmux-backed assistant
//! terminals.
pub mod engine;
pub mod error;
pub mod hub;
pub mod liveness;
pub mod poller;
pub mod project;
pub mod protocol;
pub mod reconcile;
pub mod registry;
pub mod tmux;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use engine::{Engine, EngineConfig};
pub use error::*;
pub use hub::BroadcastHub;
pub use liveness::{LivenessConfig, LivenessMonitor, LivenessOutcome};
pub use poller::{OutputPoller, PollerConfig};
pub use project::ProjectSessionManager;
pub use protocol::{ClientEvent, ServerEvent};
pub use reconcile::DualSnapshot;
pub use registry::{Session, SessionKind, SessionRegistry, SessionState, SessionSummary};
pub use tmux::{TerminalAdapter, TmuxAdapter, TmuxCommand};
