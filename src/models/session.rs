//! Session record and liveness status.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Whether a recorded daemon is still serving its session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Liveness {
    /// The recorded pid is a running session daemon.
    Alive,
    /// The process is gone or is not a session daemon.
    Dead,
    /// No session is recorded under this name.
    Unknown,
}

impl Liveness {
    /// Lowercase label used by the CLI.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Alive => "alive",
            Self::Dead => "dead",
            Self::Unknown => "unknown",
        }
    }
}

/// A named agent's session within a workspace.
///
/// `session_id` and `model` are fixed when the session is created. A resume
/// replaces only `pid`, `fifo_path` and `log_path`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SessionRecord {
    /// Agent role name, unique within the workspace.
    pub name: String,
    /// Identifier assigned by the agent during the first handshake.
    pub session_id: String,
    /// Model chosen at creation.
    pub model: Option<String>,
    /// Workspace key.
    pub workspace: String,
    /// Working directory of the agent.
    pub cwd: PathBuf,
    /// Pid of the session daemon (not of the agent).
    pub pid: u32,
    /// Pipe the daemon listens on.
    pub fifo_path: PathBuf,
    /// Session transcript.
    pub log_path: PathBuf,
}
