//! Filesystem layout of a workspace's runtime artifacts.
//!
//! ```text
//! {runtime}/duo-{workspace}.db                         coordination store
//! {runtime}/duo-{workspace}-{agent}.log                transcript, stable across resumes
//! {runtime}/duo-{workspace}-{agent}.daemon.log         daemon diagnostics
//! {runtime}/duo-{workspace}-{agent}-{launch}.fifo      input pipe, new per daemon
//! ```

use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::models::Workspace;

/// Prefix shared by every runtime artifact.
const PREFIX: &str = "duo";

/// Length of a launch id.
const LAUNCH_ID_LEN: usize = 8;

/// Paths for one daemon launch of one agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEndpoint {
    /// Identifier of this launch, embedded in the pipe name.
    pub launch_id: String,
    /// Input pipe.
    pub fifo_path: PathBuf,
    /// Session transcript.
    pub log_path: PathBuf,
    /// Daemon diagnostics.
    pub daemon_log_path: PathBuf,
}

impl SessionEndpoint {
    /// Allocate paths for a fresh launch of `agent`.
    #[must_use]
    pub fn allocate(runtime_dir: &Path, workspace: &Workspace, agent: &str) -> Self {
        Self::with_launch_id(runtime_dir, workspace, agent, &new_launch_id())
    }

    /// Paths for a known launch id.
    #[must_use]
    pub fn with_launch_id(
        runtime_dir: &Path,
        workspace: &Workspace,
        agent: &str,
        launch_id: &str,
    ) -> Self {
        let base = agent_prefix(workspace, agent);
        Self {
            launch_id: launch_id.to_owned(),
            fifo_path: runtime_dir.join(format!("{base}-{launch_id}.fifo")),
            log_path: runtime_dir.join(format!("{base}.log")),
            daemon_log_path: runtime_dir.join(format!("{base}.daemon.log")),
        }
    }
}

/// Store file of `workspace`.
#[must_use]
pub fn store_path(runtime_dir: &Path, workspace: &Workspace) -> PathBuf {
    runtime_dir.join(format!("{PREFIX}-{}.db", workspace.key()))
}

/// Globs matching the transcript, diagnostics and pipes of `agent`.
///
/// Each pattern names the agent and a fixed suffix, so workspaces whose key
/// merely starts with this one are never matched.
#[must_use]
pub fn agent_artifact_globs(
    runtime_dir: &Path,
    workspace: &Workspace,
    agent: &str,
) -> [String; 3] {
    let dir = glob::Pattern::escape(&runtime_dir.to_string_lossy());
    let base = glob::Pattern::escape(&agent_prefix(workspace, agent));
    let launch = "[0-9a-f]".repeat(LAUNCH_ID_LEN);
    [
        format!("{dir}/{base}.log"),
        format!("{dir}/{base}.daemon.log"),
        format!("{dir}/{base}-{launch}.fifo"),
    ]
}

/// A fresh random launch id of eight lowercase hex digits.
#[must_use]
pub fn new_launch_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(LAUNCH_ID_LEN);
    id
}

fn agent_prefix(workspace: &Workspace, agent: &str) -> String {
    format!("{PREFIX}-{}-{agent}", workspace.key())
}
