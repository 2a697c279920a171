//! Session registry: which daemon serves which agent of a workspace.
//!
//! Records live in the coordination store under the workspace namespace as
//! `{agent}:{field}` keys, so any process can find a session. All filesystem
//! paths are derived in [`paths`]; [`liveness`] decides whether a recorded
//! daemon is still running.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::models::{Liveness, SessionRecord, Workspace};
use crate::persistence::{Store, SwarmState};
use crate::{AppError, Result};

pub mod liveness;
pub mod paths;

pub use paths::SessionEndpoint;

/// Store-backed mapping from agent name to [`SessionRecord`].
#[derive(Clone)]
pub struct SessionRegistry {
    swarm: SwarmState,
    workspace: Workspace,
}

impl SessionRegistry {
    /// Registry of `workspace` inside `store`.
    #[must_use]
    pub fn new(store: &Store, workspace: &Workspace) -> Self {
        Self {
            swarm: SwarmState::new(store.state.clone(), workspace),
            workspace: workspace.clone(),
        }
    }

    /// The underlying state view.
    #[must_use]
    pub fn swarm(&self) -> &SwarmState {
        &self.swarm
    }

    /// Persist a complete record, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Store` if a write fails.
    pub async fn record(&self, record: &SessionRecord) -> Result<()> {
        let pid = record.pid.to_string();
        let fifo = path_str(&record.fifo_path);
        let log = path_str(&record.log_path);
        let cwd = path_str(&record.cwd);
        let mut fields = vec![
            ("session", record.session_id.as_str()),
            ("pid", pid.as_str()),
            ("fifo", fifo.as_str()),
            ("log", log.as_str()),
            ("cwd", cwd.as_str()),
        ];
        if let Some(ref model) = record.model {
            fields.push(("model", model.as_str()));
        }
        self.swarm.set_agent(&record.name, &fields).await?;
        debug!(agent = record.name, session_id = record.session_id, pid = record.pid, "session recorded");
        Ok(())
    }

    /// Load the record of `agent`, `None` if no session is recorded.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Store` if the read fails or the record is corrupt.
    pub async fn load(&self, agent: &str) -> Result<Option<SessionRecord>> {
        let fields = self.swarm.get_agent(agent).await?;
        let field = |name: &str| fields.get(name).cloned().flatten().filter(|v| !v.is_empty());

        let Some(session_id) = field("session") else {
            return Ok(None);
        };
        let pid = field("pid")
            .map(|raw| {
                raw.parse::<u32>()
                    .map_err(|_| AppError::Store(format!("corrupt pid for {agent}: {raw}")))
            })
            .transpose()?
            .unwrap_or(0);

        Ok(Some(SessionRecord {
            name: agent.to_owned(),
            session_id,
            model: field("model"),
            workspace: self.workspace.key(),
            cwd: field("cwd").map(PathBuf::from).unwrap_or_default(),
            pid,
            fifo_path: field("fifo").map(PathBuf::from).unwrap_or_default(),
            log_path: field("log").map(PathBuf::from).unwrap_or_default(),
        }))
    }

    /// Load the record of `agent`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if no session is recorded.
    pub async fn require(&self, agent: &str) -> Result<SessionRecord> {
        self.load(agent)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("no session recorded for agent {agent}")))
    }

    /// Point `agent` at a new daemon. The session id and model are kept.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Store` if a write fails.
    pub async fn update_endpoint(
        &self,
        agent: &str,
        pid: u32,
        fifo_path: &Path,
        log_path: &Path,
    ) -> Result<()> {
        let pid = pid.to_string();
        let fifo = path_str(fifo_path);
        let log = path_str(log_path);
        self.swarm
            .set_agent(
                agent,
                &[("pid", pid.as_str()), ("fifo", fifo.as_str()), ("log", log.as_str())],
            )
            .await
    }

    /// Every recorded session, ordered by agent name.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Store` if a read fails.
    pub async fn agents(&self) -> Result<Vec<SessionRecord>> {
        let mut records = Vec::new();
        for name in self.swarm.agents().await? {
            if let Some(record) = self.load(&name).await? {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Whether the daemon recorded for `agent` is running.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Store` if the read fails.
    pub async fn liveness(&self, agent: &str) -> Result<Liveness> {
        Ok(match self.load(agent).await? {
            None => Liveness::Unknown,
            Some(record) if record.pid != 0 && liveness::is_alive(record.pid) => Liveness::Alive,
            Some(_) => Liveness::Dead,
        })
    }

    /// Forget the session of `agent`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Store` if a delete fails.
    pub async fn remove(&self, agent: &str) -> Result<()> {
        self.swarm.remove_agent(agent).await
    }
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
