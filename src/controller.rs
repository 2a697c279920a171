//! Controller operations behind the `duo-relay` CLI.
//!
//! Each operation is a short-lived client of the registry, the pipe
//! transport and the store; the only long-lived processes are the daemons
//! started through the [`Launcher`].

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::GlobalConfig;
use crate::launcher::{self, CleanupReport, LaunchedSession, Launcher, LogTail};
use crate::models::{Liveness, Message, SessionRecord, Workspace};
use crate::persistence::Store;
use crate::protocol::control::{self, AgentMessage};
use crate::registry::{liveness, paths, SessionRegistry};
use crate::transport::fifo;
use crate::{AppError, Result};

/// Poll interval while following a transcript.
const FOLLOW_POLL: Duration = Duration::from_millis(200);

/// A recorded session together with its liveness.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AgentStatus {
    /// The stored record.
    pub record: SessionRecord,
    /// Whether its daemon is running.
    pub liveness: Liveness,
}

/// Drives sessions of one workspace.
#[derive(Clone)]
pub struct Controller {
    config: GlobalConfig,
    workspace: Workspace,
    store: Store,
    registry: SessionRegistry,
    launcher: Launcher,
}

impl Controller {
    /// Open the workspace's store under the configured runtime dir.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Store` if the store cannot be opened.
    pub async fn open(config: GlobalConfig, workspace: Workspace) -> Result<Self> {
        let path = paths::store_path(&config.runtime_dir, &workspace);
        let store = Store::open(&path, config.store_retry_attempts).await?;
        Ok(Self::with_store(config, workspace, store))
    }

    /// Controller over an already opened store.
    #[must_use]
    pub fn with_store(config: GlobalConfig, workspace: Workspace, store: Store) -> Self {
        let registry = SessionRegistry::new(&store, &workspace);
        let launcher = Launcher::new(config.clone());
        Self {
            config,
            workspace,
            store,
            registry,
            launcher,
        }
    }

    /// The workspace this controller acts on.
    #[must_use]
    pub const fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    /// The coordination store.
    #[must_use]
    pub const fn store(&self) -> &Store {
        &self.store
    }

    /// The session registry.
    #[must_use]
    pub const fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Create a new session for `agent`, blocking until it is ready.
    ///
    /// A live daemon already serving `agent` is stopped first. The record is
    /// written only after the session is ready, so a failed start leaves no
    /// entry behind.
    ///
    /// # Errors
    ///
    /// Returns a session start failure (`Launch`, `HandshakeTimeout`,
    /// `HandshakeRejected`) or `AppError::Store`.
    pub async fn create_agent(
        &self,
        agent: &str,
        cwd: &Path,
        model: Option<&str>,
    ) -> Result<SessionRecord> {
        if let Some(previous) = self.registry.load(agent).await? {
            if previous.pid != 0 && liveness::is_alive(previous.pid) {
                info!(agent, pid = previous.pid, "replacing running session");
                launcher::stop_daemon(previous.pid, self.config.timeouts.terminate_grace()).await;
            }
        }

        let model = model
            .filter(|m| !m.is_empty())
            .unwrap_or(&self.config.default_model)
            .to_owned();
        let launched = self
            .launcher
            .start_session(&self.workspace, agent, cwd, Some(&model))
            .await?;

        let Some(session_id) = launched.session_id.clone() else {
            launcher::stop_daemon(launched.pid, self.config.timeouts.terminate_grace()).await;
            fifo::remove(&launched.endpoint.fifo_path);
            return Err(AppError::HandshakeRejected(format!(
                "agent {agent} became ready without naming a session id"
            )));
        };

        let record = SessionRecord {
            name: agent.to_owned(),
            session_id,
            model: Some(model),
            workspace: self.workspace.key(),
            cwd: cwd.to_path_buf(),
            pid: launched.pid,
            fifo_path: launched.endpoint.fifo_path,
            log_path: launched.endpoint.log_path,
        };
        self.registry.remove(agent).await?;
        self.registry.record(&record).await?;
        info!(agent, session_id = record.session_id, pid = record.pid, "agent created");
        Ok(record)
    }

    /// Start a new daemon for the recorded session of `agent`.
    ///
    /// Only the daemon pid, pipe path and log path are replaced.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if nothing is recorded, or a session start
    /// failure.
    pub async fn resume_agent(&self, agent: &str) -> Result<SessionRecord> {
        let mut record = self.registry.require(agent).await?;
        if record.pid != 0 && liveness::is_alive(record.pid) {
            launcher::stop_daemon(record.pid, self.config.timeouts.terminate_grace()).await;
        }

        let LaunchedSession { pid, endpoint, .. } = self
            .launcher
            .resume_session(&self.workspace, agent, &record.cwd, &record.session_id)
            .await?;

        self.registry
            .update_endpoint(agent, pid, &endpoint.fifo_path, &endpoint.log_path)
            .await?;
        if record.fifo_path != endpoint.fifo_path {
            fifo::remove(&record.fifo_path);
        }
        record.pid = pid;
        record.fifo_path = endpoint.fifo_path;
        record.log_path = endpoint.log_path;
        info!(agent, session_id = record.session_id, pid, "agent resumed");
        Ok(record)
    }

    /// The record of `agent`, resuming the session first if its daemon died.
    ///
    /// # Errors
    ///
    /// See [`resume_agent`](Self::resume_agent).
    pub async fn ensure_alive(&self, agent: &str) -> Result<SessionRecord> {
        let record = self.registry.require(agent).await?;
        if record.pid != 0 && liveness::is_alive(record.pid) {
            return Ok(record);
        }
        warn!(agent, pid = record.pid, "daemon not running, resuming");
        self.resume_agent(agent).await
    }

    /// Deliver `content` from `from` to `to` and log it. Returns the message id.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown recipient,
    /// `AppError::TransportUnavailable` if its daemon is not listening, or
    /// `AppError::Store` if the log append fails.
    pub async fn send(&self, from: &str, to: &str, content: &str) -> Result<i64> {
        let record = self.registry.require(to).await?;
        let message = AgentMessage::new(from, to, content);
        fifo::send_envelope(
            &record.fifo_path,
            &message.to_envelope(),
            self.config.timeouts.send(),
        )
        .await?;

        let id = self
            .store
            .messages
            .append(&self.workspace, from, to, content, message.timestamp)
            .await?;
        info!(from, to, id, "message sent");
        Ok(id)
    }

    /// Hand `text` to `agent` as a plain user turn, without a sender header
    /// and without logging it as a message. Used for initial prompts.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` or `AppError::TransportUnavailable`.
    pub async fn prompt(&self, agent: &str, text: &str) -> Result<()> {
        let record = self.registry.require(agent).await?;
        fifo::send_envelope(
            &record.fifo_path,
            &control::add_user_message(text),
            self.config.timeouts.send(),
        )
        .await?;
        info!(agent, bytes = text.len(), "prompt delivered");
        Ok(())
    }

    /// Ask `agent` to stop its current turn.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` or `AppError::TransportUnavailable`.
    pub async fn interrupt(&self, agent: &str) -> Result<()> {
        let record = self.registry.require(agent).await?;
        fifo::send_envelope(
            &record.fifo_path,
            &control::interrupt_session(),
            self.config.timeouts.send(),
        )
        .await
    }

    /// Change the autonomy level and/or model of a running session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` when neither setting is given, otherwise
    /// as [`interrupt`](Self::interrupt).
    pub async fn update_settings(
        &self,
        agent: &str,
        auto_level: Option<&str>,
        model: Option<&str>,
    ) -> Result<()> {
        if auto_level.is_none() && model.is_none() {
            return Err(AppError::Config(
                "settings update needs an autonomy level or a model".into(),
            ));
        }
        let record = self.registry.require(agent).await?;
        fifo::send_envelope(
            &record.fifo_path,
            &control::update_session_settings(auto_level, model),
            self.config.timeouts.send(),
        )
        .await
    }

    /// Liveness of `agent`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Store` if the read fails.
    pub async fn alive(&self, agent: &str) -> Result<Liveness> {
        self.registry.liveness(agent).await
    }

    /// Status of every recorded agent.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Store` if the read fails.
    pub async fn status(&self) -> Result<Vec<AgentStatus>> {
        Ok(self
            .registry
            .agents()
            .await?
            .into_iter()
            .map(|record| {
                let liveness = if record.pid != 0 && liveness::is_alive(record.pid) {
                    Liveness::Alive
                } else {
                    Liveness::Dead
                };
                AgentStatus { record, liveness }
            })
            .collect())
    }

    /// Message history, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Store` if the read fails.
    pub async fn messages(&self, agent: Option<&str>, limit: Option<u32>) -> Result<Vec<Message>> {
        self.store.messages.list(&self.workspace, agent, limit).await
    }

    /// The last `lines` lines (all when `None`) of `agent`'s transcript.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if nothing is recorded, or `AppError::Io`
    /// if the log cannot be read.
    pub async fn logs(&self, agent: &str, lines: Option<usize>) -> Result<Vec<String>> {
        let record = self.registry.require(agent).await?;
        let raw = read_log(&record.log_path).await?;
        Ok(last_lines(&raw, lines))
    }

    /// Emit the last `lines` lines of `agent`'s transcript, then every line
    /// appended to it, until `stop` fires.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if nothing is recorded, or `AppError::Io`
    /// if the log cannot be read.
    pub async fn follow_logs<F>(
        &self,
        agent: &str,
        lines: Option<usize>,
        stop: &CancellationToken,
        mut emit: F,
    ) -> Result<()>
    where
        F: FnMut(&str),
    {
        let record = self.registry.require(agent).await?;
        let raw = read_log(&record.log_path).await?;
        for line in last_lines(&raw, lines) {
            emit(&line);
        }

        let mut tail = LogTail::new(&record.log_path, raw.len() as u64);
        loop {
            for line in tail.read_lines().await? {
                emit(line.trim_end_matches(['\n', '\r']));
            }
            tokio::select! {
                () = stop.cancelled() => {
                    debug!(agent, "stopped following log");
                    return Ok(());
                }
                () = tokio::time::sleep(FOLLOW_POLL) => {}
            }
        }
    }

    /// Record the workflow metadata of this workspace.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Store` if a write fails.
    pub async fn init_workflow(&self, branch: &str, base: &str, runner: &str) -> Result<()> {
        self.registry.swarm().init(branch, base, runner).await
    }

    /// Set a workspace state key.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Store` if the write fails.
    pub async fn set_value(&self, key: &str, value: &str) -> Result<()> {
        self.registry.swarm().set(key, value).await
    }

    /// Read a workspace state key.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Store` if the read fails.
    pub async fn get_value(&self, key: &str) -> Result<Option<String>> {
        self.registry.swarm().get(key).await
    }

    /// Every workspace state key.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Store` if the read fails.
    pub async fn all_values(&self) -> Result<BTreeMap<String, String>> {
        self.registry.swarm().get_all().await
    }

    /// Stop every daemon of this workspace, remove its pipes and logs, and
    /// clear its state namespace. The message log is kept.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Store` or `AppError::Io`.
    pub async fn cleanup(&self) -> Result<CleanupReport> {
        let records = self.registry.agents().await?;
        for record in &records {
            if record.pid != 0 && liveness::is_alive(record.pid) {
                info!(agent = record.name, pid = record.pid, "stopping daemon");
                launcher::stop_daemon(record.pid, self.config.timeouts.terminate_grace()).await;
            }
        }
        let agents: Vec<&str> = records.iter().map(|r| r.name.as_str()).collect();
        let report =
            launcher::cleanup_artifacts(&self.config.runtime_dir, &self.workspace, &agents)?;
        let removed = self.registry.swarm().delete().await?;
        info!(files = report.removed.len(), keys = removed, "workspace cleaned up");
        Ok(report)
    }
}

async fn read_log(path: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(path)
        .await
        .map_err(|err| AppError::Io(format!("cannot read {}: {err}", path.display())))
}

fn last_lines(raw: &[u8], lines: Option<usize>) -> Vec<String> {
    let text = String::from_utf8_lossy(raw);
    let all: Vec<&str> = text.lines().collect();
    let skip = lines.map_or(0, |n| all.len().saturating_sub(n));
    all[skip..].iter().map(|l| (*l).to_owned()).collect()
}
