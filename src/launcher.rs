//! Detached daemon launcher.
//!
//! Starting a session means: allocate fresh paths, create the pipe, spawn
//! `duo-relayd` in its own process group so it outlives the caller, then
//! watch the session log until the ready line appears. The launcher only
//! polls the log, at the process boundary; the daemon itself never polls.
//!
//! The log is shared across resumes, so readiness is judged only on bytes
//! appended after the launch began.

use std::fs::OpenOptions;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::process::{Child, Command};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::GlobalConfig;
use crate::models::Workspace;
use crate::protocol::handshake::{self, HandshakeMode, HandshakeSignal};
use crate::registry::liveness;
use crate::registry::paths::{self, SessionEndpoint};
use crate::transport::fifo;
use crate::{AppError, Result};

/// Interval between log polls while waiting for readiness.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Poll interval while waiting for a stopped daemon to disappear.
const STOP_POLL: Duration = Duration::from_millis(50);

/// What to launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    /// Workflow instance.
    pub workspace: Workspace,
    /// Agent role name.
    pub agent: String,
    /// Working directory of the agent.
    pub cwd: PathBuf,
    /// Autonomy level.
    pub auto_level: String,
    /// `None` starts a new session with `model`; `Some` resumes that id.
    pub resume: Option<String>,
    /// Model for a new session.
    pub model: Option<String>,
}

/// A daemon that reported its session ready.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchedSession {
    /// Daemon pid.
    pub pid: u32,
    /// Session id named by the ready line, if it named one.
    pub session_id: Option<String>,
    /// Paths of this launch.
    pub endpoint: SessionEndpoint,
}

/// Launches session daemons with one configuration.
#[derive(Debug, Clone)]
pub struct Launcher {
    config: GlobalConfig,
}

impl Launcher {
    /// Launcher using `config`.
    #[must_use]
    pub const fn new(config: GlobalConfig) -> Self {
        Self { config }
    }

    /// Start a daemon for a new session and wait until it is ready.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Launch`, `AppError::HandshakeTimeout` or
    /// `AppError::HandshakeRejected` if the session never became ready; the
    /// daemon is stopped and its pipe removed before returning.
    pub async fn start_session(
        &self,
        workspace: &Workspace,
        agent: &str,
        cwd: &Path,
        model: Option<&str>,
    ) -> Result<LaunchedSession> {
        let model = model
            .filter(|m| !m.is_empty())
            .unwrap_or(&self.config.default_model)
            .to_owned();
        self.launch(LaunchRequest {
            workspace: workspace.clone(),
            agent: agent.to_owned(),
            cwd: cwd.to_path_buf(),
            auto_level: self.config.auto_level.clone(),
            resume: None,
            model: Some(model),
        })
        .await
    }

    /// Start a daemon that loads `session_id` and wait until it is ready.
    ///
    /// The new daemon gets a new pipe path; the transcript continues in the
    /// same log.
    ///
    /// # Errors
    ///
    /// See [`start_session`](Self::start_session).
    pub async fn resume_session(
        &self,
        workspace: &Workspace,
        agent: &str,
        cwd: &Path,
        session_id: &str,
    ) -> Result<LaunchedSession> {
        self.launch(LaunchRequest {
            workspace: workspace.clone(),
            agent: agent.to_owned(),
            cwd: cwd.to_path_buf(),
            auto_level: self.config.auto_level.clone(),
            resume: Some(session_id.to_owned()),
            model: None,
        })
        .await
    }

    /// Launch the daemon described by `request`.
    ///
    /// # Errors
    ///
    /// See [`start_session`](Self::start_session).
    pub async fn launch(&self, request: LaunchRequest) -> Result<LaunchedSession> {
        let span = info_span!(
            "launch",
            agent = %request.agent,
            workspace = %request.workspace.key(),
            resume = request.resume.is_some()
        );
        self.launch_inner(request).instrument(span).await
    }

    async fn launch_inner(&self, request: LaunchRequest) -> Result<LaunchedSession> {
        let endpoint =
            SessionEndpoint::allocate(&self.config.runtime_dir, &request.workspace, &request.agent);
        std::fs::create_dir_all(&self.config.runtime_dir).map_err(|err| {
            AppError::Launch(format!(
                "cannot create runtime dir {}: {err}",
                self.config.runtime_dir.display()
            ))
        })?;
        fifo::prepare(&endpoint.fifo_path)?;

        let offset = std::fs::metadata(&endpoint.log_path).map_or(0, |m| m.len());
        let mode = match request.resume {
            Some(ref session_id) => HandshakeMode::Resume {
                session_id: session_id.clone(),
            },
            None => HandshakeMode::New {
                model: request.model.clone().unwrap_or_default(),
                machine_id: String::new(),
                cwd: request.cwd.to_string_lossy().into_owned(),
            },
        };

        let mut child = match self.spawn_daemon(&request, &endpoint) {
            Ok(child) => child,
            Err(err) => {
                fifo::remove(&endpoint.fifo_path);
                return Err(err);
            }
        };
        let pid = child.id().unwrap_or(0);
        info!(pid, fifo = %endpoint.fifo_path.display(), "daemon spawned");

        match wait_ready(
            &endpoint.log_path,
            offset,
            &mode,
            &mut child,
            self.config.timeouts.ready(),
        )
        .await
        {
            Ok(session_id) => {
                info!(pid, session_id = session_id.as_deref().unwrap_or(""), "session ready");
                Ok(LaunchedSession {
                    pid,
                    session_id,
                    endpoint,
                })
            }
            Err(err) => {
                warn!(pid, %err, daemon_log = %endpoint.daemon_log_path.display(), "launch failed");
                stop_daemon(pid, self.config.timeouts.terminate_grace()).await;
                // Reap the daemon so it does not linger as a zombie.
                if let Err(err) = child.try_wait() {
                    debug!(pid, %err, "cannot reap failed daemon");
                }
                fifo::remove(&endpoint.fifo_path);
                Err(err)
            }
        }
    }

    fn spawn_daemon(&self, request: &LaunchRequest, endpoint: &SessionEndpoint) -> Result<Child> {
        let daemon_bin = self.config.daemon_bin()?;
        let diagnostics = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&endpoint.daemon_log_path)
            .map_err(|err| {
                AppError::Launch(format!(
                    "cannot open daemon log {}: {err}",
                    endpoint.daemon_log_path.display()
                ))
            })?;

        let mut cmd = Command::new(&daemon_bin);
        cmd.arg("--agent")
            .arg(&request.agent)
            .arg("--repo")
            .arg(&request.workspace.repo)
            .arg("--pr")
            .arg(&request.workspace.pr)
            .arg("--cwd")
            .arg(&request.cwd)
            .arg("--fifo")
            .arg(&endpoint.fifo_path)
            .arg("--log")
            .arg(&endpoint.log_path)
            .arg("--agent-cli")
            .arg(&self.config.agent_cli)
            .arg("--auto")
            .arg(&request.auto_level)
            .arg("--handshake-timeout")
            .arg(self.config.timeouts.handshake_seconds.to_string())
            .arg("--terminate-grace")
            .arg(self.config.timeouts.terminate_grace_seconds.to_string());
        for arg in &self.config.agent_args {
            cmd.arg(format!("--agent-arg={arg}"));
        }
        match (&request.resume, &request.model) {
            (Some(session_id), _) => {
                cmd.arg("--resume").arg(session_id);
            }
            (None, Some(model)) => {
                cmd.arg("--model").arg(model);
            }
            (None, None) => {}
        }

        cmd.envs(request.workspace.env())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(diagnostics))
            .process_group(0)
            .kill_on_drop(false);

        debug!(bin = %daemon_bin.display(), "spawning daemon");
        cmd.spawn().map_err(|err| {
            AppError::Launch(format!("failed to spawn {}: {err}", daemon_bin.display()))
        })
    }
}

/// Poll `log_path` from `offset` until a line marks the session ready.
///
/// Returns the session id carried by the ready line, if any.
///
/// # Errors
///
/// - `AppError::HandshakeRejected`: the agent answered with an error, or the
///   daemon exited after writing to the log.
/// - `AppError::Launch`: the daemon exited without writing anything.
/// - `AppError::HandshakeTimeout`: `timeout` elapsed first.
pub async fn wait_ready(
    log_path: &Path,
    offset: u64,
    mode: &HandshakeMode,
    daemon: &mut Child,
    timeout: Duration,
) -> Result<Option<String>> {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut tail = LogTail::new(log_path, offset);

    loop {
        let exit = daemon.try_wait().ok().flatten();

        for line in tail.read_lines().await? {
            match handshake::inspect_line(&line, mode) {
                HandshakeSignal::Ready(session_id) => return Ok(session_id),
                HandshakeSignal::Rejected(detail) => {
                    return Err(AppError::HandshakeRejected(format!(
                        "{} handshake refused: {detail}",
                        mode.label()
                    )));
                }
                HandshakeSignal::Ignored => {}
            }
        }

        if let Some(status) = exit {
            return Err(if tail.bytes_seen() == 0 {
                AppError::Launch(format!("daemon exited ({status}) before the agent produced output"))
            } else {
                AppError::HandshakeRejected(format!("daemon exited ({status}) during handshake"))
            });
        }

        if tokio::time::Instant::now() >= deadline {
            return Err(AppError::HandshakeTimeout(format!(
                "no ready line in {} within {timeout:?}",
                log_path.display()
            )));
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Incremental reader over the new part of a log file.
pub(crate) struct LogTail {
    path: PathBuf,
    position: u64,
    start: u64,
    partial: Vec<u8>,
}

impl LogTail {
    pub(crate) fn new(path: &Path, offset: u64) -> Self {
        Self {
            path: path.to_path_buf(),
            position: offset,
            start: offset,
            partial: Vec::new(),
        }
    }

    fn bytes_seen(&self) -> u64 {
        self.position - self.start
    }

    /// Complete lines appended since the last call.
    pub(crate) async fn read_lines(&mut self) -> Result<Vec<String>> {
        let mut file = match tokio::fs::File::open(&self.path).await {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        file.seek(SeekFrom::Start(self.position)).await?;
        let mut chunk = Vec::new();
        let n = file.read_to_end(&mut chunk).await?;
        self.position += n as u64;
        self.partial.extend_from_slice(&chunk);

        let mut lines = Vec::new();
        while let Some(end) = self.partial.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.partial.drain(..=end).collect();
            lines.push(String::from_utf8_lossy(&raw).into_owned());
        }
        Ok(lines)
    }
}

/// Stop the daemon `pid`: SIGTERM, then SIGKILL once `grace` has elapsed.
///
/// The daemon stops its agent on SIGTERM, so the grace period here is one
/// agent grace period plus slack.
pub async fn stop_daemon(pid: u32, grace: Duration) {
    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    if raw <= 0 || !liveness::is_process_running(pid) {
        return;
    }
    if let Err(errno) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
        debug!(pid, %errno, "SIGTERM to daemon failed");
        return;
    }

    let deadline = tokio::time::Instant::now() + grace * 2;
    while tokio::time::Instant::now() < deadline {
        if !liveness::is_alive(pid) {
            return;
        }
        tokio::time::sleep(STOP_POLL).await;
    }
    warn!(pid, "daemon ignored SIGTERM, killing");
    if let Err(errno) = kill(Pid::from_raw(raw), Signal::SIGKILL) {
        debug!(pid, %errno, "SIGKILL to daemon failed");
    }
}

/// Files removed by [`cleanup_artifacts`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupReport {
    /// Paths that were removed.
    pub removed: Vec<PathBuf>,
}

/// Remove the pipes and logs of `agents` in `workspace` under `runtime_dir`.
///
/// The store file is left in place.
///
/// # Errors
///
/// Returns `AppError::Io` if a glob pattern is invalid.
pub fn cleanup_artifacts(
    runtime_dir: &Path,
    workspace: &Workspace,
    agents: &[&str],
) -> Result<CleanupReport> {
    let mut report = CleanupReport::default();
    for agent in agents {
        for pattern in paths::agent_artifact_globs(runtime_dir, workspace, agent) {
            let entries = glob::glob(&pattern)
                .map_err(|err| AppError::Io(format!("invalid cleanup pattern {pattern}: {err}")))?;
            for path in entries.flatten() {
                match std::fs::remove_file(&path) {
                    Ok(()) => report.removed.push(path),
                    Err(err) => warn!(path = %path.display(), %err, "cleanup: cannot remove"),
                }
            }
        }
    }
    debug!(count = report.removed.len(), "cleanup finished");
    Ok(report)
}
