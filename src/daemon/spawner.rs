//! Agent process spawner and exit monitor.
//!
//! Launches the agent with:
//! - the session working directory and the inherited environment plus
//!   `DUO_AGENT_NAME`, `DUO_REPO` and `DUO_PR`, so the agent's own
//!   `duo-relay` calls know who they are and which workflow they belong to;
//! - the fixed protocol flags from configuration, `--auto <level>`, and
//!   `-m <model>` for new sessions only (a resumed session keeps its model);
//! - piped stdin/stdout and stderr appended straight to the session log;
//! - `kill_on_drop(true)` so an early return never leaks the child.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::BufReader;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::models::Workspace;
use crate::{AppError, Result};

/// Environment variable carrying the agent's role name.
pub const AGENT_NAME_ENV: &str = "DUO_AGENT_NAME";

/// How to launch one agent process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentCommand {
    /// Role name of the agent (e.g. `orchestrator`).
    pub agent_name: String,
    /// Agent binary.
    pub agent_cli: String,
    /// Fixed protocol flags.
    pub agent_args: Vec<String>,
    /// Autonomy level; empty omits `--auto`.
    pub auto_level: String,
    /// Model for a new session; `None` when resuming.
    pub model: Option<String>,
    /// Working directory of the child.
    pub cwd: PathBuf,
    /// Workflow the agent belongs to.
    pub workspace: Workspace,
}

impl AgentCommand {
    /// Full argument vector passed to [`agent_cli`](Self::agent_cli).
    #[must_use]
    pub fn args(&self) -> Vec<String> {
        let mut args = self.agent_args.clone();
        if !self.auto_level.is_empty() {
            args.push("--auto".into());
            args.push(self.auto_level.clone());
        }
        if let Some(model) = self.model.as_deref().filter(|m| !m.is_empty()) {
            args.push("-m".into());
            args.push(model.to_owned());
        }
        args
    }

    /// Variables added to the inherited environment of the agent.
    #[must_use]
    pub fn env(&self) -> Vec<(&'static str, &str)> {
        let mut env = vec![(AGENT_NAME_ENV, self.agent_name.as_str())];
        env.extend(self.workspace.env());
        env
    }
}

/// Live stdio connection to a spawned agent.
#[derive(Debug)]
pub struct AgentProcess {
    /// Child handle; kept alive so `kill_on_drop` applies.
    pub child: Child,
    /// Agent's input stream.
    pub stdin: ChildStdin,
    /// Buffered reader over the agent's output stream.
    pub stdout: BufReader<ChildStdout>,
}

/// Spawn the agent described by `command`, sending its stderr to `stderr`.
///
/// # Errors
///
/// Returns `AppError::Launch` if the OS refuses to start the process or its
/// stdio cannot be captured.
pub fn spawn_agent(command: &AgentCommand, stderr: Stdio) -> Result<AgentProcess> {
    let mut cmd = Command::new(&command.agent_cli);
    cmd.args(command.args())
        .envs(command.env())
        .current_dir(&command.cwd)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(stderr)
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|err| {
        AppError::Launch(format!(
            "failed to spawn agent {} ({}): {err}",
            command.agent_name, command.agent_cli
        ))
    })?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| AppError::Launch("failed to capture agent stdin".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AppError::Launch("failed to capture agent stdout".into()))?;

    info!(
        agent = command.agent_name,
        pid = child.id().unwrap_or(0),
        cli = command.agent_cli,
        "agent process spawned"
    );

    Ok(AgentProcess {
        child,
        stdin,
        stdout: BufReader::new(stdout),
    })
}

/// Handle on the task that owns the agent's [`Child`].
///
/// `exited` fires once the child is gone, whether it exited by itself or was
/// stopped through [`stop`](Self::stop).
#[derive(Debug)]
pub struct ExitMonitor {
    exited: CancellationToken,
    stop: CancellationToken,
    handle: JoinHandle<Option<ExitStatus>>,
}

impl ExitMonitor {
    /// Token cancelled when the child has exited.
    #[must_use]
    pub fn exited(&self) -> CancellationToken {
        self.exited.clone()
    }

    /// Stop the child if still running and return its exit status.
    ///
    /// Stopping is two-phase: SIGTERM, then SIGKILL once the grace period
    /// given to [`monitor_exit`] has elapsed.
    pub async fn stop(self) -> Option<ExitStatus> {
        self.stop.cancel();
        match self.handle.await {
            Ok(status) => status,
            Err(err) => {
                warn!(%err, "exit monitor task failed");
                None
            }
        }
    }
}

/// Spawn the task that owns `child` and waits for it to exit.
#[must_use]
pub fn monitor_exit(agent: String, mut child: Child, grace: Duration) -> ExitMonitor {
    let exited = CancellationToken::new();
    let stop = CancellationToken::new();

    let task_exited = exited.clone();
    let task_stop = stop.clone();
    let handle = tokio::spawn(async move {
        let status = tokio::select! {
            result = child.wait() => match result {
                Ok(status) => {
                    info!(agent, ?status, "agent process exited");
                    Some(status)
                }
                Err(err) => {
                    warn!(agent, %err, "error waiting for agent process");
                    None
                }
            },
            () = task_stop.cancelled() => terminate(&agent, &mut child, grace).await,
        };
        task_exited.cancel();
        status
    });

    ExitMonitor {
        exited,
        stop,
        handle,
    }
}

/// Ask the child to stop, then force-kill it after `grace`.
async fn terminate(agent: &str, child: &mut Child, grace: Duration) -> Option<ExitStatus> {
    if let Ok(Some(status)) = child.try_wait() {
        return Some(status);
    }

    if let Some(pid) = child.id().and_then(|id| i32::try_from(id).ok()) {
        if let Err(errno) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
            warn!(agent, pid, %errno, "failed to send SIGTERM to agent");
        }
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            info!(agent, ?status, "agent exited after SIGTERM");
            Some(status)
        }
        Ok(Err(err)) => {
            warn!(agent, %err, "error waiting for agent after SIGTERM");
            None
        }
        Err(_) => {
            warn!(agent, ?grace, "agent ignored SIGTERM, forcing kill");
            if let Err(err) = child.kill().await {
                warn!(agent, %err, "failed to force-kill agent");
                return None;
            }
            child.try_wait().ok().flatten()
        }
    }
}
