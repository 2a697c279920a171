//! Session daemon lifecycle.
//!
//! ```text
//! Starting ─▶ HandshakeSent ─▶ TeeStarted ─▶ Forwarding ─▶ Terminating ─▶ Terminated
//!     │              │
//!     └──────────────┴──▶ Failed
//! ```
//!
//! The daemon owns exactly one agent process. After the single handshake
//! request, output is drained into the log by a separate task *before* the
//! forwarding loop starts blocking on the pipe; otherwise an agent that
//! writes more than a pipe buffer's worth of output would stall while the
//! daemon waits for input, and neither side would ever make progress.

use std::path::PathBuf;
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::Value;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, ChildStdout};
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::spawner::{self, AgentCommand};
use crate::protocol::codec::{Chunk, Frame, LineCodec};
use crate::protocol::handshake::{self, HandshakeMode, HandshakeSignal};
use crate::transport::fifo::{self, FifoListener};
use crate::transport::tee::{self, LogTee};
use crate::transport::Rebind;
use crate::{AppError, Result};

/// Pause after a failed pipe open before rebinding.
const REBIND_BACKOFF: Duration = Duration::from_millis(100);

/// How long the drain may keep running after the agent is gone. Background
/// processes started by the agent can inherit its stdout and keep it open.
const DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Attempts to unblock a pending pipe open during shutdown.
const WAKE_ATTEMPTS: u32 = 3;

/// Lifecycle state of a session daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    /// Opening the log and launching the agent.
    Starting,
    /// Handshake request written; waiting for the ready line.
    HandshakeSent,
    /// Output drain running.
    TeeStarted,
    /// Relaying pipe input to the agent.
    Forwarding,
    /// Releasing the agent, log and pipe.
    Terminating,
    /// All resources released.
    Terminated,
    /// The session never became ready.
    Failed,
}

impl DaemonState {
    /// Determine whether a lifecycle transition is permitted.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Starting, Self::HandshakeSent | Self::Failed)
                | (Self::HandshakeSent, Self::TeeStarted | Self::Failed)
                | (Self::TeeStarted, Self::Forwarding | Self::Terminating)
                | (Self::Forwarding, Self::Terminating)
                | (Self::Terminating, Self::Terminated)
        )
    }
}

/// Tracks the daemon state and logs each transition.
#[derive(Debug)]
struct Lifecycle {
    agent: String,
    state: DaemonState,
}

impl Lifecycle {
    fn new(agent: &str) -> Self {
        info!(agent, state = ?DaemonState::Starting, "daemon state");
        Self {
            agent: agent.to_owned(),
            state: DaemonState::Starting,
        }
    }

    fn advance(&mut self, next: DaemonState) {
        if !self.state.can_transition_to(next) {
            warn!(agent = self.agent, from = ?self.state, to = ?next, "unexpected daemon transition");
        }
        info!(agent = self.agent, from = ?self.state, to = ?next, "daemon state");
        self.state = next;
    }
}

/// Why a session daemon finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonOutcome {
    /// The agent exited on its own; the normal end of a session.
    ChildExited {
        /// Exit code, `None` if killed by a signal or unknown.
        code: Option<i32>,
    },
    /// The daemon was asked to shut down and stopped the agent.
    Shutdown,
}

/// Everything a daemon needs to run one session.
#[derive(Debug, Clone)]
pub struct DaemonOptions {
    /// How to launch the agent.
    pub command: AgentCommand,
    /// Handshake to perform.
    pub mode: HandshakeMode,
    /// Pipe the daemon reads input from.
    pub fifo_path: PathBuf,
    /// Transcript of all agent output.
    pub log_path: PathBuf,
    /// Upper bound on the handshake.
    pub handshake_timeout: Duration,
    /// Grace period between SIGTERM and SIGKILL.
    pub terminate_grace: Duration,
}

/// Removes the pipe on every exit path.
struct PipeGuard(PathBuf);

impl Drop for PipeGuard {
    fn drop(&mut self) {
        fifo::remove(&self.0);
    }
}

/// Run one session to completion.
///
/// Returns once the agent has exited (or was stopped because `shutdown`
/// fired) and every resource acquired here has been released.
///
/// # Errors
///
/// - `AppError::Launch`: the log could not be opened or the agent could not
///   be started.
/// - `AppError::HandshakeTimeout`: no ready line within the bound.
/// - `AppError::HandshakeRejected`: the agent exited or answered with an
///   error before becoming ready.
pub async fn run_daemon(options: DaemonOptions, shutdown: CancellationToken) -> Result<DaemonOutcome> {
    let agent = options.command.agent_name.clone();
    let span = info_span!("daemon", agent = %agent, mode = options.mode.label());
    run_inner(options, shutdown).instrument(span).await
}

async fn run_inner(options: DaemonOptions, shutdown: CancellationToken) -> Result<DaemonOutcome> {
    let agent = options.command.agent_name.clone();
    let _pipe_guard = PipeGuard(options.fifo_path.clone());
    let mut lifecycle = Lifecycle::new(&agent);

    // ── Starting ────────────────────────────────────────
    let mut log = LogTee::open(&options.log_path).map_err(|err| {
        lifecycle.advance(DaemonState::Failed);
        AppError::Launch(format!("cannot open session log: {err}"))
    })?;
    let stderr = log.stdio().map_err(|err| {
        lifecycle.advance(DaemonState::Failed);
        AppError::Launch(format!("cannot share session log with agent: {err}"))
    })?;
    let process = spawner::spawn_agent(&options.command, stderr).map_err(|err| {
        lifecycle.advance(DaemonState::Failed);
        err
    })?;
    let mut stdin = process.stdin;
    let mut stdout = process.stdout;
    let monitor = spawner::monitor_exit(agent.clone(), process.child, options.terminate_grace);

    // ── HandshakeSent ───────────────────────────────────
    lifecycle.advance(DaemonState::HandshakeSent);
    let handshake = tokio::select! {
        result = perform_handshake(
            &agent,
            &mut stdin,
            &mut stdout,
            &mut log,
            &options.mode,
            options.handshake_timeout,
        ) => result,
        () = shutdown.cancelled() => Err(AppError::HandshakeRejected(
            "daemon shut down before the session became ready".into(),
        )),
    };

    match handshake {
        Ok(session_id) => {
            info!(agent, session_id = session_id.as_deref().unwrap_or(""), "session ready");
        }
        Err(err) => {
            lifecycle.advance(DaemonState::Failed);
            error!(agent, %err, "handshake failed");
            drop(stdin);
            monitor.stop().await;
            return Err(err);
        }
    }

    // ── TeeStarted ──────────────────────────────────────
    lifecycle.advance(DaemonState::TeeStarted);
    let drain = tee::spawn_drain(agent.clone(), stdout, log);

    // ── Forwarding ──────────────────────────────────────
    lifecycle.advance(DaemonState::Forwarding);
    let mut listener = FifoListener::new(options.fifo_path.clone());
    let end = forward(&agent, &mut listener, &mut stdin, &monitor.exited(), &shutdown).await;
    debug!(agent, ?end, "forwarding loop finished");

    // ── Terminating ─────────────────────────────────────
    lifecycle.advance(DaemonState::Terminating);
    drop(stdin);
    for _ in 0..WAKE_ATTEMPTS {
        if listener.wake() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let status = monitor.stop().await;

    let mut drain = drain;
    match tokio::time::timeout(DRAIN_GRACE, &mut drain).await {
        Ok(Ok(lines)) => debug!(agent, lines, "output drain finished"),
        Ok(Err(err)) => warn!(agent, %err, "output drain task failed"),
        Err(_) => {
            warn!(agent, "agent stdout still held open after exit, closing log");
            drain.abort();
        }
    }

    lifecycle.advance(DaemonState::Terminated);
    Ok(match end {
        ForwardEnd::Shutdown => DaemonOutcome::Shutdown,
        ForwardEnd::ChildExited | ForwardEnd::InputClosed => DaemonOutcome::ChildExited {
            code: status.and_then(|s| s.code()),
        },
    })
}

/// Send the handshake request and copy output to the log until ready.
///
/// Returns the session id named by the ready line, if any.
async fn perform_handshake(
    agent: &str,
    stdin: &mut ChildStdin,
    stdout: &mut BufReader<ChildStdout>,
    log: &mut LogTee,
    mode: &HandshakeMode,
    timeout: Duration,
) -> Result<Option<String>> {
    let request = handshake::build_request(mode);
    write_json_line(stdin, &request)
        .await
        .map_err(|err| AppError::HandshakeRejected(format!("cannot write handshake: {err}")))?;
    debug!(agent, id = mode.correlation_id(), "handshake request sent");

    let read_until_ready = async {
        let mut buf = Vec::with_capacity(4096);
        loop {
            let chunk = log
                .copy_line(stdout, &mut buf)
                .await
                .map_err(|err| AppError::HandshakeRejected(format!("handshake io error: {err}")))?;
            match chunk {
                Chunk::Eof => {
                    return Err(AppError::HandshakeRejected(format!(
                        "agent {agent} exited during handshake"
                    )));
                }
                // Pieces of an oversized line are logged but never a ready line.
                Chunk::Fragment => continue,
                Chunk::Line => {}
            }

            let line = String::from_utf8_lossy(&buf);
            match handshake::inspect_line(&line, mode) {
                HandshakeSignal::Ready(session_id) => return Ok(session_id),
                HandshakeSignal::Rejected(detail) => {
                    return Err(AppError::HandshakeRejected(format!(
                        "agent {agent} refused {} handshake: {detail}",
                        mode.label()
                    )));
                }
                HandshakeSignal::Ignored => {}
            }
        }
    };

    tokio::time::timeout(timeout, read_until_ready)
        .await
        .map_err(|_| {
            AppError::HandshakeTimeout(format!(
                "agent {agent} not ready within {timeout:?}"
            ))
        })?
}

/// How the forwarding loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ForwardEnd {
    ChildExited,
    Shutdown,
    InputClosed,
}

/// Relay pipe input to the agent until it exits.
async fn forward<L: Rebind>(
    agent: &str,
    listener: &mut L,
    stdin: &mut ChildStdin,
    exited: &CancellationToken,
    shutdown: &CancellationToken,
) -> ForwardEnd {
    let mut failing = false;

    loop {
        let conn = tokio::select! {
            biased;
            () = exited.cancelled() => return ForwardEnd::ChildExited,
            () = shutdown.cancelled() => return ForwardEnd::Shutdown,
            conn = listener.rebind() => conn,
        };

        let conn = match conn {
            Ok(conn) => {
                failing = false;
                conn
            }
            Err(err) => {
                if failing {
                    debug!(agent, %err, "pipe still unavailable");
                } else {
                    warn!(agent, %err, "pipe open failed, retrying");
                    failing = true;
                }
                tokio::select! {
                    () = exited.cancelled() => return ForwardEnd::ChildExited,
                    () = shutdown.cancelled() => return ForwardEnd::Shutdown,
                    () = tokio::time::sleep(REBIND_BACKOFF) => continue,
                }
            }
        };

        let mut frames = FramedRead::new(conn, LineCodec::new());
        loop {
            let item = tokio::select! {
                biased;
                () = exited.cancelled() => return ForwardEnd::ChildExited,
                () = shutdown.cancelled() => return ForwardEnd::Shutdown,
                item = frames.next() => item,
            };

            match item {
                None => break,
                Some(Ok(Frame::Line(line))) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    if let Err(err) = write_line(stdin, &line).await {
                        warn!(agent, %err, "agent stdin closed");
                        return ForwardEnd::InputClosed;
                    }
                    debug!(agent, bytes = line.len(), "line forwarded to agent");
                }
                Some(Ok(Frame::Oversized { bytes })) => {
                    warn!(agent, bytes, "dropping oversized pipe line");
                }
                Some(Ok(Frame::InvalidUtf8 { bytes })) => {
                    warn!(agent, bytes, "dropping pipe line that is not utf-8");
                }
                Some(Err(err)) => {
                    warn!(agent, %err, "pipe read failed, rebinding");
                    break;
                }
            }
        }
    }
}

async fn write_line(stdin: &mut ChildStdin, line: &str) -> std::io::Result<()> {
    let mut bytes = Vec::with_capacity(line.len() + 1);
    bytes.extend_from_slice(line.as_bytes());
    bytes.push(b'\n');
    stdin.write_all(&bytes).await?;
    stdin.flush().await
}

async fn write_json_line(stdin: &mut ChildStdin, value: &Value) -> std::io::Result<()> {
    let line = serde_json::to_string(value).map_err(|e| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("json serialisation failed: {e}"),
        )
    })?;
    write_line(stdin, &line).await
}
