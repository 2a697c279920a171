#![forbid(unsafe_code)]

//! `duo-relayd`: session daemon for one agent.
//!
//! Started in the background by the launcher. Runs the agent, performs the
//! handshake, copies all agent output into the session log and relays every
//! line written to the session pipe into the agent's stdin until the agent
//! exits or the daemon receives SIGTERM.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use duo_relay::daemon::{run_daemon, AgentCommand, DaemonOptions, DaemonOutcome};
use duo_relay::models::Workspace;
use duo_relay::protocol::handshake::HandshakeMode;
use duo_relay::{AppError, Result};

/// How long blocking-pool threads get to finish once the daemon is done.
const RUNTIME_SHUTDOWN: Duration = Duration::from_secs(1);

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "duo-relayd", about = "Session daemon for a stdio JSON-RPC agent", version, long_about = None)]
struct Cli {
    /// Agent role name.
    #[arg(long)]
    agent: String,

    /// Repository slug of the workflow.
    #[arg(long, env = "DUO_REPO", default_value = "")]
    repo: String,

    /// Pull request number of the workflow.
    #[arg(long, env = "DUO_PR", default_value = "")]
    pr: String,

    /// Working directory of the agent.
    #[arg(long)]
    cwd: PathBuf,

    /// Pipe to read input lines from.
    #[arg(long)]
    fifo: PathBuf,

    /// Session transcript.
    #[arg(long)]
    log: PathBuf,

    /// Agent binary.
    #[arg(long)]
    agent_cli: String,

    /// Fixed argument passed to the agent; repeatable.
    #[arg(long = "agent-arg", allow_hyphen_values = true)]
    agent_args: Vec<String>,

    /// Autonomy level passed as `--auto`.
    #[arg(long, default_value = "")]
    auto: String,

    /// Model for a new session.
    #[arg(long, conflicts_with = "resume")]
    model: Option<String>,

    /// Load this session instead of creating one.
    #[arg(long)]
    resume: Option<String>,

    /// Handshake bound in seconds.
    #[arg(long, default_value_t = 60)]
    handshake_timeout: u64,

    /// Seconds between SIGTERM and SIGKILL for the agent.
    #[arg(long, default_value_t = 5)]
    terminate_grace: u64,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

fn main() -> ExitCode {
    let args = Cli::parse();
    if let Err(err) = init_tracing(args.log_format) {
        eprintln!("{err}");
        return ExitCode::FAILURE;
    }
    let workspace = Workspace::new(args.repo.clone(), args.pr.clone());
    info!(agent = args.agent, workspace = workspace.key(), "duo-relayd starting");

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(%err, "failed to build tokio runtime");
            return ExitCode::FAILURE;
        }
    };
    let result = runtime.block_on(run(args, workspace));
    // A pipe open parked on the blocking pool must not keep the process
    // alive once the session is over.
    runtime.shutdown_timeout(RUNTIME_SHUTDOWN);

    match result {
        Ok(outcome) => {
            info!(?outcome, "duo-relayd finished");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(%err, "duo-relayd failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Cli, workspace: Workspace) -> Result<DaemonOutcome> {
    let mode = match args.resume {
        Some(session_id) => HandshakeMode::Resume { session_id },
        None => HandshakeMode::New {
            model: args.model.clone().unwrap_or_default(),
            machine_id: machine_id(),
            cwd: args.cwd.to_string_lossy().into_owned(),
        },
    };
    let options = DaemonOptions {
        command: AgentCommand {
            agent_name: args.agent,
            agent_cli: args.agent_cli,
            agent_args: args.agent_args,
            auto_level: args.auto,
            model: args.model,
            cwd: args.cwd,
            workspace,
        },
        mode,
        fifo_path: args.fifo,
        log_path: args.log,
        handshake_timeout: Duration::from_secs(args.handshake_timeout),
        terminate_grace: Duration::from_secs(args.terminate_grace),
    };

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        signal_token.cancel();
    });

    run_daemon(options, shutdown).await
}

fn machine_id() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "unknown".into())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(err) => {
            tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
            if let Err(err) = ctrl_c.await {
                tracing::warn!(%err, "cannot wait for ctrl-c");
            }
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter).with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
