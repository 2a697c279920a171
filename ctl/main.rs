#![forbid(unsafe_code)]

//! `duo-relay`: controller CLI for `duo-relayd` sessions.
//!
//! Every invocation is short-lived: it opens the workspace store, acts on the
//! registry, the session pipes or the message log, and exits. Agents use it
//! too, through the `DUO_AGENT_NAME` their daemon sets for them.

use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use duo_relay::controller::Controller;
use duo_relay::daemon::AGENT_NAME_ENV;
use duo_relay::models::{Liveness, Workspace};
use duo_relay::{AppError, GlobalConfig, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(
    name = "duo-relay",
    about = "Control agent sessions and the shared workflow state",
    version,
    long_about = None
)]
struct Cli {
    /// Path to the TOML configuration file (defaults to `$DUO_CONFIG`).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Repository slug (`owner/name`).
    #[arg(long, env = "DUO_REPO", global = true, default_value = "")]
    repo: String,

    /// Pull request number.
    #[arg(long, env = "DUO_PR", global = true, default_value = "")]
    pr: String,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Record workflow metadata (branch, base, runner) and reset the stage.
    Init {
        /// Head branch.
        #[arg(long, default_value = "")]
        branch: String,
        /// Base branch.
        #[arg(long, default_value = "main")]
        base: String,
        /// Runner label.
        #[arg(long, default_value = "sdk")]
        runner: String,
    },

    /// Start a new session for an agent and wait until it is ready.
    Spawn {
        /// Agent role name.
        agent: String,
        /// Working directory (defaults to the current one).
        #[arg(long)]
        cwd: Option<PathBuf>,
        /// Model (defaults to the configured one).
        #[arg(short, long)]
        model: Option<String>,
        /// File whose contents are sent as the first user turn.
        #[arg(short = 'f', long)]
        prompt_file: Option<PathBuf>,
    },

    /// Send a message to an agent.
    Send {
        /// Recipient.
        agent: String,
        /// Message text; read from stdin with `--stdin`.
        message: Option<String>,
        /// Sender name (defaults to `$DUO_AGENT_NAME`).
        #[arg(long)]
        from: Option<String>,
        /// Read the message from stdin.
        #[arg(long)]
        stdin: bool,
        /// Fail instead of resuming a dead session.
        #[arg(long)]
        no_resume: bool,
    },

    /// Interrupt an agent's current turn.
    Interrupt {
        /// Agent role name.
        agent: String,
    },

    /// Change an agent's autonomy level or model.
    Settings {
        /// Agent role name.
        agent: String,
        /// Autonomy level.
        #[arg(long = "auto")]
        auto_level: Option<String>,
        /// Model id.
        #[arg(long)]
        model: Option<String>,
    },

    /// Restart the daemon of a recorded session.
    Resume {
        /// Agent role name.
        agent: String,
    },

    /// Show every recorded agent and whether it is running.
    Status {
        /// Print JSON.
        #[arg(long)]
        json: bool,
    },

    /// Exit 0 if the agent's daemon is running, 1 otherwise.
    Alive {
        /// Agent role name.
        agent: String,
    },

    /// List recorded agent names.
    Agents,

    /// Show the message history.
    Messages {
        /// Only messages from or to this agent.
        #[arg(long)]
        agent: Option<String>,
        /// Only the last N messages.
        #[arg(short = 'n', long = "last")]
        limit: Option<u32>,
        /// Print JSON.
        #[arg(long)]
        json: bool,
    },

    /// Print an agent's session transcript.
    Logs {
        /// Agent role name.
        agent: String,
        /// Only the last N lines.
        #[arg(short = 'n', long)]
        lines: Option<usize>,
        /// Keep printing lines as they are appended (until ctrl-c).
        #[arg(short = 'f', long)]
        follow: bool,
    },

    /// Read a workflow state key, or all keys when none is given.
    Get {
        /// Key name.
        key: Option<String>,
    },

    /// Write a workflow state key.
    Set {
        /// Key name.
        key: String,
        /// Value.
        value: String,
    },

    /// Stop all daemons of the workspace and remove their files and state.
    Cleanup,
}

fn main() -> ExitCode {
    let args = Cli::parse();
    if let Err(err) = init_tracing(args.log_format) {
        eprintln!("{err}");
        return ExitCode::FAILURE;
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("Error: failed to build tokio runtime: {err}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(args)) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Cli) -> Result<ExitCode> {
    let config = GlobalConfig::discover(args.config.as_deref())?;
    let workspace = Workspace::new(args.repo, args.pr);
    let controller = Controller::open(config, workspace).await?;

    match args.command {
        Command::Init {
            branch,
            base,
            runner,
        } => {
            controller.init_workflow(&branch, &base, &runner).await?;
            println!("Initialized {}", controller.workspace().namespace());
        }
        Command::Spawn {
            agent,
            cwd,
            model,
            prompt_file,
        } => {
            let cwd = match cwd {
                Some(cwd) => cwd,
                None => std::env::current_dir()?,
            };
            // Read the prompt up front so a bad path fails before launching.
            let prompt = match prompt_file {
                Some(ref path) => Some(std::fs::read_to_string(path).map_err(|err| {
                    AppError::Config(format!("cannot read {}: {err}", path.display()))
                })?),
                None => None,
            };
            let record = controller.create_agent(&agent, &cwd, model.as_deref()).await?;
            if let Some(prompt) = prompt.filter(|p| !p.trim().is_empty()) {
                controller.prompt(&agent, &prompt).await?;
            }
            print_json(&record)?;
        }
        Command::Send {
            agent,
            message,
            from,
            stdin,
            no_resume,
        } => {
            let message = if stdin {
                let mut buf = String::new();
                std::io::stdin().read_to_string(&mut buf)?;
                buf
            } else {
                message.unwrap_or_default()
            };
            if message.trim().is_empty() {
                return Err(AppError::Config(
                    "message required (argument or --stdin)".into(),
                ));
            }
            let from = from
                .or_else(|| std::env::var(AGENT_NAME_ENV).ok())
                .unwrap_or_else(|| "unknown".into());
            if !no_resume {
                controller.ensure_alive(&agent).await?;
            }
            controller.send(&from, &agent, &message).await?;
            println!("Sent to {agent}");
        }
        Command::Interrupt { agent } => {
            controller.interrupt(&agent).await?;
            println!("Interrupted {agent}");
        }
        Command::Settings {
            agent,
            auto_level,
            model,
        } => {
            controller
                .update_settings(&agent, auto_level.as_deref(), model.as_deref())
                .await?;
            println!("Updated {agent}");
        }
        Command::Resume { agent } => {
            let record = controller.resume_agent(&agent).await?;
            print_json(&record)?;
        }
        Command::Status { json } => {
            let statuses = controller.status().await?;
            if json {
                print_json(&statuses)?;
            } else if statuses.is_empty() {
                println!("No agents");
            } else {
                for status in statuses {
                    println!(
                        "{:<16} {:<8} pid={:<8} session={}",
                        status.record.name,
                        status.liveness.as_str(),
                        status.record.pid,
                        status.record.session_id
                    );
                }
            }
        }
        Command::Alive { agent } => {
            let liveness = controller.alive(&agent).await?;
            println!("{}", liveness.as_str());
            if liveness != Liveness::Alive {
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::Agents => {
            for record in controller.registry().agents().await? {
                println!("{}", record.name);
            }
        }
        Command::Messages {
            agent,
            limit,
            json,
        } => {
            let messages = controller.messages(agent.as_deref(), limit).await?;
            if json {
                print_json(&messages)?;
            } else if messages.is_empty() {
                println!("No messages");
            } else {
                for msg in messages {
                    println!(
                        "[{}] {} -> {}: {}",
                        msg.timestamp.format("%Y-%m-%d %H:%M:%S"),
                        msg.from_agent,
                        msg.to_agent,
                        msg.content
                    );
                }
            }
        }
        Command::Logs {
            agent,
            lines,
            follow: false,
        } => {
            for line in controller.logs(&agent, lines).await? {
                println!("{line}");
            }
        }
        Command::Logs {
            agent,
            lines,
            follow: true,
        } => {
            let stop = CancellationToken::new();
            let on_signal = stop.clone();
            tokio::spawn(async move {
                if let Err(err) = tokio::signal::ctrl_c().await {
                    tracing::warn!(%err, "cannot wait for ctrl-c");
                }
                on_signal.cancel();
            });
            controller
                .follow_logs(&agent, lines.or(Some(50)), &stop, |line| println!("{line}"))
                .await?;
        }
        Command::Get { key: Some(key) } => match controller.get_value(&key).await? {
            Some(value) => println!("{value}"),
            None => return Ok(ExitCode::FAILURE),
        },
        Command::Get { key: None } => {
            print_json(&controller.all_values().await?)?;
        }
        Command::Set { key, value } => {
            controller.set_value(&key, &value).await?;
        }
        Command::Cleanup => {
            let report = controller.cleanup().await?;
            println!("Removed {} files", report.removed.len());
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|err| AppError::Protocol(format!("cannot render output: {err}")))?;
    println!("{text}");
    Ok(())
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
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
