//! The per-agent session daemon: one long-lived process per agent that owns
//! the agent's stdio, the pipe it listens on, and the session transcript.

pub mod session;
pub mod spawner;

pub use session::{run_daemon, DaemonOptions, DaemonOutcome, DaemonState};
pub use spawner::{AgentCommand, AGENT_NAME_ENV};
