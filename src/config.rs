//! Global configuration parsing and validation.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::{AppError, Result};

/// Environment variable naming an alternative configuration file.
pub const CONFIG_ENV: &str = "DUO_CONFIG";

/// Bounds applied to blocking session operations, in seconds.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TimeoutConfig {
    /// Upper bound for the daemon's handshake with the agent.
    #[serde(default = "default_handshake_seconds")]
    pub handshake_seconds: u64,
    /// Upper bound for the launcher's wait for a ready line in the log.
    #[serde(default = "default_ready_seconds")]
    pub ready_seconds: u64,
    /// How long a sender retries when no daemon is attached to the pipe.
    #[serde(default = "default_send_seconds")]
    pub send_seconds: u64,
    /// Grace period between SIGTERM and SIGKILL for the child agent.
    #[serde(default = "default_terminate_grace_seconds")]
    pub terminate_grace_seconds: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            handshake_seconds: default_handshake_seconds(),
            ready_seconds: default_ready_seconds(),
            send_seconds: default_send_seconds(),
            terminate_grace_seconds: default_terminate_grace_seconds(),
        }
    }
}

impl TimeoutConfig {
    /// Handshake bound as a [`Duration`].
    #[must_use]
    pub const fn handshake(&self) -> Duration {
        Duration::from_secs(self.handshake_seconds)
    }

    /// Launcher ready bound as a [`Duration`].
    #[must_use]
    pub const fn ready(&self) -> Duration {
        Duration::from_secs(self.ready_seconds)
    }

    /// Sender retry bound as a [`Duration`].
    #[must_use]
    pub const fn send(&self) -> Duration {
        Duration::from_secs(self.send_seconds)
    }

    /// Termination grace period as a [`Duration`].
    #[must_use]
    pub const fn terminate_grace(&self) -> Duration {
        Duration::from_secs(self.terminate_grace_seconds)
    }
}

fn default_handshake_seconds() -> u64 {
    60
}

fn default_ready_seconds() -> u64 {
    90
}

fn default_send_seconds() -> u64 {
    5
}

fn default_terminate_grace_seconds() -> u64 {
    5
}

fn default_runtime_dir() -> PathBuf {
    PathBuf::from("/tmp")
}

fn default_agent_cli() -> String {
    env::var("HOME").map_or_else(
        |_| "droid".into(),
        |home| format!("{home}/.local/bin/droid"),
    )
}

fn default_agent_args() -> Vec<String> {
    [
        "exec",
        "--input-format",
        "stream-jsonrpc",
        "--output-format",
        "stream-jsonrpc",
        "--allow-background-processes",
    ]
    .into_iter()
    .map(str::to_owned)
    .collect()
}

fn default_auto_level() -> String {
    "high".into()
}

fn default_model() -> String {
    "claude-opus-4-5-20251101".into()
}

fn default_store_retry_attempts() -> u32 {
    5
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Directory holding FIFOs, transcripts and store files.
    #[serde(default = "default_runtime_dir")]
    pub runtime_dir: PathBuf,
    /// Agent binary launched by each session daemon.
    #[serde(default = "default_agent_cli")]
    pub agent_cli: String,
    /// Fixed protocol flags passed to the agent binary.
    #[serde(default = "default_agent_args")]
    pub agent_args: Vec<String>,
    /// Autonomy level passed as `--auto`; empty disables the flag.
    #[serde(default = "default_auto_level")]
    pub auto_level: String,
    /// Model used when a caller creates a session without naming one.
    #[serde(default = "default_model")]
    pub default_model: String,
    /// Path of the `duo-relayd` binary; defaults to a sibling of the
    /// running executable.
    #[serde(default)]
    pub daemon_bin: Option<PathBuf>,
    /// Attempts made for a store operation that hits a locked database.
    #[serde(default = "default_store_retry_attempts")]
    pub store_retry_attempts: u32,
    /// Timeout configuration for blocking flows.
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            runtime_dir: default_runtime_dir(),
            agent_cli: default_agent_cli(),
            agent_args: default_agent_args(),
            auto_level: default_auto_level(),
            default_model: default_model(),
            daemon_bin: None,
            store_retry_attempts: default_store_retry_attempts(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve configuration from an explicit path, then `DUO_CONFIG`, then
    /// built-in defaults.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if a named file is unreadable or invalid.
    pub fn discover(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load_from_path(path);
        }
        match env::var_os(CONFIG_ENV) {
            Some(path) => Self::load_from_path(PathBuf::from(path)),
            None => {
                debug!("no config file given, using defaults");
                let config = Self::default();
                config.validate()?;
                Ok(config)
            }
        }
    }

    /// Resolve the daemon binary, falling back to `duo-relayd` next to the
    /// current executable.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the current executable path is unknown.
    pub fn daemon_bin(&self) -> Result<PathBuf> {
        if let Some(ref bin) = self.daemon_bin {
            return Ok(bin.clone());
        }
        let exe = env::current_exe()
            .map_err(|err| AppError::Config(format!("cannot locate current executable: {err}")))?;
        let dir = exe
            .parent()
            .ok_or_else(|| AppError::Config("current executable has no parent dir".into()))?;
        Ok(dir.join("duo-relayd"))
    }

    fn validate(&self) -> Result<()> {
        if self.agent_cli.trim().is_empty() {
            return Err(AppError::Config("agent_cli must not be empty".into()));
        }

        let t = &self.timeouts;
        for (name, value) in [
            ("handshake_seconds", t.handshake_seconds),
            ("ready_seconds", t.ready_seconds),
            ("send_seconds", t.send_seconds),
            ("terminate_grace_seconds", t.terminate_grace_seconds),
        ] {
            if value == 0 {
                return Err(AppError::Config(format!(
                    "timeouts.{name} must be greater than zero"
                )));
            }
        }

        if self.store_retry_attempts == 0 {
            return Err(AppError::Config(
                "store_retry_attempts must be greater than zero".into(),
            ));
        }

        Ok(())
    }
}
