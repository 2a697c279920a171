//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
///
/// A child agent exiting during forwarding is not represented here: that is
/// the daemon's normal end of life and is reported through
/// [`DaemonOutcome`](crate::daemon::DaemonOutcome) instead.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// The daemon or its child agent process could not be started.
    Launch(String),
    /// The agent started but never signalled readiness within the bound.
    HandshakeTimeout(String),
    /// The agent exited or answered with an error envelope during handshake.
    HandshakeRejected(String),
    /// The pipe transport object is missing or has no reader attached.
    TransportUnavailable(String),
    /// Coordination store open, read, or write failure.
    Store(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// Malformed or oversized wire message.
    Protocol(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl AppError {
    /// Whether this error was produced while bringing a session up.
    ///
    /// Such failures must keep the controller from recording the session as
    /// active.
    #[must_use]
    pub const fn is_session_start_failure(&self) -> bool {
        matches!(
            self,
            Self::Launch(_) | Self::HandshakeTimeout(_) | Self::HandshakeRejected(_)
        )
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Launch(msg) => write!(f, "launch failed: {msg}"),
            Self::HandshakeTimeout(msg) => write!(f, "handshake timeout: {msg}"),
            Self::HandshakeRejected(msg) => write!(f, "handshake rejected: {msg}"),
            Self::TransportUnavailable(msg) => write!(f, "transport unavailable: {msg}"),
            Self::Store(msg) => write!(f, "store: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Protocol(msg) => write!(f, "protocol: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        Self::Store(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
