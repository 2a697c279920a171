//! Named-pipe (FIFO) backend of the pipe transport.
//!
//! Read side: [`FifoListener::rebind`] opens the FIFO for reading on the
//! blocking pool, which parks until some writer opens the other end. The
//! returned stream hits EOF as soon as that writer closes, after which the
//! daemon rebinds.
//!
//! Write side: [`FifoSender::connect`] opens the FIFO non-blocking. A FIFO
//! refuses a non-blocking writer (`ENXIO`) while no reader is attached, which
//! happens briefly between two rebinds, so the sender retries until its
//! deadline.

use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::stat::Mode;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::net::unix::pipe;
use tracing::{debug, warn};

use super::Rebind;
use crate::{AppError, Result};

/// Delay between non-blocking open attempts while no reader is attached.
const CONNECT_RETRY: Duration = Duration::from_millis(25);

/// Remove whatever sits at `path` and create a fresh FIFO there.
///
/// Called immediately before a daemon is started so a writer can never reach
/// a FIFO left behind by an earlier daemon: writers that still hold the old
/// inode are cut off from the new one.
///
/// # Errors
///
/// Returns `AppError::TransportUnavailable` if the stale object cannot be
/// removed or the FIFO cannot be created.
pub fn prepare(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "removed stale pipe object"),
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => {
            return Err(AppError::TransportUnavailable(format!(
                "cannot remove stale object at {}: {err}",
                path.display()
            )));
        }
    }

    nix::unistd::mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR).map_err(|errno| {
        AppError::TransportUnavailable(format!("mkfifo {} failed: {errno}", path.display()))
    })
}

/// Remove the FIFO at `path`, ignoring a missing file.
pub fn remove(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "pipe removed"),
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), %err, "failed to remove pipe"),
    }
}

/// Daemon-side read endpoint of a FIFO.
#[derive(Debug, Clone)]
pub struct FifoListener {
    path: PathBuf,
}

impl FifoListener {
    /// Listen on an existing FIFO.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the FIFO.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Rebind for FifoListener {
    type Conn = tokio::fs::File;

    fn rebind(&mut self) -> impl std::future::Future<Output = std::io::Result<Self::Conn>> + Send {
        let path = self.path.clone();
        async move {
            let file = tokio::task::spawn_blocking(move || {
                let file = fs::File::open(&path)?;
                if !file.metadata()?.file_type().is_fifo() {
                    return Err(std::io::Error::new(
                        ErrorKind::InvalidInput,
                        format!("{} is not a fifo", path.display()),
                    ));
                }
                Ok(file)
            })
            .await
            .map_err(std::io::Error::other)??;
            Ok(tokio::fs::File::from_std(file))
        }
    }

    fn wake(&self) -> bool {
        // A reader parked in open() counts as attached, so a non-blocking
        // writer open succeeds exactly when there is someone to wake.
        fs::OpenOptions::new()
            .write(true)
            .custom_flags(nix::libc::O_NONBLOCK)
            .open(&self.path)
            .is_ok()
    }
}

/// Caller-side write endpoint of a FIFO, valid for one writer session.
#[derive(Debug)]
pub struct FifoSender {
    inner: pipe::Sender,
}

impl FifoSender {
    /// Attach to the FIFO at `path`, retrying while no reader is attached.
    ///
    /// # Errors
    ///
    /// Returns `AppError::TransportUnavailable` if the path does not exist,
    /// is not a FIFO, or no daemon attaches within `timeout`.
    pub async fn connect(path: &Path, timeout: Duration) -> Result<Self> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            match pipe::OpenOptions::new().open_sender(path) {
                Ok(inner) => return Ok(Self { inner }),
                Err(err) if err.raw_os_error() == Some(Errno::ENXIO as i32) => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(AppError::TransportUnavailable(format!(
                            "no daemon attached to {} within {timeout:?}",
                            path.display()
                        )));
                    }
                    tokio::time::sleep(CONNECT_RETRY).await;
                }
                Err(err) => {
                    return Err(AppError::TransportUnavailable(format!(
                        "cannot open {}: {err}",
                        path.display()
                    )));
                }
            }
        }
    }

    /// Write one newline-terminated line.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` for a line with an embedded newline, or
    /// `AppError::TransportUnavailable` if the daemon went away mid-write.
    pub async fn send_line(&mut self, line: &str) -> Result<()> {
        let line = line.trim_end_matches('\n');
        if line.contains('\n') {
            return Err(AppError::Protocol(
                "pipe lines must not contain embedded newlines".into(),
            ));
        }
        let mut bytes = Vec::with_capacity(line.len() + 1);
        bytes.extend_from_slice(line.as_bytes());
        bytes.push(b'\n');
        self.inner
            .write_all(&bytes)
            .await
            .map_err(|err| AppError::TransportUnavailable(format!("pipe write failed: {err}")))
    }

    /// Serialise `envelope` compactly and write it as one line.
    ///
    /// # Errors
    ///
    /// See [`send_line`](Self::send_line).
    pub async fn send(&mut self, envelope: &Value) -> Result<()> {
        let line = serde_json::to_string(envelope)
            .map_err(|err| AppError::Protocol(format!("cannot serialise envelope: {err}")))?;
        self.send_line(&line).await
    }
}

/// Open, write one envelope line, close.
///
/// # Errors
///
/// See [`FifoSender::connect`] and [`FifoSender::send`].
pub async fn send_envelope(path: &Path, envelope: &Value, timeout: Duration) -> Result<()> {
    let mut sender = FifoSender::connect(path, timeout).await?;
    sender.send(envelope).await?;
    debug!(path = %path.display(), "envelope delivered to pipe");
    Ok(())
}
