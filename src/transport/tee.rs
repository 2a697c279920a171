//! Session transcript: every byte the agent writes, in order.
//!
//! The daemon first feeds handshake output through [`LogTee::copy_line`]
//! itself, then hands both the reader and the tee to [`spawn_drain`], which
//! keeps copying for the rest of the child's life. The drain is what stops a
//! chatty agent from filling its stdout pipe and blocking while the daemon
//! sits in the forwarding loop.
//!
//! Output is read in pieces of at most [`MAX_LINE_BYTES`], so a runaway line
//! never grows the daemon's buffer; the pieces are still logged in full.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::io::{AsyncBufRead, AsyncWriteExt};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::protocol::codec::{read_bounded, Chunk, MAX_LINE_BYTES};
use crate::{AppError, Result};

/// Append-only writer over the session log file.
#[derive(Debug)]
pub struct LogTee {
    path: PathBuf,
    file: tokio::fs::File,
    std_handle: std::fs::File,
    /// An oversized line has been partly written.
    mid_line: bool,
}

impl LogTee {
    /// Open (create or append to) the log at `path`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the file cannot be opened.
    pub fn open(path: &Path) -> Result<Self> {
        let std_handle = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|err| AppError::Io(format!("cannot open log {}: {err}", path.display())))?;
        let file = tokio::fs::File::from_std(std_handle.try_clone()?);
        Ok(Self {
            path: path.to_path_buf(),
            file,
            std_handle,
            mid_line: false,
        })
    }

    /// Path of the log file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A handle that appends to the same file, for the child's stderr.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the descriptor cannot be duplicated.
    pub fn stdio(&self) -> Result<Stdio> {
        Ok(Stdio::from(self.std_handle.try_clone()?))
    }

    /// Append `line` and flush. A missing trailing newline is added.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` on write failure.
    pub async fn write_line(&mut self, line: &[u8]) -> Result<()> {
        self.file.write_all(line).await?;
        if line.last() != Some(&b'\n') {
            self.file.write_all(b"\n").await?;
        }
        self.file.flush().await?;
        Ok(())
    }

    /// Append one piece of output as produced by [`read_bounded`].
    ///
    /// Fragments of an oversized line are written as-is so the transcript
    /// keeps the whole line. The returned chunk is [`Chunk::Line`] only for a
    /// line that was read in one piece; the tail of an oversized line is
    /// reported as [`Chunk::Fragment`].
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` on write failure.
    pub async fn append(&mut self, bytes: &[u8], chunk: Chunk) -> Result<Chunk> {
        match chunk {
            Chunk::Eof => {
                if std::mem::take(&mut self.mid_line) {
                    self.write_line(b"").await?;
                }
                Ok(Chunk::Eof)
            }
            Chunk::Fragment => {
                self.mid_line = true;
                self.file.write_all(bytes).await?;
                Ok(Chunk::Fragment)
            }
            Chunk::Line => {
                self.write_line(bytes).await?;
                Ok(if std::mem::take(&mut self.mid_line) {
                    Chunk::Fragment
                } else {
                    Chunk::Line
                })
            }
        }
    }

    /// Read one bounded piece of output from `reader` into `buf` and append
    /// it to the log.
    ///
    /// `buf` holds the raw bytes afterwards. See [`append`](Self::append) for
    /// the returned chunk.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` on read or write failure.
    pub async fn copy_line<R>(&mut self, reader: &mut R, buf: &mut Vec<u8>) -> Result<Chunk>
    where
        R: AsyncBufRead + Unpin,
    {
        let chunk = read_bounded(reader, buf, MAX_LINE_BYTES).await?;
        self.append(buf, chunk).await
    }
}

/// Copy every remaining line from `reader` into `tee` until EOF.
///
/// The task resolves to the number of lines copied. A write failure on the
/// log does not stop the drain: the line is dropped with a warning and
/// reading continues, because the agent must never block on its stdout.
#[must_use]
pub fn spawn_drain<R>(agent: String, mut reader: R, mut tee: LogTee) -> JoinHandle<u64>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::with_capacity(4096);
        let mut lines = 0_u64;
        loop {
            let chunk = match read_bounded(&mut reader, &mut buf, MAX_LINE_BYTES).await {
                Ok(chunk) => chunk,
                Err(err) => {
                    warn!(agent, %err, "output drain: read failed, stopping");
                    break;
                }
            };
            match tee.append(&buf, chunk).await {
                Ok(Chunk::Line) => lines += 1,
                Ok(_) => {}
                Err(err) => warn!(agent, %err, "output drain: log write failed, output dropped"),
            }
            if chunk == Chunk::Eof {
                debug!(agent, lines, "output drain: agent stdout closed");
                break;
            }
        }
        lines
    })
}
