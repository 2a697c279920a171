//! Pipe transport between short-lived callers and a session daemon.
//!
//! The read side is expressed as a channel that must be *rebound* after each
//! writer session: end-of-file means "this writer is done", not "the channel
//! is closed". [`Rebind`] captures that contract so the daemon's forwarding
//! loop does not depend on the OS primitive behind it. [`fifo`] provides the
//! named-pipe implementation, and [`tee`] copies child output into the
//! session transcript.

use std::future::Future;

use tokio::io::AsyncRead;

pub mod fifo;
pub mod tee;

/// A listening endpoint that yields one connection per writer session.
pub trait Rebind: Send {
    /// Readable stream for a single writer session.
    type Conn: AsyncRead + Unpin + Send + 'static;

    /// Wait for the next writer and return its stream.
    ///
    /// Errors are transient from the caller's point of view: the forwarding
    /// loop backs off and calls `rebind` again.
    fn rebind(&mut self) -> impl Future<Output = std::io::Result<Self::Conn>> + Send;

    /// Unblock a pending [`rebind`](Self::rebind) so the caller can observe
    /// shutdown. Returns whether a pending open was reached.
    fn wake(&self) -> bool;
}
