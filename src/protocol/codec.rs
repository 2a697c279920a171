//! Bounded line framing for pipe input and agent output.
//!
//! Every stream the daemon reads line by line shares one limit,
//! [`MAX_LINE_BYTES`]. Pipe input is decoded through [`LineCodec`], which
//! never fails on content: a line that is too long or not UTF-8 comes out as
//! a [`Frame`] the forwarding loop can drop while the connection stays
//! usable. Agent output is copied raw, so it goes through [`read_bounded`],
//! which hands an oversized line over in pieces instead of buffering it.

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio_util::codec::Decoder;

use crate::AppError;

/// Maximum line length accepted on inbound streams: 1 MiB.
pub const MAX_LINE_BYTES: usize = 1_048_576;

/// One decoded unit of pipe input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A complete line without its terminator.
    Line(String),
    /// A line longer than the limit, discarded; `bytes` counts what was
    /// thrown away.
    Oversized {
        /// Discarded byte count.
        bytes: usize,
    },
    /// A line that is not valid UTF-8, discarded.
    InvalidUtf8 {
        /// Length of the discarded line.
        bytes: usize,
    },
}

/// Newline framing with a length cap and per-line UTF-8 checks.
///
/// Once a line exceeds the cap the codec keeps discarding until the next
/// newline, then reports a single [`Frame::Oversized`]. End of input also
/// ends a discarded line, since a writer session cannot continue a line
/// started by the previous one.
///
/// ```rust,ignore
/// use tokio_util::codec::FramedRead;
/// use duo_relay::protocol::codec::LineCodec;
///
/// let frames = FramedRead::new(pipe_conn, LineCodec::new());
/// ```
#[derive(Debug)]
pub struct LineCodec {
    max_length: usize,
    /// Bytes of the buffer already searched for a newline.
    next_index: usize,
    /// Bytes dropped so far from an oversized line, or `None`.
    discarding: Option<usize>,
}

impl LineCodec {
    /// Codec with the [`MAX_LINE_BYTES`] limit.
    #[must_use]
    pub const fn new() -> Self {
        Self::with_max_length(MAX_LINE_BYTES)
    }

    /// Codec with a custom limit.
    #[must_use]
    pub const fn with_max_length(max_length: usize) -> Self {
        Self {
            max_length,
            next_index: 0,
            discarding: None,
        }
    }

    /// Whether the codec is in the middle of dropping an oversized line.
    #[must_use]
    pub const fn is_discarding(&self) -> bool {
        self.discarding.is_some()
    }
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for LineCodec {
    type Item = Frame;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, AppError> {
        loop {
            // Never look further than one byte past the limit.
            let read_to = src.len().min(self.max_length.saturating_add(1));
            let newline = src[self.next_index..read_to]
                .iter()
                .position(|b| *b == b'\n')
                .map(|offset| self.next_index + offset);

            match (self.discarding, newline) {
                (Some(dropped), Some(end)) => {
                    src.advance(end + 1);
                    self.next_index = 0;
                    self.discarding = None;
                    return Ok(Some(Frame::Oversized {
                        bytes: dropped + end,
                    }));
                }
                (Some(dropped), None) => {
                    src.advance(read_to);
                    self.next_index = 0;
                    self.discarding = Some(dropped + read_to);
                    if src.is_empty() {
                        return Ok(None);
                    }
                }
                (None, Some(end)) => {
                    self.next_index = 0;
                    let mut line = src.split_to(end + 1);
                    line.truncate(end);
                    return Ok(Some(to_frame(&line)));
                }
                (None, None) if src.len() > self.max_length => {
                    self.discarding = Some(0);
                }
                (None, None) => {
                    self.next_index = read_to;
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, AppError> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        self.next_index = 0;
        if let Some(dropped) = self.discarding.take() {
            let rest = src.len();
            src.clear();
            return Ok(Some(Frame::Oversized {
                bytes: dropped + rest,
            }));
        }
        if src.is_empty() {
            return Ok(None);
        }
        let line = src.split();
        Ok(Some(to_frame(&line)))
    }
}

fn to_frame(raw: &[u8]) -> Frame {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    match std::str::from_utf8(raw) {
        Ok(text) => Frame::Line(text.to_owned()),
        Err(_) => Frame::InvalidUtf8 { bytes: raw.len() },
    }
}

/// What one [`read_bounded`] call produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chunk {
    /// The reader is exhausted and nothing was read.
    Eof,
    /// A whole line, or the unterminated last line before end of input.
    Line,
    /// Exactly `max` bytes of a longer line; more follows.
    Fragment,
}

/// Read one line from `reader` into `buf`, but never more than `max` bytes.
///
/// `buf` is cleared first. A line longer than `max` comes back as a run of
/// [`Chunk::Fragment`]s followed by a [`Chunk::Line`] holding its tail.
///
/// # Errors
///
/// Propagates read errors from `reader`.
pub async fn read_bounded<R>(reader: &mut R, buf: &mut Vec<u8>, max: usize) -> std::io::Result<Chunk>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(if buf.is_empty() { Chunk::Eof } else { Chunk::Line });
        }

        let room = max.saturating_sub(buf.len());
        let window = &available[..available.len().min(room)];
        if let Some(pos) = window.iter().position(|b| *b == b'\n') {
            buf.extend_from_slice(&window[..=pos]);
            reader.consume(pos + 1);
            return Ok(Chunk::Line);
        }

        let taken = window.len();
        buf.extend_from_slice(window);
        reader.consume(taken);
        if buf.len() >= max {
            return Ok(Chunk::Fragment);
        }
    }
}
