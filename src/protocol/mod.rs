//! Agent wire protocol.
//!
//! The agent speaks line-delimited JSON-RPC on stdio. The daemon only knows
//! the envelope shapes, never their content:
//! - `codec`: bounded newline framing shared by every stream reader.
//! - `handshake`: the one session-establishment request and readiness check.
//! - `control`: envelopes callers forward to a live agent.

pub mod codec;
pub mod control;
pub mod handshake;
