//! Session handshake envelopes and readiness detection.
//!
//! Every daemon sends exactly one handshake request to its agent before any
//! forwarded traffic:
//!
//! 1. **new session**: `droid.initialize_session` with correlation id
//!    `"init"`, carrying the machine identity, working directory and model;
//! 2. **resume**: `droid.load_session` with correlation id `"load"`,
//!    carrying only the prior session id.
//!
//! Readiness is a structured predicate over each output line. Lines that are
//! not JSON objects, or that do not match, are ignored; the agent is free to
//! interleave unrelated output before it answers.

use serde_json::{json, Map, Value};

/// JSON-RPC version tag carried by every envelope.
pub const JSONRPC_VERSION: &str = "2.0";

/// Agent API version carried by every envelope.
pub const PROTOCOL_VERSION: &str = "1.0.0";

/// Correlation id of the new-session request.
pub const INIT_ID: &str = "init";

/// Correlation id of the resume request.
pub const LOAD_ID: &str = "load";

const INITIALIZE_METHOD: &str = "droid.initialize_session";
const LOAD_METHOD: &str = "droid.load_session";
const SESSION_ID_FIELD: &str = "sessionId";

/// Which handshake a daemon performs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeMode {
    /// Start a fresh session.
    New {
        /// Model identifier; empty means the agent's default.
        model: String,
        /// Machine identity reported to the agent.
        machine_id: String,
        /// Working directory of the session.
        cwd: String,
    },
    /// Restore a previously created session.
    Resume {
        /// Identifier assigned by the agent at creation.
        session_id: String,
    },
}

impl HandshakeMode {
    /// Correlation id used by this mode's request.
    #[must_use]
    pub const fn correlation_id(&self) -> &'static str {
        match self {
            Self::New { .. } => INIT_ID,
            Self::Resume { .. } => LOAD_ID,
        }
    }

    /// Short label used in logs.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::New { .. } => "new",
            Self::Resume { .. } => "resume",
        }
    }
}

/// Build the handshake request envelope for `mode`.
#[must_use]
pub fn build_request(mode: &HandshakeMode) -> Value {
    let (method, params) = match mode {
        HandshakeMode::New {
            model,
            machine_id,
            cwd,
        } => {
            let mut params = json!({ "machineId": machine_id, "cwd": cwd });
            if !model.is_empty() {
                params["modelId"] = Value::String(model.clone());
            }
            (INITIALIZE_METHOD, params)
        }
        HandshakeMode::Resume { session_id } => {
            (LOAD_METHOD, json!({ "sessionId": session_id }))
        }
    };

    json!({
        "jsonrpc": JSONRPC_VERSION,
        "type": "request",
        "factoryApiVersion": PROTOCOL_VERSION,
        "method": method,
        "params": params,
        "id": mode.correlation_id(),
    })
}

/// Outcome of inspecting one agent output line during the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeSignal {
    /// The session is ready. Carries the assigned session id when the line
    /// names one.
    Ready(Option<String>),
    /// The agent answered the handshake request with an error.
    Rejected(String),
    /// Unrelated or unparseable output.
    Ignored,
}

/// Classify one raw output line against the handshake for `mode`.
#[must_use]
pub fn inspect_line(line: &str, mode: &HandshakeMode) -> HandshakeSignal {
    let Some(envelope) = parse_object(line) else {
        return HandshakeSignal::Ignored;
    };

    let id = envelope.get("id").and_then(Value::as_str);
    if id == Some(mode.correlation_id()) {
        if let Some(error) = envelope.get("error") {
            let detail = error
                .get("message")
                .and_then(Value::as_str)
                .map_or_else(|| error.to_string(), str::to_owned);
            return HandshakeSignal::Rejected(detail);
        }
    }

    match mode {
        HandshakeMode::New { .. } => find_session_id(&envelope)
            .map_or(HandshakeSignal::Ignored, |sid| HandshakeSignal::Ready(Some(sid))),
        HandshakeMode::Resume { .. } => {
            let session = envelope
                .get("result")
                .and_then(|r| r.get("session"))
                .filter(|s| s.is_object());
            match (id, session) {
                (Some(LOAD_ID), Some(session)) => {
                    let sid = session
                        .get("id")
                        .or_else(|| session.get(SESSION_ID_FIELD))
                        .and_then(Value::as_str)
                        .filter(|s| !s.is_empty())
                        .map(str::to_owned);
                    HandshakeSignal::Ready(sid)
                }
                _ => HandshakeSignal::Ignored,
            }
        }
    }
}

/// Whether `line` signals that the session described by `mode` is ready.
#[must_use]
pub fn is_ready(line: &str, mode: &HandshakeMode) -> bool {
    matches!(inspect_line(line, mode), HandshakeSignal::Ready(_))
}

/// Whether `line` is an error answer to the handshake request for `mode`.
#[must_use]
pub fn is_rejection(line: &str, mode: &HandshakeMode) -> bool {
    matches!(inspect_line(line, mode), HandshakeSignal::Rejected(_))
}

fn parse_object(line: &str) -> Option<Map<String, Value>> {
    match serde_json::from_str::<Value>(line.trim()) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

/// Depth-first search for a non-empty `sessionId` string.
fn find_session_id(map: &Map<String, Value>) -> Option<String> {
    if let Some(Value::String(sid)) = map.get(SESSION_ID_FIELD) {
        if !sid.is_empty() {
            return Some(sid.clone());
        }
    }
    map.values().find_map(find_in_value)
}

fn find_in_value(value: &Value) -> Option<String> {
    match value {
        Value::Object(map) => find_session_id(map),
        Value::Array(items) => items.iter().find_map(find_in_value),
        _ => None,
    }
}
