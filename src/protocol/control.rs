//! Control envelopes forwarded to a running agent through its pipe.
//!
//! Every builder returns one complete JSON-RPC request object. The caller
//! serialises it as a single line and writes it with
//! [`transport::fifo::send_envelope`](crate::transport::fifo::send_envelope).

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use super::handshake::{JSONRPC_VERSION, PROTOCOL_VERSION};

const ADD_USER_MESSAGE: &str = "droid.add_user_message";
const INTERRUPT_SESSION: &str = "droid.interrupt_session";
const UPDATE_SESSION_SETTINGS: &str = "droid.update_session_settings";

fn request(method: &str, params: Value) -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "type": "request",
        "factoryApiVersion": PROTOCOL_VERSION,
        "method": method,
        "params": params,
        "id": Uuid::new_v4().to_string(),
    })
}

/// Queue a user turn containing `text`.
#[must_use]
pub fn add_user_message(text: &str) -> Value {
    request(ADD_USER_MESSAGE, json!({ "text": text }))
}

/// Interrupt whatever the agent is currently doing.
#[must_use]
pub fn interrupt_session() -> Value {
    request(INTERRUPT_SESSION, json!({}))
}

/// Change the autonomy level and/or model of a live session.
///
/// Absent settings are omitted from the envelope rather than sent as null.
#[must_use]
pub fn update_session_settings(auto_level: Option<&str>, model: Option<&str>) -> Value {
    let mut params = Map::new();
    if let Some(level) = auto_level {
        params.insert("autonomyLevel".into(), Value::String(level.to_owned()));
    }
    if let Some(model) = model {
        params.insert("modelId".into(), Value::String(model.to_owned()));
    }
    request(UPDATE_SESSION_SETTINGS, Value::Object(params))
}

/// A message from one agent (or operator) to another.
///
/// The wrapper text tells the receiving agent who is talking; the same
/// fields are appended to the coordination store's message log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentMessage {
    /// Sender name.
    pub from: String,
    /// Recipient name.
    pub to: String,
    /// Free-form body.
    pub content: String,
    /// Send time.
    pub timestamp: DateTime<Utc>,
}

impl AgentMessage {
    /// Stamp a new message with the current time.
    #[must_use]
    pub fn new(from: impl Into<String>, to: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    /// Render the message as the text of a user turn.
    #[must_use]
    pub fn format(&self) -> String {
        format!(
            "<MESSAGE from=\"{}\" to=\"{}\" timestamp=\"{}\">\n{}\n</MESSAGE>",
            self.from,
            self.to,
            self.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
            self.content
        )
    }

    /// The `add_user_message` envelope carrying this message.
    #[must_use]
    pub fn to_envelope(&self) -> Value {
        add_user_message(&self.format())
    }
}
