//! Inter-agent message log entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One entry of a workspace's append-only message log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    /// Store-assigned id; defines the order of the log.
    pub id: i64,
    /// Repository scope.
    pub repo: String,
    /// Pull request scope.
    pub pr_number: String,
    /// Sender.
    pub from_agent: String,
    /// Recipient.
    pub to_agent: String,
    /// Body as sent.
    pub content: String,
    /// Send time.
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Whether `agent` is either endpoint of this message.
    #[must_use]
    pub fn involves(&self, agent: &str) -> bool {
        self.from_agent == agent || self.to_agent == agent
    }
}
