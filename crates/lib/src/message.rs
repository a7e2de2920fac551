//! Conversation messages as shown to agents (history, confirmations).

use serde::{Deserialize, Serialize};

/// Opaque agent connection id (one per control-plane WebSocket).
pub type AgentId = String;

/// Who produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    Automated,
    Agent,
}

/// Immutable message record. Fields are private so a message cannot change after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    id: String,
    sender: Sender,
    /// Unix seconds.
    timestamp: i64,
    content: String,
}

impl Message {
    pub fn new(id: impl Into<String>, sender: Sender, timestamp: i64, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            sender,
            timestamp,
            content: content.into(),
        }
    }

    /// New message with a generated id and the current time.
    pub fn now(sender: Sender, content: impl Into<String>) -> Self {
        Self::new(generate_id(), sender, now_secs(), content)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn sender(&self) -> Sender {
        self.sender
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn content(&self) -> &str {
        &self.content
    }
}

pub(crate) fn generate_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub(crate) fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}
