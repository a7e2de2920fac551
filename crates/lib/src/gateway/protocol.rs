//! Control-plane WebSocket protocol.
//!
//! Every frame, in both directions, is `{ "type": "event", "event": <name>, "payload": {..} }`
//! with camelCase payload keys.

use crate::address::ConversationId;
use crate::message::{AgentId, Message};
use serde::{Deserialize, Serialize};

pub const PROTOCOL_VERSION: u32 = 1;

const FRAME_TYPE: &str = "event";

/// Events pushed from the gateway to agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    /// First frame after a successful connect.
    #[serde(rename_all = "camelCase")]
    Hello { agent_id: AgentId, protocol: u32 },
    #[serde(rename_all = "camelCase")]
    ConversationHistory {
        conversation_id: ConversationId,
        messages: Vec<Message>,
    },
    #[serde(rename_all = "camelCase")]
    ConversationTaken {
        conversation_id: ConversationId,
        agent_id: AgentId,
    },
    #[serde(rename_all = "camelCase")]
    ConversationClosed { conversation_id: ConversationId },
    #[serde(rename_all = "camelCase")]
    UserMessage {
        conversation_id: ConversationId,
        message: Message,
    },
    #[serde(rename_all = "camelCase")]
    NewConversation { conversation_id: ConversationId },
    #[serde(rename_all = "camelCase")]
    MessageSentConfirmation {
        success: bool,
        conversation_id: ConversationId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<Message>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<String>,
    },
    Shutdown {},
}

impl ServerEvent {
    pub fn error(message: impl Into<String>, details: Option<String>) -> Self {
        ServerEvent::Error {
            message: message.into(),
            details,
        }
    }

    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::Hello { .. } => "hello",
            ServerEvent::ConversationHistory { .. } => "conversation_history",
            ServerEvent::ConversationTaken { .. } => "conversation_taken",
            ServerEvent::ConversationClosed { .. } => "conversation_closed",
            ServerEvent::UserMessage { .. } => "user_message",
            ServerEvent::NewConversation { .. } => "new_conversation",
            ServerEvent::MessageSentConfirmation { .. } => "message_sent_confirmation",
            ServerEvent::Error { .. } => "error",
            ServerEvent::Shutdown {} => "shutdown",
        }
    }

    /// Serialized text frame.
    pub fn to_frame(&self) -> String {
        let mut value = serde_json::to_value(self).unwrap_or_else(|_| {
            serde_json::json!({ "event": self.name(), "payload": {} })
        });
        if let Some(obj) = value.as_object_mut() {
            obj.insert("type".to_string(), serde_json::Value::from(FRAME_TYPE));
        }
        value.to_string()
    }
}

/// Events sent by agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Must be the first frame. `token` is checked when the gateway requires one.
    Connect {
        #[serde(default)]
        token: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    TakeConversation { conversation_id: String },
    #[serde(rename_all = "camelCase")]
    AgentMessage {
        conversation_id: String,
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    CloseConversation { conversation_id: String },
    #[serde(rename_all = "camelCase")]
    AgentTypingStatus {
        conversation_id: String,
        is_typing: bool,
    },
}

impl ClientEvent {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_frame(&self) -> String {
        let mut value = serde_json::to_value(self).unwrap_or_default();
        if let Some(obj) = value.as_object_mut() {
            obj.insert("type".to_string(), serde_json::Value::from(FRAME_TYPE));
        }
        value.to_string()
    }
}
