//! Messaging transport capability.
//!
//! The transport client owns the messaging protocol (sessions, encryption, framing).
//! The engine only sees the [`TransportClient`] trait and the [`TransportEvent`]s the
//! client pushes on the channel it was built with.

mod memory;
mod sidecar;

pub use memory::{MemoryTransport, TransportCall};
pub use sidecar::SidecarTransport;

use crate::address::ConversationId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Opaque session credentials, persisted by the credential store.
pub type Credentials = serde_json::Value;

/// Status code the protocol uses for an explicit logout.
pub const LOGGED_OUT_STATUS: u16 = 401;
/// Status code the protocol uses when another client replaced this session.
pub const CONFLICT_STATUS: u16 = 440;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport not connected")]
    NotConnected,
    #[error("transport connection failed: {0}")]
    Connect(String),
    #[error("transport request failed: {0}")]
    Request(String),
    #[error("transport closed")]
    Closed,
}

/// Presence shown to the remote participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Presence {
    Composing,
    Available,
}

impl Presence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Presence::Composing => "composing",
            Presence::Available => "available",
        }
    }
}

/// Why the transport connection closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectCause {
    /// The account was logged out from the phone or server.
    LoggedOut,
    /// Another client took over the session.
    Conflict,
    /// Closed by the server with some other status code.
    Status(u16),
    /// Socket or network failure.
    Network(String),
}

impl DisconnectCause {
    pub fn from_status(code: u16) -> Self {
        match code {
            LOGGED_OUT_STATUS => DisconnectCause::LoggedOut,
            CONFLICT_STATUS => DisconnectCause::Conflict,
            other => DisconnectCause::Status(other),
        }
    }

    /// Fatal causes stop the connection for good; everything else is retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DisconnectCause::LoggedOut | DisconnectCause::Conflict)
    }
}

impl std::fmt::Display for DisconnectCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisconnectCause::LoggedOut => write!(f, "logged out"),
            DisconnectCause::Conflict => write!(f, "session conflict"),
            DisconnectCause::Status(code) => write!(f, "closed with status {}", code),
            DisconnectCause::Network(e) => write!(f, "network failure: {}", e),
        }
    }
}

/// A text message received from a participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Raw sender address as reported by the transport (normalized by the router).
    pub from: String,
    pub message_id: String,
    pub text: String,
    /// Unix seconds.
    pub timestamp: i64,
}

/// Events pushed by the transport client.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Inbound(InboundMessage),
    ConnectionOpened,
    ConnectionClosed(DisconnectCause),
    CredentialsChanged(Credentials),
}

/// Result of a successful connect.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportSession {
    /// Own account address, when the transport reports it.
    pub account: Option<String>,
}

/// Result of a successful send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentReceipt {
    pub message_id: Option<String>,
}

/// A message from the transport's local message cache (used for history).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedMessage {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub from_me: bool,
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub content: CachedContent,
}

/// Payload of a cached message, reduced to what history display needs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "camelCase")]
pub enum CachedContent {
    /// Plain text, extended text, or the display text of a button/template reply.
    Text(String),
    /// A payload the engine does not render (media, stickers, ...). Holds the payload kind.
    Unsupported(String),
    /// The cache kept the key but not the payload.
    #[default]
    Missing,
}

/// Messaging transport client.
#[async_trait]
pub trait TransportClient: Send + Sync {
    /// Open a session. `None` credentials means the client provisions new ones (e.g. pairing).
    async fn connect(&self, credentials: Option<Credentials>) -> Result<TransportSession, TransportError>;

    /// Close the session.
    async fn disconnect(&self) -> Result<(), TransportError>;

    async fn send_message(&self, to: &ConversationId, text: &str) -> Result<SentReceipt, TransportError>;

    async fn send_presence(&self, presence: Presence, to: &ConversationId) -> Result<(), TransportError>;

    async fn mark_read(&self, conversation: &ConversationId, message_id: &str) -> Result<(), TransportError>;

    /// Most recent `limit` cached messages for the conversation, in any order.
    async fn load_messages(
        &self,
        conversation: &ConversationId,
        limit: usize,
    ) -> Result<Vec<CachedMessage>, TransportError>;
}
