//! In-memory transport: records every call and replays scripted failures.
//!
//! Used by tests and for running the gateway without a protocol sidecar.

use crate::address::ConversationId;
use crate::transport::{
    CachedMessage, Credentials, Presence, SentReceipt, TransportClient, TransportError,
    TransportEvent, TransportSession,
};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use tokio::sync::{mpsc, Mutex};

/// One recorded transport call.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportCall {
    Connect(Option<Credentials>),
    Disconnect,
    SendMessage { to: ConversationId, text: String },
    SendPresence { to: ConversationId, presence: Presence },
    MarkRead { conversation: ConversationId, message_id: String },
    LoadMessages { conversation: ConversationId, limit: usize },
}

#[derive(Default)]
struct MemoryState {
    calls: Vec<TransportCall>,
    connect_failures: VecDeque<String>,
    send_failures: usize,
    history: HashMap<ConversationId, Vec<CachedMessage>>,
    history_error: Option<String>,
    next_id: u64,
}

#[derive(Default)]
pub struct MemoryTransport {
    state: Mutex<MemoryState>,
    events_tx: Option<mpsc::Sender<TransportEvent>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the event channel so [`MemoryTransport::emit`] can push events to the engine.
    pub fn with_events(mut self, events_tx: mpsc::Sender<TransportEvent>) -> Self {
        self.events_tx = Some(events_tx);
        self
    }

    /// Push an event as if it came from the protocol. Returns false when no receiver is attached.
    pub async fn emit(&self, event: TransportEvent) -> bool {
        match &self.events_tx {
            Some(tx) => tx.send(event).await.is_ok(),
            None => false,
        }
    }

    /// The next `n` connect calls fail with `reason`.
    pub async fn fail_next_connects(&self, n: usize, reason: &str) {
        let mut s = self.state.lock().await;
        for _ in 0..n {
            s.connect_failures.push_back(reason.to_string());
        }
    }

    /// The next `n` send_message calls fail.
    pub async fn fail_next_sends(&self, n: usize) {
        self.state.lock().await.send_failures = n;
    }

    /// Seed the message cache for a conversation.
    pub async fn set_history(&self, conversation: &ConversationId, messages: Vec<CachedMessage>) {
        self.state
            .lock()
            .await
            .history
            .insert(conversation.clone(), messages);
    }

    /// Make load_messages fail with `reason`.
    pub async fn fail_history(&self, reason: &str) {
        self.state.lock().await.history_error = Some(reason.to_string());
    }

    pub async fn calls(&self) -> Vec<TransportCall> {
        self.state.lock().await.calls.clone()
    }

    /// Texts sent to a conversation, in order (one entry per attempt).
    pub async fn sent_to(&self, to: &ConversationId) -> Vec<String> {
        self.state
            .lock()
            .await
            .calls
            .iter()
            .filter_map(|c| match c {
                TransportCall::SendMessage { to: t, text } if t == to => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    pub async fn connect_count(&self) -> usize {
        self.state
            .lock()
            .await
            .calls
            .iter()
            .filter(|c| matches!(c, TransportCall::Connect(_)))
            .count()
    }
}

#[async_trait]
impl TransportClient for MemoryTransport {
    async fn connect(&self, credentials: Option<Credentials>) -> Result<TransportSession, TransportError> {
        let mut s = self.state.lock().await;
        s.calls.push(TransportCall::Connect(credentials));
        if let Some(reason) = s.connect_failures.pop_front() {
            return Err(TransportError::Connect(reason));
        }
        Ok(TransportSession {
            account: Some("memory".to_string()),
        })
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.state.lock().await.calls.push(TransportCall::Disconnect);
        Ok(())
    }

    async fn send_message(&self, to: &ConversationId, text: &str) -> Result<SentReceipt, TransportError> {
        log::info!("memory transport: message to {}: {}", to, text);
        let mut s = self.state.lock().await;
        s.calls.push(TransportCall::SendMessage {
            to: to.clone(),
            text: text.to_string(),
        });
        if s.send_failures > 0 {
            s.send_failures -= 1;
            return Err(TransportError::Request("scripted send failure".to_string()));
        }
        s.next_id += 1;
        Ok(SentReceipt {
            message_id: Some(format!("mem-{}", s.next_id)),
        })
    }

    async fn send_presence(&self, presence: Presence, to: &ConversationId) -> Result<(), TransportError> {
        self.state.lock().await.calls.push(TransportCall::SendPresence {
            to: to.clone(),
            presence,
        });
        Ok(())
    }

    async fn mark_read(&self, conversation: &ConversationId, message_id: &str) -> Result<(), TransportError> {
        self.state.lock().await.calls.push(TransportCall::MarkRead {
            conversation: conversation.clone(),
            message_id: message_id.to_string(),
        });
        Ok(())
    }

    async fn load_messages(
        &self,
        conversation: &ConversationId,
        limit: usize,
    ) -> Result<Vec<CachedMessage>, TransportError> {
        let mut s = self.state.lock().await;
        s.calls.push(TransportCall::LoadMessages {
            conversation: conversation.clone(),
            limit,
        });
        if let Some(ref reason) = s.history_error {
            return Err(TransportError::Request(reason.clone()));
        }
        let all = s.history.get(conversation).cloned().unwrap_or_default();
        let skip = all.len().saturating_sub(limit);
        Ok(all.into_iter().skip(skip).collect())
    }
}
