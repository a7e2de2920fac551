//! Delivery engine: outbound text with presence signaling and bounded retry.

use crate::address::ConversationId;
use crate::message::{self, Message, Sender};
use crate::transport::{Presence, TransportClient, TransportError};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("delivery to {conversation} failed after {attempts} attempts: {source}")]
    Failed {
        conversation: ConversationId,
        attempts: u32,
        #[source]
        source: TransportError,
    },
}

/// Fixed-delay retry policy for a single send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Pause between attempts.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(2),
        }
    }
}

#[derive(Clone)]
pub struct DeliveryEngine {
    transport: Arc<dyn TransportClient>,
    policy: RetryPolicy,
}

impl DeliveryEngine {
    pub fn new(transport: Arc<dyn TransportClient>, policy: RetryPolicy) -> Self {
        Self { transport, policy }
    }

    /// Deliver `text` to the conversation. Shows "composing" while sending and
    /// "available" afterwards; presence errors are logged only. Each retry is a new
    /// transport send. Returns the delivered message.
    pub async fn send(&self, conversation: &str, text: &str, sender: Sender) -> Result<Message, DeliveryError> {
        let to = ConversationId::normalize(conversation);
        self.presence(Presence::Composing, &to).await;
        let result = self.send_with_retry(&to, text).await;
        self.presence(Presence::Available, &to).await;
        let message_id = result?;
        log::info!("delivery: message sent to {}", to);
        Ok(Message::new(
            message_id.unwrap_or_else(message::generate_id),
            sender,
            message::now_secs(),
            text,
        ))
    }

    async fn send_with_retry(&self, to: &ConversationId, text: &str) -> Result<Option<String>, DeliveryError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.transport.send_message(to, text).await {
                Ok(receipt) => return Ok(receipt.message_id),
                Err(e) if attempt < max_attempts => {
                    log::warn!(
                        "delivery: attempt {}/{} to {} failed: {}",
                        attempt,
                        max_attempts,
                        to,
                        e
                    );
                    tokio::time::sleep(self.policy.delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    log::warn!("delivery: giving up on {} after {} attempts: {}", to, attempt, e);
                    return Err(DeliveryError::Failed {
                        conversation: to.clone(),
                        attempts: attempt,
                        source: e,
                    });
                }
            }
        }
    }

    /// Forward an agent's typing indicator as presence.
    pub async fn set_typing(&self, conversation: &str, typing: bool) {
        let to = ConversationId::normalize(conversation);
        let presence = if typing {
            Presence::Composing
        } else {
            Presence::Available
        };
        self.presence(presence, &to).await;
    }

    async fn presence(&self, presence: Presence, to: &ConversationId) {
        if let Err(e) = self.transport.send_presence(presence, to).await {
            log::debug!("delivery: presence {} for {} failed: {}", presence.as_str(), to, e);
        }
    }
}
