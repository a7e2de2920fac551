//! Message router: decides who answers an inbound message.
//!
//! Precedence, first match wins:
//! 1. the conversation has an assigned agent: forward to that agent;
//! 2. the text contains the handoff keyword: announce the conversation to all agents;
//! 3. otherwise: the responder answers, or the fallback apology is sent.

use crate::address::ConversationId;
use crate::delivery::DeliveryEngine;
use crate::gateway::{ControlPlane, ServerEvent};
use crate::message::{AgentId, Message, Sender};
use crate::registry::ConversationRegistry;
use crate::responder::Responder;
use crate::transport::{InboundMessage, TransportClient};
use std::sync::Arc;

pub const DEFAULT_HANDOFF_KEYWORD: &str = "humano";
pub const DEFAULT_FALLBACK_REPLY: &str =
    "Sorry, I am having trouble processing your request. Please try again later.";

#[derive(Debug, Clone)]
pub struct RouterSettings {
    /// Matched case-insensitively anywhere in the text. Empty disables handoff requests.
    pub handoff_keyword: String,
    pub fallback_reply: String,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            handoff_keyword: DEFAULT_HANDOFF_KEYWORD.to_string(),
            fallback_reply: DEFAULT_FALLBACK_REPLY.to_string(),
        }
    }
}

/// Branch taken for one inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Empty text; nothing to do.
    Ignored,
    ForwardedToAgent(AgentId),
    HandoffRequested,
    AutoReplied,
    /// The responder failed and the apology went out instead.
    FallbackReplied,
    /// No reply reached the user (delivery failed).
    ReplyFailed,
}

#[derive(Clone)]
pub struct MessageRouter {
    registry: ConversationRegistry,
    control: Arc<dyn ControlPlane>,
    transport: Arc<dyn TransportClient>,
    responder: Arc<dyn Responder>,
    delivery: DeliveryEngine,
    settings: RouterSettings,
}

impl MessageRouter {
    pub fn new(
        registry: ConversationRegistry,
        control: Arc<dyn ControlPlane>,
        transport: Arc<dyn TransportClient>,
        responder: Arc<dyn Responder>,
        delivery: DeliveryEngine,
        settings: RouterSettings,
    ) -> Self {
        Self {
            registry,
            control,
            transport,
            responder,
            delivery,
            settings,
        }
    }

    /// Route one inbound message. Never fails; problems are logged and named in the outcome.
    pub async fn route(&self, inbound: InboundMessage) -> RouteOutcome {
        let text = inbound.text.trim();
        if text.is_empty() {
            log::debug!("router: ignoring empty message from {}", inbound.from);
            return RouteOutcome::Ignored;
        }
        let conversation = ConversationId::normalize(&inbound.from);

        if let Some(agent) = self.registry.lookup(&conversation).await {
            self.forward(&conversation, &agent, &inbound).await;
            return RouteOutcome::ForwardedToAgent(agent);
        }

        if self.wants_human(text) {
            log::info!("router: {} asked for a human agent", conversation);
            self.control
                .broadcast(ServerEvent::NewConversation {
                    conversation_id: conversation,
                })
                .await;
            return RouteOutcome::HandoffRequested;
        }

        let (reply, outcome) = match self.responder.complete(text).await {
            Ok(reply) => (reply, RouteOutcome::AutoReplied),
            Err(e) => {
                log::warn!("router: responder failed for {}: {}", conversation, e);
                (self.settings.fallback_reply.clone(), RouteOutcome::FallbackReplied)
            }
        };
        match self
            .delivery
            .send(conversation.as_str(), &reply, Sender::Automated)
            .await
        {
            Ok(_) => outcome,
            Err(e) => {
                log::warn!("router: automated reply lost: {}", e);
                RouteOutcome::ReplyFailed
            }
        }
    }

    fn wants_human(&self, text: &str) -> bool {
        let keyword = self.settings.handoff_keyword.trim();
        !keyword.is_empty() && text.to_lowercase().contains(&keyword.to_lowercase())
    }

    async fn forward(&self, conversation: &ConversationId, agent: &str, inbound: &InboundMessage) {
        let message = Message::new(
            inbound.message_id.clone(),
            Sender::User,
            inbound.timestamp,
            inbound.text.trim(),
        );
        let pushed = self
            .control
            .send_to(
                agent,
                ServerEvent::UserMessage {
                    conversation_id: conversation.clone(),
                    message,
                },
            )
            .await;
        if pushed {
            log::debug!("router: forwarded message for {} to agent {}", conversation, agent);
        } else {
            log::warn!(
                "router: agent {} owning {} is not connected; message not forwarded",
                agent,
                conversation
            );
        }
        if let Err(e) = self.transport.mark_read(conversation, &inbound.message_id).await {
            log::debug!("router: mark read for {} failed: {}", conversation, e);
        }
    }
}
