//! Agent desk: the operations agents drive over the control plane.
//!
//! Every fallible operation answers the requesting agent with an explicit outcome event
//! (`error` for claims, `message_sent_confirmation` for replies).

use crate::address::ConversationId;
use crate::delivery::DeliveryEngine;
use crate::gateway::{ControlPlane, ServerEvent};
use crate::handoff::HandoffCoordinator;
use crate::history::{HistoryStore, DEFAULT_HISTORY_LIMIT};
use crate::message::{AgentId, Message, Sender};
use crate::registry::ConversationRegistry;
use std::sync::Arc;

pub const DEFAULT_HANDOFF_ACKNOWLEDGEMENT: &str =
    "Le he informado a un agente humano, dentro de poco te escribirá, hasta luego";

#[derive(Debug, Clone)]
pub struct DeskSettings {
    pub history_limit: usize,
    /// Sent to the user once an agent has claimed the conversation.
    pub handoff_acknowledgement: String,
}

impl Default for DeskSettings {
    fn default() -> Self {
        Self {
            history_limit: DEFAULT_HISTORY_LIMIT,
            handoff_acknowledgement: DEFAULT_HANDOFF_ACKNOWLEDGEMENT.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The agent now owns the conversation. `acknowledged` is false when the
    /// notice to the user could not be delivered.
    Claimed { acknowledged: bool },
    /// Another claim (or an earlier one) already holds the conversation.
    Conflict { owner: Option<AgentId> },
    /// A claim for the same conversation was still running; this one was dropped.
    Dropped,
    /// The id carries no phone number.
    Invalid,
}

#[derive(Clone)]
pub struct AgentDesk {
    registry: ConversationRegistry,
    coordinator: HandoffCoordinator,
    history: HistoryStore,
    delivery: DeliveryEngine,
    control: Arc<dyn ControlPlane>,
    settings: DeskSettings,
}

impl AgentDesk {
    pub fn new(
        registry: ConversationRegistry,
        history: HistoryStore,
        delivery: DeliveryEngine,
        control: Arc<dyn ControlPlane>,
        settings: DeskSettings,
    ) -> Self {
        Self {
            registry,
            coordinator: HandoffCoordinator::new(),
            history,
            delivery,
            control,
            settings,
        }
    }

    /// `take_conversation`: claim, send history to the claimant, tell the other agents,
    /// then notify the user.
    pub async fn take_conversation(&self, agent: &str, raw_conversation: &str) -> ClaimOutcome {
        let conversation = ConversationId::normalize(raw_conversation);
        if conversation.number().is_empty() {
            log::warn!("desk: agent {} tried to take invalid id {:?}", agent, raw_conversation);
            self.control
                .send_to(
                    agent,
                    ServerEvent::error("invalid conversation id", Some(raw_conversation.to_string())),
                )
                .await;
            return ClaimOutcome::Invalid;
        }
        match self
            .coordinator
            .guard(&conversation, || self.claim(agent, &conversation))
            .await
        {
            Some(outcome) => outcome,
            None => {
                log::info!(
                    "desk: claim of {} by {} dropped, another claim is in flight",
                    conversation,
                    agent
                );
                ClaimOutcome::Dropped
            }
        }
    }

    async fn claim(&self, agent: &str, conversation: &ConversationId) -> ClaimOutcome {
        if !self.registry.try_assign(conversation, agent).await {
            let owner = self.registry.lookup(conversation).await;
            log::info!(
                "desk: {} refused for {}, already assigned to {}",
                conversation,
                agent,
                owner.as_deref().unwrap_or("?")
            );
            self.control
                .send_to(
                    agent,
                    ServerEvent::error(
                        "conversation already assigned",
                        Some(conversation.to_string()),
                    ),
                )
                .await;
            return ClaimOutcome::Conflict { owner };
        }
        log::info!("desk: agent {} took {}", agent, conversation);

        let messages = self.history.load(conversation, self.settings.history_limit).await;
        self.control
            .send_to(
                agent,
                ServerEvent::ConversationHistory {
                    conversation_id: conversation.clone(),
                    messages,
                },
            )
            .await;
        self.control
            .broadcast_except(
                agent,
                ServerEvent::ConversationTaken {
                    conversation_id: conversation.clone(),
                    agent_id: agent.to_string(),
                },
            )
            .await;

        match self
            .delivery
            .send(
                conversation.as_str(),
                &self.settings.handoff_acknowledgement,
                Sender::Automated,
            )
            .await
        {
            Ok(_) => ClaimOutcome::Claimed { acknowledged: true },
            Err(e) => {
                log::warn!("desk: acknowledgement for {} not delivered: {}", conversation, e);
                self.control
                    .send_to(
                        agent,
                        ServerEvent::error("could not notify the user", Some(e.to_string())),
                    )
                    .await;
                ClaimOutcome::Claimed {
                    acknowledged: false,
                }
            }
        }
    }

    /// `agent_message`: deliver the agent's text. Refused when another agent owns the
    /// conversation. Always answers with `message_sent_confirmation`.
    pub async fn agent_message(&self, agent: &str, raw_conversation: &str, text: &str) -> bool {
        let conversation = ConversationId::normalize(raw_conversation);
        let refusal = if conversation.number().is_empty() {
            Some("invalid conversation id".to_string())
        } else if text.trim().is_empty() {
            Some("message is empty".to_string())
        } else {
            match self.registry.lookup(&conversation).await {
                Some(owner) if owner != agent => {
                    log::warn!(
                        "desk: agent {} tried to write to {} owned by {}",
                        agent,
                        conversation,
                        owner
                    );
                    Some("conversation is assigned to another agent".to_string())
                }
                _ => None,
            }
        };
        if let Some(error) = refusal {
            self.confirm(agent, conversation, Err(error)).await;
            return false;
        }

        match self.delivery.send(conversation.as_str(), text, Sender::Agent).await {
            Ok(message) => {
                self.confirm(agent, conversation, Ok(message)).await;
                true
            }
            Err(e) => {
                log::warn!("desk: reply from {} not delivered: {}", agent, e);
                self.confirm(agent, conversation, Err(e.to_string())).await;
                false
            }
        }
    }

    async fn confirm(
        &self,
        agent: &str,
        conversation: ConversationId,
        result: Result<Message, String>,
    ) {
        let event = match result {
            Ok(message) => ServerEvent::MessageSentConfirmation {
                success: true,
                conversation_id: conversation,
                message: Some(message),
                error: None,
            },
            Err(error) => ServerEvent::MessageSentConfirmation {
                success: false,
                conversation_id: conversation,
                message: None,
                error: Some(error),
            },
        };
        self.control.send_to(agent, event).await;
    }

    /// `close_conversation`: release the assignment and tell every agent.
    pub async fn close_conversation(&self, agent: &str, raw_conversation: &str) {
        let conversation = ConversationId::normalize(raw_conversation);
        self.registry.release(&conversation).await;
        log::info!("desk: {} closed by agent {}", conversation, agent);
        self.control
            .broadcast(ServerEvent::ConversationClosed {
                conversation_id: conversation,
            })
            .await;
    }

    /// `agent_typing_status`: mirror the agent's typing state as user-visible presence.
    pub async fn set_typing(&self, raw_conversation: &str, typing: bool) {
        self.delivery.set_typing(raw_conversation, typing).await;
    }

    /// Agent connection went away. Assignments are kept until closed explicitly.
    pub async fn agent_disconnected(&self, agent: &str) {
        let owned = self.registry.assigned_to(agent).await;
        if !owned.is_empty() {
            log::info!(
                "desk: agent {} left with {} open conversation(s); they stay assigned",
                agent,
                owned.len()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::RetryPolicy;
    use crate::gateway::AgentHub;
    use crate::transport::{CachedContent, CachedMessage, MemoryTransport, Presence, TransportCall};
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Fixture {
        desk: AgentDesk,
        registry: ConversationRegistry,
        hub: AgentHub,
        transport: Arc<MemoryTransport>,
    }

    fn fixture() -> Fixture {
        let registry = ConversationRegistry::new();
        let hub = AgentHub::new();
        let transport = Arc::new(MemoryTransport::new());
        let delivery = DeliveryEngine::new(
            transport.clone(),
            RetryPolicy {
                max_attempts: 3,
                delay: Duration::ZERO,
            },
        );
        let desk = AgentDesk::new(
            registry.clone(),
            HistoryStore::new(transport.clone()),
            delivery,
            Arc::new(hub.clone()),
            DeskSettings::default(),
        );
        Fixture {
            desk,
            registry,
            hub,
            transport,
        }
    }

    fn drain(rx: &mut UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut out = Vec::new();
        while let Ok(e) = rx.try_recv() {
            out.push(e);
        }
        out
    }

    #[tokio::test]
    async fn claim_sends_history_announces_and_acknowledges() {
        let f = fixture();
        let c = ConversationId::normalize("15551234567");
        f.transport
            .set_history(
                &c,
                vec![CachedMessage {
                    id: Some("h1".into()),
                    from_me: false,
                    timestamp: Some(5),
                    content: CachedContent::Text("necesito un humano".into()),
                }],
            )
            .await;
        let mut a = f.hub.register("a").await;
        let mut b = f.hub.register("b").await;

        let outcome = f.desk.take_conversation("a", "+1 (555) 123-4567").await;
        assert_eq!(outcome, ClaimOutcome::Claimed { acknowledged: true });
        assert_eq!(f.registry.lookup(&c).await.as_deref(), Some("a"));

        let to_a = drain(&mut a);
        assert_eq!(to_a.len(), 1);
        match &to_a[0] {
            ServerEvent::ConversationHistory { conversation_id, messages } => {
                assert_eq!(conversation_id, &c);
                assert_eq!(messages.len(), 1);
                assert_eq!(messages[0].content(), "necesito un humano");
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(
            drain(&mut b),
            vec![ServerEvent::ConversationTaken {
                conversation_id: c.clone(),
                agent_id: "a".into(),
            }]
        );
        assert_eq!(
            f.transport.sent_to(&c).await,
            vec![DEFAULT_HANDOFF_ACKNOWLEDGEMENT.to_string()]
        );
    }

    #[tokio::test]
    async fn second_claim_is_refused_with_error_event() {
        let f = fixture();
        let _a = f.hub.register("a").await;
        let mut b = f.hub.register("b").await;
        f.desk.take_conversation("a", "1").await;
        drain(&mut b);

        let outcome = f.desk.take_conversation("b", "1").await;
        assert_eq!(
            outcome,
            ClaimOutcome::Conflict {
                owner: Some("a".into())
            }
        );
        let events = drain(&mut b);
        assert!(matches!(&events[..], [ServerEvent::Error { .. }]));
        assert_eq!(
            f.registry.lookup(&ConversationId::normalize("1")).await.as_deref(),
            Some("a")
        );
    }

    #[tokio::test]
    async fn concurrent_claims_run_the_claim_once() {
        let f = fixture();
        let _a = f.hub.register("a").await;
        let _b = f.hub.register("b").await;
        let (first, second) = tokio::join!(
            f.desk.take_conversation("a", "15551234567"),
            f.desk.take_conversation("b", "15551234567"),
        );
        let claimed = [&first, &second]
            .iter()
            .filter(|o| matches!(o, ClaimOutcome::Claimed { .. }))
            .count();
        assert_eq!(claimed, 1);
        // Exactly one history load and one acknowledgement happened.
        let calls = f.transport.calls().await;
        let loads = calls
            .iter()
            .filter(|c| matches!(c, TransportCall::LoadMessages { .. }))
            .count();
        assert_eq!(loads, 1);
        assert_eq!(
            f.transport
                .sent_to(&ConversationId::normalize("15551234567"))
                .await
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn failed_acknowledgement_keeps_claim_and_reports_error() {
        let f = fixture();
        let mut a = f.hub.register("a").await;
        f.transport.fail_next_sends(3).await;
        let outcome = f.desk.take_conversation("a", "1").await;
        assert_eq!(outcome, ClaimOutcome::Claimed { acknowledged: false });
        let events = drain(&mut a);
        assert!(matches!(events.last(), Some(ServerEvent::Error { .. })));
        assert!(f.registry.is_assigned(&ConversationId::normalize("1")).await);
    }

    #[tokio::test]
    async fn claim_of_id_without_digits_is_refused() {
        let f = fixture();
        let mut a = f.hub.register("a").await;
        let mut b = f.hub.register("b").await;

        assert_eq!(f.desk.take_conversation("a", "abc").await, ClaimOutcome::Invalid);
        assert!(matches!(drain(&mut a).as_slice(), [ServerEvent::Error { .. }]));
        assert!(drain(&mut b).is_empty());
        assert_eq!(f.registry.len().await, 0);
        assert!(f.transport.calls().await.is_empty());

        assert!(!f.desk.agent_message("a", "abc", "hola").await);
        assert!(matches!(
            drain(&mut a).as_slice(),
            [ServerEvent::MessageSentConfirmation { success: false, .. }]
        ));
        assert!(f.transport.calls().await.is_empty());
    }

    #[tokio::test]
    async fn agent_message_confirms_success() {
        let f = fixture();
        let mut a = f.hub.register("a").await;
        f.desk.take_conversation("a", "1").await;
        drain(&mut a);

        assert!(f.desk.agent_message("a", "1", "hola, soy Ana").await);
        match drain(&mut a).as_slice() {
            [ServerEvent::MessageSentConfirmation {
                success: true,
                message: Some(m),
                ..
            }] => {
                assert_eq!(m.content(), "hola, soy Ana");
                assert_eq!(m.sender(), Sender::Agent);
            }
            other => panic!("unexpected events {:?}", other),
        }
    }

    #[tokio::test]
    async fn agent_message_failure_is_confirmed_as_failed() {
        let f = fixture();
        let mut a = f.hub.register("a").await;
        f.transport.fail_next_sends(3).await;
        assert!(!f.desk.agent_message("a", "1", "hola").await);
        assert!(matches!(
            drain(&mut a).as_slice(),
            [ServerEvent::MessageSentConfirmation {
                success: false,
                error: Some(_),
                ..
            }]
        ));
    }

    #[tokio::test]
    async fn agent_message_to_someone_elses_conversation_is_refused() {
        let f = fixture();
        let _a = f.hub.register("a").await;
        let mut b = f.hub.register("b").await;
        f.desk.take_conversation("a", "1").await;
        drain(&mut b);
        let sent_before = f.transport.sent_to(&ConversationId::normalize("1")).await.len();

        assert!(!f.desk.agent_message("b", "1", "hola").await);
        assert!(matches!(
            drain(&mut b).as_slice(),
            [ServerEvent::MessageSentConfirmation { success: false, .. }]
        ));
        assert_eq!(
            f.transport.sent_to(&ConversationId::normalize("1")).await.len(),
            sent_before
        );
    }

    #[tokio::test]
    async fn close_releases_and_notifies_everyone() {
        let f = fixture();
        let mut a = f.hub.register("a").await;
        let mut b = f.hub.register("b").await;
        f.desk.take_conversation("a", "1").await;
        drain(&mut a);
        drain(&mut b);

        f.desk.close_conversation("a", "1").await;
        let c = ConversationId::normalize("1");
        assert!(!f.registry.is_assigned(&c).await);
        let closed = ServerEvent::ConversationClosed { conversation_id: c };
        assert_eq!(drain(&mut a), vec![closed.clone()]);
        assert_eq!(drain(&mut b), vec![closed]);

        assert_eq!(
            f.desk.take_conversation("b", "1").await,
            ClaimOutcome::Claimed { acknowledged: true }
        );
    }

    #[tokio::test]
    async fn disconnect_keeps_assignments() {
        let f = fixture();
        let _a = f.hub.register("a").await;
        f.desk.take_conversation("a", "1").await;
        f.hub.unregister("a").await;
        f.desk.agent_disconnected("a").await;
        assert_eq!(
            f.registry.lookup(&ConversationId::normalize("1")).await.as_deref(),
            Some("a")
        );
    }

    #[tokio::test]
    async fn typing_maps_to_presence() {
        let f = fixture();
        f.desk.set_typing("1", true).await;
        f.desk.set_typing("1", false).await;
        let c = ConversationId::normalize("1");
        assert_eq!(
            f.transport.calls().await,
            vec![
                TransportCall::SendPresence { to: c.clone(), presence: Presence::Composing },
                TransportCall::SendPresence { to: c, presence: Presence::Available },
            ]
        );
    }
}
