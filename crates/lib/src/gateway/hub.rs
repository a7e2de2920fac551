//! Agent hub: one outbound queue per connected agent.

use crate::gateway::protocol::ServerEvent;
use crate::message::AgentId;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

/// Push side of the control plane, as seen by the router and the desk.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Deliver to one agent. False when the agent is not connected.
    async fn send_to(&self, agent: &str, event: ServerEvent) -> bool;
    async fn broadcast(&self, event: ServerEvent);
    async fn broadcast_except(&self, agent: &str, event: ServerEvent);
}

/// Registry of connected agents (agent id -> socket writer queue).
#[derive(Clone, Default)]
pub struct AgentHub {
    agents: Arc<RwLock<HashMap<AgentId, mpsc::UnboundedSender<ServerEvent>>>>,
}

impl AgentHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new agent connection; the receiver feeds its socket.
    pub async fn register(&self, agent: &str) -> mpsc::UnboundedReceiver<ServerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.agents.write().await.insert(agent.to_string(), tx);
        log::info!("hub: agent {} connected", agent);
        rx
    }

    pub async fn unregister(&self, agent: &str) {
        if self.agents.write().await.remove(agent).is_some() {
            log::info!("hub: agent {} disconnected", agent);
        }
    }

    pub async fn len(&self) -> usize {
        self.agents.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.agents.read().await.is_empty()
    }

    async fn fan_out(&self, skip: Option<&str>, event: ServerEvent) {
        let agents = self.agents.read().await;
        for (id, tx) in agents.iter() {
            if Some(id.as_str()) == skip {
                continue;
            }
            if tx.send(event.clone()).is_err() {
                log::debug!("hub: agent {} queue closed, dropping {}", id, event.name());
            }
        }
    }
}

#[async_trait]
impl ControlPlane for AgentHub {
    async fn send_to(&self, agent: &str, event: ServerEvent) -> bool {
        let agents = self.agents.read().await;
        match agents.get(agent) {
            Some(tx) => tx.send(event).is_ok(),
            None => {
                log::debug!("hub: agent {} not connected, dropping {}", agent, event.name());
                false
            }
        }
    }

    async fn broadcast(&self, event: ServerEvent) {
        self.fan_out(None, event).await;
    }

    async fn broadcast_except(&self, agent: &str, event: ServerEvent) {
        self.fan_out(Some(agent), event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::ConversationId;

    fn closed(n: &str) -> ServerEvent {
        ServerEvent::ConversationClosed {
            conversation_id: ConversationId::normalize(n),
        }
    }

    #[tokio::test]
    async fn send_to_reaches_only_the_target() {
        let hub = AgentHub::new();
        let mut a = hub.register("a").await;
        let mut b = hub.register("b").await;
        assert!(hub.send_to("a", closed("1")).await);
        assert_eq!(a.try_recv().unwrap(), closed("1"));
        assert!(b.try_recv().is_err());
        assert!(!hub.send_to("nobody", closed("1")).await);
    }

    #[tokio::test]
    async fn broadcast_except_skips_the_sender() {
        let hub = AgentHub::new();
        let mut a = hub.register("a").await;
        let mut b = hub.register("b").await;
        let mut c = hub.register("c").await;
        hub.broadcast_except("a", closed("2")).await;
        assert!(a.try_recv().is_err());
        assert_eq!(b.try_recv().unwrap(), closed("2"));
        assert_eq!(c.try_recv().unwrap(), closed("2"));

        hub.broadcast(closed("3")).await;
        assert_eq!(a.try_recv().unwrap(), closed("3"));
    }

    #[tokio::test]
    async fn unregister_removes_agent() {
        let hub = AgentHub::new();
        let _a = hub.register("a").await;
        assert_eq!(hub.len().await, 1);
        hub.unregister("a").await;
        assert!(hub.is_empty().await);
        assert!(!hub.send_to("a", closed("1")).await);
    }
}
