//! Conversation registry: conversation id -> assigned agent, with atomic claim/release.
//!
//! The only owner of the assignment map. Claims are check-and-set under a single write
//! lock so two agents claiming the same conversation at once cannot both win.

use crate::address::ConversationId;
use crate::message::AgentId;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// In-memory assignment map. Cheap to clone; clones share the same map.
#[derive(Clone)]
pub struct ConversationRegistry {
    inner: Arc<RwLock<HashMap<ConversationId, AgentId>>>,
}

impl Default for ConversationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Assign `agent` unless the conversation already has an agent. Returns false (and
    /// changes nothing) when it was already assigned.
    pub async fn try_assign(&self, conversation: &ConversationId, agent: &str) -> bool {
        let mut g = self.inner.write().await;
        if let Some(current) = g.get(conversation) {
            log::debug!(
                "registry: {} already assigned to {}, rejecting {}",
                conversation,
                current,
                agent
            );
            return false;
        }
        g.insert(conversation.clone(), agent.to_string());
        log::info!("registry: {} assigned to {}", conversation, agent);
        true
    }

    pub async fn is_assigned(&self, conversation: &ConversationId) -> bool {
        self.inner.read().await.contains_key(conversation)
    }

    /// Clear the assignment. Releasing an unassigned conversation is a no-op.
    pub async fn release(&self, conversation: &ConversationId) {
        if let Some(agent) = self.inner.write().await.remove(conversation) {
            log::info!("registry: {} released by {}", conversation, agent);
        }
    }

    pub async fn lookup(&self, conversation: &ConversationId) -> Option<AgentId> {
        self.inner.read().await.get(conversation).cloned()
    }

    /// Conversations currently assigned to `agent`.
    pub async fn assigned_to(&self, agent: &str) -> Vec<ConversationId> {
        let g = self.inner.read().await;
        let mut ids: Vec<ConversationId> = g
            .iter()
            .filter(|(_, a)| a.as_str() == agent)
            .map(|(c, _)| c.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Number of assigned conversations.
    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}
