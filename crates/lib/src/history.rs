//! History store adapter: recent messages of a conversation from the transport cache.
//!
//! Best effort. Any failure yields an empty history so a claim is never blocked by it.

use crate::address::ConversationId;
use crate::message::{self, Message, Sender};
use crate::transport::{CachedContent, CachedMessage, TransportClient};
use std::sync::Arc;

pub const DEFAULT_HISTORY_LIMIT: usize = 100;

const CONTENT_MISSING: &str = "message unavailable";
const CONTENT_UNSUPPORTED: &str = "unsupported content";

#[derive(Clone)]
pub struct HistoryStore {
    transport: Arc<dyn TransportClient>,
}

impl HistoryStore {
    pub fn new(transport: Arc<dyn TransportClient>) -> Self {
        Self { transport }
    }

    /// Newest `limit` messages, oldest first. Marks the newest one as read.
    pub async fn load(&self, conversation: &ConversationId, limit: usize) -> Vec<Message> {
        let cached = match self.transport.load_messages(conversation, limit).await {
            Ok(c) => c,
            Err(e) => {
                log::warn!("history: loading {} failed: {}", conversation, e);
                return Vec::new();
            }
        };
        // Keep the transport's own id next to each message; generated ids are never marked read.
        let mut entries: Vec<(Option<String>, Message)> = cached
            .into_iter()
            .map(|c| (c.id.clone(), normalize(c)))
            .collect();
        // Stable: equal timestamps keep cache order.
        entries.sort_by_key(|(_, m)| m.timestamp());
        if entries.len() > limit {
            entries.drain(..entries.len() - limit);
        }
        log::debug!("history: {} message(s) for {}", entries.len(), conversation);

        match entries.last() {
            Some((Some(newest), _)) => {
                if let Err(e) = self.transport.mark_read(conversation, newest).await {
                    log::debug!("history: mark read for {} failed: {}", conversation, e);
                }
            }
            Some((None, _)) => {
                log::debug!("history: newest message of {} has no id, not marking read", conversation);
            }
            None => {}
        }
        entries.into_iter().map(|(_, m)| m).collect()
    }
}

fn normalize(cached: CachedMessage) -> Message {
    let sender = if cached.from_me {
        Sender::Automated
    } else {
        Sender::User
    };
    let content = match cached.content {
        CachedContent::Text(text) => text,
        CachedContent::Unsupported(kind) => {
            log::debug!("history: unsupported message kind {}", kind);
            CONTENT_UNSUPPORTED.to_string()
        }
        CachedContent::Missing => CONTENT_MISSING.to_string(),
    };
    Message::new(
        cached.id.unwrap_or_else(message::generate_id),
        sender,
        cached.timestamp.unwrap_or_else(message::now_secs),
        content,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryTransport, TransportCall};

    fn cached(id: &str, ts: i64, from_me: bool, content: CachedContent) -> CachedMessage {
        CachedMessage {
            id: Some(id.to_string()),
            from_me,
            timestamp: Some(ts),
            content,
        }
    }

    #[tokio::test]
    async fn returns_oldest_first_bounded_and_marks_newest_read() {
        let transport = Arc::new(MemoryTransport::new());
        let c = ConversationId::normalize("15551234567");
        transport
            .set_history(
                &c,
                vec![
                    cached("m3", 30, false, CachedContent::Text("third".into())),
                    cached("m1", 10, false, CachedContent::Text("first".into())),
                    cached("m2", 20, true, CachedContent::Text("second".into())),
                ],
            )
            .await;
        let history = HistoryStore::new(transport.clone()).load(&c, 2).await;
        // The cache returned its last two entries (m1, m2); they come back sorted.
        let ids: Vec<&str> = history.iter().map(|m| m.id()).collect();
        assert_eq!(ids, vec!["m1", "m2"]);
        assert_eq!(history[1].sender(), Sender::Automated);
        assert!(transport.calls().await.contains(&TransportCall::MarkRead {
            conversation: c.clone(),
            message_id: "m2".into(),
        }));
    }

    #[tokio::test]
    async fn newest_without_transport_id_is_not_marked_read() {
        let transport = Arc::new(MemoryTransport::new());
        let c = ConversationId::normalize("15551234567");
        transport
            .set_history(
                &c,
                vec![
                    cached("m1", 10, false, CachedContent::Text("first".into())),
                    CachedMessage {
                        id: None,
                        from_me: false,
                        timestamp: Some(20),
                        content: CachedContent::Text("second".into()),
                    },
                ],
            )
            .await;
        let history = HistoryStore::new(transport.clone()).load(&c, 100).await;
        assert_eq!(history.len(), 2);
        assert!(!history[1].id().is_empty());
        assert!(!transport
            .calls()
            .await
            .iter()
            .any(|call| matches!(call, TransportCall::MarkRead { .. })));
    }

    #[tokio::test]
    async fn failure_yields_empty_history() {
        let transport = Arc::new(MemoryTransport::new());
        transport.fail_history("cache unavailable").await;
        let c = ConversationId::normalize("1");
        assert!(HistoryStore::new(transport.clone()).load(&c, 100).await.is_empty());
        assert!(!transport
            .calls()
            .await
            .iter()
            .any(|call| matches!(call, TransportCall::MarkRead { .. })));
    }

    #[test]
    fn normalize_fills_placeholders() {
        let m = normalize(CachedMessage {
            id: None,
            from_me: false,
            timestamp: None,
            content: CachedContent::Missing,
        });
        assert_eq!(m.content(), CONTENT_MISSING);
        assert_eq!(m.sender(), Sender::User);
        assert!(!m.id().is_empty());
        assert!(m.timestamp() > 0);

        let m = normalize(cached("x", 1, false, CachedContent::Unsupported("imageMessage".into())));
        assert_eq!(m.content(), CONTENT_UNSUPPORTED);
    }
}
