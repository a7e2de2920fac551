//! Sidecar transport: talks to a messaging-protocol sidecar over a local WebSocket.
//!
//! The sidecar owns the protocol session (pairing, encryption, multi-device sync) and
//! exchanges JSON frames with us: requests `{type:"req",id,method,params}`, responses
//! `{type:"res",id,ok,payload|error}` and events `{type:"event",event,payload}`.

use crate::address::ConversationId;
use crate::transport::{
    CachedMessage, Credentials, DisconnectCause, InboundMessage, Presence, SentReceipt,
    TransportClient, TransportError, TransportEvent, TransportSession,
};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;

/// Wire request: `{ "type": "req", "id", "method", "params" }`.
#[derive(Debug, Clone, Serialize)]
struct SidecarRequest<'a> {
    #[serde(rename = "type")]
    typ: &'static str,
    id: String,
    method: &'a str,
    params: serde_json::Value,
}

/// Any frame from the sidecar: a response (`res`) or an event.
#[derive(Debug, Clone, Deserialize)]
struct SidecarFrame {
    #[serde(rename = "type")]
    typ: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    payload: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    event: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageEventPayload {
    from: String,
    id: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    timestamp: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectionEventPayload {
    state: String,
    #[serde(default)]
    status_code: Option<u16>,
    #[serde(default)]
    reason: Option<String>,
}

type Pending = Arc<Mutex<HashMap<String, oneshot::Sender<SidecarFrame>>>>;

/// One socket to the sidecar.
struct SidecarLink {
    out_tx: mpsc::UnboundedSender<Message>,
    pending: Pending,
    next_id: AtomicU64,
    /// Set when we close the socket ourselves, so the reader does not report a drop.
    closing: Arc<AtomicBool>,
    /// Set, under the `pending` lock, once the reader or the writer has stopped.
    dead: Arc<AtomicBool>,
}

/// Mark the link dead and fail every waiting request.
async fn fail_pending(pending: &Pending, dead: &AtomicBool) {
    let mut waiters = pending.lock().await;
    dead.store(true, Ordering::SeqCst);
    // Dropping the senders wakes each waiter with a closed-channel error.
    waiters.clear();
}

/// Transport client backed by a protocol sidecar process.
pub struct SidecarTransport {
    url: String,
    events_tx: mpsc::Sender<TransportEvent>,
    link: RwLock<Option<Arc<SidecarLink>>>,
}

impl SidecarTransport {
    pub fn new(url: impl Into<String>, events_tx: mpsc::Sender<TransportEvent>) -> Self {
        Self {
            url: url.into(),
            events_tx,
            link: RwLock::new(None),
        }
    }

    /// Open the socket and start the reader/writer tasks. Replaces any previous link.
    async fn open_link(&self) -> Result<Arc<SidecarLink>, TransportError> {
        let (ws, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError::Connect(format!("{}: {}", self.url, e)))?;
        let (mut sink, mut stream) = ws.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let closing = Arc::new(AtomicBool::new(false));
        let dead = Arc::new(AtomicBool::new(false));

        {
            let pending = pending.clone();
            let dead = dead.clone();
            tokio::spawn(async move {
                while let Some(msg) = out_rx.recv().await {
                    if let Err(e) = sink.send(msg).await {
                        log::debug!("sidecar: write failed: {}", e);
                        fail_pending(&pending, &dead).await;
                        return;
                    }
                }
                let _ = sink.close().await;
            });
        }

        // The reader hands events to a forwarder so responses are never stuck behind a
        // full event channel.
        let (forward_tx, mut forward_rx) = mpsc::unbounded_channel::<TransportEvent>();
        {
            let events_tx = self.events_tx.clone();
            tokio::spawn(async move {
                while let Some(event) = forward_rx.recv().await {
                    if events_tx.send(event).await.is_err() {
                        log::debug!("sidecar: event channel closed, dropping events");
                        return;
                    }
                }
            });
        }

        {
            let pending = pending.clone();
            let closing = closing.clone();
            let dead = dead.clone();
            tokio::spawn(async move {
                let mut close_reason = "sidecar socket closed".to_string();
                while let Some(msg) = stream.next().await {
                    let text = match msg {
                        Ok(Message::Text(text)) => text,
                        Ok(Message::Close(_)) => break,
                        Ok(_) => continue,
                        Err(e) => {
                            close_reason = e.to_string();
                            break;
                        }
                    };
                    let Ok(frame) = serde_json::from_str::<SidecarFrame>(&text) else {
                        log::debug!("sidecar: ignoring unparseable frame");
                        continue;
                    };
                    if frame.typ == "res" {
                        let waiter = match frame.id.as_deref() {
                            Some(id) => pending.lock().await.remove(id),
                            None => None,
                        };
                        if let Some(tx) = waiter {
                            let _ = tx.send(frame);
                        }
                        continue;
                    }
                    if let Some(event) = frame
                        .event
                        .as_deref()
                        .and_then(|name| parse_event(name, frame.payload.clone().unwrap_or_default()))
                    {
                        let _ = forward_tx.send(event);
                    }
                }
                fail_pending(&pending, &dead).await;
                if !closing.load(Ordering::SeqCst) {
                    log::warn!("sidecar: connection lost: {}", close_reason);
                    let _ = forward_tx.send(TransportEvent::ConnectionClosed(DisconnectCause::Network(
                        close_reason,
                    )));
                }
            });
        }

        let link = Arc::new(SidecarLink {
            out_tx,
            pending,
            next_id: AtomicU64::new(1),
            closing,
            dead,
        });
        if let Some(old) = self.link.write().await.replace(link.clone()) {
            old.closing.store(true, Ordering::SeqCst);
        }
        Ok(link)
    }

    async fn current_link(&self) -> Result<Arc<SidecarLink>, TransportError> {
        self.link
            .read()
            .await
            .clone()
            .ok_or(TransportError::NotConnected)
    }

    async fn request(&self, method: &str, params: serde_json::Value) -> Result<serde_json::Value, TransportError> {
        let link = self.current_link().await?;
        request_on(&link, method, params).await
    }
}

async fn request_on(
    link: &SidecarLink,
    method: &str,
    params: serde_json::Value,
) -> Result<serde_json::Value, TransportError> {
    let id = link.next_id.fetch_add(1, Ordering::SeqCst).to_string();
    let req = SidecarRequest {
        typ: "req",
        id: id.clone(),
        method,
        params,
    };
    let text = serde_json::to_string(&req).map_err(|e| TransportError::Request(e.to_string()))?;
    let (tx, rx) = oneshot::channel();
    {
        let mut waiters = link.pending.lock().await;
        if link.dead.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        waiters.insert(id.clone(), tx);
    }
    if link.out_tx.send(Message::Text(text)).is_err() {
        link.pending.lock().await.remove(&id);
        return Err(TransportError::Closed);
    }
    let frame = rx.await.map_err(|_| TransportError::Closed)?;
    if !frame.ok {
        return Err(TransportError::Request(format!(
            "{} failed: {}",
            method,
            frame.error.unwrap_or_else(|| "unknown error".to_string())
        )));
    }
    Ok(frame.payload.unwrap_or_default())
}

/// Map a sidecar event frame to a transport event. Unknown events and non-text messages map to None.
fn parse_event(name: &str, payload: serde_json::Value) -> Option<TransportEvent> {
    match name {
        "message" => {
            let p: MessageEventPayload = serde_json::from_value(payload).ok()?;
            let text = p.text.filter(|t| !t.trim().is_empty())?;
            Some(TransportEvent::Inbound(InboundMessage {
                from: p.from,
                message_id: p.id,
                text,
                timestamp: p.timestamp.unwrap_or_else(crate::message::now_secs),
            }))
        }
        "connection" => {
            let p: ConnectionEventPayload = serde_json::from_value(payload).ok()?;
            match p.state.as_str() {
                "open" => Some(TransportEvent::ConnectionOpened),
                "close" => {
                    let cause = match p.status_code {
                        Some(code) => DisconnectCause::from_status(code),
                        None => DisconnectCause::Network(
                            p.reason.unwrap_or_else(|| "connection closed".to_string()),
                        ),
                    };
                    Some(TransportEvent::ConnectionClosed(cause))
                }
                other => {
                    log::debug!("sidecar: connection state {}", other);
                    None
                }
            }
        }
        "creds" => payload
            .get("credentials")
            .cloned()
            .map(TransportEvent::CredentialsChanged),
        other => {
            log::debug!("sidecar: ignoring event {}", other);
            None
        }
    }
}

#[async_trait]
impl TransportClient for SidecarTransport {
    async fn connect(&self, credentials: Option<Credentials>) -> Result<TransportSession, TransportError> {
        log::info!("sidecar: connecting to {}", self.url);
        let link = self.open_link().await?;
        let payload = request_on(&link, "connect", json!({ "credentials": credentials }))
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        Ok(TransportSession {
            account: payload
                .get("account")
                .and_then(|v| v.as_str())
                .map(str::to_string),
        })
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let Some(link) = self.link.write().await.take() else {
            return Ok(());
        };
        link.closing.store(true, Ordering::SeqCst);
        let res = request_on(&link, "disconnect", json!({})).await.map(|_| ());
        let _ = link.out_tx.send(Message::Close(None));
        res
    }

    async fn send_message(&self, to: &ConversationId, text: &str) -> Result<SentReceipt, TransportError> {
        let payload = self
            .request("sendMessage", json!({ "to": to.as_str(), "text": text }))
            .await?;
        Ok(SentReceipt {
            message_id: payload.get("id").and_then(|v| v.as_str()).map(str::to_string),
        })
    }

    async fn send_presence(&self, presence: Presence, to: &ConversationId) -> Result<(), TransportError> {
        self.request(
            "sendPresence",
            json!({ "to": to.as_str(), "state": presence.as_str() }),
        )
        .await
        .map(|_| ())
    }

    async fn mark_read(&self, conversation: &ConversationId, message_id: &str) -> Result<(), TransportError> {
        self.request(
            "readMessages",
            json!({ "to": conversation.as_str(), "id": message_id }),
        )
        .await
        .map(|_| ())
    }

    async fn load_messages(
        &self,
        conversation: &ConversationId,
        limit: usize,
    ) -> Result<Vec<CachedMessage>, TransportError> {
        let payload = self
            .request(
                "loadMessages",
                json!({ "to": conversation.as_str(), "limit": limit }),
            )
            .await?;
        let messages = payload.get("messages").cloned().unwrap_or_else(|| json!([]));
        serde_json::from_value(messages).map_err(|e| TransportError::Request(format!("invalid messages: {}", e)))
    }
}
