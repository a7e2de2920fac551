//! Gateway HTTP + WebSocket server (single port) and the transport event loop.

use crate::config::{self, Config, TransportMode};
use crate::connection::{CloseOutcome, ConnectionManager, ConnectionStatus};
use crate::credentials::{CredentialStore, FileCredentialStore};
use crate::delivery::DeliveryEngine;
use crate::desk::AgentDesk;
use crate::gateway::hub::{AgentHub, ControlPlane};
use crate::gateway::protocol::{ClientEvent, ServerEvent, PROTOCOL_VERSION};
use crate::history::HistoryStore;
use crate::message::AgentId;
use crate::registry::ConversationRegistry;
use crate::responder::{self, Responder};
use crate::router::MessageRouter;
use crate::transport::{
    DisconnectCause, MemoryTransport, SidecarTransport, TransportClient, TransportEvent,
};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Json, Router,
};
use serde_json::json;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};

/// Pause between reconnect attempts after a failed reconnect. A refused connection
/// fails instantly, so the loop needs pacing of its own.
const RECONNECT_PAUSE: Duration = Duration::from_secs(1);

const TRANSPORT_EVENT_BUFFER: usize = 256;

/// The external capabilities the gateway runs on.
pub struct GatewayComponents {
    pub transport: Arc<dyn TransportClient>,
    /// Events from `transport`.
    pub events: mpsc::Receiver<TransportEvent>,
    pub credentials: Arc<dyn CredentialStore>,
    pub responder: Arc<dyn Responder>,
}

/// Shared state for the HTTP and WebSocket handlers.
#[derive(Clone)]
struct GatewayState {
    /// Port actually bound (differs from config when config asks for 0).
    port: u16,
    /// When Some, the agent `connect` event must carry this token.
    required_token: Option<String>,
    hub: AgentHub,
    desk: AgentDesk,
    registry: ConversationRegistry,
    connection: watch::Receiver<ConnectionStatus>,
}

/// When bind is not loopback a token must be configured. Returns the token agents must present.
fn required_connect_token(config: &Config) -> Result<Option<String>> {
    let token = if config.gateway.auth.mode == config::GatewayAuthMode::Token {
        config::resolve_gateway_token(config)
    } else {
        None
    };
    let bind = config.gateway.bind.trim();
    if !config::is_loopback_bind(bind) && token.is_none() {
        anyhow::bail!(
            "refusing to bind gateway to {} without auth (set gateway.auth.mode to \"token\" and gateway.auth.token or {})",
            bind,
            config::GATEWAY_TOKEN_ENV
        );
    }
    if config.gateway.auth.mode == config::GatewayAuthMode::Token && token.is_none() {
        anyhow::bail!(
            "gateway.auth.mode is \"token\" but no token is set (gateway.auth.token or {})",
            config::GATEWAY_TOKEN_ENV
        );
    }
    Ok(token)
}

/// Run the gateway with the transport, credentials and responder named in the config.
/// Blocks until shutdown (Ctrl+C or SIGTERM).
pub async fn run_gateway(config: Config, config_path: PathBuf) -> Result<()> {
    let (events_tx, events) = mpsc::channel(TRANSPORT_EVENT_BUFFER);
    let transport: Arc<dyn TransportClient> = match config.transport.mode {
        TransportMode::Sidecar => {
            log::info!("transport: protocol sidecar at {}", config.transport.sidecar_url);
            Arc::new(SidecarTransport::new(
                config.transport.sidecar_url.clone(),
                events_tx,
            ))
        }
        TransportMode::Memory => {
            log::warn!("transport: in-memory mode, nothing reaches the messaging network");
            Arc::new(MemoryTransport::new().with_events(events_tx))
        }
    };
    let credentials_path = config::resolve_credentials_path(&config, &config_path);
    log::debug!("credentials file: {}", credentials_path.display());
    let components = GatewayComponents {
        transport,
        events,
        credentials: Arc::new(FileCredentialStore::new(credentials_path)),
        responder: responder::from_config(&config),
    };
    serve(config, components, shutdown_signal()).await
}

/// Run the gateway on the given components until `shutdown` resolves.
///
/// Startup connects the transport (bounded retries; failure aborts), then serves HTTP
/// `GET /` (health) and `GET /ws` (agent sessions) on `gateway.bind:gateway.port`.
/// On shutdown every agent receives `shutdown` and the transport is disconnected.
pub async fn serve<S>(config: Config, components: GatewayComponents, shutdown: S) -> Result<()>
where
    S: Future<Output = ()> + Send + 'static,
{
    let required_token = required_connect_token(&config)?;
    let GatewayComponents {
        transport,
        events,
        credentials,
        responder,
    } = components;

    let registry = ConversationRegistry::new();
    let hub = AgentHub::new();
    let control: Arc<dyn ControlPlane> = Arc::new(hub.clone());
    let delivery = DeliveryEngine::new(transport.clone(), config.delivery.retry_policy());
    let desk = AgentDesk::new(
        registry.clone(),
        HistoryStore::new(transport.clone()),
        delivery.clone(),
        control.clone(),
        config.routing.desk_settings(),
    );
    let router = MessageRouter::new(
        registry.clone(),
        control.clone(),
        transport.clone(),
        responder,
        delivery,
        config.routing.router_settings(),
    );

    let mut manager = ConnectionManager::new(transport, credentials);
    let connection = manager.subscribe();
    manager
        .connect_with_startup_retry(
            config.transport.startup_attempts,
            config.transport.startup_retry_delay(),
        )
        .await
        .context("connecting to the messaging transport")?;

    let bind_addr = format!("{}:{}", config.gateway.bind.trim(), config.gateway.port);
    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(l) => l,
        Err(e) => {
            manager.shutdown().await;
            return Err(e).with_context(|| format!("binding to {}", bind_addr));
        }
    };
    let port = listener
        .local_addr()
        .map(|a| a.port())
        .unwrap_or(config.gateway.port);

    let (stop_tx, stop_rx) = oneshot::channel();
    let event_loop = tokio::spawn(run_transport_events(
        manager,
        events,
        router,
        control.clone(),
        stop_rx,
    ));

    let state = GatewayState {
        port,
        required_token,
        hub,
        desk,
        registry,
        connection,
    };
    let app = Router::new()
        .route("/", get(health_http))
        .route("/ws", get(ws_handler))
        .with_state(state);

    log::info!("gateway listening on {}", bind_addr);
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.await;
            log::info!("shutdown requested, notifying agents");
            control.broadcast(ServerEvent::Shutdown {}).await;
        })
        .await
        .context("gateway server exited");

    let _ = stop_tx.send(());
    if let Err(e) = event_loop.await {
        log::warn!("transport event loop ended abnormally: {}", e);
    }
    log::info!("gateway stopped");
    served
}

/// Future that completes on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("installing Ctrl+C handler failed: {}", e);
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                log::error!("installing SIGTERM handler failed: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();
    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Owns the connection manager. Inbound messages are routed on their own tasks;
/// connection events drive the manager. Ends when `stop` fires, then disconnects.
async fn run_transport_events(
    mut manager: ConnectionManager,
    mut events: mpsc::Receiver<TransportEvent>,
    router: MessageRouter,
    control: Arc<dyn ControlPlane>,
    mut stop: oneshot::Receiver<()>,
) {
    'events: loop {
        let event = tokio::select! {
            _ = &mut stop => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => {
                    log::warn!("transport: event channel closed");
                    // Keep the manager until shutdown so health stays accurate.
                    let _ = (&mut stop).await;
                    break;
                }
            },
        };
        match event {
            TransportEvent::Inbound(message) => {
                let router = router.clone();
                tokio::spawn(async move {
                    let outcome = router.route(message).await;
                    log::debug!("router: outcome {:?}", outcome);
                });
            }
            TransportEvent::ConnectionOpened => manager.handle_opened(),
            TransportEvent::CredentialsChanged(credentials) => {
                manager.handle_credentials(&credentials).await
            }
            TransportEvent::ConnectionClosed(mut cause) => loop {
                match manager.handle_closed(cause).await {
                    CloseOutcome::ReconnectFailed(e) => {
                        cause = DisconnectCause::Network(e.to_string());
                        tokio::select! {
                            _ = &mut stop => break 'events,
                            _ = tokio::time::sleep(RECONNECT_PAUSE) => {}
                        }
                    }
                    CloseOutcome::Terminated(cause) => {
                        control
                            .broadcast(ServerEvent::error(
                                "messaging transport disconnected; restart required",
                                Some(cause.to_string()),
                            ))
                            .await;
                        break;
                    }
                    CloseOutcome::Reconnected | CloseOutcome::Ignored => break,
                }
            },
        }
    }
    manager.shutdown().await;
}

/// GET / returns a simple health JSON (for liveness checks).
async fn health_http(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    let transport = state.connection.borrow().label();
    Json(json!({
        "runtime": "running",
        "protocol": PROTOCOL_VERSION,
        "port": state.port,
        "transport": transport,
        "agents": state.hub.len().await,
        "assigned": state.registry.len().await,
    }))
}

/// GET /ws upgrades to WebSocket. First frame must be `connect`; we reply with `hello`.
async fn ws_handler(State(state): State<GatewayState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn send_direct(socket: &mut WebSocket, event: ServerEvent) -> bool {
    socket.send(Message::Text(event.to_frame())).await.is_ok()
}

/// Wait for a valid `connect`. None when the socket closed or the token was wrong.
async fn await_connect(socket: &mut WebSocket, state: &GatewayState) -> Option<AgentId> {
    loop {
        let Some(Ok(msg)) = socket.recv().await else {
            return None;
        };
        let Message::Text(text) = msg else { continue };
        let token = match ClientEvent::parse(&text) {
            Ok(ClientEvent::Connect { token }) => token,
            Ok(other) => {
                log::debug!("ws: {:?} before connect", other);
                send_direct(socket, ServerEvent::error("connect first", None)).await;
                continue;
            }
            Err(e) => {
                send_direct(socket, ServerEvent::error("invalid event", Some(e.to_string()))).await;
                continue;
            }
        };
        if let Some(ref required) = state.required_token {
            let provided = token.as_deref().unwrap_or("").trim();
            if provided.is_empty() {
                send_direct(
                    socket,
                    ServerEvent::error("unauthorized: gateway token missing", None),
                )
                .await;
                return None;
            }
            if provided != required {
                send_direct(socket, ServerEvent::error("unauthorized: gateway token mismatch", None))
                    .await;
                return None;
            }
        }
        return Some(uuid::Uuid::new_v4().to_string());
    }
}

async fn handle_socket(mut socket: WebSocket, state: GatewayState) {
    let Some(agent_id) = await_connect(&mut socket, &state).await else {
        let _ = socket.send(Message::Close(None)).await;
        return;
    };
    let mut outbound = state.hub.register(&agent_id).await;
    state
        .hub
        .send_to(
            &agent_id,
            ServerEvent::Hello {
                agent_id: agent_id.clone(),
                protocol: PROTOCOL_VERSION,
            },
        )
        .await;

    loop {
        tokio::select! {
            biased;
            event = outbound.recv() => {
                let Some(event) = event else { break };
                let is_shutdown = matches!(event, ServerEvent::Shutdown {});
                if !send_direct(&mut socket, event).await || is_shutdown {
                    break;
                }
            }
            msg = socket.recv() => {
                let Some(Ok(msg)) = msg else { break };
                let Message::Text(text) = msg else { continue };
                match ClientEvent::parse(&text) {
                    Ok(event) => dispatch(&state, &agent_id, event),
                    Err(e) => {
                        log::debug!("ws: agent {} sent an invalid frame: {}", agent_id, e);
                        state
                            .hub
                            .send_to(&agent_id, ServerEvent::error("invalid event", Some(e.to_string())))
                            .await;
                    }
                }
            }
        }
    }

    state.hub.unregister(&agent_id).await;
    state.desk.agent_disconnected(&agent_id).await;
}

/// Each agent request runs on its own task so a slow claim or send never blocks the socket.
fn dispatch(state: &GatewayState, agent_id: &str, event: ClientEvent) {
    let desk = state.desk.clone();
    let hub = state.hub.clone();
    let agent = agent_id.to_string();
    tokio::spawn(async move {
        match event {
            ClientEvent::Connect { .. } => {
                hub.send_to(&agent, ServerEvent::error("already connected", None))
                    .await;
            }
            ClientEvent::TakeConversation { conversation_id } => {
                let outcome = desk.take_conversation(&agent, &conversation_id).await;
                log::debug!("ws: take_conversation by {}: {:?}", agent, outcome);
            }
            ClientEvent::AgentMessage {
                conversation_id,
                message,
            } => {
                desk.agent_message(&agent, &conversation_id, &message).await;
            }
            ClientEvent::CloseConversation { conversation_id } => {
                desk.close_conversation(&agent, &conversation_id).await;
            }
            ClientEvent::AgentTypingStatus {
                conversation_id,
                is_typing,
            } => {
                desk.set_typing(&conversation_id, is_typing).await;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::MemoryCredentialStore;
    use crate::responder::ResponderError;
    use crate::transport::{TransportCall, LOGGED_OUT_STATUS};
    use async_trait::async_trait;

    struct Silent;

    #[async_trait]
    impl Responder for Silent {
        async fn complete(&self, _text: &str) -> Result<String, ResponderError> {
            Err(ResponderError::Empty)
        }
    }

    fn loop_parts() -> (
        Arc<MemoryTransport>,
        ConnectionManager,
        MessageRouter,
        AgentHub,
    ) {
        let transport = Arc::new(MemoryTransport::new());
        let manager = ConnectionManager::new(
            transport.clone(),
            Arc::new(MemoryCredentialStore::new(None)),
        );
        let hub = AgentHub::new();
        let delivery = DeliveryEngine::new(transport.clone(), Default::default());
        let router = MessageRouter::new(
            ConversationRegistry::new(),
            Arc::new(hub.clone()),
            transport.clone(),
            Arc::new(Silent),
            delivery,
            Default::default(),
        );
        (transport, manager, router, hub)
    }

    #[test]
    fn public_bind_without_token_is_refused() {
        let mut config = Config::default();
        config.gateway.bind = "0.0.0.0".into();
        assert!(required_connect_token(&config).is_err());

        config.gateway.auth.mode = config::GatewayAuthMode::Token;
        config.gateway.auth.token = Some("s3cret".into());
        if std::env::var(config::GATEWAY_TOKEN_ENV).is_err() {
            assert_eq!(
                required_connect_token(&config).unwrap().as_deref(),
                Some("s3cret")
            );
        }
    }

    #[test]
    fn loopback_without_auth_needs_no_token() {
        assert_eq!(required_connect_token(&Config::default()).unwrap(), None);
    }

    #[tokio::test]
    async fn fatal_close_broadcasts_error_and_stops_reconnecting() {
        let (transport, mut manager, router, hub) = loop_parts();
        manager.connect().await.unwrap();
        let mut agent = hub.register("a").await;
        let (events_tx, events) = mpsc::channel(8);
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(run_transport_events(
            manager,
            events,
            router,
            Arc::new(hub.clone()),
            stop_rx,
        ));

        events_tx
            .send(TransportEvent::ConnectionClosed(DisconnectCause::from_status(
                LOGGED_OUT_STATUS,
            )))
            .await
            .unwrap();
        let event = agent.recv().await.unwrap();
        assert!(matches!(event, ServerEvent::Error { .. }));
        assert_eq!(transport.connect_count().await, 1);

        stop_tx.send(()).unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn failed_reconnect_keeps_retrying_until_success() {
        let (transport, mut manager, router, hub) = loop_parts();
        manager.connect().await.unwrap();
        let status = manager.subscribe();
        transport.fail_next_connects(2, "refused").await;
        let (events_tx, events) = mpsc::channel(8);
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(run_transport_events(
            manager,
            events,
            router,
            Arc::new(hub),
            stop_rx,
        ));

        events_tx
            .send(TransportEvent::ConnectionClosed(DisconnectCause::Network(
                "reset".into(),
            )))
            .await
            .unwrap();
        // Initial connect + two failed reconnects + one successful one.
        for _ in 0..50 {
            if transport.connect_count().await == 4 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        assert_eq!(transport.connect_count().await, 4);
        assert_eq!(status.borrow().label(), "connected");

        stop_tx.send(()).unwrap();
        task.await.unwrap();
        assert!(transport.calls().await.contains(&TransportCall::Disconnect));
        assert_eq!(status.borrow().label(), "terminated");
    }
}
