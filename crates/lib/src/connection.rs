//! Connection lifecycle manager: owns the transport connection state machine.
//!
//! `Disconnected -> Connecting -> Connected`; a retryable close goes back through
//! `Connecting` immediately, a fatal close (logout, session conflict) ends in a terminal
//! `Disconnected`. The manager is owned by the transport event loop; other components
//! observe the state through [`ConnectionManager::subscribe`].

use crate::credentials::CredentialStore;
use crate::transport::{
    Credentials, DisconnectCause, TransportClient, TransportError, TransportSession,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

/// Published snapshot of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    /// True once a fatal close (or shutdown) ended the connection for good.
    pub terminal: bool,
}

impl ConnectionStatus {
    /// Label for health output: the state name, or "terminated".
    pub fn label(&self) -> &'static str {
        if self.terminal {
            return "terminated";
        }
        match self.state {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Closing => "closing",
        }
    }
}

/// What handling a transport-closed signal did.
#[derive(Debug)]
pub enum CloseOutcome {
    /// Retryable close; one reconnect attempt succeeded.
    Reconnected,
    /// Retryable close; the reconnect attempt failed. The caller may signal again.
    ReconnectFailed(TransportError),
    /// Fatal close; the manager is now terminal and will not reconnect.
    Terminated(DisconnectCause),
    /// Close arrived after shutdown or after a fatal close.
    Ignored,
}

pub struct ConnectionManager {
    transport: Arc<dyn TransportClient>,
    credentials: Arc<dyn CredentialStore>,
    status: ConnectionStatus,
    status_tx: watch::Sender<ConnectionStatus>,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn TransportClient>, credentials: Arc<dyn CredentialStore>) -> Self {
        let status = ConnectionStatus {
            state: ConnectionState::Disconnected,
            terminal: false,
        };
        let (status_tx, _) = watch::channel(status);
        Self {
            transport,
            credentials,
            status,
            status_tx,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.status.state
    }

    pub fn is_terminal(&self) -> bool {
        self.status.terminal
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_tx.subscribe()
    }

    fn set_state(&mut self, state: ConnectionState, terminal: bool) {
        self.status = ConnectionStatus { state, terminal };
        self.status_tx.send_replace(self.status);
        log::debug!("connection: state -> {}", self.status.label());
    }

    /// Request a new transport session with the stored credentials (or none, letting the
    /// transport provision fresh ones).
    pub async fn connect(&mut self) -> Result<TransportSession, TransportError> {
        if self.status.terminal {
            return Err(TransportError::Connect(
                "connection terminated; restart required".to_string(),
            ));
        }
        self.set_state(ConnectionState::Connecting, false);
        let credentials = match self.credentials.load().await {
            Ok(c) => c,
            Err(e) => {
                log::warn!("connection: loading credentials failed, connecting without: {}", e);
                None
            }
        };
        if credentials.is_none() {
            log::info!("connection: no stored credentials, transport will provision a new session");
        }
        match self.transport.connect(credentials).await {
            Ok(session) => {
                self.set_state(ConnectionState::Connected, false);
                log::info!(
                    "connection: connected{}",
                    session
                        .account
                        .as_deref()
                        .map(|a| format!(" as {}", a))
                        .unwrap_or_default()
                );
                Ok(session)
            }
            Err(e) => {
                self.set_state(ConnectionState::Disconnected, false);
                Err(e)
            }
        }
    }

    /// Initial connect at startup: up to `attempts` tries with `delay` between them.
    pub async fn connect_with_startup_retry(
        &mut self,
        attempts: u32,
        delay: Duration,
    ) -> Result<TransportSession, TransportError> {
        let attempts = attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.connect().await {
                Ok(session) => return Ok(session),
                Err(e) if attempt < attempts => {
                    log::warn!(
                        "connection: startup attempt {}/{} failed: {}; retrying in {:?}",
                        attempt,
                        attempts,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    log::error!(
                        "connection: giving up after {} attempts; check the transport and credentials",
                        attempts
                    );
                    return Err(e);
                }
            }
        }
    }

    /// Transport reported the session is open. Connect already moved us to Connected.
    pub fn handle_opened(&mut self) {
        log::info!("connection: transport reports session open");
    }

    /// Classify a close and either reconnect once (retryable) or stop for good (fatal).
    pub async fn handle_closed(&mut self, cause: DisconnectCause) -> CloseOutcome {
        if self.status.terminal {
            log::debug!("connection: close after termination ignored ({})", cause);
            return CloseOutcome::Ignored;
        }
        if self.status.state == ConnectionState::Closing {
            self.set_state(ConnectionState::Disconnected, true);
            return CloseOutcome::Ignored;
        }
        if cause.is_fatal() {
            log::error!(
                "connection: {}; resolve it and restart the gateway (no automatic reconnect)",
                cause
            );
            self.set_state(ConnectionState::Disconnected, true);
            return CloseOutcome::Terminated(cause);
        }
        log::warn!("connection: closed ({}), reconnecting", cause);
        match self.connect().await {
            Ok(_) => CloseOutcome::Reconnected,
            Err(e) => {
                log::warn!("connection: reconnect failed: {}", e);
                CloseOutcome::ReconnectFailed(e)
            }
        }
    }

    /// Persist updated credentials. Does not touch the connection state.
    pub async fn handle_credentials(&self, credentials: &Credentials) {
        if let Err(e) = self.credentials.save(credentials).await {
            log::warn!("connection: saving credentials failed: {}", e);
        } else {
            log::debug!("connection: credentials saved");
        }
    }

    /// Close the session on purpose; ends in terminal Disconnected.
    pub async fn shutdown(&mut self) {
        if self.status.terminal {
            return;
        }
        self.set_state(ConnectionState::Closing, false);
        if let Err(e) = self.transport.disconnect().await {
            log::debug!("connection: disconnect on shutdown: {}", e);
        }
        self.set_state(ConnectionState::Disconnected, true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::MemoryCredentialStore;
    use crate::transport::{MemoryTransport, TransportCall};
    use serde_json::json;

    fn manager(stored: Option<Credentials>) -> (ConnectionManager, Arc<MemoryTransport>, Arc<MemoryCredentialStore>) {
        let transport = Arc::new(MemoryTransport::new());
        let store = Arc::new(MemoryCredentialStore::new(stored));
        let m = ConnectionManager::new(transport.clone(), store.clone());
        (m, transport, store)
    }

    #[tokio::test]
    async fn starts_disconnected_and_connects_with_stored_credentials() {
        let (mut m, transport, _) = manager(Some(json!({ "me": "1555" })));
        assert_eq!(m.state(), ConnectionState::Disconnected);
        m.connect().await.unwrap();
        assert_eq!(m.state(), ConnectionState::Connected);
        assert_eq!(
            transport.calls().await,
            vec![TransportCall::Connect(Some(json!({ "me": "1555" })))]
        );
    }

    #[tokio::test]
    async fn retryable_close_triggers_exactly_one_reconnect() {
        let (mut m, transport, _) = manager(None);
        m.connect().await.unwrap();
        let outcome = m.handle_closed(DisconnectCause::Network("reset".into())).await;
        assert!(matches!(outcome, CloseOutcome::Reconnected));
        assert_eq!(transport.connect_count().await, 2);
        assert_eq!(m.state(), ConnectionState::Connected);
        assert!(!m.is_terminal());
    }

    #[tokio::test]
    async fn logout_is_terminal_without_reconnect() {
        let (mut m, transport, _) = manager(None);
        m.connect().await.unwrap();
        let outcome = m.handle_closed(DisconnectCause::from_status(401)).await;
        assert!(matches!(outcome, CloseOutcome::Terminated(DisconnectCause::LoggedOut)));
        assert_eq!(transport.connect_count().await, 1);
        assert_eq!(m.state(), ConnectionState::Disconnected);
        assert!(m.is_terminal());

        // Later signals do nothing.
        let again = m.handle_closed(DisconnectCause::Network("late".into())).await;
        assert!(matches!(again, CloseOutcome::Ignored));
        assert_eq!(transport.connect_count().await, 1);
        assert!(m.connect().await.is_err());
    }

    #[tokio::test]
    async fn conflict_is_terminal() {
        let (mut m, transport, _) = manager(None);
        m.connect().await.unwrap();
        let outcome = m.handle_closed(DisconnectCause::from_status(440)).await;
        assert!(matches!(outcome, CloseOutcome::Terminated(DisconnectCause::Conflict)));
        assert_eq!(transport.connect_count().await, 1);
    }

    #[tokio::test]
    async fn failed_reconnect_leaves_manager_retryable() {
        let (mut m, transport, _) = manager(None);
        m.connect().await.unwrap();
        transport.fail_next_connects(1, "offline").await;
        let outcome = m.handle_closed(DisconnectCause::Status(408)).await;
        assert!(matches!(outcome, CloseOutcome::ReconnectFailed(_)));
        assert_eq!(m.state(), ConnectionState::Disconnected);
        assert!(!m.is_terminal());
        assert!(matches!(
            m.handle_closed(DisconnectCause::Status(408)).await,
            CloseOutcome::Reconnected
        ));
    }

    #[tokio::test]
    async fn credentials_update_is_saved_without_state_change() {
        let (mut m, _, store) = manager(None);
        m.connect().await.unwrap();
        m.handle_credentials(&json!({ "k": 1 })).await;
        assert_eq!(store.load().await.unwrap(), Some(json!({ "k": 1 })));
        assert_eq!(m.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn startup_retry_is_bounded() {
        let (mut m, transport, _) = manager(None);
        transport.fail_next_connects(2, "boom").await;
        m.connect_with_startup_retry(3, Duration::ZERO).await.unwrap();
        assert_eq!(transport.connect_count().await, 3);

        let (mut m, transport, _) = manager(None);
        transport.fail_next_connects(5, "boom").await;
        assert!(m.connect_with_startup_retry(3, Duration::ZERO).await.is_err());
        assert_eq!(transport.connect_count().await, 3);
        assert!(!m.is_terminal());
    }

    #[tokio::test]
    async fn shutdown_ends_terminal_and_publishes() {
        let (mut m, transport, _) = manager(None);
        let rx = m.subscribe();
        m.connect().await.unwrap();
        assert_eq!(rx.borrow().label(), "connected");
        m.shutdown().await;
        assert!(m.is_terminal());
        assert_eq!(rx.borrow().label(), "terminated");
        assert!(transport.calls().await.contains(&TransportCall::Disconnect));
    }
}
