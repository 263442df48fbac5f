//! Protocol-Agent Session Manager
//!
//! Once the tunnel data path is up, the agent opens an authenticated
//! control session to the VPN server with the client certificate and
//! negotiates connection features over it.
//!
//! The manager watches the tunnel state: it refuses to connect unless
//! the tunnel is connected, and collapses to `Disconnected` as soon as
//! the tunnel leaves `Connected`.

use crate::certificate::AuthenticationData;
use crate::config::{ControlConfig, ServerTarget};
use crate::features::VpnFeatures;
use crate::tunnel::{TunnelState, left_connected};
use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Agent session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Disconnected,
    /// Handshake in progress
    Connecting,
    Connected,
}

impl AgentState {
    pub fn is_connected(&self) -> bool {
        matches!(self, AgentState::Connected)
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(self, AgentState::Disconnected)
    }
}

/// Error codes reported by the server over the agent session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentErrorCode {
    CertificateExpired,
    CertificateRevoked,
    KeyUsedMultipleTimes,
    MaxSessionsReached,
    ServerError,
    Unknown(u32),
}

impl AgentErrorCode {
    pub fn from_code(code: u32) -> Self {
        match code {
            86112 => AgentErrorCode::CertificateExpired,
            86113 => AgentErrorCode::CertificateRevoked,
            86114..=86119 => AgentErrorCode::MaxSessionsReached,
            86150 => AgentErrorCode::ServerError,
            86202 => AgentErrorCode::KeyUsedMultipleTimes,
            other => AgentErrorCode::Unknown(other),
        }
    }

    /// Fixed by issuing a new certificate and reconnecting
    pub fn needs_new_certificate(&self) -> bool {
        matches!(
            self,
            AgentErrorCode::CertificateExpired | AgentErrorCode::KeyUsedMultipleTimes
        )
    }
}

impl fmt::Display for AgentErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentErrorCode::CertificateExpired => write!(f, "certificate expired"),
            AgentErrorCode::CertificateRevoked => write!(f, "certificate revoked"),
            AgentErrorCode::KeyUsedMultipleTimes => write!(f, "key used multiple times"),
            AgentErrorCode::MaxSessionsReached => write!(f, "max sessions reached"),
            AgentErrorCode::ServerError => write!(f, "server error"),
            AgentErrorCode::Unknown(code) => write!(f, "error {}", code),
        }
    }
}

/// Agent errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AgentError {
    #[error("Agent handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Agent session dropped: {0}")]
    SessionDropped(String),

    #[error("Tunnel is not connected")]
    TunnelNotConnected,

    #[error("No agent session")]
    NotConnected,

    #[error("Agent handshake timed out")]
    Timeout,

    #[error("Agent handshake cancelled")]
    Cancelled,
}

/// What an open agent session reports
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentSessionEvent {
    /// Handshake complete
    Connected,
    Error { code: AgentErrorCode, message: String },
    /// The server or transport closed the session
    Closed(String),
}

/// A freshly opened session and its event stream
pub struct AgentLink {
    pub session: Box<dyn AgentSession>,
    pub events: mpsc::Receiver<AgentSessionEvent>,
}

/// Opens agent sessions to a server
#[async_trait]
pub trait AgentConnector: Send + Sync {
    async fn open(
        &self,
        target: &ServerTarget,
        auth: &AuthenticationData,
    ) -> Result<AgentLink, AgentError>;
}

/// An open agent session
#[async_trait]
pub trait AgentSession: Send + Sync {
    async fn set_features(&self, features: &VpnFeatures) -> Result<(), AgentError>;
    async fn close(&self);
}

/// Agent notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    StateChanged(AgentState),
    /// The server reported an error on a live session
    Error { code: AgentErrorCode, message: String },
    SessionDropped(String),
}

struct Active {
    id: u64,
    session: Arc<dyn AgentSession>,
    pump: AbortHandle,
}

struct Pending {
    id: u64,
    cancel: CancellationToken,
}

struct Inner {
    connector: Arc<dyn AgentConnector>,
    tunnel: watch::Receiver<TunnelState>,
    state: watch::Sender<AgentState>,
    events: broadcast::Sender<AgentEvent>,
    /// Held only to swap sessions, never across a handshake
    active: Mutex<Option<Active>>,
    handshake: std::sync::Mutex<Option<Pending>>,
    next_id: AtomicU64,
    handshake_timeout: Duration,
}

/// Protocol-Agent Session Manager
#[derive(Clone)]
pub struct AgentSessionManager {
    inner: Arc<Inner>,
}

impl AgentSessionManager {
    pub fn new(
        connector: Arc<dyn AgentConnector>,
        tunnel: watch::Receiver<TunnelState>,
        config: &ControlConfig,
    ) -> Self {
        let (state, _) = watch::channel(AgentState::Disconnected);
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Inner {
                connector,
                tunnel,
                state,
                events,
                active: Mutex::new(None),
                handshake: std::sync::Mutex::new(None),
                next_id: AtomicU64::new(1),
                handshake_timeout: config.agent_handshake_timeout(),
            }),
        }
    }

    pub fn state(&self) -> AgentState {
        *self.inner.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<AgentState> {
        self.inner.state.subscribe()
    }

    /// Receive agent events
    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.inner.events.subscribe()
    }

    /// Open a session and wait for the handshake
    ///
    /// Replaces any existing session and cancels a handshake still in
    /// progress, whose caller gets [`AgentError::Cancelled`].
    pub async fn connect(
        &self,
        target: &ServerTarget,
        auth: &AuthenticationData,
    ) -> Result<(), AgentError> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let replaced = self.inner.lock_handshake().replace(Pending {
            id,
            cancel: cancel.clone(),
        });
        if let Some(previous) = replaced {
            debug!("Cancelling agent handshake #{}", previous.id);
            previous.cancel.cancel();
        }
        self.inner.close_active().await;

        let mut tunnel = self.inner.tunnel.clone();
        if !tunnel.borrow_and_update().is_connected() {
            self.inner.finish_handshake(id);
            self.inner.set_state(AgentState::Disconnected);
            return Err(AgentError::TunnelNotConnected);
        }

        info!("Connecting agent to {} (session #{})", target, id);
        self.inner.set_state(AgentState::Connecting);

        let outcome = self.inner.handshake(target, auth, &mut tunnel, &cancel).await;

        let link = match outcome {
            Ok(link) => link,
            // Whoever cancelled owns the state now
            Err(AgentError::Cancelled) => return Err(AgentError::Cancelled),
            Err(e) => {
                self.inner.finish_handshake(id);
                warn!("Agent connection to {} failed: {}", target, e);
                self.inner.set_state(AgentState::Disconnected);
                return Err(e);
            }
        };

        // The pending slot stays set until the session is installed, so a
        // disconnect either cancels it here or closes the installed one.
        let mut active = self.inner.active.lock().await;
        if cancel.is_cancelled() {
            drop(active);
            link.session.close().await;
            return Err(AgentError::Cancelled);
        }
        self.inner.finish_handshake(id);

        let session: Arc<dyn AgentSession> = Arc::from(link.session);
        let pump = tokio::spawn(self.inner.clone().pump(id, link.events, tunnel));
        *active = Some(Active {
            id,
            session,
            pump: pump.abort_handle(),
        });

        info!("Agent connected to {} (session #{})", target, id);
        self.inner.set_state(AgentState::Connected);
        Ok(())
    }

    /// Push a new feature set to the live session
    pub async fn update_features(&self, features: &VpnFeatures) -> Result<(), AgentError> {
        let active = self.inner.active.lock().await;
        let Some(active) = active.as_ref() else {
            return Err(AgentError::NotConnected);
        };
        debug!("Updating agent features to {}", features);
        active.session.set_features(features).await
    }

    /// Tear the session down (best effort)
    ///
    /// Also cancels a handshake in progress without waiting for it.
    pub async fn disconnect(&self) {
        let pending = self.inner.lock_handshake().take();
        if let Some(pending) = pending {
            info!("Cancelling agent handshake #{}", pending.id);
            pending.cancel.cancel();
        }
        self.inner.close_active().await;
        if !self.inner.state.borrow().is_disconnected() {
            self.inner.set_state(AgentState::Disconnected);
        }
    }
}

impl Inner {
    fn set_state(&self, state: AgentState) {
        debug!("Agent state -> {:?}", state);
        self.state.send_replace(state);
        let _ = self.events.send(AgentEvent::StateChanged(state));
    }

    fn lock_handshake(&self) -> MutexGuard<'_, Option<Pending>> {
        self.handshake.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Clear the pending slot if it still belongs to handshake `id`
    fn finish_handshake(&self, id: u64) {
        let mut pending = self.lock_handshake();
        if pending.as_ref().is_some_and(|p| p.id == id) {
            *pending = None;
        }
    }

    async fn close_active(&self) {
        let previous = self.active.lock().await.take();
        if let Some(previous) = previous {
            info!("Closing agent session #{}", previous.id);
            previous.pump.abort();
            previous.session.close().await;
        }
    }

    /// Open a session and wait for its first event. The link is closed on
    /// every path that does not hand it back.
    async fn handshake(
        &self,
        target: &ServerTarget,
        auth: &AuthenticationData,
        tunnel: &mut watch::Receiver<TunnelState>,
        cancel: &CancellationToken,
    ) -> Result<AgentLink, AgentError> {
        let deadline = tokio::time::sleep(self.handshake_timeout);
        tokio::pin!(deadline);

        let mut link = tokio::select! {
            link = self.connector.open(target, auth) => link?,
            _ = &mut deadline => return Err(AgentError::Timeout),
            _ = left_connected(tunnel) => return Err(AgentError::TunnelNotConnected),
            _ = cancel.cancelled() => return Err(AgentError::Cancelled),
        };

        let outcome = tokio::select! {
            event = link.events.recv() => match event {
                Some(AgentSessionEvent::Connected) => Ok(()),
                Some(AgentSessionEvent::Error { code, message }) => {
                    Err(AgentError::HandshakeFailed(format!("{}: {}", code, message)))
                }
                Some(AgentSessionEvent::Closed(reason)) => Err(AgentError::HandshakeFailed(reason)),
                None => Err(AgentError::HandshakeFailed(
                    "session closed during handshake".to_string(),
                )),
            },
            _ = &mut deadline => Err(AgentError::Timeout),
            _ = left_connected(tunnel) => Err(AgentError::TunnelNotConnected),
            _ = cancel.cancelled() => Err(AgentError::Cancelled),
        };

        match outcome {
            Ok(()) => Ok(link),
            Err(e) => {
                link.session.close().await;
                Err(e)
            }
        }
    }

    /// Forward session events until the session or the tunnel goes away
    async fn pump(
        self: Arc<Self>,
        id: u64,
        mut events: mpsc::Receiver<AgentSessionEvent>,
        mut tunnel: watch::Receiver<TunnelState>,
    ) {
        let reason = loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(AgentSessionEvent::Error { code, message }) => {
                        warn!("Agent session #{} reported {}: {}", id, code, message);
                        let _ = self.events.send(AgentEvent::Error { code, message });
                    }
                    Some(AgentSessionEvent::Connected) => {}
                    Some(AgentSessionEvent::Closed(reason)) => {
                        break AgentError::SessionDropped(reason);
                    }
                    None => break AgentError::SessionDropped("event stream closed".to_string()),
                },
                _ = left_connected(&mut tunnel) => break AgentError::TunnelNotConnected,
            }
        };

        let mut active = self.active.lock().await;
        if active.as_ref().is_some_and(|a| a.id == id) {
            if let Some(dropped) = active.take() {
                dropped.session.close().await;
            }
            warn!("Agent session #{} ended: {}", id, reason);
            self.set_state(AgentState::Disconnected);
            let _ = self.events.send(AgentEvent::SessionDropped(reason.to_string()));
        }
    }
}
