//! Tunnel Lifecycle Manager
//!
//! Drives the privileged tunnel process through the IPC channel and keeps
//! a local [`TunnelState`] that only moves when the external status
//! source confirms it.
//!
//! # State Machine
//!
//! ```text
//!                connect()                 external "connected"
//!  Disconnected ─────────▶ Connecting ─────────────────────────▶ Connected
//!       ▲                      │                                    │
//!       │   failure / timeout  │                                    │ disconnect()
//!       ├──────────────────────┘                                    ▼
//!       │            external "disconnected"                  Disconnecting
//!       └───────────────────────────────────────────────────────────┘
//! ```
//!
//! An external "disconnected" while connected is a connection loss: it is
//! reported as [`TunnelEvent::ConnectionFailed`] and never retried here.
//! A reasserting tunnel goes back to `Connecting` for the same target
//! until the status source settles it either way.

use crate::channel::{ControlSender, IpcError};
use crate::config::{ControlConfig, ServerTarget, TunnelConfig};
use crate::credentials::{AuthError, CredentialManager};
use crate::features::VpnFeatures;
use crate::message::{ControlMessage, ControlResponse};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

/// Tunnel state as confirmed by the privileged process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelState {
    Disconnected,
    Connecting {
        target: ServerTarget,
        features: VpnFeatures,
    },
    Connected {
        target: ServerTarget,
        features: VpnFeatures,
    },
    Disconnecting,
}

impl TunnelState {
    /// Check if tunnel is usable
    pub fn is_connected(&self) -> bool {
        matches!(self, TunnelState::Connected { .. })
    }

    /// Check if tunnel is attempting to connect
    pub fn is_connecting(&self) -> bool {
        matches!(self, TunnelState::Connecting { .. })
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(self, TunnelState::Disconnected)
    }

    /// Server the tunnel is (being) established to
    pub fn target(&self) -> Option<&ServerTarget> {
        match self {
            TunnelState::Connecting { target, .. } | TunnelState::Connected { target, .. } => {
                Some(target)
            }
            _ => None,
        }
    }
}

/// Status value reported by the host's tunnel status source
///
/// Mirrors the platform status codes. Values outside the known set are
/// logged and ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawTunnelStatus(pub i32);

impl RawTunnelStatus {
    pub const INVALID: Self = Self(0);
    pub const DISCONNECTED: Self = Self(1);
    pub const CONNECTING: Self = Self(2);
    pub const CONNECTED: Self = Self(3);
    pub const REASSERTING: Self = Self(4);
    pub const DISCONNECTING: Self = Self(5);

    fn known(self) -> Option<ExternalStatus> {
        match self.0 {
            0 | 1 => Some(ExternalStatus::Disconnected),
            2 => Some(ExternalStatus::Connecting),
            3 => Some(ExternalStatus::Connected),
            4 => Some(ExternalStatus::Reasserting),
            5 => Some(ExternalStatus::Disconnecting),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExternalStatus {
    Disconnected,
    Connecting,
    Connected,
    Reasserting,
    Disconnecting,
}

/// Publishes raw status updates from the host tunnel framework
pub trait TunnelStatusSource: Send + Sync {
    fn subscribe(&self) -> broadcast::Receiver<RawTunnelStatus>;
}

/// Broadcast-backed status source the host adapter publishes into
#[derive(Debug, Clone)]
pub struct StatusFeed {
    tx: broadcast::Sender<RawTunnelStatus>,
}

impl StatusFeed {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self { tx }
    }

    /// Forward a status observed by the host
    pub fn publish(&self, status: RawTunnelStatus) {
        let _ = self.tx.send(status);
    }
}

impl Default for StatusFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl TunnelStatusSource for StatusFeed {
    fn subscribe(&self) -> broadcast::Receiver<RawTunnelStatus> {
        self.tx.subscribe()
    }
}

/// Tunnel errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TunnelError {
    #[error("Tunnel already active")]
    AlreadyActive,

    #[error("Tunnel start failed: {0}")]
    StartFailed(String),

    #[error("Unexpected tunnel status {0}")]
    UnexpectedStatus(i32),

    #[error("Credentials unavailable: {0}")]
    Credentials(#[from] AuthError),

    #[error("IPC error: {0}")]
    Ipc(#[from] IpcError),

    #[error("Tunnel did not confirm in time")]
    Timeout,

    #[error("Connection attempt superseded")]
    Cancelled,

    #[error("Connection lost")]
    ConnectionLost,
}

/// Tunnel notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelEvent {
    StateChanged(TunnelState),
    /// A connection attempt failed or an established tunnel dropped
    ConnectionFailed(TunnelError),
}

#[derive(Default)]
struct Control {
    /// Bumped by every connect/disconnect; stale attempts compare against it
    generation: u64,
    attempt: Option<AbortHandle>,
    /// `startTunnel` went out for this generation. Statuses seen before
    /// that belong to an earlier session.
    start_sent: bool,
}

struct Inner {
    channel: Arc<dyn ControlSender>,
    credentials: CredentialManager,
    state: watch::Sender<TunnelState>,
    events: broadcast::Sender<TunnelEvent>,
    control: Mutex<Control>,
    connect_timeout: Duration,
    disconnect_timeout: Duration,
}

/// Tunnel Lifecycle Manager
///
/// Cheap to clone. Must be created inside a Tokio runtime: it spawns a
/// monitor task on the status source.
#[derive(Clone)]
pub struct TunnelManager {
    inner: Arc<Inner>,
}

impl TunnelManager {
    pub fn new(
        channel: Arc<dyn ControlSender>,
        credentials: CredentialManager,
        status: &dyn TunnelStatusSource,
        config: &ControlConfig,
    ) -> Self {
        let (state, _) = watch::channel(TunnelState::Disconnected);
        let (events, _) = broadcast::channel(64);
        let inner = Arc::new(Inner {
            channel,
            credentials,
            state,
            events,
            control: Mutex::new(Control::default()),
            connect_timeout: config.tunnel_connect_timeout(),
            disconnect_timeout: config.tunnel_disconnect_timeout(),
        });

        Self::spawn_monitor(Arc::downgrade(&inner), status.subscribe());
        Self { inner }
    }

    /// Current state
    pub fn state(&self) -> TunnelState {
        self.inner.state.borrow().clone()
    }

    /// Watch state changes
    pub fn subscribe_state(&self) -> watch::Receiver<TunnelState> {
        self.inner.state.subscribe()
    }

    /// Receive tunnel events
    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.inner.events.subscribe()
    }

    /// Bring the tunnel up and wait until the privileged process confirms it
    ///
    /// A connect to a different server while still connecting supersedes
    /// the running attempt, whose caller gets [`TunnelError::Cancelled`].
    pub async fn connect(&self, config: TunnelConfig) -> Result<(), TunnelError> {
        let attempt = {
            let mut control = self.inner.lock_control();
            let current = self.inner.state.borrow().clone();
            match &current {
                TunnelState::Disconnected => {}
                TunnelState::Connecting { target, .. } if *target != config.target => {
                    info!("Superseding connection to {} with {}", target, config.target);
                    if let Some(previous) = control.attempt.take() {
                        previous.abort();
                    }
                }
                _ => return Err(TunnelError::AlreadyActive),
            }

            control.generation += 1;
            control.start_sent = false;
            let generation = control.generation;

            info!("Connecting tunnel to {} ({:?})", config.target, config.protocol);
            self.inner.set_state(TunnelState::Connecting {
                target: config.target.clone(),
                features: config.features,
            });

            let attempt = tokio::spawn(self.inner.clone().attempt(config, generation));
            control.attempt = Some(attempt.abort_handle());
            attempt
        };

        match attempt.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(TunnelError::Cancelled),
            Err(e) => {
                error!("Tunnel connect task failed: {}", e);
                Err(TunnelError::StartFailed(e.to_string()))
            }
        }
    }

    /// Tear the tunnel down and wait for the privileged process to confirm
    ///
    /// An attempt that never reached `startTunnel` is dropped locally; the
    /// privileged process has nothing to stop.
    pub async fn disconnect(&self) -> Result<(), TunnelError> {
        let mut state = {
            let mut control = self.inner.lock_control();
            if let Some(attempt) = control.attempt.take() {
                attempt.abort();
            }
            let start_sent = std::mem::take(&mut control.start_sent);
            control.generation += 1;

            let current = self.inner.state.borrow().clone();
            if current.is_disconnected() {
                return Ok(());
            }
            if current.is_connecting() && !start_sent {
                info!("Dropping tunnel attempt before it was started");
                self.inner.set_state(TunnelState::Disconnected);
                return Ok(());
            }
            info!("Disconnecting tunnel");
            self.inner.set_state(TunnelState::Disconnecting);
            self.inner.state.subscribe()
        };

        match self.inner.channel.send(ControlMessage::StopTunnel).await {
            Ok(ControlResponse::Ok) => {}
            Ok(other) => warn!("Unexpected response to stopTunnel: {:?}", other),
            Err(e) => {
                // Nothing left to confirm the stop
                warn!("stopTunnel failed ({}), treating tunnel as down", e);
                self.inner.set_state(TunnelState::Disconnected);
                return Err(e.into());
            }
        }

        let confirmed = tokio::time::timeout(
            self.inner.disconnect_timeout,
            state.wait_for(TunnelState::is_disconnected),
        )
        .await;

        match confirmed {
            Ok(_) => {
                info!("Tunnel disconnected");
                Ok(())
            }
            Err(_) => {
                warn!(
                    "Tunnel process did not confirm disconnect within {:?}",
                    self.inner.disconnect_timeout
                );
                self.inner.set_state(TunnelState::Disconnected);
                Err(TunnelError::Timeout)
            }
        }
    }

    fn spawn_monitor(inner: Weak<Inner>, mut status: broadcast::Receiver<RawTunnelStatus>) {
        tokio::spawn(async move {
            loop {
                let raw = match status.recv().await {
                    Ok(raw) => raw,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Tunnel status monitor lagged, skipped {} updates", skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                inner.on_status(raw);
            }
            debug!("Tunnel status monitor stopped");
        });
    }
}

/// Resolves once the observed tunnel is no longer `Connected`, or its
/// manager is gone
pub(crate) async fn left_connected(state: &mut watch::Receiver<TunnelState>) {
    let _ = state.wait_for(|s| !s.is_connected()).await;
}

impl Inner {
    fn lock_control(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: TunnelState) {
        debug!("Tunnel state -> {:?}", state);
        self.state.send_replace(state.clone());
        let _ = self.events.send(TunnelEvent::StateChanged(state));
    }

    fn emit_failure(&self, error: TunnelError) {
        warn!("Tunnel connection failed: {}", error);
        let _ = self.events.send(TunnelEvent::ConnectionFailed(error));
    }

    /// Map one external status update onto the local state
    fn on_status(&self, raw: RawTunnelStatus) {
        let Some(external) = raw.known() else {
            warn!("{}, ignoring", TunnelError::UnexpectedStatus(raw.0));
            return;
        };

        let control = self.lock_control();
        let current = self.state.borrow().clone();
        debug!("External tunnel status {:?} while {:?}", external, current);

        match (external, current) {
            (ExternalStatus::Connected, TunnelState::Connecting { target, features }) => {
                if control.start_sent {
                    info!("Tunnel connected to {}", target);
                    self.set_state(TunnelState::Connected { target, features });
                } else {
                    debug!("Ignoring connected status from before startTunnel");
                }
            }
            (ExternalStatus::Reasserting, TunnelState::Connected { target, features }) => {
                info!("Tunnel to {} is reasserting", target);
                self.set_state(TunnelState::Connecting { target, features });
            }
            (ExternalStatus::Connecting, TunnelState::Connected { .. }) => {
                debug!("Ignoring late connecting status on a confirmed tunnel");
            }
            (ExternalStatus::Disconnecting, TunnelState::Connected { .. }) => {
                info!("Tunnel process is disconnecting on its own");
                self.set_state(TunnelState::Disconnecting);
            }
            (ExternalStatus::Disconnected, TunnelState::Connected { target, .. }) => {
                warn!("Tunnel to {} dropped", target);
                self.set_state(TunnelState::Disconnected);
                self.emit_failure(TunnelError::ConnectionLost);
            }
            (ExternalStatus::Disconnected, TunnelState::Connecting { target, .. }) => {
                // Before startTunnel this is the tail of a previous session
                if control.start_sent {
                    self.set_state(TunnelState::Disconnected);
                    if control.attempt.is_none() {
                        warn!("Reasserting tunnel to {} dropped", target);
                        self.emit_failure(TunnelError::ConnectionLost);
                    }
                }
            }
            (ExternalStatus::Disconnected, TunnelState::Disconnecting) => {
                self.set_state(TunnelState::Disconnected);
            }
            _ => {}
        }
    }

    /// Record that `startTunnel` is about to go out for `generation`
    fn mark_start_sent(&self, generation: u64) -> bool {
        let mut control = self.lock_control();
        if control.generation == generation {
            control.start_sent = true;
            true
        } else {
            false
        }
    }

    async fn attempt(
        self: Arc<Self>,
        config: TunnelConfig,
        generation: u64,
    ) -> Result<(), TunnelError> {
        let result = self.clone().establish(&config, generation).await;

        if let Err(e) = &result {
            let current = {
                let mut control = self.lock_control();
                let current = control.generation == generation;
                if current {
                    control.attempt = None;
                }
                current
            };
            if current {
                if matches!(e, TunnelError::Timeout) {
                    // The process may still be trying; make it stop
                    let _ = self.channel.send(ControlMessage::StopTunnel).await;
                }
                if !self.state.borrow().is_disconnected() {
                    self.set_state(TunnelState::Disconnected);
                }
                self.emit_failure(e.clone());
            }
        } else {
            let mut control = self.lock_control();
            if control.generation == generation {
                control.attempt = None;
            }
        }
        result
    }

    async fn establish(
        self: Arc<Self>,
        config: &TunnelConfig,
        generation: u64,
    ) -> Result<(), TunnelError> {
        if config.protocol.is_certificate_bound() {
            self.credentials.load_authentication_data(&config.features).await?;
        }

        // From here on a `connected` status belongs to this attempt, even
        // one that arrives before the reply
        if !self.mark_start_sent(generation) {
            return Err(TunnelError::Cancelled);
        }
        let mut state = self.state.subscribe();
        match self.channel.send(ControlMessage::StartTunnel(config.clone())).await? {
            ControlResponse::Ok => {}
            ControlResponse::Error(message) => return Err(TunnelError::StartFailed(message)),
            other => {
                return Err(TunnelError::Ipc(IpcError::UnexpectedResponse {
                    request: "startTunnel",
                    response: format!("{:?}", other),
                }));
            }
        }
        debug!("startTunnel acknowledged, waiting for confirmation");

        let settled = tokio::time::timeout(
            self.connect_timeout,
            state.wait_for(|s| !s.is_connecting()),
        )
        .await
        .map_err(|_| TunnelError::Timeout)?
        .map_err(|_| TunnelError::Cancelled)?
        .clone();

        match settled {
            TunnelState::Connected { target, .. } if target == config.target => Ok(()),
            TunnelState::Disconnected => Err(TunnelError::StartFailed(
                "tunnel process reported disconnected".to_string(),
            )),
            _ => Err(TunnelError::Cancelled),
        }
    }
}
