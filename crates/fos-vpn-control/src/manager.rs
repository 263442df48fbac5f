//! VPN Manager
//!
//! Composes the credential, tunnel and agent managers into one
//! connection:
//!
//! 1. Brings the tunnel up and waits for the privileged process to confirm
//! 2. Loads credentials for the requested features
//! 3. Connects the protocol agent with them
//!
//! While connected, a supervisor task tears the agent down when the
//! tunnel leaves `Connected` and reconnects it if the tunnel reasserts.
//! It also refreshes the certificate when its soft-refresh time comes (or
//! the server reports it expired) and reconnects the agent with it.
//!
//! # Usage
//!
//! ```rust,ignore
//! let vpn = VpnManager::build(config, store, generator, issuer, channel, &status, connector);
//! vpn.connect(TunnelConfig::new(target, TunnelProtocol::WireGuardUdp, features)).await?;
//!
//! let mut events = vpn.subscribe();
//! while let Ok(event) = events.recv().await {
//!     println!("{:?}", event);
//! }
//!
//! vpn.disconnect().await?;
//! ```

use crate::agent::{AgentConnector, AgentError, AgentEvent, AgentSessionManager};
use crate::certificate::AuthenticationData;
use crate::channel::ControlSender;
use crate::config::{ControlConfig, TunnelConfig};
use crate::credentials::{AuthError, CredentialManager};
use crate::features::VpnFeatures;
use crate::issuer::CertificateIssuer;
use crate::keys::KeyGenerator;
use crate::store::KeyCertStore;
use crate::tunnel::{
    TunnelError, TunnelManager, TunnelState, TunnelStatusSource, left_connected,
};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::{broadcast, watch};
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

/// Retry delay after a failed soft refresh without a server backoff hint
const REFRESH_RETRY_DELAY: Duration = Duration::from_secs(60);

/// VPN Manager errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VpnError {
    #[error("VPN not connected")]
    NotConnected,

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    #[error("Credential error: {0}")]
    Credentials(#[from] AuthError),

    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),
}

/// Notifications from the supervisor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VpnEvent {
    CertificateRefreshed { valid_until: SystemTime },
    CertificateRefreshFailed(AuthError),
    AgentReconnected,
    AgentReconnectFailed(AgentError),
    /// The tunnel is reasserting; the agent is down until it settles
    TunnelReasserting,
    /// The tunnel left `Connected` for good; the agent was torn down
    TunnelLost,
}

struct Active {
    config: TunnelConfig,
    connected_at: Instant,
    supervisor: AbortHandle,
}

/// VPN Manager
///
/// Enforces the ordering between the managers: the agent is only
/// connected after `Connected` was observed on the tunnel.
pub struct VpnManager {
    config: ControlConfig,
    credentials: CredentialManager,
    tunnel: TunnelManager,
    agent: AgentSessionManager,
    events: broadcast::Sender<VpnEvent>,
    active: Mutex<Option<Active>>,
}

impl VpnManager {
    /// Create from already-built managers
    pub fn new(
        config: ControlConfig,
        credentials: CredentialManager,
        tunnel: TunnelManager,
        agent: AgentSessionManager,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            config,
            credentials,
            tunnel,
            agent,
            events,
            active: Mutex::new(None),
        }
    }

    /// Build the managers from their collaborators
    pub fn build(
        config: ControlConfig,
        store: Arc<dyn KeyCertStore>,
        generator: Arc<dyn KeyGenerator>,
        issuer: Arc<dyn CertificateIssuer>,
        channel: Arc<dyn ControlSender>,
        status: &dyn TunnelStatusSource,
        connector: Arc<dyn AgentConnector>,
    ) -> Self {
        let credentials = CredentialManager::new(store, generator, issuer);
        let tunnel = TunnelManager::new(channel, credentials.clone(), status, &config);
        let agent = AgentSessionManager::new(connector, tunnel.subscribe_state(), &config);
        Self::new(config, credentials, tunnel, agent)
    }

    pub fn credentials(&self) -> &CredentialManager {
        &self.credentials
    }

    pub fn tunnel(&self) -> &TunnelManager {
        &self.tunnel
    }

    pub fn agent(&self) -> &AgentSessionManager {
        &self.agent
    }

    /// Receive supervisor events
    pub fn subscribe(&self) -> broadcast::Receiver<VpnEvent> {
        self.events.subscribe()
    }

    /// Tunnel confirmed and, for certificate-bound protocols, agent connected
    pub fn is_connected(&self) -> bool {
        let Some(protocol) = self.lock_active().as_ref().map(|a| a.config.protocol) else {
            return false;
        };
        self.tunnel.state().is_connected()
            && (!protocol.is_certificate_bound() || self.agent.state().is_connected())
    }

    /// Get connection duration
    pub fn connection_duration(&self) -> Option<Duration> {
        self.lock_active().as_ref().map(|a| a.connected_at.elapsed())
    }

    /// Connect tunnel, then credentials, then agent
    pub async fn connect(&self, config: TunnelConfig) -> Result<(), VpnError> {
        info!("Connecting VPN to {}", config.target);

        // Subscribe before connecting so `Connected` can't be missed
        let mut tunnel_state = self.tunnel.subscribe_state();
        self.tunnel.connect(config.clone()).await?;

        if !tunnel_state.borrow_and_update().is_connected() {
            warn!("Tunnel left connected before the agent could start");
            return Err(TunnelError::ConnectionLost.into());
        }
        self.stop_supervisor();

        let mut refresh_at = None;
        if config.protocol.is_certificate_bound() {
            match self.connect_agent(&config).await {
                Ok(next) => refresh_at = Some(next),
                Err(e) => {
                    error!("VPN connection failed: {}", e);
                    if let Err(e) = self.tunnel.disconnect().await {
                        warn!("Tunnel teardown after failed connect: {}", e);
                    }
                    return Err(e);
                }
            }
        }

        self.start_supervisor(config, refresh_at);
        info!("VPN connected");
        Ok(())
    }

    /// Tear down agent and tunnel
    pub async fn disconnect(&self) -> Result<(), VpnError> {
        info!("Disconnecting VPN");
        self.stop_supervisor();
        self.agent.disconnect().await;
        self.tunnel.disconnect().await?;
        info!("VPN disconnected");
        Ok(())
    }

    /// Switch features on the live connection
    ///
    /// The agent gets the new set immediately; the stored certificate is
    /// renewed for it so a reconnect does not need a refresh.
    pub async fn update_features(&self, features: VpnFeatures) -> Result<(), VpnError> {
        let Some(mut config) = self.lock_active().as_ref().map(|a| a.config.clone()) else {
            return Err(VpnError::NotConnected);
        };
        config.features = features;

        let mut refresh_at = None;
        if config.protocol.is_certificate_bound() {
            self.agent.update_features(&features).await?;
            let auth = self.credentials.load_authentication_data(&features).await?;
            refresh_at = Some(auth.refresh_after());
        }

        self.stop_supervisor();
        self.start_supervisor(config, refresh_at);
        Ok(())
    }

    /// Get status string
    pub fn status(&self) -> String {
        let tunnel = match self.tunnel.state() {
            TunnelState::Connected { target, .. } => format!("connected to {}", target),
            TunnelState::Connecting { target, .. } => format!("connecting to {}", target),
            TunnelState::Disconnecting => "disconnecting".to_string(),
            TunnelState::Disconnected => "disconnected".to_string(),
        };
        format!("Tunnel: {}, Agent: {:?}", tunnel, self.agent.state())
    }

    async fn connect_agent(&self, config: &TunnelConfig) -> Result<SystemTime, VpnError> {
        let auth = self.credentials.load_authentication_data(&config.features).await?;
        self.agent.connect(&config.target, &auth).await?;
        Ok(auth.refresh_after())
    }

    fn lock_active(&self) -> MutexGuard<'_, Option<Active>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stop_supervisor(&self) {
        if let Some(active) = self.lock_active().take() {
            active.supervisor.abort();
        }
    }

    fn start_supervisor(&self, config: TunnelConfig, refresh_at: Option<SystemTime>) {
        let supervisor = Supervisor {
            config: config.clone(),
            credentials: self.credentials.clone(),
            agent: self.agent.clone(),
            tunnel_state: self.tunnel.subscribe_state(),
            agent_events: self.agent.subscribe(),
            events: self.events.clone(),
            refresh_lead: self.config.refresh_lead(),
        };
        let task = tokio::spawn(supervisor.run(refresh_at));

        *self.lock_active() = Some(Active {
            config,
            connected_at: Instant::now(),
            supervisor: task.abort_handle(),
        });
    }
}

impl Drop for VpnManager {
    fn drop(&mut self) {
        self.stop_supervisor();
    }
}

struct Supervisor {
    config: TunnelConfig,
    credentials: CredentialManager,
    agent: AgentSessionManager,
    tunnel_state: watch::Receiver<TunnelState>,
    agent_events: broadcast::Receiver<AgentEvent>,
    events: broadcast::Sender<VpnEvent>,
    refresh_lead: Duration,
}

impl Supervisor {
    async fn run(mut self, mut refresh_at: Option<SystemTime>) {
        debug!("VPN supervisor started for {}", self.config.target);

        loop {
            let delay = refresh_at
                .map(|at| {
                    at.checked_sub(self.refresh_lead)
                        .and_then(|at| at.duration_since(SystemTime::now()).ok())
                        .unwrap_or(Duration::ZERO)
                })
                .unwrap_or(Duration::ZERO);

            tokio::select! {
                _ = left_connected(&mut self.tunnel_state) => {
                    self.agent.disconnect().await;
                    if !self.ride_out_reassertion().await {
                        warn!("Tunnel lost, agent torn down");
                        let _ = self.events.send(VpnEvent::TunnelLost);
                        break;
                    }
                    info!("Tunnel to {} reasserted", self.config.target);
                    refresh_at = self.resume().await;
                }
                event = self.agent_events.recv() => match event {
                    Ok(AgentEvent::Error { code, .. }) if code.needs_new_certificate() => {
                        info!("Agent reported {}, renewing certificate", code);
                        refresh_at = self.renew().await;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("VPN supervisor lagged, skipped {} agent events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = tokio::time::sleep(delay), if refresh_at.is_some() => {
                    info!("Certificate soft-refresh time reached");
                    refresh_at = self.renew().await;
                }
            }
        }

        debug!("VPN supervisor stopped");
    }

    /// Wait out a reasserting tunnel. True if it came back connected.
    async fn ride_out_reassertion(&mut self) -> bool {
        if !self.tunnel_state.borrow_and_update().is_connecting() {
            return false;
        }
        info!("Tunnel to {} is reasserting, agent paused", self.config.target);
        let _ = self.events.send(VpnEvent::TunnelReasserting);

        self.tunnel_state
            .wait_for(|s| !s.is_connecting())
            .await
            .map(|state| state.is_connected())
            .unwrap_or(false)
    }

    /// Reconnect the agent after the tunnel came back
    async fn resume(&self) -> Option<SystemTime> {
        if !self.config.protocol.is_certificate_bound() {
            return None;
        }
        match self.credentials.load_authentication_data(&self.config.features).await {
            Ok(auth) => {
                self.reconnect_agent(&auth).await;
                Some(auth.refresh_after())
            }
            Err(e) => self.refresh_failed(e),
        }
    }

    /// Refresh the certificate and reconnect the agent with it.
    /// Returns when the next refresh is due.
    async fn renew(&self) -> Option<SystemTime> {
        if !self.config.protocol.is_certificate_bound() {
            return None;
        }

        let auth = match self.credentials.refresh(&self.config.features).await {
            Ok(auth) => auth,
            Err(e) => return self.refresh_failed(e),
        };
        let _ = self.events.send(VpnEvent::CertificateRefreshed {
            valid_until: auth.valid_until(),
        });

        if self.tunnel_state.borrow().is_connected() {
            self.reconnect_agent(&auth).await;
        }
        Some(auth.refresh_after())
    }

    async fn reconnect_agent(&self, auth: &AuthenticationData) {
        match self.agent.connect(&self.config.target, auth).await {
            Ok(()) => {
                let _ = self.events.send(VpnEvent::AgentReconnected);
            }
            Err(e) => {
                warn!("Agent reconnect failed: {}", e);
                let _ = self.events.send(VpnEvent::AgentReconnectFailed(e));
            }
        }
    }

    /// Report a failed refresh and pick the retry time, if any
    fn refresh_failed(&self, e: AuthError) -> Option<SystemTime> {
        warn!("Certificate refresh failed: {}", e);
        let _ = self.events.send(VpnEvent::CertificateRefreshFailed(e.clone()));
        if e.requires_reauthentication() {
            return None;
        }
        let delay = e.retry_after().unwrap_or(REFRESH_RETRY_DELAY);
        Some(SystemTime::now() + delay + self.refresh_lead)
    }
}
