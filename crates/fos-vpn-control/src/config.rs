//! Control-Plane Configuration
//!
//! Server targets, the tunnel configuration handed to the privileged
//! process, and the tunable timeouts of the managers.

use crate::features::VpnFeatures;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

/// Where a server's tunnel listener can be reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub addr: IpAddr,
    pub port: u16,
}

impl Endpoint {
    pub fn new(addr: IpAddr, port: u16) -> Self {
        Self { addr, port }
    }

    pub fn ipv4(a: u8, b: u8, c: u8, d: u8, port: u16) -> Self {
        Self::new(Ipv4Addr::new(a, b, c, d).into(), port)
    }

    pub fn socket_addr(&self) -> SocketAddr {
        (self.addr, self.port).into()
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.socket_addr(), f)
    }
}

/// The VPN server a connection is aimed at
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerTarget {
    pub server_id: String,
    pub hostname: String,
    pub endpoint: Endpoint,
}

impl ServerTarget {
    pub fn new(
        server_id: impl Into<String>,
        hostname: impl Into<String>,
        endpoint: Endpoint,
    ) -> Self {
        Self {
            server_id: server_id.into(),
            hostname: hostname.into(),
            endpoint,
        }
    }
}

impl std::fmt::Display for ServerTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.hostname, self.endpoint)
    }
}

/// Tunnel protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelProtocol {
    #[default]
    WireGuardUdp,
    WireGuardTcp,
    WireGuardTls,
    Ikev2,
}

impl TunnelProtocol {
    /// Does this tunnel type authenticate with the client certificate?
    pub fn is_certificate_bound(&self) -> bool {
        !matches!(self, TunnelProtocol::Ikev2)
    }

    pub fn as_u8(self) -> u8 {
        match self {
            TunnelProtocol::WireGuardUdp => 0,
            TunnelProtocol::WireGuardTcp => 1,
            TunnelProtocol::WireGuardTls => 2,
            TunnelProtocol::Ikev2 => 3,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(TunnelProtocol::WireGuardUdp),
            1 => Some(TunnelProtocol::WireGuardTcp),
            2 => Some(TunnelProtocol::WireGuardTls),
            3 => Some(TunnelProtocol::Ikev2),
            _ => None,
        }
    }
}

/// Configuration sent to the privileged process with `startTunnel`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelConfig {
    pub target: ServerTarget,
    pub protocol: TunnelProtocol,
    pub features: VpnFeatures,
    pub kill_switch: bool,
}

impl TunnelConfig {
    pub fn new(target: ServerTarget, protocol: TunnelProtocol, features: VpnFeatures) -> Self {
        Self {
            target,
            protocol,
            features,
            kill_switch: false,
        }
    }

    pub fn with_kill_switch(mut self, enabled: bool) -> Self {
        self.kill_switch = enabled;
        self
    }
}

/// Logging section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default `EnvFilter` directive, overridden by `RUST_LOG`
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Control-plane configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub tunnel_connect_timeout_secs: u64,
    pub tunnel_disconnect_timeout_secs: u64,
    pub agent_handshake_timeout_secs: u64,
    pub ipc_timeout_secs: u64,
    /// Requested certificate lifetime
    pub certificate_duration_mins: u64,
    pub device_name: String,
    pub api_certificate_path: String,
    pub api_session_fork_path: String,
    /// Margin before `refresh_after` at which the soft refresh fires
    pub refresh_lead_secs: u64,
    pub logging: LoggingConfig,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            tunnel_connect_timeout_secs: 30,
            tunnel_disconnect_timeout_secs: 10,
            agent_handshake_timeout_secs: 15,
            ipc_timeout_secs: 20,
            certificate_duration_mins: 1440,
            device_name: "fOS-WB".to_string(),
            api_certificate_path: "/vpn/v1/certificate".to_string(),
            api_session_fork_path: "/auth/v4/sessions/forks".to_string(),
            refresh_lead_secs: 0,
            logging: LoggingConfig::default(),
        }
    }
}

impl ControlConfig {
    /// Load from TOML file
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_toml(&content)
    }

    /// Load from TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from JSON string
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let timeouts = [
            ("tunnel_connect_timeout_secs", self.tunnel_connect_timeout_secs),
            ("tunnel_disconnect_timeout_secs", self.tunnel_disconnect_timeout_secs),
            ("agent_handshake_timeout_secs", self.agent_handshake_timeout_secs),
            ("ipc_timeout_secs", self.ipc_timeout_secs),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::ZeroTimeout(*name));
        }
        if self.certificate_duration_mins == 0 {
            return Err(ConfigError::InvalidCertificateDuration);
        }
        Ok(())
    }

    pub fn tunnel_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.tunnel_connect_timeout_secs)
    }

    pub fn tunnel_disconnect_timeout(&self) -> Duration {
        Duration::from_secs(self.tunnel_disconnect_timeout_secs)
    }

    pub fn agent_handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.agent_handshake_timeout_secs)
    }

    pub fn ipc_timeout(&self) -> Duration {
        Duration::from_secs(self.ipc_timeout_secs)
    }

    pub fn refresh_lead(&self) -> Duration {
        Duration::from_secs(self.refresh_lead_secs)
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("{0} must be greater than zero")]
    ZeroTimeout(&'static str),

    #[error("Certificate duration must be greater than zero")]
    InvalidCertificateDuration,
}
