//! Connection Features
//!
//! The feature snapshot a certificate is issued for. A stored
//! certificate is only reused when the requested features match the
//! ones it was issued with.

use serde::{Deserialize, Serialize};
use std::fmt;

/// NetShield (ad/malware blocking) level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetShieldLevel {
    #[default]
    Off,
    /// Block malware domains
    Malware,
    /// Block malware, ads and trackers
    AdsAndTrackers,
}

impl NetShieldLevel {
    pub fn as_u8(self) -> u8 {
        match self {
            NetShieldLevel::Off => 0,
            NetShieldLevel::Malware => 1,
            NetShieldLevel::AdsAndTrackers => 2,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(NetShieldLevel::Off),
            1 => Some(NetShieldLevel::Malware),
            2 => Some(NetShieldLevel::AdsAndTrackers),
            _ => None,
        }
    }
}

/// Connection options active when a certificate was issued
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VpnFeatures {
    pub netshield: NetShieldLevel,
    /// VPN accelerator (split TCP)
    pub vpn_accelerator: bool,
    /// Moderate NAT (random NAT disabled)
    pub moderate_nat: bool,
    pub port_forwarding: bool,
    /// `None` when the account has no say over safe mode
    pub safe_mode: Option<bool>,
}

impl VpnFeatures {
    /// Check if a certificate issued for `self` may serve a request for `requested`
    pub fn is_compatible_with(&self, requested: &VpnFeatures) -> bool {
        self == requested
    }

    pub fn with_netshield(mut self, level: NetShieldLevel) -> Self {
        self.netshield = level;
        self
    }
}

impl Default for VpnFeatures {
    fn default() -> Self {
        Self {
            netshield: NetShieldLevel::Off,
            vpn_accelerator: true,
            moderate_nat: false,
            port_forwarding: false,
            safe_mode: None,
        }
    }
}

impl fmt::Display for VpnFeatures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "netshield={:?} accelerator={} moderate_nat={} port_forwarding={}",
            self.netshield, self.vpn_accelerator, self.moderate_nat, self.port_forwarding
        )?;
        if let Some(safe_mode) = self.safe_mode {
            write!(f, " safe_mode={}", safe_mode)?;
        }
        Ok(())
    }
}
