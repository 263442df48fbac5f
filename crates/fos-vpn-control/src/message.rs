//! Message types exchanged with the privileged tunnel process.

use crate::certificate::Certificate;
use crate::config::TunnelConfig;
use crate::features::VpnFeatures;
use std::time::Duration;

/// Requests sent from the application to the privileged process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Issue a new certificate for the stored key pair
    RefreshCertificate { features: Option<VpnFeatures> },
    /// Hand over a session fork selector so the privileged side can
    /// authenticate against the backend on its own
    SetSessionSelector {
        selector: String,
        cookie: Option<String>,
    },
    /// Bring the tunnel up
    StartTunnel(TunnelConfig),
    /// Tear the tunnel down
    StopTunnel,
}

impl ControlMessage {
    pub fn name(&self) -> &'static str {
        match self {
            ControlMessage::RefreshCertificate { .. } => "refreshCertificate",
            ControlMessage::SetSessionSelector { .. } => "setSessionSelector",
            ControlMessage::StartTunnel(_) => "startTunnel",
            ControlMessage::StopTunnel => "stopTunnel",
        }
    }
}

/// Responses sent from the privileged process back to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlResponse {
    Ok,
    /// Generic failure with a diagnosable message
    Error(String),
    /// The backend session is gone; the user must log in again
    ErrorSessionExpired,
    /// The backend refused the public key; new keys are needed
    ErrorNeedKeyRegeneration,
    /// Certificate issuance is rate limited
    ErrorTooManyCertRequests { retry_after: Duration },
    /// A freshly issued certificate
    Certificate(Certificate),
}
