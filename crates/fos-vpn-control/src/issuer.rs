//! Certificate Issuance
//!
//! Exchanges the client public key plus a session proof for a signed
//! certificate. Two transports sit behind [`CertificateIssuer`]:
//!
//! - [`DirectIssuer`] talks to the backend through a [`NetworkClient`]
//! - [`IpcIssuer`] asks the privileged tunnel process to do it
//!
//! Which one is used is decided once, when the credential manager is
//! built.

use crate::certificate::Certificate;
use crate::channel::{ControlSender, IpcError};
use crate::config::ControlConfig;
use crate::features::VpnFeatures;
use crate::keys::KeyPair;
use crate::message::{ControlMessage, ControlResponse};
use crate::network::{ApiRequest, ApiResponse, NetworkClient, NetworkError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Backend code: public key already used for another certificate
pub const API_CODE_KEY_USED_MULTIPLE_TIMES: i64 = 2500;

/// Backend code: session invalid
pub const API_CODE_INVALID_SESSION: i64 = 10013;

/// Used when a 429 carries no `Retry-After`
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(60);

/// Classified certificate refresh failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RefreshError {
    #[error("IPC error: {0}")]
    Ipc(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Session expired or missing")]
    SessionExpiredOrMissing,

    #[error("Backend requires new keys")]
    RequiresNewKeys,

    #[error("Too many certificate requests, retry after {}s", retry_after.as_secs())]
    TooManyRequests { retry_after: Duration },
}

impl From<IpcError> for RefreshError {
    fn from(e: IpcError) -> Self {
        RefreshError::Ipc(e.to_string())
    }
}

impl From<NetworkError> for RefreshError {
    fn from(e: NetworkError) -> Self {
        RefreshError::Network(e.to_string())
    }
}

/// Result of one certificate refresh
pub type RefreshOutcome = Result<Certificate, RefreshError>;

/// Obtains a signed certificate for a key pair
#[async_trait]
pub trait CertificateIssuer: Send + Sync {
    async fn refresh_certificate(&self, keys: &KeyPair, features: &VpnFeatures) -> RefreshOutcome;
}

/// Authenticated backend session
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct ApiSession {
    #[serde(rename = "UID")]
    pub uid: String,
    #[serde(rename = "AccessToken")]
    pub access_token: String,
}

impl std::fmt::Debug for ApiSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiSession").field("uid", &self.uid).finish()
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct CertificateRequest<'a> {
    client_public_key: String,
    client_public_key_mode: &'static str,
    mode: &'static str,
    device_name: &'a str,
    duration: String,
    features: FeaturesBody,
}

#[derive(Debug, Serialize)]
struct FeaturesBody {
    #[serde(rename = "NetShieldLevel")]
    netshield_level: u8,
    #[serde(rename = "RandomNAT")]
    random_nat: bool,
    #[serde(rename = "SplitTCP")]
    split_tcp: bool,
    #[serde(rename = "PortForwarding")]
    port_forwarding: bool,
    #[serde(rename = "SafeMode", skip_serializing_if = "Option::is_none")]
    safe_mode: Option<bool>,
}

impl From<&VpnFeatures> for FeaturesBody {
    fn from(features: &VpnFeatures) -> Self {
        Self {
            netshield_level: features.netshield.as_u8(),
            random_nat: !features.moderate_nat,
            split_tcp: features.vpn_accelerator,
            port_forwarding: features.port_forwarding,
            safe_mode: features.safe_mode,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CertificateBody {
    certificate: String,
    expiration_time: u64,
    refresh_time: u64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ApiErrorBody {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    error: String,
}

/// Map a backend response onto a certificate or a classified error
fn classify_response(response: &ApiResponse, features: &VpnFeatures) -> RefreshOutcome {
    if response.is_success() {
        let body: CertificateBody = response.json()?;
        return Ok(Certificate::from_unix(
            body.certificate,
            body.expiration_time,
            body.refresh_time,
            *features,
        ));
    }

    let error: ApiErrorBody = response.json().unwrap_or_default();
    match (response.status, error.code) {
        (401, _) | (422, API_CODE_INVALID_SESSION) => Err(RefreshError::SessionExpiredOrMissing),
        (422, API_CODE_KEY_USED_MULTIPLE_TIMES) => Err(RefreshError::RequiresNewKeys),
        (429, _) => {
            let retry_after = response
                .header("Retry-After")
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_RETRY_AFTER);
            Err(RefreshError::TooManyRequests { retry_after })
        }
        (status, code) => Err(RefreshError::Network(format!(
            "HTTP {} (code {}): {}",
            status, code, error.error
        ))),
    }
}

/// Issues certificates with a direct backend round trip
pub struct DirectIssuer {
    client: Arc<dyn NetworkClient>,
    session: RwLock<Option<ApiSession>>,
    certificate_path: String,
    session_fork_path: String,
    device_name: String,
    duration_mins: u64,
}

impl DirectIssuer {
    pub fn new(client: Arc<dyn NetworkClient>, config: &ControlConfig) -> Self {
        Self {
            client,
            session: RwLock::new(None),
            certificate_path: config.api_certificate_path.clone(),
            session_fork_path: config.api_session_fork_path.clone(),
            device_name: config.device_name.clone(),
            duration_mins: config.certificate_duration_mins,
        }
    }

    pub fn with_session(self, session: ApiSession) -> Self {
        Self {
            session: RwLock::new(Some(session)),
            ..self
        }
    }

    pub async fn set_session(&self, session: Option<ApiSession>) {
        *self.session.write().await = session;
    }

    pub async fn has_session(&self) -> bool {
        self.session.read().await.is_some()
    }

    /// Exchange a session fork selector for a session of our own
    pub async fn fork_session(
        &self,
        selector: &str,
        cookie: Option<&str>,
    ) -> Result<ApiSession, RefreshError> {
        let mut request = ApiRequest::get(format!("{}/{}", self.session_fork_path, selector));
        if let Some(cookie) = cookie {
            request = request.with_header("Cookie", cookie);
        }

        let response = self.client.perform(request).await?;
        match response.status {
            200 => {
                let session: ApiSession = response.json()?;
                info!("Forked backend session {}", session.uid);
                self.set_session(Some(session.clone())).await;
                Ok(session)
            }
            401 | 404 | 422 => Err(RefreshError::SessionExpiredOrMissing),
            status => Err(RefreshError::Network(format!("Session fork failed: HTTP {}", status))),
        }
    }
}

#[async_trait]
impl CertificateIssuer for DirectIssuer {
    async fn refresh_certificate(&self, keys: &KeyPair, features: &VpnFeatures) -> RefreshOutcome {
        let session = self
            .session
            .read()
            .await
            .clone()
            .ok_or(RefreshError::SessionExpiredOrMissing)?;

        let body = CertificateRequest {
            client_public_key: keys.public_key_encoded(),
            client_public_key_mode: "X25519",
            mode: "session",
            device_name: &self.device_name,
            duration: format!("{} min", self.duration_mins),
            features: features.into(),
        };
        let request = ApiRequest::post_json(&self.certificate_path, &body)?
            .with_header("x-pm-uid", &session.uid)
            .with_header("Authorization", format!("Bearer {}", session.access_token));

        debug!("Requesting certificate for {:?} ({})", keys.public, features);
        let response = self.client.perform(request).await?;

        let outcome = classify_response(&response, features);
        match &outcome {
            Ok(certificate) => info!(
                "Certificate issued ({} bytes, valid until {})",
                certificate.certificate.len(),
                certificate.valid_until_unix()
            ),
            Err(RefreshError::SessionExpiredOrMissing) => {
                warn!("Backend rejected session {}, discarding it", session.uid);
                self.set_session(None).await;
            }
            Err(e) => warn!("Certificate request failed: {}", e),
        }
        outcome
    }
}

/// Delegates certificate issuance to the privileged tunnel process
pub struct IpcIssuer {
    channel: Arc<dyn ControlSender>,
}

impl IpcIssuer {
    pub fn new(channel: Arc<dyn ControlSender>) -> Self {
        Self { channel }
    }

    /// Forward a session selector so the privileged side can fork its own session
    pub async fn set_session_selector(
        &self,
        selector: impl Into<String>,
        cookie: Option<String>,
    ) -> Result<(), RefreshError> {
        let message = ControlMessage::SetSessionSelector {
            selector: selector.into(),
            cookie,
        };
        match self.channel.send(message).await? {
            ControlResponse::Ok => Ok(()),
            ControlResponse::Error(message) => Err(RefreshError::Ipc(message)),
            ControlResponse::ErrorSessionExpired => Err(RefreshError::SessionExpiredOrMissing),
            other => Err(RefreshError::Ipc(format!(
                "unexpected response to setSessionSelector: {:?}",
                other
            ))),
        }
    }
}

#[async_trait]
impl CertificateIssuer for IpcIssuer {
    async fn refresh_certificate(&self, keys: &KeyPair, features: &VpnFeatures) -> RefreshOutcome {
        debug!("Delegating certificate refresh for {:?} to tunnel process", keys.public);

        let message = ControlMessage::RefreshCertificate {
            features: Some(*features),
        };
        match self.channel.send(message).await? {
            ControlResponse::Certificate(certificate) => Ok(certificate),
            ControlResponse::ErrorSessionExpired => Err(RefreshError::SessionExpiredOrMissing),
            ControlResponse::ErrorNeedKeyRegeneration => Err(RefreshError::RequiresNewKeys),
            ControlResponse::ErrorTooManyCertRequests { retry_after } => {
                Err(RefreshError::TooManyRequests { retry_after })
            }
            ControlResponse::Error(message) => Err(RefreshError::Ipc(message)),
            ControlResponse::Ok => Err(RefreshError::Ipc(
                "refreshCertificate answered without a certificate".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::NetShieldLevel;
    use crate::testing::{ScriptedClient, ScriptedSender};

    fn session() -> ApiSession {
        ApiSession {
            uid: "uid-1".into(),
            access_token: "token".into(),
        }
    }

    fn issuer(client: Arc<ScriptedClient>) -> DirectIssuer {
        DirectIssuer::new(client, &ControlConfig::default()).with_session(session())
    }

    #[tokio::test]
    async fn test_direct_success_builds_certificate() {
        let client = Arc::new(ScriptedClient::new(vec![ApiResponse::new(
            200,
            r#"{"Code":1000,"Certificate":"PEM","ExpirationTime":2000,"RefreshTime":1500}"#,
        )]));
        let keys = KeyPair::generate();
        let features = VpnFeatures::default().with_netshield(NetShieldLevel::Malware);

        let certificate = issuer(client.clone())
            .refresh_certificate(&keys, &features)
            .await
            .unwrap();

        assert_eq!(certificate.certificate, "PEM");
        assert_eq!(certificate.valid_until_unix(), 2000);
        assert_eq!(certificate.refresh_after_unix(), 1500);
        assert_eq!(certificate.features, features);

        let request = client.requests().pop().unwrap();
        assert_eq!(request.headers.get("x-pm-uid").map(String::as_str), Some("uid-1"));
        let body: serde_json::Value = serde_json::from_slice(&request.body.unwrap()).unwrap();
        assert_eq!(body["ClientPublicKey"], keys.public_key_encoded());
        assert_eq!(body["Features"]["NetShieldLevel"], 1);
        assert_eq!(body["Duration"], "1440 min");
    }

    #[tokio::test]
    async fn test_direct_classifies_errors() {
        let cases = vec![
            (ApiResponse::new(401, "{}"), RefreshError::SessionExpiredOrMissing),
            (
                ApiResponse::new(422, r#"{"Code":2500,"Error":"Key used"}"#),
                RefreshError::RequiresNewKeys,
            ),
            (
                ApiResponse::new(429, "{}").with_header("Retry-After", "30"),
                RefreshError::TooManyRequests {
                    retry_after: Duration::from_secs(30),
                },
            ),
            (
                ApiResponse::new(429, "{}"),
                RefreshError::TooManyRequests {
                    retry_after: DEFAULT_RETRY_AFTER,
                },
            ),
        ];

        for (response, expected) in cases {
            let client = Arc::new(ScriptedClient::new(vec![response]));
            let result = issuer(client)
                .refresh_certificate(&KeyPair::generate(), &VpnFeatures::default())
                .await;
            assert_eq!(result, Err(expected));
        }
    }

    #[tokio::test]
    async fn test_direct_without_session_never_hits_network() {
        let client = Arc::new(ScriptedClient::new(vec![]));
        let issuer = DirectIssuer::new(client.clone(), &ControlConfig::default());

        let result = issuer
            .refresh_certificate(&KeyPair::generate(), &VpnFeatures::default())
            .await;

        assert_eq!(result, Err(RefreshError::SessionExpiredOrMissing));
        assert!(client.requests().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_session_is_discarded() {
        let client = Arc::new(ScriptedClient::new(vec![ApiResponse::new(401, "{}")]));
        let issuer = issuer(client);

        let _ = issuer
            .refresh_certificate(&KeyPair::generate(), &VpnFeatures::default())
            .await;
        assert!(!issuer.has_session().await);
    }

    #[tokio::test]
    async fn test_fork_session() {
        let client = Arc::new(ScriptedClient::new(vec![ApiResponse::new(
            200,
            r#"{"UID":"forked","AccessToken":"t2","RefreshToken":"r"}"#,
        )]));
        let issuer = DirectIssuer::new(client.clone(), &ControlConfig::default());

        let session = issuer.fork_session("sel", Some("c=1")).await.unwrap();

        assert_eq!(session.uid, "forked");
        assert!(issuer.has_session().await);
        assert_eq!(client.requests()[0].path, "/auth/v4/sessions/forks/sel");
    }

    #[tokio::test]
    async fn test_ipc_maps_typed_responses() {
        let cases = vec![
            (ControlResponse::ErrorSessionExpired, Err(RefreshError::SessionExpiredOrMissing)),
            (ControlResponse::ErrorNeedKeyRegeneration, Err(RefreshError::RequiresNewKeys)),
            (
                ControlResponse::ErrorTooManyCertRequests {
                    retry_after: Duration::from_secs(30),
                },
                Err(RefreshError::TooManyRequests {
                    retry_after: Duration::from_secs(30),
                }),
            ),
            (
                ControlResponse::Error("boom".into()),
                Err(RefreshError::Ipc("boom".into())),
            ),
        ];

        for (response, expected) in cases {
            let sender = Arc::new(ScriptedSender::new(vec![Ok(response)]));
            let issuer = IpcIssuer::new(sender.clone());
            let result = issuer
                .refresh_certificate(&KeyPair::generate(), &VpnFeatures::default())
                .await;
            assert_eq!(result, expected);
            assert_eq!(
                sender.sent(),
                vec![ControlMessage::RefreshCertificate {
                    features: Some(VpnFeatures::default())
                }]
            );
        }
    }

    #[tokio::test]
    async fn test_ipc_transport_failure_is_ipc_error() {
        let sender = Arc::new(ScriptedSender::new(vec![Err(IpcError::Disconnected)]));
        let result = IpcIssuer::new(sender)
            .refresh_certificate(&KeyPair::generate(), &VpnFeatures::default())
            .await;

        assert_eq!(
            result,
            Err(RefreshError::Ipc("Privileged process disconnected".into()))
        );
    }
}
