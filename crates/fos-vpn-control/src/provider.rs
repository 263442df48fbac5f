//! Privileged-process side of the control channel
//!
//! [`ProviderHandler`] answers the application's control messages: it
//! issues certificates on the application's behalf (forking a backend
//! session from the selector it was handed) and starts or stops the
//! tunnel through a [`TunnelBackend`].
//!
//! It only reads the key/certificate store. Issued certificates travel
//! back over the channel and the application stores them.

use crate::channel::ControlHandler;
use crate::config::TunnelConfig;
use crate::features::VpnFeatures;
use crate::issuer::{CertificateIssuer, DirectIssuer, RefreshError};
use crate::message::{ControlMessage, ControlResponse};
use crate::store::KeyCertStore;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// The tunnel implementation inside the privileged process
#[async_trait]
pub trait TunnelBackend: Send + Sync {
    async fn start(&self, config: TunnelConfig) -> Result<(), String>;
    async fn stop(&self);
}

#[derive(Clone, PartialEq, Eq)]
struct Selector {
    selector: String,
    cookie: Option<String>,
}

/// Handles control messages inside the privileged process
pub struct ProviderHandler {
    issuer: DirectIssuer,
    store: Arc<dyn KeyCertStore>,
    backend: Arc<dyn TunnelBackend>,
    selector: Mutex<Option<Selector>>,
}

impl ProviderHandler {
    pub fn new(
        issuer: DirectIssuer,
        store: Arc<dyn KeyCertStore>,
        backend: Arc<dyn TunnelBackend>,
    ) -> Self {
        Self {
            issuer,
            store,
            backend,
            selector: Mutex::new(None),
        }
    }

    async fn refresh_certificate(&self, features: Option<VpnFeatures>) -> ControlResponse {
        let keys = match self.store.get_keys() {
            Ok(Some(keys)) => keys,
            Ok(None) => {
                warn!("refreshCertificate without stored keys");
                return ControlResponse::ErrorNeedKeyRegeneration;
            }
            Err(e) => return ControlResponse::Error(e.to_string()),
        };

        let features = match features {
            Some(features) => features,
            None => self
                .store
                .get_certificate()
                .ok()
                .flatten()
                .map(|certificate| certificate.features)
                .unwrap_or_default(),
        };

        if !self.issuer.has_session().await {
            let Some(selector) = self.selector.lock().await.clone() else {
                return ControlResponse::ErrorSessionExpired;
            };
            let forked = self
                .issuer
                .fork_session(&selector.selector, selector.cookie.as_deref())
                .await;
            match forked {
                // A selector can only be redeemed once
                Ok(_) => self.forget_selector(&selector).await,
                Err(
                    e @ (RefreshError::SessionExpiredOrMissing | RefreshError::RequiresNewKeys),
                ) => {
                    warn!("Session selector rejected: {}", e);
                    self.forget_selector(&selector).await;
                    return Self::error_response(e);
                }
                Err(e) => {
                    warn!("Session fork failed, keeping selector for a retry: {}", e);
                    return Self::error_response(e);
                }
            }
        }

        match self.issuer.refresh_certificate(&keys, &features).await {
            Ok(certificate) => ControlResponse::Certificate(certificate),
            Err(e) => Self::error_response(e),
        }
    }

    async fn forget_selector(&self, used: &Selector) {
        let mut selector = self.selector.lock().await;
        if selector.as_ref() == Some(used) {
            *selector = None;
        }
    }

    fn error_response(error: RefreshError) -> ControlResponse {
        match error {
            RefreshError::SessionExpiredOrMissing => ControlResponse::ErrorSessionExpired,
            RefreshError::RequiresNewKeys => ControlResponse::ErrorNeedKeyRegeneration,
            RefreshError::TooManyRequests { retry_after } => {
                ControlResponse::ErrorTooManyCertRequests { retry_after }
            }
            RefreshError::Ipc(message) | RefreshError::Network(message) => {
                ControlResponse::Error(message)
            }
        }
    }
}

#[async_trait]
impl ControlHandler for ProviderHandler {
    async fn handle(&self, message: ControlMessage) -> ControlResponse {
        match message {
            ControlMessage::RefreshCertificate { features } => {
                self.refresh_certificate(features).await
            }
            ControlMessage::SetSessionSelector { selector, cookie } => {
                debug!("Received session selector");
                *self.selector.lock().await = Some(Selector { selector, cookie });
                self.issuer.set_session(None).await;
                ControlResponse::Ok
            }
            ControlMessage::StartTunnel(config) => {
                info!("Starting tunnel to {}", config.target);
                match self.backend.start(config).await {
                    Ok(()) => ControlResponse::Ok,
                    Err(reason) => {
                        warn!("Tunnel start failed: {}", reason);
                        ControlResponse::Error(reason)
                    }
                }
            }
            ControlMessage::StopTunnel => {
                info!("Stopping tunnel");
                self.backend.stop().await;
                ControlResponse::Ok
            }
        }
    }
}
