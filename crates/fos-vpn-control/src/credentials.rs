//! Credential Lifecycle Manager
//!
//! Decides whether the stored key pair and certificate can serve a
//! connection and, when they can't, generates keys and/or obtains a new
//! certificate.
//!
//! # Request Coalescing
//!
//! At most one refresh runs at a time. Callers arriving while it is in
//! flight wait on the same result instead of starting a second network
//! or IPC round trip:
//!
//! ```text
//! caller A ──┐
//!            ├──▶ [in-flight refresh] ──▶ result ──┬──▶ caller A
//! caller B ──┘                                     └──▶ caller B
//! ```
//!
//! A request for a *different* feature set cancels the running refresh
//! and starts over; callers of the cancelled refresh get
//! [`AuthError::Cancelled`].

use crate::certificate::{AuthenticationData, Certificate};
use crate::features::VpnFeatures;
use crate::issuer::{CertificateIssuer, RefreshError};
use crate::keys::{KeyGenerator, KeyPair};
use crate::store::{KeyCertStore, StoreError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

/// Credential errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("Key generation failed: {0}")]
    GenerationFailed(String),

    #[error("Session expired or missing, re-authentication required")]
    SessionExpiredOrMissing,

    #[error("Backend requires new keys")]
    RequiresNewKeys,

    #[error("Too many certificate requests, retry after {}s", retry_after.as_secs())]
    TooManyRequests { retry_after: Duration },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("IPC error: {0}")]
    Ipc(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("Issuer returned an unusable certificate: {0}")]
    InvalidCertificate(String),

    #[error("Superseded by a request for different features")]
    Cancelled,
}

impl AuthError {
    /// Needs the user to sign in again
    pub fn requires_reauthentication(&self) -> bool {
        matches!(self, AuthError::SessionExpiredOrMissing)
    }

    /// Backoff hint for rate-limited requests
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            AuthError::TooManyRequests { retry_after } => Some(*retry_after),
            _ => None,
        }
    }
}

impl From<RefreshError> for AuthError {
    fn from(e: RefreshError) -> Self {
        match e {
            RefreshError::Ipc(message) => AuthError::Ipc(message),
            RefreshError::Network(message) => AuthError::Transport(message),
            RefreshError::SessionExpiredOrMissing => AuthError::SessionExpiredOrMissing,
            RefreshError::RequiresNewKeys => AuthError::RequiresNewKeys,
            RefreshError::TooManyRequests { retry_after } => {
                AuthError::TooManyRequests { retry_after }
            }
        }
    }
}

/// Credential state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialState {
    Idle,
    /// Obtaining credentials after a cache miss
    Loading,
    /// Explicitly requested refresh in progress
    Refreshing,
    Loaded(AuthenticationData),
    LoadingFailed(AuthError),
}

impl CredentialState {
    /// Check if an operation is running
    pub fn is_busy(&self) -> bool {
        matches!(self, CredentialState::Loading | CredentialState::Refreshing)
    }

    pub fn authentication_data(&self) -> Option<&AuthenticationData> {
        match self {
            CredentialState::Loaded(data) => Some(data),
            _ => None,
        }
    }
}

/// Why stored credentials could not be reused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Miss {
    NoKeys,
    NoCertificate,
    FeatureMismatch,
    Expired,
}

type AuthResult = Result<AuthenticationData, AuthError>;

struct InFlight {
    id: u64,
    features: VpnFeatures,
    result: watch::Receiver<Option<AuthResult>>,
    task: AbortHandle,
}

struct Inner {
    store: Arc<dyn KeyCertStore>,
    generator: Arc<dyn KeyGenerator>,
    issuer: Arc<dyn CertificateIssuer>,
    state: watch::Sender<CredentialState>,
    in_flight: Mutex<Option<InFlight>>,
    next_id: AtomicU64,
}

/// Credential Lifecycle Manager
///
/// Sole writer of the key/certificate store. Cheap to clone; all clones
/// share the same state and in-flight refresh.
#[derive(Clone)]
pub struct CredentialManager {
    inner: Arc<Inner>,
}

impl CredentialManager {
    pub fn new(
        store: Arc<dyn KeyCertStore>,
        generator: Arc<dyn KeyGenerator>,
        issuer: Arc<dyn CertificateIssuer>,
    ) -> Self {
        let (state, _) = watch::channel(CredentialState::Idle);
        Self {
            inner: Arc::new(Inner {
                store,
                generator,
                issuer,
                state,
                in_flight: Mutex::new(None),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Current state
    pub fn state(&self) -> CredentialState {
        self.inner.state.borrow().clone()
    }

    /// Watch state changes
    pub fn subscribe(&self) -> watch::Receiver<CredentialState> {
        self.inner.state.subscribe()
    }

    /// The stored certificate, expired or not (diagnostics only)
    pub fn stored_certificate(&self) -> Result<Option<Certificate>, AuthError> {
        Ok(self.inner.store.get_certificate()?)
    }

    /// Return usable credentials for `features`, refreshing on a miss
    ///
    /// A stored certificate inside its soft-refresh window is still
    /// returned without a network call.
    pub async fn load_authentication_data(&self, features: &VpnFeatures) -> AuthResult {
        let result = {
            let mut slot = self.lock_in_flight();
            match slot.as_ref() {
                Some(flight) if flight.features == *features => {
                    debug!("Joining in-flight credential refresh #{}", flight.id);
                    flight.result.clone()
                }
                _ => match self.cached(features)? {
                    Ok(data) => {
                        if slot.is_none() {
                            self.inner.state.send_replace(CredentialState::Loaded(data.clone()));
                        }
                        return Ok(data);
                    }
                    Err(miss) => {
                        debug!("Stored credentials unusable ({:?}), refreshing", miss);
                        self.start_flight(&mut slot, *features, CredentialState::Loading)
                    }
                },
            }
        };
        Self::wait(result).await
    }

    /// Obtain a new certificate for `features` regardless of what is stored
    pub async fn refresh(&self, features: &VpnFeatures) -> AuthResult {
        let result = {
            let mut slot = self.lock_in_flight();
            match slot.as_ref() {
                Some(flight) if flight.features == *features => flight.result.clone(),
                _ => self.start_flight(&mut slot, *features, CredentialState::Refreshing),
            }
        };
        Self::wait(result).await
    }

    /// Forget keys and certificate (logout)
    pub fn clear(&self) -> Result<(), AuthError> {
        if let Some(flight) = self.lock_in_flight().take() {
            flight.task.abort();
        }
        self.inner.store.delete_certificate()?;
        self.inner.store.delete_keys()?;
        self.inner.state.send_replace(CredentialState::Idle);
        info!("Cleared stored credentials");
        Ok(())
    }

    fn lock_in_flight(&self) -> MutexGuard<'_, Option<InFlight>> {
        self.inner
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Read the store; `Ok(Err(miss))` means a refresh is needed
    fn cached(
        &self,
        features: &VpnFeatures,
    ) -> Result<Result<AuthenticationData, Miss>, AuthError> {
        let Some(keys) = self.inner.store.get_keys()? else {
            return Ok(Err(Miss::NoKeys));
        };
        let Some(certificate) = self.inner.store.get_certificate()? else {
            return Ok(Err(Miss::NoCertificate));
        };

        let now = SystemTime::now();
        if !certificate.is_usable_for(features, now) {
            let miss = if certificate.is_expired_at(now) {
                Miss::Expired
            } else {
                Miss::FeatureMismatch
            };
            return Ok(Err(miss));
        }
        if certificate.should_refresh_at(now) {
            debug!("Stored certificate is past its refresh time, using it until expiry");
        }
        Ok(Ok(AuthenticationData::new(keys.private, &certificate)))
    }

    fn start_flight(
        &self,
        slot: &mut Option<InFlight>,
        features: VpnFeatures,
        state: CredentialState,
    ) -> watch::Receiver<Option<AuthResult>> {
        if let Some(previous) = slot.take() {
            info!(
                "Cancelling credential refresh #{} for {} in favour of {}",
                previous.id, previous.features, features
            );
            previous.task.abort();
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = watch::channel(None);
        self.inner.state.send_replace(state);

        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            let result = inner.obtain(&features).await;

            let current = {
                let mut slot = inner.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
                let current = slot.as_ref().is_some_and(|f| f.id == id);
                if current {
                    *slot = None;
                }
                current
            };

            // A superseded refresh must not overwrite the state of its successor
            if current {
                inner.state.send_replace(match &result {
                    Ok(data) => CredentialState::Loaded(data.clone()),
                    Err(e) => CredentialState::LoadingFailed(e.clone()),
                });
            }
            let _ = tx.send(Some(result));
        });

        *slot = Some(InFlight {
            id,
            features,
            result: rx.clone(),
            task: task.abort_handle(),
        });
        rx
    }

    async fn wait(mut result: watch::Receiver<Option<AuthResult>>) -> AuthResult {
        match result.wait_for(Option::is_some).await {
            Ok(value) => (*value).clone().unwrap_or(Err(AuthError::Cancelled)),
            Err(_) => Err(AuthError::Cancelled),
        }
    }
}

impl Inner {
    /// Generate (if needed) keys and obtain a certificate for them
    async fn obtain(&self, features: &VpnFeatures) -> AuthResult {
        let mut keys = match self.store.get_keys()? {
            Some(keys) => keys,
            None => self.regenerate_keys()?,
        };

        let certificate = match self.issuer.refresh_certificate(&keys, features).await {
            Err(RefreshError::RequiresNewKeys) => {
                warn!("Backend rejected {:?}, retrying once with new keys", keys.public);
                keys = self.regenerate_keys()?;
                self.issuer.refresh_certificate(&keys, features).await?
            }
            outcome => outcome?,
        };

        if certificate.is_expired_at(SystemTime::now()) {
            return Err(AuthError::InvalidCertificate("already expired".to_string()));
        }
        if !certificate.features.is_compatible_with(features) {
            return Err(AuthError::InvalidCertificate(format!(
                "issued for {} instead of {}",
                certificate.features, features
            )));
        }

        self.store.store_certificate(&certificate)?;
        info!(
            "Certificate refreshed (valid until {}, refresh after {})",
            certificate.valid_until_unix(),
            certificate.refresh_after_unix()
        );
        Ok(AuthenticationData::new(keys.private, &certificate))
    }

    fn regenerate_keys(&self) -> Result<KeyPair, AuthError> {
        let keys = self
            .generator
            .generate()
            .map_err(|e| AuthError::GenerationFailed(e.to_string()))?;
        self.store.store_keys(&keys)?;
        self.store.delete_certificate()?;
        info!("Generated new client keys {:?}", keys.public);
        Ok(keys)
    }
}
