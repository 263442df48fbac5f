//! Connection Certificates
//!
//! A short-lived certificate signed by the backend for the client's
//! public key. `refresh_after` opens a soft-refresh window before the
//! hard `valid_until` expiry.

use crate::features::VpnFeatures;
use crate::keys::PrivateKey;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Signed connection certificate
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate {
    /// PEM body as issued by the backend
    pub certificate: String,
    pub valid_until: SystemTime,
    pub refresh_after: SystemTime,
    /// Features the certificate was issued for
    pub features: VpnFeatures,
}

impl Certificate {
    /// Create a certificate, clamping `refresh_after` to `valid_until`
    pub fn new(
        certificate: impl Into<String>,
        valid_until: SystemTime,
        refresh_after: SystemTime,
        features: VpnFeatures,
    ) -> Self {
        Self {
            certificate: certificate.into(),
            valid_until,
            refresh_after: refresh_after.min(valid_until),
            features,
        }
    }

    /// Create from unix timestamps (seconds), as returned by the backend
    pub fn from_unix(
        certificate: impl Into<String>,
        valid_until_secs: u64,
        refresh_after_secs: u64,
        features: VpnFeatures,
    ) -> Self {
        Self::new(
            certificate,
            from_unix_secs(valid_until_secs),
            from_unix_secs(refresh_after_secs),
            features,
        )
    }

    /// Hard expiry reached
    pub fn is_expired_at(&self, now: SystemTime) -> bool {
        now >= self.valid_until
    }

    /// Inside the soft-refresh window (or past it)
    pub fn should_refresh_at(&self, now: SystemTime) -> bool {
        now >= self.refresh_after
    }

    /// Usable for a connection with `features` at `now`
    pub fn is_usable_for(&self, features: &VpnFeatures, now: SystemTime) -> bool {
        !self.is_expired_at(now) && self.features.is_compatible_with(features)
    }

    pub fn valid_until_unix(&self) -> u64 {
        to_unix_secs(self.valid_until)
    }

    pub fn refresh_after_unix(&self) -> u64 {
        to_unix_secs(self.refresh_after)
    }
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("len", &self.certificate.len())
            .field("valid_until", &self.valid_until_unix())
            .field("refresh_after", &self.refresh_after_unix())
            .field("features", &self.features)
            .finish()
    }
}

pub(crate) fn from_unix_secs(secs: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(secs)
}

pub(crate) fn to_unix_secs(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// The minimal credential handed to the protocol agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticationData {
    pub key: PrivateKey,
    pub certificate: String,
    pub(crate) valid_until: SystemTime,
    pub(crate) refresh_after: SystemTime,
    pub(crate) features: VpnFeatures,
}

impl AuthenticationData {
    pub fn new(key: PrivateKey, certificate: &Certificate) -> Self {
        Self {
            key,
            certificate: certificate.certificate.clone(),
            valid_until: certificate.valid_until,
            refresh_after: certificate.refresh_after,
            features: certificate.features,
        }
    }

    pub fn valid_until(&self) -> SystemTime {
        self.valid_until
    }

    pub fn refresh_after(&self) -> SystemTime {
        self.refresh_after
    }

    pub fn features(&self) -> &VpnFeatures {
        &self.features
    }
}
