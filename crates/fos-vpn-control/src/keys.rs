//! Client key material
//!
//! Every connection certificate is bound to one X25519 client key. The
//! credential manager owns the pair; the issuer only ever sees the
//! public half, and the store persists nothing but the encoded secret.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use rand::rngs::OsRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

const KEY_LEN: usize = 32;

fn parse_encoded(encoded: &str) -> Result<[u8; KEY_LEN], KeyError> {
    let raw = BASE64
        .decode(encoded.trim())
        .map_err(|_| KeyError::InvalidBase64)?;
    <[u8; KEY_LEN]>::try_from(raw.as_slice()).map_err(|_| KeyError::InvalidLength)
}

/// Secret half of a client key. Never printed.
#[derive(Clone)]
pub struct PrivateKey(StaticSecret);

impl PrivateKey {
    pub fn generate() -> Self {
        Self(StaticSecret::random_from_rng(OsRng))
    }

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(StaticSecret::from(bytes))
    }

    pub fn from_base64(encoded: &str) -> Result<Self, KeyError> {
        parse_encoded(encoded).map(Self::from_bytes)
    }

    /// Derives the matching public key
    pub fn public_key(&self) -> PublicKey {
        PublicKey(X25519Public::from(&self.0))
    }

    pub fn to_bytes(&self) -> [u8; KEY_LEN] {
        self.0.to_bytes()
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0.as_bytes())
    }
}

impl PartialEq for PrivateKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.as_bytes() == other.0.as_bytes()
    }
}

impl Eq for PrivateKey {}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey(..)")
    }
}

/// Public half of a client key, sent to the backend when requesting a
/// certificate
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct PublicKey(X25519Public);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(X25519Public::from(bytes))
    }

    pub fn from_base64(encoded: &str) -> Result<Self, KeyError> {
        parse_encoded(encoded).map(Self::from_bytes)
    }

    pub fn to_bytes(&self) -> [u8; KEY_LEN] {
        self.0.to_bytes()
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0.as_bytes())
    }

    /// Short form for log lines
    fn fingerprint(&self) -> String {
        self.to_base64().chars().take(8).collect()
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({}..)", self.fingerprint())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

/// A client key with its derived public half
///
/// Serialized as the encoded private key alone; the public half is
/// recomputed on load so the two can never disagree.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyPair {
    pub private: PrivateKey,
    pub public: PublicKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        Self::from_private(PrivateKey::generate())
    }

    pub fn from_private(private: PrivateKey) -> Self {
        Self {
            public: private.public_key(),
            private,
        }
    }

    pub fn private_key_raw(&self) -> [u8; KEY_LEN] {
        self.private.to_bytes()
    }

    pub fn private_key_encoded(&self) -> String {
        self.private.to_base64()
    }

    pub fn public_key_raw(&self) -> [u8; KEY_LEN] {
        self.public.to_bytes()
    }

    /// The form the certificate endpoint expects
    pub fn public_key_encoded(&self) -> String {
        self.public.to_base64()
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("KeyPair").field(&self.public).finish()
    }
}

impl Serialize for KeyPair {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.private_key_encoded())
    }
}

impl<'de> Deserialize<'de> for KeyPair {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        PrivateKey::from_base64(&encoded)
            .map(KeyPair::from_private)
            .map_err(serde::de::Error::custom)
    }
}

/// Source of fresh client keys.
///
/// Only the credential manager in the application process calls this.
pub trait KeyGenerator: Send + Sync {
    fn generate(&self) -> Result<KeyPair, KeyError>;
}

/// Generator drawing from the OS random source
#[derive(Debug, Clone, Copy, Default)]
pub struct X25519Generator;

impl KeyGenerator for X25519Generator {
    fn generate(&self) -> Result<KeyPair, KeyError> {
        Ok(KeyPair::generate())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("Key is not valid base64")]
    InvalidBase64,

    #[error("Key must be 32 bytes")]
    InvalidLength,

    #[error("Key generation failed: {0}")]
    GenerationFailed(String),
}
