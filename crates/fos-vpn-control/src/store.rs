//! Key/Certificate Store
//!
//! Persistence seam for the client key pair and its certificate. The
//! credential manager is the only writer; everything else reads the
//! derived [`AuthenticationData`](crate::AuthenticationData).

use crate::certificate::Certificate;
use crate::keys::KeyPair;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::{debug, warn};

/// Secure key-value storage for keys and certificates
pub trait KeyCertStore: Send + Sync {
    fn get_keys(&self) -> Result<Option<KeyPair>, StoreError>;
    fn get_certificate(&self) -> Result<Option<Certificate>, StoreError>;
    fn store_keys(&self, keys: &KeyPair) -> Result<(), StoreError>;
    fn store_certificate(&self, certificate: &Certificate) -> Result<(), StoreError>;
    fn delete_keys(&self) -> Result<(), StoreError>;
    fn delete_certificate(&self) -> Result<(), StoreError>;
}

/// Store errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("Storage lock poisoned")]
    Poisoned,

    #[error("IO error: {0}")]
    Io(String),

    #[error("Corrupt stored data: {0}")]
    Corrupt(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoredCredentials {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    keys: Option<KeyPair>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    certificate: Option<Certificate>,
}

/// In-memory store
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<StoredCredentials>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read<T>(&self, f: impl FnOnce(&StoredCredentials) -> T) -> Result<T, StoreError> {
        self.inner.read().map(|guard| f(&guard)).map_err(|_| StoreError::Poisoned)
    }

    fn write(&self, f: impl FnOnce(&mut StoredCredentials)) -> Result<(), StoreError> {
        self.inner
            .write()
            .map(|mut guard| f(&mut guard))
            .map_err(|_| StoreError::Poisoned)
    }
}

impl KeyCertStore for MemoryStore {
    fn get_keys(&self) -> Result<Option<KeyPair>, StoreError> {
        self.read(|s| s.keys.clone())
    }

    fn get_certificate(&self) -> Result<Option<Certificate>, StoreError> {
        self.read(|s| s.certificate.clone())
    }

    fn store_keys(&self, keys: &KeyPair) -> Result<(), StoreError> {
        self.write(|s| s.keys = Some(keys.clone()))
    }

    fn store_certificate(&self, certificate: &Certificate) -> Result<(), StoreError> {
        self.write(|s| s.certificate = Some(certificate.clone()))
    }

    fn delete_keys(&self) -> Result<(), StoreError> {
        self.write(|s| s.keys = None)
    }

    fn delete_certificate(&self) -> Result<(), StoreError> {
        self.write(|s| s.certificate = None)
    }
}

/// JSON file store
///
/// Keeps a cached copy in memory and rewrites the whole file on every
/// mutation.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    cache: MemoryStore,
}

impl FileStore {
    /// Open (or lazily create) a store at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let stored = match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str::<StoredCredentials>(&content)
                .map_err(|e| StoreError::Corrupt(e.to_string()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No credential file at {}, starting empty", path.display());
                StoredCredentials::default()
            }
            Err(e) => return Err(StoreError::Io(e.to_string())),
        };

        Ok(Self {
            path,
            cache: MemoryStore {
                inner: RwLock::new(stored),
            },
        })
    }

    fn persist(&self) -> Result<(), StoreError> {
        let content = self
            .cache
            .read(|stored| serde_json::to_string_pretty(stored))?
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;

        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, content).map_err(|e| StoreError::Io(e.to_string()))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| {
            warn!("Failed to replace credential file {}: {}", self.path.display(), e);
            StoreError::Io(e.to_string())
        })
    }
}

impl KeyCertStore for FileStore {
    fn get_keys(&self) -> Result<Option<KeyPair>, StoreError> {
        self.cache.get_keys()
    }

    fn get_certificate(&self) -> Result<Option<Certificate>, StoreError> {
        self.cache.get_certificate()
    }

    fn store_keys(&self, keys: &KeyPair) -> Result<(), StoreError> {
        self.cache.store_keys(keys)?;
        self.persist()
    }

    fn store_certificate(&self, certificate: &Certificate) -> Result<(), StoreError> {
        self.cache.store_certificate(certificate)?;
        self.persist()
    }

    fn delete_keys(&self) -> Result<(), StoreError> {
        self.cache.delete_keys()?;
        self.persist()
    }

    fn delete_certificate(&self) -> Result<(), StoreError> {
        self.cache.delete_certificate()?;
        self.persist()
    }
}
