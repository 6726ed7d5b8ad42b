//! OS credential vault seam.
//!
//! The pinentry caches passphrases here when the upstream allows it.  An
//! absent credential is not an error — [`CredentialVault::lookup`] returns
//! `None` and [`CredentialVault::delete`] succeeds — so the error channel
//! only carries real vault failures.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use zeroize::Zeroizing;

#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("vault lookup failed: {0}")]
    Lookup(String),

    #[error("vault store failed: {0}")]
    Store(String),

    #[error("vault delete failed: {0}")]
    Delete(String),
}

/// Named secret storage backed by the operating system.
#[async_trait]
pub trait CredentialVault: Send + Sync {
    /// Fetch a secret; `None` when no credential exists under `name`.
    async fn lookup(&self, name: &str) -> Result<Option<Zeroizing<Vec<u8>>>, VaultError>;

    /// Create or replace a secret.
    async fn store(&self, name: &str, secret: &[u8]) -> Result<(), VaultError>;

    /// Remove a secret.  Deleting an absent credential succeeds.
    async fn delete(&self, name: &str) -> Result<(), VaultError>;
}

/// In-memory vault for tests and headless operation.
#[derive(Debug, Default)]
pub struct MemoryVault {
    entries: Mutex<HashMap<String, Zeroizing<Vec<u8>>>>,
}

impl MemoryVault {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialVault for MemoryVault {
    async fn lookup(&self, name: &str) -> Result<Option<Zeroizing<Vec<u8>>>, VaultError> {
        let entries = self.entries.lock().expect("vault mutex poisoned");
        Ok(entries.get(name).cloned())
    }

    async fn store(&self, name: &str, secret: &[u8]) -> Result<(), VaultError> {
        let mut entries = self.entries.lock().expect("vault mutex poisoned");
        entries.insert(name.to_string(), Zeroizing::new(secret.to_vec()));
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), VaultError> {
        let mut entries = self.entries.lock().expect("vault mutex poisoned");
        entries.remove(name);
        Ok(())
    }
}
