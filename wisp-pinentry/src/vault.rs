//! OS keyring vault.
//!
//! [`CredentialVault`] over the platform credential store (Windows
//! Credential Manager, macOS Keychain, Secret Service).  The keyring calls
//! block, so each operation runs on the blocking pool.

use async_trait::async_trait;
use keyring::Entry;
use tracing::debug;
use zeroize::Zeroizing;

use wisp_core::{CredentialVault, VaultError};

/// User field attached to every entry; the credential identity lives in the
/// service name so the vault shows `<prefix>=<keyinfo>` verbatim.
const ENTRY_USER: &str = "wisp";

pub struct KeyringVault;

impl KeyringVault {
    pub fn new() -> Self {
        Self
    }
}

impl Default for KeyringVault {
    fn default() -> Self {
        Self::new()
    }
}

fn entry(name: &str) -> Result<Entry, keyring::Error> {
    Entry::new(name, ENTRY_USER)
}

#[async_trait]
impl CredentialVault for KeyringVault {
    async fn lookup(&self, name: &str) -> Result<Option<Zeroizing<Vec<u8>>>, VaultError> {
        let name = name.to_string();
        tokio::task::spawn_blocking(move || match entry(&name)?.get_secret() {
            Ok(secret) => Ok(Some(Zeroizing::new(secret))),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(err) => Err(err),
        })
        .await
        .expect("keyring task panicked")
        .map_err(|err: keyring::Error| VaultError::Lookup(err.to_string()))
    }

    async fn store(&self, name: &str, secret: &[u8]) -> Result<(), VaultError> {
        let name = name.to_string();
        let secret = Zeroizing::new(secret.to_vec());
        tokio::task::spawn_blocking(move || entry(&name)?.set_secret(&secret))
            .await
            .expect("keyring task panicked")
            .map_err(|err| VaultError::Store(err.to_string()))
    }

    async fn delete(&self, name: &str) -> Result<(), VaultError> {
        let name = name.to_string();
        tokio::task::spawn_blocking(move || match entry(&name)?.delete_credential() {
            Ok(()) => Ok(()),
            // deleting an absent credential succeeds
            Err(keyring::Error::NoEntry) => {
                debug!("no credential to delete");
                Ok(())
            }
            Err(err) => Err(err),
        })
        .await
        .expect("keyring task panicked")
        .map_err(|err: keyring::Error| VaultError::Delete(err.to_string()))
    }
}
