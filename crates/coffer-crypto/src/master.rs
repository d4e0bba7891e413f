//! Master key provider
//!
//! Resolves the single root key for a vault instance. The key is looked up
//! in the secret store; if there is none, 32 fresh bytes are generated and
//! written back before they are used. An unpersisted root key is never
//! adopted: after a restart it would be gone, and every agent key wrapped
//! under it with it.
//!
//! ```text
//! Uninitialized -> (Loaded | Generated) -> Closed
//! ```

use secrecy::{ExposeSecret, SecretString};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::cipher::CipherError;
use crate::key::SymmetricKey;
use crate::keychain::{KeychainError, SecretStore};

#[derive(Error, Debug)]
pub enum KeyStoreError {
    #[error("Failed to store master key in secret store: {0}")]
    Persist(#[source] KeychainError),

    #[error("Secret store entry {service}/{account} does not hold a 32-byte base64 key")]
    CorruptKey { service: String, account: String },

    #[error("Master key generation failed: {0}")]
    Generate(#[source] CipherError),

    #[error("Master key provider is closed")]
    Closed,
}

/// Where the active master key came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyOrigin {
    Loaded,
    Generated,
}

enum State {
    Uninitialized,
    Active { key: SymmetricKey, origin: KeyOrigin },
    Closed,
}

pub struct MasterKeyProvider {
    store: Arc<dyn SecretStore>,
    service: String,
    account: String,
    state: State,
}

impl MasterKeyProvider {
    pub fn new(store: Arc<dyn SecretStore>, service: &str, account: &str) -> Self {
        Self {
            store,
            service: service.to_string(),
            account: account.to_string(),
            state: State::Uninitialized,
        }
    }

    /// Load or create the master key. Calling it again once active is a no-op.
    pub fn initialize(&mut self) -> Result<KeyOrigin, KeyStoreError> {
        match self.state {
            State::Active { origin, .. } => return Ok(origin),
            State::Closed => return Err(KeyStoreError::Closed),
            State::Uninitialized => {}
        }

        let (key, origin) = match self.load()? {
            Some(key) => (key, KeyOrigin::Loaded),
            None => (self.generate()?, KeyOrigin::Generated),
        };

        info!(service = %self.service, ?origin, "Master key active");
        self.state = State::Active { key, origin };
        Ok(origin)
    }

    fn load(&self) -> Result<Option<SymmetricKey>, KeyStoreError> {
        let stored = match self.store.get(&self.service, &self.account) {
            Ok(stored) => stored,
            Err(e) => {
                warn!(service = %self.service, error = %e, "Secret store read failed, treating as no existing key");
                None
            }
        };

        match stored {
            None => Ok(None),
            Some(secret) => SymmetricKey::from_base64(secret.expose_secret())
                .map(Some)
                .map_err(|_| KeyStoreError::CorruptKey {
                    service: self.service.clone(),
                    account: self.account.clone(),
                }),
        }
    }

    fn generate(&self) -> Result<SymmetricKey, KeyStoreError> {
        let key = SymmetricKey::generate().map_err(KeyStoreError::Generate)?;
        let encoded = SecretString::new(key.to_base64().to_string());
        self.store
            .set(&self.service, &self.account, &encoded)
            .map_err(KeyStoreError::Persist)?;
        Ok(key)
    }

    pub fn has_key(&self) -> bool {
        matches!(self.state, State::Active { .. })
    }

    pub fn key(&self) -> Option<&SymmetricKey> {
        match &self.state {
            State::Active { key, .. } => Some(key),
            _ => None,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, State::Closed)
    }

    /// Drop the in-memory key. The secret store entry is left alone.
    pub fn close(&mut self) {
        // Replacing the state drops the key, which zeroizes it
        self.state = State::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keychain::MemorySecretStore;

    const SERVICE: &str = "coffer-test";
    const ACCOUNT: &str = "coffer";

    #[test]
    fn test_generates_then_loads_same_key() {
        let store = Arc::new(MemorySecretStore::new());

        let mut first = MasterKeyProvider::new(store.clone(), SERVICE, ACCOUNT);
        assert!(!first.has_key());
        assert_eq!(first.initialize().unwrap(), KeyOrigin::Generated);
        assert!(first.has_key());

        let mut second = MasterKeyProvider::new(store.clone(), SERVICE, ACCOUNT);
        assert_eq!(second.initialize().unwrap(), KeyOrigin::Loaded);
        assert_eq!(first.key().unwrap(), second.key().unwrap());
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let store = Arc::new(MemorySecretStore::new());
        let mut provider = MasterKeyProvider::new(store, SERVICE, ACCOUNT);
        provider.initialize().unwrap();
        let before = provider.key().unwrap().clone();

        assert_eq!(provider.initialize().unwrap(), KeyOrigin::Generated);
        assert_eq!(provider.key().unwrap(), &before);
    }

    #[test]
    fn test_unpersistable_key_is_fatal() {
        let store = Arc::new(MemorySecretStore::new());
        store.set_read_only(true);

        let mut provider = MasterKeyProvider::new(store, SERVICE, ACCOUNT);
        let result = provider.initialize();
        assert!(matches!(result, Err(KeyStoreError::Persist(_))));
        assert!(!provider.has_key());
    }

    #[test]
    fn test_corrupt_stored_key_is_not_overwritten() {
        let store = Arc::new(MemorySecretStore::new());
        store
            .set(SERVICE, ACCOUNT, &SecretString::new("dG9vIHNob3J0".into()))
            .unwrap();

        let mut provider = MasterKeyProvider::new(store.clone(), SERVICE, ACCOUNT);
        assert!(matches!(
            provider.initialize(),
            Err(KeyStoreError::CorruptKey { .. })
        ));

        let still_there = store.get(SERVICE, ACCOUNT).unwrap().unwrap();
        assert_eq!(still_there.expose_secret(), "dG9vIHNob3J0");
    }

    #[test]
    fn test_close_discards_key_but_keeps_store_entry() {
        let store = Arc::new(MemorySecretStore::new());
        let mut provider = MasterKeyProvider::new(store.clone(), SERVICE, ACCOUNT);
        provider.initialize().unwrap();

        provider.close();
        assert!(!provider.has_key());
        assert!(provider.is_closed());
        assert!(matches!(provider.initialize(), Err(KeyStoreError::Closed)));
        assert!(store.get(SERVICE, ACCOUNT).unwrap().is_some());
    }
}
