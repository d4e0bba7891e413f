//! Secret-store backends for the master key
//!
//! The vault never writes its root key into its own files. It goes to
//! whatever implements [`SecretStore`]: the OS keychain in production,
//! an in-memory map in tests and throwaway sessions.

use secrecy::{ExposeSecret, SecretString};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum KeychainError {
    #[error("Keychain not available")]
    NotAvailable,
    #[error("Keychain is read-only")]
    ReadOnly,
    #[error("Platform error: {0}")]
    Platform(String),
}

/// External store addressed by a (service, account) pair
pub trait SecretStore: Send + Sync {
    /// `Ok(None)` means no entry exists for the pair
    fn get(&self, service: &str, account: &str) -> Result<Option<SecretString>, KeychainError>;

    fn set(&self, service: &str, account: &str, secret: &SecretString) -> Result<(), KeychainError>;
}

/// OS keychain (macOS Keychain, Secret Service, Windows Credential Manager)
#[derive(Debug, Default, Clone, Copy)]
pub struct KeychainProvider;

impl KeychainProvider {
    pub fn new() -> Self {
        Self
    }

    fn entry(service: &str, account: &str) -> Result<keyring::Entry, KeychainError> {
        keyring::Entry::new(service, account).map_err(|e| match e {
            keyring::Error::NoStorageAccess(_) | keyring::Error::PlatformFailure(_) => {
                KeychainError::NotAvailable
            }
            _ => KeychainError::Platform(e.to_string()),
        })
    }
}

impl SecretStore for KeychainProvider {
    fn get(&self, service: &str, account: &str) -> Result<Option<SecretString>, KeychainError> {
        let entry = Self::entry(service, account)?;
        match entry.get_password() {
            Ok(secret) => Ok(Some(SecretString::new(secret))),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(KeychainError::Platform(e.to_string())),
        }
    }

    fn set(&self, service: &str, account: &str, secret: &SecretString) -> Result<(), KeychainError> {
        let entry = Self::entry(service, account)?;
        entry
            .set_password(secret.expose_secret())
            .map_err(|e| KeychainError::Platform(e.to_string()))
    }
}

/// Process-local secret store
///
/// Shared via `Arc` it survives a vault restart inside one process, which
/// is what the restart scenarios in the test suite rely on.
#[derive(Debug, Default)]
pub struct MemorySecretStore {
    entries: Mutex<HashMap<(String, String), SecretString>>,
    read_only: AtomicBool,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `set` fail with [`KeychainError::ReadOnly`]
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SecretStore for MemorySecretStore {
    fn get(&self, service: &str, account: &str) -> Result<Option<SecretString>, KeychainError> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries
            .get(&(service.to_string(), account.to_string()))
            .map(|s| SecretString::new(s.expose_secret().clone())))
    }

    fn set(&self, service: &str, account: &str, secret: &SecretString) -> Result<(), KeychainError> {
        if self.read_only.load(Ordering::SeqCst) {
            return Err(KeychainError::ReadOnly);
        }
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(
            (service.to_string(), account.to_string()),
            SecretString::new(secret.expose_secret().clone()),
        );
        Ok(())
    }
}
