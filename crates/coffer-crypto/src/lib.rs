//! Coffer Crypto - envelope encryption primitives
//!
//! This crate provides:
//! - ChaCha20-Poly1305 envelopes with per-call PBKDF2 sub-keys
//! - A zeroizing 256-bit key type
//! - Secret-store integration (OS keychain, in-memory)
//! - The master key provider that sits on top of the secret store

pub mod cipher;
pub mod key;
pub mod keychain;
pub mod master;

pub use cipher::{CipherError, Envelope, KdfParams};
pub use key::SymmetricKey;
pub use keychain::{KeychainError, KeychainProvider, MemorySecretStore, SecretStore};
pub use master::{KeyOrigin, KeyStoreError, MasterKeyProvider};
