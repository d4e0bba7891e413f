//! Coffer Store - JSON-on-disk persistence for the vault
//!
//! Layout under the vault root:
//!
//! ```text
//! metadata.json            written once, marks the vault initialized
//! keys.json                every agent's key, wrapped under the master key
//! agent-<id>/files.json    that agent's files, sealed under the agent key
//! ```
//!
//! Each collection file is rewritten whole on every mutation, under a
//! per-file mutex, via temp file + rename.

pub mod collection;
pub mod file_store;
pub mod layout;
pub mod metadata;
pub mod records;
pub mod registry;

pub use collection::JsonCollection;
pub use file_store::AgentFileStore;
pub use layout::VaultLayout;
pub use metadata::VaultMetadata;
pub use records::{AgentKeyRecord, FileRecord};
pub use registry::{AgentKeyRegistry, AgentKeys};

use coffer_crypto::CipherError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Collection file is not valid JSON: {}", .0.display())]
    Corrupt(PathBuf),

    #[error("Invalid agent id: {0:?}")]
    InvalidAgentId(String),

    #[error("No key record for agent {0}")]
    UnknownAgent(String),

    #[error("Key for agent {0} exists but cannot be unwrapped with the current master key")]
    KeyUnavailable(String),

    #[error("Cipher error: {0}")]
    Cipher(#[from] CipherError),
}

pub type Result<T> = std::result::Result<T, StoreError>;
