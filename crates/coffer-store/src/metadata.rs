//! Vault metadata - written once, its presence marks an initialized vault

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use tracing::{info, warn};

use crate::collection::{move_aside, write_atomic};
use crate::records::now_millis;
use crate::{Result, StoreError};

pub const VAULT_FORMAT_VERSION: &str = "1.0.0";

fn default_kdf_iterations() -> u32 {
    coffer_crypto::cipher::DEFAULT_KDF_ITERATIONS
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultMetadata {
    pub initialized_at: i64,
    pub version: String,
    /// Work factor every envelope in this vault was sealed with. Fixed at
    /// initialization; changing it later would make old envelopes unreadable.
    #[serde(default = "default_kdf_iterations")]
    pub kdf_iterations: u32,
}

impl VaultMetadata {
    pub fn load(path: &Path) -> Result<Option<Self>> {
        match fs::read(path) {
            Ok(data) => serde_json::from_slice(&data)
                .map(Some)
                .map_err(|_| StoreError::Corrupt(path.to_path_buf())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Return the existing metadata, or write a fresh record
    ///
    /// An unreadable file is an error when `strict`. Otherwise it is moved
    /// aside and replaced, taking `kdf_iterations` as the work factor.
    pub fn ensure(path: &Path, kdf_iterations: u32, strict: bool) -> Result<Self> {
        match Self::load(path) {
            Ok(Some(existing)) => return Ok(existing),
            Ok(None) => {}
            Err(StoreError::Corrupt(_)) if !strict => {
                warn!(path = %path.display(), kdf_iterations, "Vault metadata unreadable, rewriting it");
                move_aside(path)?;
            }
            Err(e) => return Err(e),
        }

        let metadata = Self {
            initialized_at: now_millis(),
            version: VAULT_FORMAT_VERSION.to_string(),
            kdf_iterations,
        };
        write_atomic(path, &serde_json::to_vec_pretty(&metadata)?)?;
        info!(version = VAULT_FORMAT_VERSION, "Vault metadata initialized");
        Ok(metadata)
    }
}
