//! Vault configuration
//!
//! Every field is optional; a missing or empty config file gives the
//! defaults below. Keys are camelCase to match the host's plugin config.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_KEYCHAIN_SERVICE: &str = "coffer-vault";
pub const DEFAULT_KEYCHAIN_ACCOUNT: &str = "coffer";
pub const DEFAULT_KEY_ROTATION_DAYS: u32 = 90;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VaultConfig {
    /// Secret-store service name the master key lives under
    pub keychain_service: String,
    pub keychain_account: String,
    /// Vault root directory
    pub db_path: PathBuf,
    /// Keys older than this are reported as due for rotation
    pub key_rotation_days: u32,
    /// Finish interrupted rotations when the vault starts
    pub auto_migrate: bool,
    /// PBKDF2 work factor for a new vault. An existing vault keeps the
    /// value recorded in its metadata.
    pub kdf_iterations: u32,
    /// Fail instead of treating an unparseable collection as empty
    pub strict_parse: bool,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            keychain_service: DEFAULT_KEYCHAIN_SERVICE.to_string(),
            keychain_account: DEFAULT_KEYCHAIN_ACCOUNT.to_string(),
            db_path: default_db_path(),
            key_rotation_days: DEFAULT_KEY_ROTATION_DAYS,
            auto_migrate: true,
            kdf_iterations: coffer_crypto::cipher::DEFAULT_KDF_ITERATIONS,
            strict_parse: false,
        }
    }
}

/// `~/.coffer/vault`, or `./.coffer/vault` without a home directory
pub fn default_db_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".coffer")
        .join("vault")
}

impl VaultConfig {
    pub fn with_db_path(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            ..Self::default()
        }
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }
}
