//! Vault directory layout and agent id validation

use std::fs;
use std::path::{Path, PathBuf};

use crate::{Result, StoreError};

const METADATA_FILE: &str = "metadata.json";
const KEYS_FILE: &str = "keys.json";
const FILES_FILE: &str = "files.json";
const AGENT_DIR_PREFIX: &str = "agent-";

/// Reject ids that would escape or alias the agent's directory
pub fn validate_agent_id(agent_id: &str) -> Result<()> {
    let invalid = agent_id.is_empty()
        || agent_id == "."
        || agent_id == ".."
        || agent_id.contains(['/', '\\', '\0']);

    if invalid {
        return Err(StoreError::InvalidAgentId(agent_id.to_string()));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct VaultLayout {
    root: PathBuf,
}

impl VaultLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create the root directory (0700 on unix) if needed
    pub fn ensure_root(&self) -> Result<()> {
        create_private_dir(&self.root)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.root.join(METADATA_FILE)
    }

    pub fn keys_path(&self) -> PathBuf {
        self.root.join(KEYS_FILE)
    }

    pub fn agent_dir(&self, agent_id: &str) -> Result<PathBuf> {
        validate_agent_id(agent_id)?;
        Ok(self.root.join(format!("{AGENT_DIR_PREFIX}{agent_id}")))
    }

    pub fn files_path(&self, agent_id: &str) -> Result<PathBuf> {
        Ok(self.agent_dir(agent_id)?.join(FILES_FILE))
    }

    /// Bytes used by the metadata, registry and every agent's file table
    pub fn approx_size_bytes(&self) -> u64 {
        let mut total = file_len(&self.metadata_path()) + file_len(&self.keys_path());

        let Ok(entries) = fs::read_dir(&self.root) else {
            return total;
        };
        for entry in entries.flatten() {
            let is_agent_dir = entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with(AGENT_DIR_PREFIX));
            if is_agent_dir {
                total += file_len(&entry.path().join(FILES_FILE));
            }
        }
        total
    }
}

fn file_len(path: &Path) -> u64 {
    fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

pub(crate) fn create_private_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}
