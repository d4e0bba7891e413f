//! Agent key registry
//!
//! Maps agent ids to 32-byte agent keys. Keys only ever touch disk wrapped
//! in an envelope under the master key, all of them in `keys.json`.
//!
//! Rotation is two-phase so no file is ever left sealed under a key the
//! registry has forgotten:
//! 1. [`AgentKeyRegistry::begin_rotation`] stores a new key and keeps the
//!    old one as `previousKey`
//! 2. the caller re-encrypts the agent's files
//! 3. [`AgentKeyRegistry::finish_rotation`] moves `previousKey` to
//!    `retiredKeys`, still available to open envelopes the host holds

use chrono::Duration;
use coffer_crypto::{cipher, Envelope, KdfParams, SymmetricKey};
use tracing::{debug, info, warn};

use crate::collection::JsonCollection;
use crate::layout::VaultLayout;
use crate::records::{now_millis, AgentKeyRecord};
use crate::{Result, StoreError};

/// An agent's live key, the one it replaces mid-rotation, and keys from
/// earlier rotations
#[derive(Debug, Clone)]
pub struct AgentKeys {
    pub current: SymmetricKey,
    pub previous: Option<SymmetricKey>,
    pub retired: Vec<SymmetricKey>,
}

impl AgentKeys {
    pub fn new(current: SymmetricKey) -> Self {
        Self {
            current,
            previous: None,
            retired: Vec::new(),
        }
    }

    /// Current key first, then the outgoing one, then retired keys newest first
    pub fn candidates(&self) -> impl Iterator<Item = &SymmetricKey> {
        std::iter::once(&self.current).chain(self.older())
    }

    /// Every key except the current one
    pub fn older(&self) -> impl Iterator<Item = &SymmetricKey> {
        self.previous.iter().chain(self.retired.iter().rev())
    }
}

pub struct AgentKeyRegistry {
    keys: JsonCollection<AgentKeyRecord>,
    kdf: KdfParams,
}

impl AgentKeyRegistry {
    pub fn new(layout: &VaultLayout, kdf: KdfParams, strict: bool) -> Self {
        Self {
            keys: JsonCollection::new(layout.keys_path(), strict),
            kdf,
        }
    }

    fn wrap(&self, master: &SymmetricKey, key: &SymmetricKey) -> Result<Envelope> {
        Ok(cipher::encrypt(master, key.as_bytes(), &self.kdf)?)
    }

    fn unwrap(&self, master: &SymmetricKey, envelope: &Envelope) -> Result<SymmetricKey> {
        let raw = cipher::decrypt(master, envelope, &self.kdf)?;
        Ok(SymmetricKey::from_slice(&raw)?)
    }

    fn unwrap_record(&self, master: &SymmetricKey, record: &AgentKeyRecord) -> Option<AgentKeys> {
        let current = match self.unwrap(master, &record.encrypted_key) {
            Ok(key) => key,
            Err(e) => {
                warn!(agent_id = %record.agent_id, error = %e, "Agent key does not unwrap");
                return None;
            }
        };
        let previous = record
            .previous_key
            .as_ref()
            .and_then(|envelope| self.unwrap(master, envelope).ok());
        let retired = record
            .retired_keys
            .iter()
            .filter_map(|envelope| self.unwrap(master, envelope).ok())
            .collect();
        Some(AgentKeys {
            current,
            previous,
            retired,
        })
    }

    /// The agent's current key, or `None` if there is no record or it does
    /// not unwrap under `master`
    pub fn get_agent_key(&self, master: &SymmetricKey, agent_id: &str) -> Result<Option<SymmetricKey>> {
        Ok(self.agent_keys(master, agent_id)?.map(|keys| keys.current))
    }

    /// Like [`get_agent_key`](Self::get_agent_key), including a pending previous key
    pub fn agent_keys(&self, master: &SymmetricKey, agent_id: &str) -> Result<Option<AgentKeys>> {
        let records = self.keys.load()?;
        Ok(records
            .iter()
            .find(|r| r.agent_id == agent_id)
            .and_then(|record| self.unwrap_record(master, record)))
    }

    /// Return the agent's key, creating and persisting one if none exists
    ///
    /// The lookup and the append happen under the registry's write lock, so
    /// racing callers for the same new agent end up with one record.
    pub fn generate_agent_key(&self, master: &SymmetricKey, agent_id: &str) -> Result<SymmetricKey> {
        self.keys.update(|records| {
            if let Some(existing) = records.iter().find(|r| r.agent_id == agent_id) {
                // Never mint a second key over one we merely failed to open
                return self
                    .unwrap(master, &existing.encrypted_key)
                    .map_err(|_| StoreError::KeyUnavailable(agent_id.to_string()));
            }

            let key = SymmetricKey::generate()?;
            let now = now_millis();
            records.push(AgentKeyRecord {
                agent_id: agent_id.to_string(),
                encrypted_key: self.wrap(master, &key)?,
                created_at: now,
                last_rotated: now,
                previous_key: None,
                retired_keys: Vec::new(),
            });

            info!(agent_id, "Generated agent key");
            Ok(key)
        })
    }

    /// Phase one of rotation: store a fresh key and keep the old one as
    /// `previousKey`. If a rotation is already pending, its keys are
    /// returned unchanged so the caller can resume.
    pub fn begin_rotation(&self, master: &SymmetricKey, agent_id: &str) -> Result<AgentKeys> {
        self.keys.update(|records| {
            let record = records
                .iter_mut()
                .find(|r| r.agent_id == agent_id)
                .ok_or_else(|| StoreError::UnknownAgent(agent_id.to_string()))?;

            let unavailable = || StoreError::KeyUnavailable(agent_id.to_string());
            let current = self.unwrap(master, &record.encrypted_key).map_err(|_| unavailable())?;
            let retired = record
                .retired_keys
                .iter()
                .filter_map(|envelope| self.unwrap(master, envelope).ok())
                .collect();

            if let Some(previous) = &record.previous_key {
                let previous = self.unwrap(master, previous).map_err(|_| unavailable())?;
                debug!(agent_id, "Resuming pending key rotation");
                return Ok(AgentKeys {
                    current,
                    previous: Some(previous),
                    retired,
                });
            }

            let next = SymmetricKey::generate()?;
            record.previous_key = Some(record.encrypted_key.clone());
            record.encrypted_key = self.wrap(master, &next)?;
            record.last_rotated = now_millis();

            info!(agent_id, "Agent key rotation started");
            Ok(AgentKeys {
                current: next,
                previous: Some(current),
                retired,
            })
        })
    }

    /// Phase three of rotation: retire the outgoing key
    ///
    /// Files no longer need it, but sealed envelopes held outside the vault
    /// can only be opened with the key they were sealed under.
    pub fn finish_rotation(&self, agent_id: &str) -> Result<()> {
        self.keys.update(|records| {
            let record = records
                .iter_mut()
                .find(|r| r.agent_id == agent_id)
                .ok_or_else(|| StoreError::UnknownAgent(agent_id.to_string()))?;
            if let Some(previous) = record.previous_key.take() {
                record.retired_keys.push(previous);
                info!(agent_id, retired = record.retired_keys.len(), "Agent key rotation finished");
            }
            Ok(())
        })
    }

    /// Agents with a rotation started but not finished
    pub fn pending_rotations(&self) -> Result<Vec<String>> {
        Ok(self
            .keys
            .load()?
            .into_iter()
            .filter(|r| r.previous_key.is_some())
            .map(|r| r.agent_id)
            .collect())
    }

    /// Agents whose key is older than `max_age` at `now_ms`
    pub fn due_for_rotation(&self, max_age: Duration, now_ms: i64) -> Result<Vec<String>> {
        let cutoff = now_ms - max_age.num_milliseconds();
        Ok(self
            .keys
            .load()?
            .into_iter()
            .filter(|r| r.last_rotated <= cutoff)
            .map(|r| r.agent_id)
            .collect())
    }

    pub fn records(&self) -> Result<Vec<AgentKeyRecord>> {
        self.keys.load()
    }

    pub fn list_agents(&self) -> Result<Vec<String>> {
        Ok(self.keys.load()?.into_iter().map(|r| r.agent_id).collect())
    }

    pub fn key_count(&self) -> Result<usize> {
        Ok(self.keys.load()?.len())
    }
}
