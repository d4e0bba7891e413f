//! Vault service - lifecycle, routing and status
//!
//! `start` resolves the master key and opens the registry; per-agent file
//! stores are opened lazily and cached for the life of the session. Every
//! operation holds the session read lock for its whole duration, and `stop`
//! takes the write lock, so the master key is only dropped once in-flight
//! work has drained.

use chrono::Duration;
use coffer_crypto::{
    cipher, CipherError, Envelope, KdfParams, KeyStoreError, MasterKeyProvider, SecretStore,
    SymmetricKey,
};
use coffer_store::{
    layout::validate_agent_id, metadata::VaultMetadata, records::now_millis, AgentFileStore,
    AgentKeyRegistry, AgentKeys, StoreError, VaultLayout,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard};
use thiserror::Error;
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::config::VaultConfig;

#[derive(Error, Debug)]
pub enum VaultError {
    #[error("Vault service not started")]
    NotStarted,

    #[error("No encryption key found for agent {0}")]
    MissingKey(String),

    #[error("Stored content at {0} is not valid UTF-8")]
    NotUtf8(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(&'static str),

    #[error(transparent)]
    KeyStore(#[from] KeyStoreError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Cipher(#[from] CipherError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, VaultError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultStatus {
    pub initialized: bool,
    pub key_count: usize,
    pub approx_size_bytes: u64,
    pub master_key_present: bool,
    pub active_store_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RotationReport {
    pub agent_id: String,
    pub migrated: usize,
    pub skipped: usize,
}

/// Cached handle to one agent's file store
///
/// Writes and reads hold `rotation` shared; rotation holds it exclusively,
/// so nothing is sealed under a key that is about to be retired.
struct AgentVault {
    store: AgentFileStore,
    rotation: RwLock<()>,
}

struct Session {
    master: MasterKeyProvider,
    registry: AgentKeyRegistry,
    kdf: KdfParams,
    strict: bool,
    vaults: Mutex<HashMap<String, Arc<AgentVault>>>,
}

impl Session {
    fn master_key(&self) -> Result<&SymmetricKey> {
        self.master.key().ok_or(VaultError::NotStarted)
    }

    /// The agent's key, created if absent. Every write path comes through
    /// here, so this is where agent ids are validated.
    fn ensure_key(&self, agent_id: &str) -> Result<SymmetricKey> {
        validate_agent_id(agent_id)?;
        let master = self.master_key()?;
        match self.registry.get_agent_key(master, agent_id)? {
            Some(key) => Ok(key),
            None => Ok(self.registry.generate_agent_key(master, agent_id)?),
        }
    }

    fn agent_keys(&self, agent_id: &str) -> Result<Option<AgentKeys>> {
        Ok(self.registry.agent_keys(self.master_key()?, agent_id)?)
    }

    /// Cached handle for `agent_id`. With `create`, a missing key is
    /// generated; without it, an agent with no key yields `None`.
    ///
    /// The cache lock is held through open-and-insert so each agent has
    /// exactly one handle, and with it one writer per files.json.
    fn vault(&self, layout: &VaultLayout, agent_id: &str, create: bool) -> Result<Option<Arc<AgentVault>>> {
        let mut vaults = self.vaults.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(vault) = vaults.get(agent_id) {
            return Ok(Some(Arc::clone(vault)));
        }

        validate_agent_id(agent_id)?;
        if create {
            self.ensure_key(agent_id)?;
        } else if self.agent_keys(agent_id)?.is_none() {
            return Ok(None);
        }

        let vault = Arc::new(AgentVault {
            store: AgentFileStore::open(layout, agent_id, self.kdf, self.strict)?,
            rotation: RwLock::new(()),
        });
        vaults.insert(agent_id.to_string(), Arc::clone(&vault));
        Ok(Some(vault))
    }
}

pub struct VaultService {
    config: VaultConfig,
    layout: VaultLayout,
    secrets: Arc<dyn SecretStore>,
    session: RwLock<Option<Session>>,
}

impl VaultService {
    pub fn new(config: VaultConfig, secrets: Arc<dyn SecretStore>) -> Self {
        let layout = VaultLayout::new(&config.db_path);
        Self {
            config,
            layout,
            secrets,
            session: RwLock::new(None),
        }
    }

    pub fn layout(&self) -> &VaultLayout {
        &self.layout
    }

    fn session(&self) -> RwLockReadGuard<'_, Option<Session>> {
        self.session.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_session<R>(&self, f: impl FnOnce(&Session) -> Result<R>) -> Result<R> {
        let guard = self.session();
        let session = guard.as_ref().ok_or(VaultError::NotStarted)?;
        f(session)
    }

    /// Resolve the master key, write metadata on first run and mark the
    /// vault operational. Starting a running vault is a no-op.
    pub fn start(&self) -> Result<()> {
        let pending = {
            let mut guard = self.session.write().unwrap_or_else(PoisonError::into_inner);
            if guard.is_some() {
                return Ok(());
            }

            info!(path = %self.layout.root().display(), "Starting vault service");
            self.layout.ensure_root()?;

            let mut master = MasterKeyProvider::new(
                Arc::clone(&self.secrets),
                &self.config.keychain_service,
                &self.config.keychain_account,
            );
            master.initialize()?;

            let metadata = VaultMetadata::ensure(
                &self.layout.metadata_path(),
                self.config.kdf_iterations,
                self.config.strict_parse,
            )?;
            let kdf = KdfParams::new(metadata.kdf_iterations)?;
            if metadata.kdf_iterations != self.config.kdf_iterations {
                warn!(
                    vault = metadata.kdf_iterations,
                    configured = self.config.kdf_iterations,
                    "Using the vault's recorded KDF work factor, not the configured one"
                );
            }

            // Also the first parse of keys.json: in strict mode a corrupt
            // registry stops the vault from starting
            let registry = AgentKeyRegistry::new(&self.layout, kdf, self.config.strict_parse);
            let pending = registry.pending_rotations()?;

            *guard = Some(Session {
                master,
                registry,
                kdf,
                strict: self.config.strict_parse,
                vaults: Mutex::new(HashMap::new()),
            });
            pending
        };

        if self.config.auto_migrate {
            for agent_id in pending {
                match self.rotate_agent_key(&agent_id) {
                    Ok(report) => {
                        info!(agent_id, migrated = report.migrated, "Finished interrupted key rotation")
                    }
                    // Both keys are still on record, so the agent's files stay readable
                    Err(e) => warn!(agent_id, error = %e, "Could not finish interrupted key rotation"),
                }
            }
        }

        info!("Vault service started");
        Ok(())
    }

    /// Drop cached agent handles and the in-memory master key
    pub fn stop(&self) {
        let mut guard = self.session.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(mut session) = guard.take() {
            info!("Stopping vault service");
            session.vaults.get_mut().unwrap_or_else(PoisonError::into_inner).clear();
            session.master.close();
            info!("Vault service stopped");
        }
    }

    pub fn is_started(&self) -> bool {
        self.session().is_some()
    }

    /// Seal `plaintext` into the agent's store at `path`, creating the
    /// agent's key on first use
    pub fn encrypt_and_store(&self, agent_id: &str, path: &str, plaintext: impl AsRef<[u8]>) -> Result<()> {
        self.with_session(|s| {
            let vault = s
                .vault(&self.layout, agent_id, true)?
                .ok_or_else(|| VaultError::MissingKey(agent_id.to_string()))?;
            let _shared = vault.rotation.read().unwrap_or_else(PoisonError::into_inner);

            let key = s
                .registry
                .get_agent_key(s.master_key()?, agent_id)?
                .ok_or_else(|| VaultError::MissingKey(agent_id.to_string()))?;
            vault.store.store_file(&key, path, plaintext.as_ref())?;
            Ok(())
        })
    }

    /// Decrypt the agent's payload at `path`
    ///
    /// Unknown agents, unknown paths and payloads that fail their integrity
    /// check all come back as `None`.
    pub fn decrypt_and_read(&self, agent_id: &str, path: &str) -> Result<Option<Zeroizing<Vec<u8>>>> {
        self.with_session(|s| {
            if validate_agent_id(agent_id).is_err() {
                return Ok(None);
            }
            let Some(vault) = s.vault(&self.layout, agent_id, false)? else {
                return Ok(None);
            };
            let _shared = vault.rotation.read().unwrap_or_else(PoisonError::into_inner);

            let Some(keys) = s.agent_keys(agent_id)? else {
                return Ok(None);
            };
            Ok(vault.store.read_file(&keys, path)?)
        })
    }

    pub fn decrypt_and_read_string(&self, agent_id: &str, path: &str) -> Result<Option<String>> {
        match self.decrypt_and_read(agent_id, path)? {
            None => Ok(None),
            Some(bytes) => String::from_utf8(bytes.to_vec())
                .map(Some)
                .map_err(|_| VaultError::NotUtf8(path.to_string())),
        }
    }

    /// Seal raw bytes under the agent's key (created if absent) without
    /// touching its file store
    pub fn seal_for_agent(&self, agent_id: &str, plaintext: &[u8]) -> Result<Envelope> {
        self.with_session(|s| {
            let key = s.ensure_key(agent_id)?;
            Ok(cipher::encrypt(&key, plaintext, &s.kdf)?)
        })
    }

    /// Open an envelope sealed by [`seal_for_agent`](Self::seal_for_agent)
    ///
    /// There is no key-creation fallback here: an agent without a key is
    /// [`VaultError::MissingKey`]. Keys retired by rotation are tried after
    /// the current one. A failed integrity check is `None`.
    pub fn open_for_agent(&self, agent_id: &str, envelope: &Envelope) -> Result<Option<Zeroizing<Vec<u8>>>> {
        self.with_session(|s| {
            let keys = s
                .agent_keys(agent_id)?
                .ok_or_else(|| VaultError::MissingKey(agent_id.to_string()))?;
            let opened = keys
                .candidates()
                .find_map(|key| cipher::decrypt(key, envelope, &s.kdf).ok());
            Ok(opened)
        })
    }

    /// Replace an agent's key, re-encrypting its files first
    ///
    /// Resumes a rotation that was interrupted part way.
    pub fn rotate_agent_key(&self, agent_id: &str) -> Result<RotationReport> {
        self.with_session(|s| {
            let vault = s
                .vault(&self.layout, agent_id, false)?
                .ok_or_else(|| StoreError::UnknownAgent(agent_id.to_string()))?;
            let _exclusive = vault.rotation.write().unwrap_or_else(PoisonError::into_inner);

            let keys = s.registry.begin_rotation(s.master_key()?, agent_id)?;
            let (migrated, skipped) = vault.store.reencrypt(&keys)?;
            if skipped > 0 {
                warn!(agent_id, skipped, "Some files could not be re-encrypted");
            }
            s.registry.finish_rotation(agent_id)?;

            info!(agent_id, migrated, "Agent key rotated");
            Ok(RotationReport {
                agent_id: agent_id.to_string(),
                migrated,
                skipped,
            })
        })
    }

    /// Agents whose key is older than `keyRotationDays`
    pub fn keys_due_for_rotation(&self) -> Result<Vec<String>> {
        self.with_session(|s| {
            let max_age = Duration::days(i64::from(self.config.key_rotation_days));
            Ok(s.registry.due_for_rotation(max_age, now_millis())?)
        })
    }

    pub fn list_agents(&self) -> Result<Vec<String>> {
        self.with_session(|s| Ok(s.registry.list_agents()?))
    }

    pub fn list_files(&self, agent_id: &str) -> Result<Vec<String>> {
        self.with_session(|s| match s.vault(&self.layout, agent_id, false)? {
            Some(vault) => Ok(vault.store.list_files()?),
            None => Ok(Vec::new()),
        })
    }

    /// Works whether or not the vault is started
    pub fn status(&self) -> Result<VaultStatus> {
        let guard = self.session();
        let (key_count, master_key_present, active_store_count) = match guard.as_ref() {
            Some(s) => (
                s.registry.key_count()?,
                s.master.has_key(),
                s.vaults.lock().unwrap_or_else(PoisonError::into_inner).len(),
            ),
            None => {
                // Counting records never decrypts, so the work factor is irrelevant
                let registry = AgentKeyRegistry::new(&self.layout, KdfParams::default(), self.config.strict_parse);
                (registry.key_count()?, false, 0)
            }
        };

        Ok(VaultStatus {
            initialized: self.layout.metadata_path().exists(),
            key_count,
            approx_size_bytes: self.layout.approx_size_bytes(),
            master_key_present,
            active_store_count,
        })
    }
}

impl Drop for VaultService {
    fn drop(&mut self) {
        self.stop();
    }
}
