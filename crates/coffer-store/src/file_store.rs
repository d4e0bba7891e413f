//! Per-agent encrypted file table
//!
//! Each agent gets its own directory holding `files.json`, an array of
//! [`FileRecord`]s keyed by logical path (exact, case-sensitive match).
//! Payloads are sealed under the agent's key; the store never sees the
//! master key.

use coffer_crypto::{cipher, KdfParams, SymmetricKey};
use std::path::PathBuf;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::collection::JsonCollection;
use crate::layout::{create_private_dir, VaultLayout};
use crate::records::{now_millis, FileRecord};
use crate::registry::AgentKeys;
use crate::Result;

pub struct AgentFileStore {
    agent_id: String,
    dir: PathBuf,
    files: JsonCollection<FileRecord>,
    kdf: KdfParams,
}

impl AgentFileStore {
    /// Open the store for `agent_id`. Nothing is created on disk until the
    /// first write.
    pub fn open(layout: &VaultLayout, agent_id: &str, kdf: KdfParams, strict: bool) -> Result<Self> {
        Ok(Self {
            agent_id: agent_id.to_string(),
            dir: layout.agent_dir(agent_id)?,
            files: JsonCollection::new(layout.files_path(agent_id)?, strict),
            kdf,
        })
    }

    /// Seal `plaintext` and upsert it under `path`
    ///
    /// An existing record keeps its `createdAt`; `updatedAt` always moves
    /// forward, even when two writes land in the same millisecond.
    pub fn store_file(&self, key: &SymmetricKey, path: &str, plaintext: &[u8]) -> Result<()> {
        let encrypted_data = cipher::encrypt(key, plaintext, &self.kdf)?;

        create_private_dir(&self.dir)?;
        self.files.update(|files| {
            let now = now_millis();
            match files.iter_mut().find(|f| f.file_path == path) {
                Some(existing) => {
                    existing.encrypted_data = encrypted_data;
                    existing.updated_at = now.max(existing.updated_at + 1);
                }
                None => files.push(FileRecord {
                    file_path: path.to_string(),
                    encrypted_data,
                    original_path: path.to_string(),
                    created_at: now,
                    updated_at: now,
                }),
            }
            Ok(())
        })?;

        debug!(agent_id = %self.agent_id, path, bytes = plaintext.len(), "Stored file");
        Ok(())
    }

    /// Decrypt the payload at `path`
    ///
    /// `None` when there is no such record or it opens under none of `keys`.
    pub fn read_file(&self, keys: &AgentKeys, path: &str) -> Result<Option<Zeroizing<Vec<u8>>>> {
        let files = self.files.load()?;
        let Some(record) = files.iter().find(|f| f.file_path == path) else {
            return Ok(None);
        };

        let opened = keys
            .candidates()
            .find_map(|key| cipher::decrypt(key, &record.encrypted_data, &self.kdf).ok());
        if opened.is_none() {
            warn!(agent_id = %self.agent_id, path, "Stored file failed integrity check");
        }
        Ok(opened)
    }

    /// Re-seal every record that only opens under an older key with
    /// `keys.current`. Records already under the current key are left as
    /// they are; records that open under no key are kept and counted as
    /// skipped. Returns `(migrated, skipped)`.
    pub fn reencrypt(&self, keys: &AgentKeys) -> Result<(usize, usize)> {
        if keys.older().next().is_none() || !self.files.path().exists() {
            return Ok((0, 0));
        }

        self.files.update(|files| {
            let mut migrated = 0;
            let mut skipped = 0;
            for record in files.iter_mut() {
                if cipher::decrypt(&keys.current, &record.encrypted_data, &self.kdf).is_ok() {
                    continue;
                }
                let opened = keys
                    .older()
                    .find_map(|key| cipher::decrypt(key, &record.encrypted_data, &self.kdf).ok());
                match opened {
                    Some(plaintext) => {
                        record.encrypted_data = cipher::encrypt(&keys.current, &plaintext, &self.kdf)?;
                        migrated += 1;
                    }
                    None => {
                        warn!(agent_id = %self.agent_id, path = %record.file_path, "Cannot re-encrypt unreadable file");
                        skipped += 1;
                    }
                }
            }
            Ok((migrated, skipped))
        })
    }

    pub fn list_files(&self) -> Result<Vec<String>> {
        Ok(self.files.load()?.into_iter().map(|f| f.file_path).collect())
    }

    pub fn records(&self) -> Result<Vec<FileRecord>> {
        self.files.load()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StoreError;
    use std::fs;
    use tempfile::TempDir;

    fn fast() -> KdfParams {
        KdfParams::new(10).unwrap()
    }

    fn keys(current: &SymmetricKey) -> AgentKeys {
        AgentKeys::new(current.clone())
    }

    fn edit_records(layout: &VaultLayout, agent: &str, f: impl FnOnce(&mut Vec<FileRecord>)) {
        let path = layout.files_path(agent).unwrap();
        let mut records: Vec<FileRecord> = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        f(&mut records);
        fs::write(&path, serde_json::to_vec(&records).unwrap()).unwrap();
    }

    fn setup(agent: &str) -> (TempDir, VaultLayout, AgentFileStore) {
        let dir = TempDir::new().unwrap();
        let layout = VaultLayout::new(dir.path());
        let store = AgentFileStore::open(&layout, agent, fast(), false).unwrap();
        (dir, layout, store)
    }

    #[test]
    fn test_store_and_read() {
        let (_dir, _layout, store) = setup("agentA");
        let key = SymmetricKey::generate().unwrap();

        store.store_file(&key, "notes.txt", b"secret text").unwrap();
        let content = store.read_file(&keys(&key), "notes.txt").unwrap().unwrap();
        assert_eq!(content.as_slice(), b"secret text");
    }

    #[test]
    fn test_unknown_path_is_none() {
        let (_dir, _layout, store) = setup("agentA");
        let key = SymmetricKey::generate().unwrap();
        assert!(store.read_file(&keys(&key), "missing.txt").unwrap().is_none());

        store.store_file(&key, "Notes.txt", b"x").unwrap();
        // Exact, case-sensitive match
        assert!(store.read_file(&keys(&key), "notes.txt").unwrap().is_none());
    }

    #[test]
    fn test_upsert_preserves_created_at() {
        let (_dir, _layout, store) = setup("agentA");
        let key = SymmetricKey::generate().unwrap();

        store.store_file(&key, "notes.txt", b"first").unwrap();
        let before = store.records().unwrap()[0].clone();
        store.store_file(&key, "notes.txt", b"second").unwrap();
        let records = store.records().unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].created_at, before.created_at);
        assert!(records[0].updated_at > before.updated_at);
        assert_eq!(records[0].original_path, "notes.txt");
        let content = store.read_file(&keys(&key), "notes.txt").unwrap().unwrap();
        assert_eq!(content.as_slice(), b"second");
    }

    #[test]
    fn test_foreign_key_reads_none() {
        let (_dir, _layout, store) = setup("agentA");
        let key = SymmetricKey::generate().unwrap();
        let other = SymmetricKey::generate().unwrap();

        store.store_file(&key, "notes.txt", b"mine").unwrap();
        assert!(store.read_file(&keys(&other), "notes.txt").unwrap().is_none());
    }

    #[test]
    fn test_tampered_record_reads_none() {
        let (_dir, layout, store) = setup("agentA");
        let key = SymmetricKey::generate().unwrap();
        store.store_file(&key, "notes.txt", b"untouched").unwrap();

        edit_records(&layout, "agentA", |records| {
            let other = cipher::encrypt(&key, b"swapped", &fast()).unwrap();
            records[0].encrypted_data.data = other.data;
        });

        assert!(store.read_file(&keys(&key), "notes.txt").unwrap().is_none());
    }

    #[test]
    fn test_damaged_record_leaves_siblings_readable() {
        let (_dir, layout, store) = setup("agentA");
        let key = SymmetricKey::generate().unwrap();
        store.store_file(&key, "a.txt", b"alpha").unwrap();
        store.store_file(&key, "b.txt", b"beta").unwrap();

        edit_records(&layout, "agentA", |records| {
            records[0].encrypted_data.data = "!!not-base64!!".to_string();
        });

        assert!(store.read_file(&keys(&key), "a.txt").unwrap().is_none());
        let sibling = store.read_file(&keys(&key), "b.txt").unwrap().unwrap();
        assert_eq!(sibling.as_slice(), b"beta");

        // The table is still live: a later write keeps every record
        store.store_file(&key, "c.txt", b"gamma").unwrap();
        assert_eq!(store.list_files().unwrap(), vec!["a.txt", "b.txt", "c.txt"]);
    }

    #[test]
    fn test_open_and_read_do_not_touch_disk() {
        let dir = TempDir::new().unwrap();
        let layout = VaultLayout::new(dir.path());
        let store = AgentFileStore::open(&layout, "quiet", fast(), false).unwrap();
        let key = SymmetricKey::generate().unwrap();

        assert!(store.read_file(&keys(&key), "a.txt").unwrap().is_none());
        assert!(store.list_files().unwrap().is_empty());
        assert_eq!(store.reencrypt(&AgentKeys { previous: Some(key.clone()), ..keys(&key) }).unwrap(), (0, 0));
        assert!(!layout.agent_dir("quiet").unwrap().exists());

        store.store_file(&key, "a.txt", b"x").unwrap();
        assert!(layout.agent_dir("quiet").unwrap().is_dir());
    }

    #[test]
    fn test_agents_live_in_separate_directories() {
        let dir = TempDir::new().unwrap();
        let layout = VaultLayout::new(dir.path());
        let a = AgentFileStore::open(&layout, "alpha", fast(), false).unwrap();
        let b = AgentFileStore::open(&layout, "beta", fast(), false).unwrap();
        let key = SymmetricKey::generate().unwrap();

        a.store_file(&key, "shared-name.txt", b"alpha data").unwrap();
        assert!(b.list_files().unwrap().is_empty());
        assert!(layout.files_path("alpha").unwrap().exists());
        assert!(!layout.files_path("beta").unwrap().exists());
    }

    #[test]
    fn test_invalid_agent_id_rejected() {
        let dir = TempDir::new().unwrap();
        let layout = VaultLayout::new(dir.path());
        assert!(matches!(
            AgentFileStore::open(&layout, "../escape", fast(), false),
            Err(StoreError::InvalidAgentId(_))
        ));
    }

    #[test]
    fn test_reencrypt_moves_records_to_new_key() {
        let (_dir, _layout, store) = setup("agentA");
        let old = SymmetricKey::generate().unwrap();
        let new = SymmetricKey::generate().unwrap();

        store.store_file(&old, "a.txt", b"alpha").unwrap();
        store.store_file(&old, "b.txt", b"beta").unwrap();

        let rotating = AgentKeys {
            previous: Some(old.clone()),
            ..AgentKeys::new(new.clone())
        };
        // Readable under either key while mid-rotation
        assert!(store.read_file(&rotating, "a.txt").unwrap().is_some());

        assert_eq!(store.reencrypt(&rotating).unwrap(), (2, 0));
        // Second pass finds nothing left to move
        assert_eq!(store.reencrypt(&rotating).unwrap(), (0, 0));

        let content = store.read_file(&keys(&new), "b.txt").unwrap().unwrap();
        assert_eq!(content.as_slice(), b"beta");
        assert!(store.read_file(&keys(&old), "b.txt").unwrap().is_none());
    }

    #[test]
    fn test_reencrypt_picks_up_retired_keys() {
        let (_dir, _layout, store) = setup("agentA");
        let oldest = SymmetricKey::generate().unwrap();
        let current = SymmetricKey::generate().unwrap();
        store.store_file(&oldest, "a.txt", b"alpha").unwrap();

        let keys = AgentKeys {
            retired: vec![oldest.clone()],
            ..AgentKeys::new(current.clone())
        };
        assert_eq!(store.reencrypt(&keys).unwrap(), (1, 0));
        let content = store.read_file(&AgentKeys::new(current), "a.txt").unwrap().unwrap();
        assert_eq!(content.as_slice(), b"alpha");
    }
}
