//! Whole-file JSON collections
//!
//! A collection is a JSON array rewritten in full on every mutation. All
//! mutations of one file go through [`JsonCollection::update`], which holds
//! the file's mutex across read, modify and write, so two concurrent
//! updates can never lose each other's changes.
//!
//! Writes are atomic: temp file, fsync, rename. Readers see either the old
//! or the new array, never a torn one.
//!
//! A file that does not parse reads as an empty collection (with a warning)
//! unless the collection is strict. The first write after that moves the
//! unreadable file aside as `<name>.corrupt-<millis>` instead of
//! overwriting it.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, warn};

use crate::{Result, StoreError};

enum Loaded<T> {
    Missing,
    Parsed(Vec<T>),
    Corrupt,
}

pub struct JsonCollection<T> {
    path: PathBuf,
    strict: bool,
    write_lock: Mutex<()>,
    _records: PhantomData<fn() -> T>,
}

impl<T: Serialize + DeserializeOwned> JsonCollection<T> {
    pub fn new(path: PathBuf, strict: bool) -> Self {
        Self {
            path,
            strict,
            write_lock: Mutex::new(()),
            _records: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<Loaded<T>> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Loaded::Missing),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice(&data) {
            Ok(records) => Ok(Loaded::Parsed(records)),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Collection file is not valid JSON");
                Ok(Loaded::Corrupt)
            }
        }
    }

    /// Current contents. A missing file is an empty collection.
    pub fn load(&self) -> Result<Vec<T>> {
        match self.read()? {
            Loaded::Missing => Ok(Vec::new()),
            Loaded::Parsed(records) => Ok(records),
            Loaded::Corrupt if self.strict => Err(StoreError::Corrupt(self.path.clone())),
            Loaded::Corrupt => Ok(Vec::new()),
        }
    }

    /// Read-modify-write under the collection's mutex
    ///
    /// If `f` fails nothing is written.
    pub fn update<R>(&self, f: impl FnOnce(&mut Vec<T>) -> Result<R>) -> Result<R> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let mut records = match self.read()? {
            Loaded::Missing => Vec::new(),
            Loaded::Parsed(records) => records,
            Loaded::Corrupt if self.strict => return Err(StoreError::Corrupt(self.path.clone())),
            Loaded::Corrupt => {
                move_aside(&self.path)?;
                Vec::new()
            }
        };

        let out = f(&mut records)?;
        self.write(&records)?;
        Ok(out)
    }

    fn write(&self, records: &[T]) -> Result<()> {
        write_atomic(&self.path, &serde_json::to_vec_pretty(records)?)?;
        debug!(path = %self.path.display(), count = records.len(), "Collection written");
        Ok(())
    }
}

/// Rename an unreadable file to `<name>.corrupt-<millis>` so it is kept
/// for recovery instead of being overwritten
pub(crate) fn move_aside(path: &Path) -> Result<PathBuf> {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".corrupt-{}", chrono::Utc::now().timestamp_millis()));
    let aside = path.with_file_name(name);

    fs::rename(path, &aside)?;
    warn!(
        path = %path.display(),
        moved_to = %aside.display(),
        "Moved unreadable file aside before rewriting"
    );
    Ok(aside)
}

/// Replace `path` with `content`: temp file (0600 on unix), fsync, rename
pub(crate) fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(format!(".tmp.{}", std::process::id()));
    let tmp_path = path.with_file_name(tmp_name);

    {
        let mut file = File::create(&tmp_path)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp_path, fs::Permissions::from_mode(0o600))?;
        }

        file.write_all(content)?;
        file.sync_all()?;
    }

    if let Err(e) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(e.into());
    }
    Ok(())
}
