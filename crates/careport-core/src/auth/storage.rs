//! Client-side key-value backends for the credential record.
//!
//! The session store keeps the serialized token and user under two
//! well-known keys and always writes or removes them together, so backends
//! only need batched `write`/`remove`.

use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use keyring::Entry;
use thiserror::Error;

/// Key holding the raw access token
pub const TOKEN_KEY: &str = "token";

/// Key holding the JSON-serialized user
pub const USER_KEY: &str = "user";

/// Session file name in cache directory
const SESSION_FILE: &str = "session.json";

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Keychain error: {0}")]
    Keyring(#[from] keyring::Error),
}

pub trait CredentialStorage: Send + Sync {
    fn read(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Write every entry; a reader going through the session store never
    /// observes only some of them.
    fn write(&self, entries: &[(&str, &str)]) -> Result<(), StorageError>;

    /// Remove the keys. Missing keys are not an error.
    fn remove(&self, keys: &[&str]) -> Result<(), StorageError>;
}

/// In-process storage; nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialStorage for MemoryStorage {
    fn read(&self, key: &str) -> Result<Option<String>, StorageError> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(key).cloned())
    }

    fn write(&self, new_entries: &[(&str, &str)]) -> Result<(), StorageError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        for (key, value) in new_entries {
            entries.insert((*key).to_string(), (*value).to_string());
        }
        Ok(())
    }

    fn remove(&self, keys: &[&str]) -> Result<(), StorageError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        for key in keys {
            entries.remove(*key);
        }
        Ok(())
    }
}

/// JSON file in the cache directory. Writes go to a temp file that is
/// renamed over the original, so a crash never leaves half a record.
/// On Unix the file is readable by its owner only.
#[derive(Debug, Clone)]
pub struct FileStorage {
    path: PathBuf,
}

impl FileStorage {
    pub fn new(cache_dir: &Path) -> Self {
        Self {
            path: cache_dir.join(SESSION_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<BTreeMap<String, String>, StorageError> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let contents = std::fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    fn save(&self, entries: &BTreeMap<String, String>) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp_path = self.path.with_extension("json.tmp");
        let contents = serde_json::to_string_pretty(entries)?;

        let mut options = std::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&tmp_path)?;
        // A stale temp file keeps its old mode, so set it explicitly
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
        }
        file.write_all(contents.as_bytes())?;
        file.sync_all()?;
        drop(file);

        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

impl CredentialStorage for FileStorage {
    fn read(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.load()?.remove(key))
    }

    fn write(&self, new_entries: &[(&str, &str)]) -> Result<(), StorageError> {
        // A corrupt file is replaced rather than blocking a fresh login
        let mut entries = self.load().unwrap_or_default();
        for (key, value) in new_entries {
            entries.insert((*key).to_string(), (*value).to_string());
        }
        self.save(&entries)
    }

    fn remove(&self, keys: &[&str]) -> Result<(), StorageError> {
        if !self.path.exists() {
            return Ok(());
        }
        let mut entries = self.load().unwrap_or_default();
        for key in keys {
            entries.remove(*key);
        }
        if entries.is_empty() {
            std::fs::remove_file(&self.path)?;
            Ok(())
        } else {
            self.save(&entries)
        }
    }
}

/// OS keychain, one entry per key under a shared service name.
#[derive(Debug, Clone)]
pub struct KeyringStorage {
    service: String,
}

impl KeyringStorage {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, key: &str) -> Result<Entry, StorageError> {
        Ok(Entry::new(&self.service, key)?)
    }
}

impl CredentialStorage for KeyringStorage {
    fn read(&self, key: &str) -> Result<Option<String>, StorageError> {
        match self.entry(key)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, entries: &[(&str, &str)]) -> Result<(), StorageError> {
        for (key, value) in entries {
            self.entry(key)?.set_password(value)?;
        }
        Ok(())
    }

    fn remove(&self, keys: &[&str]) -> Result<(), StorageError> {
        for key in keys {
            match self.entry(key)?.delete_credential() {
                Ok(()) | Err(keyring::Error::NoEntry) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}
