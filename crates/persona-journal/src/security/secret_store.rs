//! Secret storage backends for the database key.
//!
//! The key custodian only needs three atomic operations (`get`, `set`,
//! `delete`) from an OS-backed store. Two backends ship with the crate:
//! a file store that keeps secrets in an owner-only JSON file, and an
//! in-process store used for tests and embedding.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::Write as IoWrite;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum SecretStoreError {
    #[error("secret store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("secret store is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("secret store unavailable: {0}")]
    Unavailable(String),
}

/// Durable name/value store for secrets. Each call is atomic on its own.
pub trait SecretStore: Send + Sync {
    fn get(&self, name: &str) -> Result<Option<String>, SecretStoreError>;
    fn set(&self, name: &str, value: &str) -> Result<(), SecretStoreError>;
    fn delete(&self, name: &str) -> Result<(), SecretStoreError>;
}

/// Secrets kept in a single JSON file readable only by the owning user.
///
/// Writes go to a sibling temp file which is fsynced and renamed over the
/// original, so a crash never leaves a half-written secrets file.
pub struct FileSecretStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileSecretStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<BTreeMap<String, String>, SecretStoreError> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let content = fs::read_to_string(&self.path)?;
        if content.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        Ok(serde_json::from_str(&content)?)
    }

    fn save(&self, entries: &BTreeMap<String, String>) -> Result<(), SecretStoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let tmp_path = self.path.with_extension("tmp");
        {
            let mut file = open_owner_only(&tmp_path)?;
            file.write_all(serde_json::to_string_pretty(entries)?.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        debug!("Secret store written to {}", self.path.display());
        Ok(())
    }
}

#[cfg(unix)]
fn open_owner_only(path: &Path) -> std::io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(unix))]
fn open_owner_only(path: &Path) -> std::io::Result<File> {
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
}

impl SecretStore for FileSecretStore {
    fn get(&self, name: &str) -> Result<Option<String>, SecretStoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        Ok(self.load()?.get(name).cloned())
    }

    fn set(&self, name: &str, value: &str) -> Result<(), SecretStoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut entries = self.load()?;
        entries.insert(name.to_string(), value.to_string());
        self.save(&entries)
    }

    fn delete(&self, name: &str) -> Result<(), SecretStoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut entries = self.load()?;
        if entries.remove(name).is_some() {
            self.save(&entries)?;
        }
        Ok(())
    }
}

/// Process-local secret store. Can be switched offline to simulate a locked
/// keychain.
#[derive(Default)]
pub struct MemorySecretStore {
    entries: Mutex<HashMap<String, String>>,
    offline: AtomicBool,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.offline.store(!available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), SecretStoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(SecretStoreError::Unavailable(
                "in-memory secret store is offline".to_string(),
            ));
        }
        Ok(())
    }
}

impl SecretStore for MemorySecretStore {
    fn get(&self, name: &str) -> Result<Option<String>, SecretStoreError> {
        self.check_available()?;
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(entries.get(name).cloned())
    }

    fn set(&self, name: &str, value: &str) -> Result<(), SecretStoreError> {
        self.check_available()?;
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(name.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<(), SecretStoreError> {
        self.check_available()?;
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(name);
        Ok(())
    }
}
