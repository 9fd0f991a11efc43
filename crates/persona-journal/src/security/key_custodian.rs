//! Lifecycle of the single symmetric database key

use std::fmt;
use std::sync::{Arc, Mutex};

use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{info, warn};

use super::secret_store::SecretStore;
use crate::error::{JournalError, Result};

/// Name the key is stored under in the secret store.
pub const DATABASE_KEY_NAME: &str = "persona_db_encryption_key";

/// 256-bit key, stored as 64 lowercase hex characters.
pub const KEY_BYTES: usize = 32;

/// Database key. Formatting never prints the key material.
#[derive(Clone, PartialEq, Eq)]
pub struct DatabaseKey(String);

impl DatabaseKey {
    fn generate() -> Self {
        let mut bytes = [0u8; KEY_BYTES];
        OsRng.fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    fn parse(encoded: &str) -> Option<Self> {
        let well_formed = encoded.len() == KEY_BYTES * 2
            && encoded
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        well_formed.then(|| Self(encoded.to_string()))
    }

    /// Raw hex passphrase, used to key a freshly opened connection.
    pub(crate) fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for DatabaseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DatabaseKey(<redacted>)")
    }
}

impl fmt::Display for DatabaseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

/// Owns generation, persistence and retrieval of the database key.
pub struct KeyCustodian {
    store: Arc<dyn SecretStore>,
    // Serializes obtain/forget so two first-time callers cannot both generate.
    lifecycle: Mutex<()>,
}

impl KeyCustodian {
    pub fn new(store: Arc<dyn SecretStore>) -> Self {
        Self {
            store,
            lifecycle: Mutex::new(()),
        }
    }

    /// Returns the persisted key, generating and persisting one on first use.
    pub fn obtain_key(&self) -> Result<DatabaseKey> {
        let _guard = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(existing) = self.store.get(DATABASE_KEY_NAME)? {
            return DatabaseKey::parse(&existing).ok_or_else(|| {
                // Never overwrite: replacing the key would orphan the data.
                JournalError::KeyUnavailable("stored database key is malformed".to_string())
            });
        }

        let key = DatabaseKey::generate();
        self.store.set(DATABASE_KEY_NAME, key.expose())?;

        match self.store.get(DATABASE_KEY_NAME)? {
            Some(stored) if stored == key.expose() => {
                info!("Generated and stored a new database key");
                Ok(key)
            }
            _ => Err(JournalError::KeyUnavailable(
                "secret store did not retain the generated key".to_string(),
            )),
        }
    }

    /// Ready/not-ready status. Errors from the store read as not ready.
    pub fn is_ready(&self) -> bool {
        matches!(self.store.get(DATABASE_KEY_NAME), Ok(Some(_)))
    }

    /// Deletes the key. Everything encrypted with it becomes unrecoverable.
    pub fn forget_key(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
        self.store.delete(DATABASE_KEY_NAME)?;
        warn!("Database key deleted; previously encrypted data is now unrecoverable");
        Ok(())
    }
}
