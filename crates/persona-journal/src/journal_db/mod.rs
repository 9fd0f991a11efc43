//! Journal database module - keyed SQLite storage for personas, conversations and messages
pub mod conversation_store;
pub mod migration;
pub mod persona_store;
pub mod schema;

pub use conversation_store::ConversationStore;
pub use migration::{MigrationManager, SchemaOutcome};
pub use persona_store::{NewPersona, PersonaStore, PRESET_COLORS};
pub use schema::*;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OpenFlags, OptionalExtension};
use tracing::{debug, info, warn};

use crate::error::{JournalError, Result};
use crate::security::{DatabaseKey, KeyCustodian};

pub type ConnectionPool = Pool<SqliteConnectionManager>;
pub type PooledConnection = r2d2::PooledConnection<SqliteConnectionManager>;

/// Where the database lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    File(PathBuf),
    Memory,
}

/// Memoized, keyed handle to the journal database.
///
/// A single pooled connection is kept for the whole process: the pool never
/// recycles it, and every new physical connection is keyed before anything
/// else runs on it.
pub struct JournalDatabase {
    location: StoreLocation,
    custodian: Arc<KeyCustodian>,
    require_cipher: bool,
    pool: ArcSwapOption<ConnectionPool>,
    open_lock: Mutex<()>,
}

impl JournalDatabase {
    pub fn new(location: StoreLocation, custodian: Arc<KeyCustodian>) -> Self {
        Self {
            location,
            custodian,
            require_cipher: cfg!(feature = "sqlcipher"),
            pool: ArcSwapOption::empty(),
            open_lock: Mutex::new(()),
        }
    }

    pub fn file(path: impl Into<PathBuf>, custodian: Arc<KeyCustodian>) -> Self {
        Self::new(StoreLocation::File(path.into()), custodian)
    }

    pub fn in_memory(custodian: Arc<KeyCustodian>) -> Self {
        Self::new(StoreLocation::Memory, custodian)
    }

    /// Refuse to open unless the linked SQLite reports a cipher. On by
    /// default in `sqlcipher` builds.
    pub fn require_cipher(mut self, required: bool) -> Self {
        self.require_cipher = required;
        self
    }

    pub fn location(&self) -> &StoreLocation {
        &self.location
    }

    pub fn is_open(&self) -> bool {
        self.pool.load().is_some()
    }

    /// Opens (or returns the already open) database: key, verify, then
    /// bring the schema to the current version.
    pub fn open(&self) -> Result<Arc<ConnectionPool>> {
        if let Some(pool) = self.pool.load_full() {
            return Ok(pool);
        }

        let _guard = self.open_lock.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(pool) = self.pool.load_full() {
            return Ok(pool);
        }

        let key = self.custodian.obtain_key()?;
        let pool = Arc::new(self.build_pool(key)?);
        {
            let mut conn = pool.get()?;
            self.verify_encryption(&conn)?;
            let outcome = MigrationManager::new(&mut conn).ensure_schema()?;
            debug!("Schema check finished: {:?}", outcome);
        }

        self.pool.store(Some(Arc::clone(&pool)));
        info!("Journal database opened ({})", self.describe_location());
        Ok(pool)
    }

    /// The open pool, or `NotInitialized` before `open()`.
    pub fn get_database(&self) -> Result<Arc<ConnectionPool>> {
        self.pool.load_full().ok_or(JournalError::NotInitialized)
    }

    pub fn connection(&self) -> Result<PooledConnection> {
        Ok(self.get_database()?.get()?)
    }

    /// Drops every application table and recreates the schema.
    pub fn reset(&self) -> Result<SchemaOutcome> {
        let mut conn = self.connection()?;
        warn!("Resetting journal database ({})", self.describe_location());
        MigrationManager::new(&mut conn).reset()
    }

    pub fn stats(&self) -> Result<DatabaseStats> {
        let conn = self.connection()?;
        migration::get_database_stats(&conn)
    }

    /// Checkpoints the WAL and releases the connection. A later `open()`
    /// re-keys from scratch.
    pub fn close(&self) {
        let _guard = self.open_lock.lock().unwrap_or_else(|e| e.into_inner());
        let Some(pool) = self.pool.swap(None) else {
            return;
        };

        if matches!(self.location, StoreLocation::File(_)) {
            match pool.get() {
                Ok(conn) => {
                    if let Err(e) = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);") {
                        warn!("WAL checkpoint on close failed: {}", e);
                    }
                }
                Err(e) => warn!("Could not check out connection for close: {}", e),
            }
        }
        info!("Journal database closed");
    }

    fn build_pool(&self, key: DatabaseKey) -> Result<ConnectionPool> {
        let manager = match &self.location {
            StoreLocation::File(path) => {
                ensure_parent_dir(path)?;
                SqliteConnectionManager::file(path).with_flags(
                    OpenFlags::SQLITE_OPEN_READ_WRITE
                        | OpenFlags::SQLITE_OPEN_CREATE
                        | OpenFlags::SQLITE_OPEN_FULL_MUTEX,
                )
            }
            StoreLocation::Memory => SqliteConnectionManager::memory(),
        };
        let is_file = matches!(self.location, StoreLocation::File(_));

        let manager = manager.with_init(move |conn| {
            // The key must be the first statement on a new connection.
            apply_key(conn, &key)?;
            conn.execute_batch(
                "PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
            )?;
            if is_file {
                conn.execute_batch(
                    "PRAGMA journal_mode = WAL;
                     PRAGMA synchronous = NORMAL;",
                )?;
            }
            Ok(())
        });

        Pool::builder()
            .max_size(1)
            .max_lifetime(None)
            .idle_timeout(None)
            .connection_timeout(Duration::from_secs(5))
            .build(manager)
            .map_err(|e| {
                JournalError::EncryptionSetupFailed(format!(
                    "could not open a keyed connection: {}",
                    e
                ))
            })
    }

    fn verify_encryption(&self, conn: &Connection) -> Result<()> {
        // A wrong key, or a key applied after the first read, leaves the file
        // unreadable.
        conn.query_row("SELECT count(*) FROM sqlite_master", [], |row| {
            row.get::<_, i64>(0)
        })
        .map_err(|e| {
            JournalError::EncryptionSetupFailed(format!(
                "database is not readable with the stored key: {}",
                e
            ))
        })?;

        let cipher_version: Option<String> = conn
            .query_row("PRAGMA cipher_version", [], |row| row.get(0))
            .optional()?;
        match cipher_version {
            Some(version) => debug!("SQLCipher {} active", version),
            None if self.require_cipher => {
                return Err(JournalError::EncryptionSetupFailed(
                    "linked SQLite has no cipher support; build with the sqlcipher feature"
                        .to_string(),
                ));
            }
            None => warn!("SQLite build has no cipher support; database file is not encrypted"),
        }
        Ok(())
    }

    fn describe_location(&self) -> String {
        match &self.location {
            StoreLocation::File(path) => path.display().to_string(),
            StoreLocation::Memory => ":memory:".to_string(),
        }
    }
}

impl Drop for JournalDatabase {
    fn drop(&mut self) {
        self.close();
    }
}

fn apply_key(conn: &Connection, key: &DatabaseKey) -> rusqlite::Result<()> {
    // Raw 256-bit key form, so SQLCipher skips its passphrase KDF.
    conn.execute_batch(&format!("PRAGMA key = \"x'{}'\";", key.expose()))
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| {
            JournalError::EncryptionSetupFailed(format!(
                "cannot create database directory {}: {}",
                parent.display(),
                e
            ))
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::MemorySecretStore;
    use tempfile::TempDir;

    fn custodian() -> (Arc<MemorySecretStore>, Arc<KeyCustodian>) {
        let store = Arc::new(MemorySecretStore::new());
        let custodian = Arc::new(KeyCustodian::new(store.clone()));
        (store, custodian)
    }

    #[test]
    fn access_before_open_is_not_initialized() {
        let (_, custodian) = custodian();
        let db = JournalDatabase::in_memory(custodian);
        assert!(matches!(db.get_database(), Err(JournalError::NotInitialized)));
        assert!(matches!(db.connection(), Err(JournalError::NotInitialized)));
    }

    #[test]
    fn open_is_memoized() {
        let (_, custodian) = custodian();
        let db = JournalDatabase::in_memory(custodian);
        let first = db.open().unwrap();
        let second = db.open().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(db.is_open());
    }

    #[test]
    fn open_fails_without_a_key() {
        let (store, custodian) = custodian();
        store.set_available(false);
        let db = JournalDatabase::in_memory(custodian);

        let err = db.open().unwrap_err();
        assert!(matches!(err, JournalError::KeyUnavailable(_)));
        assert!(err.is_fatal());
        assert!(!db.is_open());
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("journal.db");
        let (_, custodian) = custodian();

        let db = JournalDatabase::file(&path, Arc::clone(&custodian));
        {
            let conn = db.open().unwrap().get().unwrap();
            ConversationStore::new(&conn)
                .create_conversation("kept")
                .unwrap();
        }
        db.close();
        assert!(!db.is_open());
        assert!(path.exists());

        let reopened = JournalDatabase::file(&path, custodian);
        reopened.open().unwrap();
        let stats = reopened.stats().unwrap();
        assert_eq!(stats.total_conversations, 1);
        assert_eq!(stats.schema_version, SCHEMA_VERSION);
    }

    #[test]
    fn reset_clears_rows_and_keeps_the_user() {
        let (_, custodian) = custodian();
        let db = JournalDatabase::in_memory(custodian);
        db.open().unwrap();
        {
            let conn = db.connection().unwrap();
            ConversationStore::new(&conn)
                .create_conversation("gone")
                .unwrap();
        }

        db.reset().unwrap();
        let stats = db.stats().unwrap();
        assert_eq!(stats.total_conversations, 0);
        assert_eq!(stats.total_personas, 1);
    }

    #[cfg(not(feature = "sqlcipher"))]
    #[test]
    fn required_cipher_is_enforced() {
        let (_, custodian) = custodian();
        let db = JournalDatabase::in_memory(custodian).require_cipher(true);
        assert!(matches!(
            db.open(),
            Err(JournalError::EncryptionSetupFailed(_))
        ));
        assert!(!db.is_open());
    }

    #[cfg(feature = "sqlcipher")]
    #[test]
    fn file_on_disk_is_not_plain_sqlite() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("journal.db");
        let (_, custodian) = custodian();

        let db = JournalDatabase::file(&path, custodian);
        {
            let conn = db.open().unwrap().get().unwrap();
            ConversationStore::new(&conn)
                .create_conversation("a private title")
                .unwrap();
        }
        db.close();

        let bytes = std::fs::read(&path).unwrap();
        assert!(!bytes.starts_with(b"SQLite format 3\0"));
        let needle = b"a private title";
        assert!(!bytes.windows(needle.len()).any(|w| w == needle));
    }

    #[cfg(feature = "sqlcipher")]
    #[test]
    fn foreign_key_cannot_read_the_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("journal.db");

        let (_, first) = custodian();
        let db = JournalDatabase::file(&path, first);
        db.open().unwrap();
        db.close();

        let (_, second) = custodian();
        let intruder = JournalDatabase::file(&path, second);
        assert!(matches!(
            intruder.open(),
            Err(JournalError::EncryptionSetupFailed(_))
        ));
    }
}
