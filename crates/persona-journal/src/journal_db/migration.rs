//! Database migration system

use rusqlite::{params, Connection, Transaction};
use tracing::{error, info, warn};

use crate::error::{JournalError, Result};
use crate::journal_db::schema::{
    self, now_millis, APPLICATION_TABLES, SCHEMA_SQL, SCHEMA_VERSION, USER_PERSONA_COLOR,
    USER_PERSONA_ID, USER_PERSONA_NAME,
};

/// What `ensure_schema` found and did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaOutcome {
    /// No version was recorded; the store was initialized at the current version.
    Fresh,
    /// Ran the additive migrations between the two versions.
    Migrated { from: i64, to: i64 },
    Current,
}

/// Version found by `create_tables`.
enum StoredVersion {
    /// `None` when the store was empty and has just been stamped.
    Stamped(Option<i64>),
    /// Pre-v2 tables exist but no version was ever recorded.
    Unstamped,
}

/// One forward-only, additive schema step.
struct Migration {
    version: i64,
    name: &'static str,
    apply: fn(&Transaction<'_>) -> rusqlite::Result<()>,
}

fn get_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 2,
        name: "flow modes and persona sides",
        apply: migrate_v2,
    }]
}

/// v1 stores lack turn-taking state and persona sides.
fn migrate_v2(tx: &Transaction<'_>) -> rusqlite::Result<()> {
    add_column_if_missing(
        tx,
        "conversations",
        "flow_mode",
        "TEXT NOT NULL DEFAULT 'full_control' CHECK (flow_mode IN ('full_control', 'random'))",
    )?;
    add_column_if_missing(tx, "conversations", "persona_sequence", "TEXT")?;
    add_column_if_missing(
        tx,
        "conversations",
        "current_persona_index",
        "INTEGER NOT NULL DEFAULT 0",
    )?;
    add_column_if_missing(
        tx,
        "conversation_personas",
        "side",
        "TEXT CHECK (side IN ('left', 'right'))",
    )?;
    tx.execute(
        "UPDATE conversation_personas SET side = 'right' WHERE persona_id = ?1 AND side IS NULL",
        [USER_PERSONA_ID],
    )?;
    Ok(())
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> rusqlite::Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(names.iter().any(|name| name == column))
}

fn add_column_if_missing(
    conn: &Connection,
    table: &str,
    column: &str,
    definition: &str,
) -> rusqlite::Result<()> {
    if column_exists(conn, table, column)? {
        return Ok(());
    }
    conn.execute_batch(&format!(
        "ALTER TABLE {} ADD COLUMN {} {}",
        table, column, definition
    ))
}

/// Manages database schema migrations
pub struct MigrationManager<'a> {
    conn: &'a mut Connection,
}

impl<'a> MigrationManager<'a> {
    pub fn new(conn: &'a mut Connection) -> Self {
        Self { conn }
    }

    /// Brings the store to [`SCHEMA_VERSION`] and makes sure the `user`
    /// persona exists. Safe to call any number of times.
    pub fn ensure_schema(&mut self) -> Result<SchemaOutcome> {
        info!("Ensuring journal database schema...");

        let stored = self.create_tables().map_err(|e| failed(SCHEMA_VERSION, e))?;

        let outcome = match stored {
            StoredVersion::Stamped(None) => SchemaOutcome::Fresh,
            // v1 created its tables before recording a version; a crash in
            // between leaves v1 tables with no stamp.
            StoredVersion::Unstamped => {
                warn!("Found unversioned v1 tables; migrating");
                self.apply_migrations(1)?;
                SchemaOutcome::Migrated {
                    from: 1,
                    to: SCHEMA_VERSION,
                }
            }
            StoredVersion::Stamped(Some(version)) if version > SCHEMA_VERSION => {
                error!(
                    "Database schema v{} is newer than supported v{}",
                    version, SCHEMA_VERSION
                );
                return Err(JournalError::SchemaMigrationFailed {
                    version,
                    reason: format!(
                        "stored schema v{} is newer than supported v{}",
                        version, SCHEMA_VERSION
                    ),
                });
            }
            StoredVersion::Stamped(Some(version)) if version < SCHEMA_VERSION => {
                self.apply_migrations(version)?;
                SchemaOutcome::Migrated {
                    from: version,
                    to: SCHEMA_VERSION,
                }
            }
            StoredVersion::Stamped(Some(_)) => SchemaOutcome::Current,
        };

        self.ensure_user_persona()
            .map_err(|e| failed(SCHEMA_VERSION, e))?;

        info!("Database schema ready at v{} ({:?})", SCHEMA_VERSION, outcome);
        Ok(outcome)
    }

    /// Creates absent tables and indexes. An empty store is stamped with the
    /// current version in the same transaction; unstamped v1 tables are not.
    fn create_tables(&mut self) -> rusqlite::Result<StoredVersion> {
        let tx = self.conn.transaction()?;
        tx.execute_batch(SCHEMA_SQL)?;

        let stored: Option<i64> =
            tx.query_row("SELECT MAX(version) FROM schema_info", [], |row| row.get(0))?;

        if stored.is_none() && !column_exists(&tx, "conversations", "flow_mode")? {
            tx.commit()?;
            return Ok(StoredVersion::Unstamped);
        }
        if stored.is_none() {
            tx.execute(
                "INSERT INTO schema_info (version) VALUES (?1)",
                [SCHEMA_VERSION],
            )?;
            info!("Initialized fresh database schema (v{})", SCHEMA_VERSION);
        }

        tx.commit()?;
        Ok(StoredVersion::Stamped(stored))
    }

    /// Each migration and its version bump commit together.
    fn apply_migrations(&mut self, current_version: i64) -> Result<()> {
        for migration in get_migrations() {
            if migration.version <= current_version {
                continue;
            }

            info!(
                "Applying migration {} ({})...",
                migration.version, migration.name
            );

            let version = migration.version;
            let result = (|| -> rusqlite::Result<()> {
                let tx = self.conn.transaction()?;
                (migration.apply)(&tx)?;
                tx.execute("DELETE FROM schema_info", [])?;
                tx.execute("INSERT INTO schema_info (version) VALUES (?1)", [version])?;
                tx.commit()
            })();

            if let Err(e) = result {
                error!("Failed to apply migration {}: {}", version, e);
                return Err(failed(version, e));
            }

            info!("Migration {} applied successfully", version);
        }

        Ok(())
    }

    fn ensure_user_persona(&self) -> rusqlite::Result<()> {
        let now = now_millis();
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO personas
             (id, name, description, color, is_custom, pack_name, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 0, NULL, ?5, ?5)",
            params![
                USER_PERSONA_ID,
                USER_PERSONA_NAME,
                "The author of this journal",
                USER_PERSONA_COLOR,
                now
            ],
        )?;
        if inserted > 0 {
            info!("Created sentinel '{}' persona", USER_PERSONA_ID);
        }
        Ok(())
    }

    pub fn get_current_version(&self) -> Result<Option<i64>> {
        Ok(self
            .conn
            .query_row("SELECT MAX(version) FROM schema_info", [], |row| row.get(0))?)
    }

    /// Drops every application table and rebuilds the schema from scratch.
    pub fn reset(&mut self) -> Result<SchemaOutcome> {
        warn!("Dropping all journal tables");
        let drop_all = (|| -> rusqlite::Result<()> {
            let tx = self.conn.transaction()?;
            for table in APPLICATION_TABLES {
                tx.execute_batch(&format!("DROP TABLE IF EXISTS {}", table))?;
            }
            tx.commit()
        })();
        drop_all.map_err(|e| failed(SCHEMA_VERSION, e))?;
        self.ensure_schema()
    }
}

fn failed(version: i64, e: rusqlite::Error) -> JournalError {
    JournalError::SchemaMigrationFailed {
        version,
        reason: e.to_string(),
    }
}

/// Get database statistics from a connection
pub fn get_database_stats(conn: &Connection) -> Result<schema::DatabaseStats> {
    fn get_table_count(conn: &Connection, table_name: &str) -> i64 {
        conn.query_row(&format!("SELECT COUNT(*) FROM {}", table_name), [], |row| {
            row.get(0)
        })
        .unwrap_or_else(|e| {
            warn!("Failed to get count from table {}: {}", table_name, e);
            0
        })
    }

    let schema_version: i64 = conn
        .query_row("SELECT MAX(version) FROM schema_info", [], |row| {
            row.get::<_, Option<i64>>(0)
        })?
        .unwrap_or(0);

    let database_size_bytes: i64 = conn
        .query_row(
            "SELECT page_count * page_size FROM pragma_page_count(), pragma_page_size()",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    Ok(schema::DatabaseStats {
        schema_version,
        total_personas: get_table_count(conn, "personas"),
        total_conversations: get_table_count(conn, "conversations"),
        total_messages: get_table_count(conn, "messages"),
        total_links: get_table_count(conn, "conversation_personas"),
        database_size_bytes,
    })
}
