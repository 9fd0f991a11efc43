use lazy_static::lazy_static;
use regex::Regex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info};
use uuid::Uuid;

use crate::catalog::{CatalogPersona, PersonaPack};
use crate::error::{JournalError, Result};
use crate::journal_db::schema::*;

lazy_static! {
    static ref HEX_COLOR: Regex = Regex::new(r"^#[0-9A-Fa-f]{6}$").unwrap();
}

/// Palette offered when authoring a custom persona.
pub const PRESET_COLORS: [&str; 15] = [
    "#2196F3", "#E91E63", "#4CAF50", "#FF5722", "#9C27B0", "#00BCD4", "#FFC107", "#795548",
    "#607D8B", "#FF9800", "#F44336", "#3F51B5", "#009688", "#CDDC39", "#FF6F00",
];

const PERSONA_COLUMNS: &str =
    "id, name, description, color, is_custom, pack_name, created_at, updated_at";

/// Input for authoring a custom persona
pub struct NewPersona<'a> {
    pub name: &'a str,
    pub perspective: &'a str,
    pub color: &'a str,
}

/// Persona reads and writes over a borrowed connection or transaction.
pub struct PersonaStore<'c> {
    conn: &'c Connection,
}

impl<'c> PersonaStore<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    fn row_to_persona(row: &Row<'_>) -> rusqlite::Result<Persona> {
        Ok(Persona {
            id: row.get(0)?,
            name: row.get(1)?,
            perspective: row.get(2)?,
            color: row.get(3)?,
            is_custom: row.get::<_, Option<i64>>(4)?.unwrap_or(1) != 0,
            pack_name: row.get(5)?,
            created_at: datetime_from_millis(row.get(6)?),
            updated_at: datetime_from_millis(row.get(7)?),
        })
    }

    pub fn get_persona(&self, persona_id: &str) -> Result<Option<Persona>> {
        Ok(self
            .conn
            .query_row(
                &format!("SELECT {} FROM personas WHERE id = ?1", PERSONA_COLUMNS),
                [persona_id],
                Self::row_to_persona,
            )
            .optional()?)
    }

    pub fn exists(&self, persona_id: &str) -> Result<bool> {
        Ok(self
            .conn
            .query_row("SELECT 1 FROM personas WHERE id = ?1", [persona_id], |_| Ok(()))
            .optional()?
            .is_some())
    }

    /// Inserts a built-in persona from the catalog unless it is already stored.
    pub fn ensure_builtin(&self, pack: &PersonaPack, persona: &CatalogPersona) -> Result<bool> {
        let now = now_millis();
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO personas
             (id, name, description, color, is_custom, pack_name, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6, ?6)",
            params![
                persona.id,
                persona.name,
                persona.perspective,
                persona.color,
                pack.name,
                now
            ],
        )?;
        if inserted > 0 {
            debug!("Stored built-in persona {} from pack {}", persona.id, pack.id);
        }
        Ok(inserted > 0)
    }

    pub fn create_custom(&self, new: NewPersona<'_>) -> Result<Persona> {
        let name = new.name.trim();
        let perspective = new.perspective.trim();
        if name.is_empty() || perspective.is_empty() {
            return Err(JournalError::validation(
                "persona name and perspective are both required",
            ));
        }
        if !HEX_COLOR.is_match(new.color) {
            return Err(JournalError::validation(format!(
                "persona color '{}' is not a #RRGGBB value",
                new.color
            )));
        }

        let id = format!("persona_custom_{}", Uuid::new_v4().simple());
        let now = now_millis();
        self.conn.execute(
            "INSERT INTO personas
             (id, name, description, color, is_custom, pack_name, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 1, NULL, ?5, ?5)",
            params![id, name, perspective, new.color, now],
        )?;

        info!("Custom persona created: {}", id);
        Ok(Persona {
            id,
            name: name.to_string(),
            perspective: Some(perspective.to_string()),
            color: new.color.to_string(),
            is_custom: true,
            pack_name: None,
            created_at: datetime_from_millis(now),
            updated_at: datetime_from_millis(now),
        })
    }

    /// Custom personas, newest first.
    pub fn list_custom(&self) -> Result<Vec<Persona>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM personas WHERE is_custom = 1 ORDER BY created_at DESC, rowid DESC",
            PERSONA_COLUMNS
        ))?;
        let personas = stmt
            .query_map([], Self::row_to_persona)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(personas)
    }
}
