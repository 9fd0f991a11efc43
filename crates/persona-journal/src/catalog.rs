//! Static catalog of built-in persona packs
//!
//! The catalog is input data: an embedded default ships with the crate and an
//! external JSON file with the same layout can replace it.

use std::collections::HashSet;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::{JournalError, Result};
use crate::journal_db::schema::USER_PERSONA_ID;

const DEFAULT_CATALOG: &str = include_str!("../assets/persona-packs.json");

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogPersona {
    pub id: String,
    pub name: String,
    pub perspective: String,
    pub color: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonaPack {
    pub id: String,
    pub name: String,
    pub description: String,
    pub personas: Vec<CatalogPersona>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonaCatalog {
    packs: Vec<PersonaPack>,
}

impl PersonaCatalog {
    pub fn embedded() -> Result<Self> {
        Self::from_json(DEFAULT_CATALOG)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let catalog: PersonaCatalog = serde_json::from_str(json)?;
        catalog.validate()?;
        Ok(catalog)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read persona catalog {}", path.display()))?;
        Self::from_json(&json)
            .with_context(|| format!("Invalid persona catalog {}", path.display()))
    }

    /// Persona ids must be unique across packs and may not shadow `user`.
    fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for persona in self.packs.iter().flat_map(|pack| pack.personas.iter()) {
            if persona.id == USER_PERSONA_ID {
                return Err(JournalError::validation(
                    "catalog personas may not use the reserved 'user' id",
                ));
            }
            if !seen.insert(persona.id.as_str()) {
                return Err(JournalError::validation(format!(
                    "catalog persona id '{}' appears more than once",
                    persona.id
                )));
            }
        }
        Ok(())
    }

    pub fn packs(&self) -> &[PersonaPack] {
        &self.packs
    }

    pub fn find(&self, persona_id: &str) -> Option<(&PersonaPack, &CatalogPersona)> {
        self.packs.iter().find_map(|pack| {
            pack.personas
                .iter()
                .find(|persona| persona.id == persona_id)
                .map(|persona| (pack, persona))
        })
    }
}
