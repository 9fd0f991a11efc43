//! Local-first persona journal: encrypted storage, persona-threaded
//! conversations and turn-taking.

pub mod catalog;
pub mod config;
pub mod error;
pub mod journal;
pub mod journal_db;
pub mod security;
pub mod side_resolver;
pub mod telemetry;
pub mod turn_engine;
pub mod utils;

#[cfg(feature = "cli")]
pub mod cli;

// Public API exports
pub use catalog::{CatalogPersona, PersonaCatalog, PersonaPack};
pub use config::Config;
pub use error::{EntityKind, JournalError, Result};
pub use journal::{AppendOutcome, DestructiveConfirmation, Journal};
pub use journal_db::{
    Conversation, ConversationSummary, DatabaseStats, FlowMode, JournalDatabase, LinkedPersona,
    MessagePreview, Persona, PersonaSequence, Side, StoreLocation, StoredMessage,
    SCHEMA_VERSION, USER_PERSONA_ID,
};
pub use security::{FileSecretStore, KeyCustodian, MemorySecretStore, SecretStore};
pub use side_resolver::SideResolver;
pub use turn_engine::{ActiveTurn, TurnEngine};
