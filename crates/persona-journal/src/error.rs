//! Error taxonomy shared by every journal component

use std::fmt;

use thiserror::Error;

use crate::security::SecretStoreError;

/// Kind of entity a lookup failed to find
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Conversation,
    Persona,
    /// A persona exists but is not linked to the conversation
    ConversationPersona,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntityKind::Conversation => "conversation",
            EntityKind::Persona => "persona",
            EntityKind::ConversationPersona => "conversation persona",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("database key unavailable: {0}")]
    KeyUnavailable(String),

    #[error("schema migration to v{version} failed: {reason}")]
    SchemaMigrationFailed { version: i64, reason: String },

    #[error("database not initialized; call open() first")]
    NotInitialized,

    #[error("encryption setup failed: {0}")]
    EncryptionSetupFailed(String),

    #[error("invalid persona sequence for conversation {conversation_id}: {reason}")]
    InvalidSequenceState {
        conversation_id: String,
        reason: String,
    },

    #[error("{kind} {id} not found")]
    NotFound { kind: EntityKind, id: String },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl JournalError {
    pub fn not_found(kind: EntityKind, id: impl Into<String>) -> Self {
        JournalError::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        JournalError::Validation(message.into())
    }

    pub fn invalid_sequence(conversation_id: &str, reason: impl Into<String>) -> Self {
        JournalError::InvalidSequenceState {
            conversation_id: conversation_id.to_string(),
            reason: reason.into(),
        }
    }

    /// Initialization failures: the session cannot continue in a degraded mode.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            JournalError::KeyUnavailable(_)
                | JournalError::SchemaMigrationFailed { .. }
                | JournalError::EncryptionSetupFailed(_)
        )
    }
}

impl From<SecretStoreError> for JournalError {
    fn from(e: SecretStoreError) -> Self {
        JournalError::KeyUnavailable(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, JournalError>;
