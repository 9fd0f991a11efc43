//! Database schema definitions for the journal
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

use crate::error::{JournalError, Result};

/// Schema version this build writes and understands.
pub const SCHEMA_VERSION: i64 = 2;

/// Sentinel persona representing the human author.
pub const USER_PERSONA_ID: &str = "user";
pub const USER_PERSONA_NAME: &str = "You";
pub const USER_PERSONA_COLOR: &str = "#FFFFFF";

/// Where a persona's messages are placed in the conversation view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Left,
    Right,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Left => "left",
            Side::Right => "right",
        }
    }

    pub fn opposite(self) -> Side {
        match self {
            Side::Left => Side::Right,
            Side::Right => Side::Left,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Side {
    type Err = JournalError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "left" => Ok(Side::Left),
            "right" => Ok(Side::Right),
            other => Err(JournalError::validation(format!("unknown side '{}'", other))),
        }
    }
}

/// Policy deciding which persona may speak next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowMode {
    #[default]
    FullControl,
    Random,
}

impl FlowMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowMode::FullControl => "full_control",
            FlowMode::Random => "random",
        }
    }
}

impl fmt::Display for FlowMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FlowMode {
    type Err = JournalError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "full_control" => Ok(FlowMode::FullControl),
            "random" => Ok(FlowMode::Random),
            "" => Err(JournalError::validation("a flow mode must be selected")),
            other => Err(JournalError::validation(format!(
                "unknown flow mode '{}'",
                other
            ))),
        }
    }
}

macro_rules! text_enum_sql {
    ($ty:ty) => {
        impl ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $ty {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e: JournalError| FromSqlError::Other(Box::new(e)))
            }
        }
    };
}

text_enum_sql!(Side);
text_enum_sql!(FlowMode);

/// Ordered rotation of persona ids used under [`FlowMode::Random`].
///
/// Stored as a JSON array; (de)serialization happens only in the store.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PersonaSequence(Vec<String>);

impl PersonaSequence {
    pub fn new(ids: Vec<String>) -> Self {
        Self(ids)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.0.get(index).map(String::as_str)
    }

    pub fn ids(&self) -> &[String] {
        &self.0
    }

    pub fn contains(&self, id: &str) -> bool {
        self.0.iter().any(|existing| existing == id)
    }

    pub fn push(&mut self, id: String) {
        self.0.push(id);
    }

    pub(crate) fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.0)?)
    }

    pub(crate) fn from_json(json: &str) -> Result<Self> {
        Ok(Self(serde_json::from_str(json)?))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Persona {
    pub id: String,
    pub name: String,
    /// First-person perspective text
    pub perspective: Option<String>,
    pub color: String,
    pub is_custom: bool,
    pub pack_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub flow_mode: FlowMode,
    pub persona_sequence: Option<PersonaSequence>,
    pub current_persona_index: usize,
}

impl Conversation {
    /// Ordering key for the conversation list: last message, else creation.
    pub fn activity_at(&self) -> DateTime<Utc> {
        self.last_message_at.unwrap_or(self.created_at)
    }
}

/// A persona as linked into one conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkedPersona {
    pub conversation_id: String,
    pub persona_id: String,
    pub name: String,
    pub color: String,
    pub side: Option<Side>,
    pub added_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: String,
    pub conversation_id: String,
    pub persona_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePreview {
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub conversation: Conversation,
    pub latest_message: Option<MessagePreview>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseStats {
    pub schema_version: i64,
    pub total_personas: i64,
    pub total_conversations: i64,
    pub total_messages: i64,
    pub total_links: i64,
    pub database_size_bytes: i64,
}

pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

pub(crate) fn datetime_from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

/// Application tables in drop order (children first).
pub const APPLICATION_TABLES: &[&str] = &[
    "messages",
    "conversation_personas",
    "conversations",
    "personas",
    "schema_info",
];

/// Current table set. Every statement is create-if-absent; existing tables
/// from older versions are brought forward by the migrations instead.
pub const SCHEMA_SQL: &str = "
-- Single-row record of the applied schema version
CREATE TABLE IF NOT EXISTS schema_info (
    version INTEGER PRIMARY KEY
);
-- Personas: built-in and user-authored perspectives
CREATE TABLE IF NOT EXISTS personas (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    description TEXT,
    color TEXT NOT NULL,
    is_custom INTEGER DEFAULT 1,
    pack_name TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
-- Conversations: journal threads
CREATE TABLE IF NOT EXISTS conversations (
    id TEXT PRIMARY KEY,
    title TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    last_message_at INTEGER,
    flow_mode TEXT NOT NULL DEFAULT 'full_control'
        CHECK (flow_mode IN ('full_control', 'random')),
    persona_sequence TEXT,
    current_persona_index INTEGER NOT NULL DEFAULT 0
);
-- Messages: append-only entries in a conversation
CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL,
    persona_id TEXT NOT NULL,
    content TEXT NOT NULL,
    is_user INTEGER NOT NULL DEFAULT 1,
    created_at INTEGER NOT NULL,
    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE,
    FOREIGN KEY (persona_id) REFERENCES personas(id) ON DELETE RESTRICT
);
-- Personas available in each conversation, with their display side
CREATE TABLE IF NOT EXISTS conversation_personas (
    conversation_id TEXT NOT NULL,
    persona_id TEXT NOT NULL,
    added_at INTEGER NOT NULL,
    side TEXT CHECK (side IN ('left', 'right')),
    PRIMARY KEY (conversation_id, persona_id),
    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE,
    FOREIGN KEY (persona_id) REFERENCES personas(id) ON DELETE CASCADE
);
-- Indexes for performance
CREATE INDEX IF NOT EXISTS idx_messages_conversation
    ON messages (conversation_id, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_messages_persona
    ON messages (persona_id);
CREATE INDEX IF NOT EXISTS idx_conversations_updated
    ON conversations (updated_at DESC);
";
