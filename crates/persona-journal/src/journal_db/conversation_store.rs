use std::cmp::Ordering;

use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{EntityKind, JournalError, Result};
use crate::journal_db::schema::*;

const CONVERSATION_COLUMNS: &str = "id, title, created_at, updated_at, last_message_at, \
     flow_mode, persona_sequence, current_persona_index";

const LINKED_PERSONA_SELECT: &str = "SELECT cp.conversation_id, p.id, p.name, p.color, cp.side, cp.added_at
     FROM conversation_personas cp
     JOIN personas p ON p.id = cp.persona_id";

/// Conversation row as stored, before the sequence column is decoded.
struct ConversationRecord {
    id: String,
    title: Option<String>,
    created_at: i64,
    updated_at: i64,
    last_message_at: Option<i64>,
    flow_mode: FlowMode,
    persona_sequence: Option<String>,
    current_persona_index: i64,
}

impl ConversationRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            title: row.get(1)?,
            created_at: row.get(2)?,
            updated_at: row.get(3)?,
            last_message_at: row.get(4)?,
            flow_mode: row.get(5)?,
            persona_sequence: row.get(6)?,
            current_persona_index: row.get(7)?,
        })
    }

    /// Only `random` conversations carry turn state. A row whose state does
    /// not decode is still listed; the turn engine reports it through
    /// [`ConversationStore::sequence_state`].
    fn into_conversation(self) -> Conversation {
        let mut persona_sequence = None;
        let mut current_persona_index = 0;
        if self.flow_mode == FlowMode::Random {
            match decode_sequence_state(
                &self.id,
                self.persona_sequence.as_deref(),
                self.current_persona_index,
            ) {
                Ok((sequence, index)) => {
                    persona_sequence = sequence;
                    current_persona_index = index;
                }
                Err(e) => warn!("Conversation {} has unreadable turn state: {}", self.id, e),
            }
        }

        Conversation {
            title: self.title.unwrap_or_default(),
            created_at: datetime_from_millis(self.created_at),
            updated_at: datetime_from_millis(self.updated_at),
            last_message_at: self.last_message_at.map(datetime_from_millis),
            flow_mode: self.flow_mode,
            persona_sequence,
            current_persona_index,
            id: self.id,
        }
    }
}

fn decode_sequence_state(
    conversation_id: &str,
    sequence: Option<&str>,
    index: i64,
) -> Result<(Option<PersonaSequence>, usize)> {
    let sequence = sequence
        .map(PersonaSequence::from_json)
        .transpose()
        .map_err(|e| JournalError::invalid_sequence(conversation_id, e.to_string()))?;
    let index = usize::try_from(index)
        .map_err(|_| JournalError::invalid_sequence(conversation_id, "negative persona index"))?;
    Ok((sequence, index))
}

fn row_to_linked_persona(row: &Row<'_>) -> rusqlite::Result<LinkedPersona> {
    Ok(LinkedPersona {
        conversation_id: row.get(0)?,
        persona_id: row.get(1)?,
        name: row.get(2)?,
        color: row.get(3)?,
        side: row.get(4)?,
        added_at: datetime_from_millis(row.get(5)?),
    })
}

fn row_to_stored_message(row: &Row<'_>) -> rusqlite::Result<StoredMessage> {
    let id: String = row.get(0)?;
    let persona_id: Option<String> = row.get(2)?;
    let persona_id = persona_id.unwrap_or_else(|| {
        // Only pre-v2 rows can lack an author; those were written by the user.
        warn!("Message {} has no persona; attributing it to the user", id);
        USER_PERSONA_ID.to_string()
    });
    Ok(StoredMessage {
        id,
        conversation_id: row.get(1)?,
        persona_id,
        content: row.get(3)?,
        created_at: datetime_from_millis(row.get(4)?),
    })
}

/// Most recent activity first; creation time, then id, break ties.
pub fn by_recent_activity(a: &Conversation, b: &Conversation) -> Ordering {
    b.activity_at()
        .cmp(&a.activity_at())
        .then_with(|| b.created_at.cmp(&a.created_at))
        .then_with(|| a.id.cmp(&b.id))
}

/// Conversation, link and message reads and writes over a borrowed
/// connection or transaction.
pub struct ConversationStore<'c> {
    conn: &'c Connection,
}

impl<'c> ConversationStore<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    /// Creates a conversation and links the `user` persona on the right.
    pub fn create_conversation(&self, title: &str) -> Result<Conversation> {
        let title = title.trim();
        if title.is_empty() {
            return Err(JournalError::validation("conversation title must not be empty"));
        }

        let id = format!("conv_{}", Uuid::new_v4().simple());
        let now = now_millis();
        self.conn.execute(
            "INSERT INTO conversations (id, title, created_at, updated_at, last_message_at, flow_mode)
             VALUES (?1, ?2, ?3, ?3, NULL, ?4)",
            params![id, title, now, FlowMode::FullControl],
        )?;
        self.link_persona(&id, USER_PERSONA_ID, Some(Side::Right), now)?;

        info!("Created conversation {}", id);
        Ok(Conversation {
            id,
            title: title.to_string(),
            created_at: datetime_from_millis(now),
            updated_at: datetime_from_millis(now),
            last_message_at: None,
            flow_mode: FlowMode::FullControl,
            persona_sequence: None,
            current_persona_index: 0,
        })
    }

    pub fn get_conversation(&self, conversation_id: &str) -> Result<Option<Conversation>> {
        let record = self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM conversations WHERE id = ?1",
                    CONVERSATION_COLUMNS
                ),
                [conversation_id],
                ConversationRecord::from_row,
            )
            .optional()?;
        Ok(record.map(ConversationRecord::into_conversation))
    }

    pub fn require_conversation(&self, conversation_id: &str) -> Result<Conversation> {
        self.get_conversation(conversation_id)?
            .ok_or_else(|| JournalError::not_found(EntityKind::Conversation, conversation_id))
    }

    /// Inserts the join row unless the pair is already linked.
    pub fn link_persona(
        &self,
        conversation_id: &str,
        persona_id: &str,
        side: Option<Side>,
        added_at: i64,
    ) -> Result<bool> {
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO conversation_personas (conversation_id, persona_id, side, added_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![conversation_id, persona_id, side, added_at],
        )?;
        Ok(inserted > 0)
    }

    pub fn linked_persona(
        &self,
        conversation_id: &str,
        persona_id: &str,
    ) -> Result<Option<LinkedPersona>> {
        Ok(self
            .conn
            .query_row(
                &format!(
                    "{} WHERE cp.conversation_id = ?1 AND cp.persona_id = ?2",
                    LINKED_PERSONA_SELECT
                ),
                [conversation_id, persona_id],
                row_to_linked_persona,
            )
            .optional()?)
    }

    /// Linked personas ordered by display name.
    pub fn linked_personas(&self, conversation_id: &str) -> Result<Vec<LinkedPersona>> {
        let mut stmt = self.conn.prepare(&format!(
            "{} WHERE cp.conversation_id = ?1 ORDER BY p.name COLLATE NOCASE, p.id",
            LINKED_PERSONA_SELECT
        ))?;
        let personas = stmt
            .query_map([conversation_id], row_to_linked_persona)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(personas)
    }

    /// Linked persona ids in the order they were added.
    pub fn linked_persona_ids(&self, conversation_id: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT persona_id FROM conversation_personas
             WHERE conversation_id = ?1 ORDER BY added_at, rowid",
        )?;
        let ids = stmt
            .query_map([conversation_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(ids)
    }

    /// Sets the side only if none has been recorded yet. Returns whether it
    /// was written.
    pub fn assign_side_if_unset(
        &self,
        conversation_id: &str,
        persona_id: &str,
        side: Side,
    ) -> Result<bool> {
        let updated = self.conn.execute(
            "UPDATE conversation_personas SET side = ?1
             WHERE conversation_id = ?2 AND persona_id = ?3 AND side IS NULL",
            params![side, conversation_id, persona_id],
        )?;
        Ok(updated > 0)
    }

    /// Side of whoever wrote the newest message. `None` when the conversation
    /// has no messages; `Some(None)` when that author has no side yet.
    pub fn latest_author_side(&self, conversation_id: &str) -> Result<Option<Option<Side>>> {
        Ok(self
            .conn
            .query_row(
                "SELECT cp.side
                 FROM messages m
                 LEFT JOIN conversation_personas cp
                   ON cp.persona_id = m.persona_id AND cp.conversation_id = m.conversation_id
                 WHERE m.conversation_id = ?1
                 ORDER BY m.created_at DESC, m.rowid DESC
                 LIMIT 1",
                [conversation_id],
                |row| row.get::<_, Option<Side>>(0),
            )
            .optional()?)
    }

    pub fn last_message_millis(&self, conversation_id: &str) -> Result<Option<i64>> {
        Ok(self.conn.query_row(
            "SELECT MAX(created_at) FROM messages WHERE conversation_id = ?1",
            [conversation_id],
            |row| row.get(0),
        )?)
    }

    pub fn insert_message(
        &self,
        conversation_id: &str,
        persona_id: &str,
        content: &str,
        created_at: i64,
    ) -> Result<StoredMessage> {
        let id = format!("msg_{}", Uuid::new_v4().simple());
        self.conn.execute(
            "INSERT INTO messages (id, conversation_id, persona_id, content, is_user, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                id,
                conversation_id,
                persona_id,
                content,
                persona_id == USER_PERSONA_ID,
                created_at
            ],
        )?;
        debug!("Stored message {} in conversation {}", id, conversation_id);

        Ok(StoredMessage {
            id,
            conversation_id: conversation_id.to_string(),
            persona_id: persona_id.to_string(),
            content: content.to_string(),
            created_at: datetime_from_millis(created_at),
        })
    }

    pub fn touch_conversation(&self, conversation_id: &str, at: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE conversations SET last_message_at = ?1, updated_at = ?1 WHERE id = ?2",
            params![at, conversation_id],
        )?;
        Ok(())
    }

    pub fn message_count(&self, conversation_id: &str) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE conversation_id = ?1",
            [conversation_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// The newest `limit` messages, oldest first.
    pub fn list_messages(&self, conversation_id: &str, limit: usize) -> Result<Vec<StoredMessage>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, conversation_id, persona_id, content, created_at
             FROM messages
             WHERE conversation_id = ?1
             ORDER BY created_at DESC, rowid DESC
             LIMIT ?2",
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut messages = stmt
            .query_map(params![conversation_id, limit], row_to_stored_message)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        messages.reverse();
        Ok(messages)
    }

    pub fn latest_message(&self, conversation_id: &str) -> Result<Option<MessagePreview>> {
        Ok(self
            .conn
            .query_row(
                "SELECT content, created_at FROM messages
                 WHERE conversation_id = ?1
                 ORDER BY created_at DESC, rowid DESC
                 LIMIT 1",
                [conversation_id],
                |row| {
                    Ok(MessagePreview {
                        content: row.get(0)?,
                        created_at: datetime_from_millis(row.get(1)?),
                    })
                },
            )
            .optional()?)
    }

    /// Every conversation with its latest message, most recently active first.
    pub fn list_conversations(&self) -> Result<Vec<ConversationSummary>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM conversations",
            CONVERSATION_COLUMNS
        ))?;
        let records = stmt
            .query_map([], ConversationRecord::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut conversations: Vec<Conversation> = records
            .into_iter()
            .map(ConversationRecord::into_conversation)
            .collect();
        conversations.sort_by(by_recent_activity);

        conversations
            .into_iter()
            .map(|conversation| -> Result<ConversationSummary> {
                let latest_message = self.latest_message(&conversation.id)?;
                Ok(ConversationSummary {
                    conversation,
                    latest_message,
                })
            })
            .collect()
    }

    pub fn set_flow_mode(
        &self,
        conversation_id: &str,
        mode: FlowMode,
        sequence: Option<&PersonaSequence>,
    ) -> Result<()> {
        let sequence_json = sequence.map(PersonaSequence::to_json).transpose()?;
        self.conn.execute(
            "UPDATE conversations
             SET flow_mode = ?1, persona_sequence = ?2, current_persona_index = 0
             WHERE id = ?3",
            params![mode, sequence_json, conversation_id],
        )?;
        Ok(())
    }

    /// Stored sequence and index, decoded strictly.
    pub fn sequence_state(&self, conversation_id: &str) -> Result<(Option<PersonaSequence>, usize)> {
        let (sequence, index): (Option<String>, i64) = self
            .conn
            .query_row(
                "SELECT persona_sequence, current_persona_index FROM conversations WHERE id = ?1",
                [conversation_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?
            .ok_or_else(|| JournalError::not_found(EntityKind::Conversation, conversation_id))?;
        decode_sequence_state(conversation_id, sequence.as_deref(), index)
    }

    pub fn save_sequence(
        &self,
        conversation_id: &str,
        sequence: &PersonaSequence,
        index: usize,
    ) -> Result<()> {
        self.conn.execute(
            "UPDATE conversations SET persona_sequence = ?1, current_persona_index = ?2 WHERE id = ?3",
            params![sequence.to_json()?, index as i64, conversation_id],
        )?;
        Ok(())
    }

    pub fn save_sequence_index(&self, conversation_id: &str, index: usize) -> Result<()> {
        self.conn.execute(
            "UPDATE conversations SET current_persona_index = ?1 WHERE id = ?2",
            params![index as i64, conversation_id],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal_db::migration::MigrationManager;

    fn conn() -> Connection {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys = ON;").unwrap();
        MigrationManager::new(&mut conn).ensure_schema().unwrap();
        conn
    }

    #[test]
    fn new_conversation_links_user_on_the_right() {
        let conn = conn();
        let store = ConversationStore::new(&conn);
        let conversation = store.create_conversation("  Morning thoughts ").unwrap();

        assert_eq!(conversation.title, "Morning thoughts");
        assert_eq!(conversation.flow_mode, FlowMode::FullControl);
        let user = store
            .linked_persona(&conversation.id, USER_PERSONA_ID)
            .unwrap()
            .unwrap();
        assert_eq!(user.side, Some(Side::Right));
        assert_eq!(store.get_conversation(&conversation.id).unwrap(), Some(conversation));
    }

    #[test]
    fn empty_title_is_rejected() {
        let conn = conn();
        let err = ConversationStore::new(&conn).create_conversation(" \n").unwrap_err();
        assert!(matches!(err, JournalError::Validation(_)));
    }

    #[test]
    fn linking_twice_keeps_one_row() {
        let conn = conn();
        let store = ConversationStore::new(&conn);
        let conversation = store.create_conversation("t").unwrap();

        assert!(!store
            .link_persona(&conversation.id, USER_PERSONA_ID, None, 0)
            .unwrap());
        assert_eq!(store.linked_persona_ids(&conversation.id).unwrap(), vec!["user"]);
        // The original side survives the duplicate link attempt.
        let user = store.linked_persona(&conversation.id, USER_PERSONA_ID).unwrap().unwrap();
        assert_eq!(user.side, Some(Side::Right));
    }

    #[test]
    fn side_is_written_only_once() {
        let conn = conn();
        let store = ConversationStore::new(&conn);
        let conversation = store.create_conversation("t").unwrap();

        assert!(!store
            .assign_side_if_unset(&conversation.id, USER_PERSONA_ID, Side::Left)
            .unwrap());
        let user = store.linked_persona(&conversation.id, USER_PERSONA_ID).unwrap().unwrap();
        assert_eq!(user.side, Some(Side::Right));
    }

    #[test]
    fn list_messages_returns_newest_page_oldest_first() {
        let conn = conn();
        let store = ConversationStore::new(&conn);
        let conversation = store.create_conversation("t").unwrap();
        for (i, text) in ["one", "two", "three", "four"].iter().enumerate() {
            store
                .insert_message(&conversation.id, USER_PERSONA_ID, text, 100 + i as i64)
                .unwrap();
        }

        let page: Vec<String> = store
            .list_messages(&conversation.id, 2)
            .unwrap()
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(page, vec!["three", "four"]);
        assert!(store.list_messages(&conversation.id, 0).unwrap().is_empty());
    }

    #[test]
    fn equal_timestamps_fall_back_to_insertion_order() {
        let conn = conn();
        let store = ConversationStore::new(&conn);
        let conversation = store.create_conversation("t").unwrap();
        store.insert_message(&conversation.id, USER_PERSONA_ID, "a", 500).unwrap();
        store.insert_message(&conversation.id, USER_PERSONA_ID, "b", 500).unwrap();

        let latest = store.latest_message(&conversation.id).unwrap().unwrap();
        assert_eq!(latest.content, "b");
    }

    #[test]
    fn conversations_sort_by_last_activity_then_creation() {
        let conn = conn();
        let store = ConversationStore::new(&conn);
        let quiet = store.create_conversation("quiet").unwrap();
        let busy = store.create_conversation("busy").unwrap();
        conn.execute(
            "UPDATE conversations SET created_at = 1000 WHERE id = ?1",
            [&quiet.id],
        )
        .unwrap();
        conn.execute(
            "UPDATE conversations SET created_at = 2000 WHERE id = ?1",
            [&busy.id],
        )
        .unwrap();
        let newest = store.create_conversation("newest").unwrap();

        let tomorrow = now_millis() + 86_400_000;
        store.insert_message(&quiet.id, USER_PERSONA_ID, "late entry", tomorrow).unwrap();
        store.touch_conversation(&quiet.id, tomorrow).unwrap();

        let listed = store.list_conversations().unwrap();
        let ids: Vec<&str> = listed.iter().map(|s| s.conversation.id.as_str()).collect();
        assert_eq!(ids, vec![quiet.id.as_str(), newest.id.as_str(), busy.id.as_str()]);

        assert_eq!(listed[0].latest_message.as_ref().unwrap().content, "late entry");
        assert!(listed[1].latest_message.is_none());
    }

    #[test]
    fn corrupt_sequence_only_affects_its_own_turn_state() {
        let conn = conn();
        let store = ConversationStore::new(&conn);
        let good = store.create_conversation("good").unwrap();
        let broken = store.create_conversation("broken").unwrap();
        let manual = store.create_conversation("manual").unwrap();
        for id in [&broken.id, &manual.id] {
            conn.execute(
                "UPDATE conversations SET persona_sequence = 'not json' WHERE id = ?1",
                [id],
            )
            .unwrap();
        }
        conn.execute(
            "UPDATE conversations SET flow_mode = 'random' WHERE id = ?1",
            [&broken.id],
        )
        .unwrap();

        assert_eq!(store.list_conversations().unwrap().len(), 3);
        assert!(store.get_conversation(&good.id).unwrap().is_some());

        // full_control ignores the column entirely.
        let manual = store.require_conversation(&manual.id).unwrap();
        assert!(manual.persona_sequence.is_none());
        assert!(store.sequence_state(&good.id).unwrap().0.is_none());

        let broken = store.require_conversation(&broken.id).unwrap();
        assert_eq!(broken.flow_mode, FlowMode::Random);
        assert!(broken.persona_sequence.is_none());
        assert!(matches!(
            store.sequence_state(&broken.id),
            Err(JournalError::InvalidSequenceState { .. })
        ));
    }
}
