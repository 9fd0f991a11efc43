//! Lazy left/right placement of personas within a conversation.

use rusqlite::Connection;
use tracing::debug;

use crate::error::{EntityKind, JournalError, Result};
use crate::journal_db::conversation_store::ConversationStore;
use crate::journal_db::schema::{Side, USER_PERSONA_ID};

/// Side for a persona speaking for the first time, given the side of the
/// newest message's author (`None` when the conversation is empty).
pub fn next_side(latest_author: Option<Option<Side>>) -> Side {
    match latest_author {
        Some(Some(side)) => side.opposite(),
        // No history yet, or the last author was never placed.
        Some(None) | None => Side::Left,
    }
}

pub struct SideResolver<'c> {
    conversations: ConversationStore<'c>,
}

impl<'c> SideResolver<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self {
            conversations: ConversationStore::new(conn),
        }
    }

    /// Returns the persona's side in this conversation, assigning it on first
    /// use. Must run before the persona's message is inserted so that the
    /// "newest message" is the previous one.
    pub fn resolve_side(&self, conversation_id: &str, persona_id: &str) -> Result<Side> {
        let link = self
            .conversations
            .linked_persona(conversation_id, persona_id)?
            .ok_or_else(|| JournalError::not_found(EntityKind::ConversationPersona, persona_id))?;

        if let Some(side) = link.side {
            return Ok(side);
        }

        let side = if persona_id == USER_PERSONA_ID {
            Side::Right
        } else {
            next_side(self.conversations.latest_author_side(conversation_id)?)
        };

        if !self
            .conversations
            .assign_side_if_unset(conversation_id, persona_id, side)?
        {
            // Someone else placed it first; theirs stands.
            return self
                .conversations
                .linked_persona(conversation_id, persona_id)?
                .and_then(|link| link.side)
                .ok_or_else(|| {
                    JournalError::not_found(EntityKind::ConversationPersona, persona_id)
                });
        }

        debug!(
            "Assigned side {} to {} in {}",
            side.as_str(),
            persona_id,
            conversation_id
        );
        Ok(side)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal_db::migration::MigrationManager;
    use crate::journal_db::schema::now_millis;

    fn conn() -> Connection {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys = ON;").unwrap();
        MigrationManager::new(&mut conn).ensure_schema().unwrap();
        conn
    }

    fn link(conn: &Connection, conversation_id: &str, persona_id: &str) {
        conn.execute(
            "INSERT OR IGNORE INTO personas (id, name, color, created_at, updated_at)
             VALUES (?1, ?1, '#000000', 0, 0)",
            [persona_id],
        )
        .unwrap();
        ConversationStore::new(conn)
            .link_persona(conversation_id, persona_id, None, 0)
            .unwrap();
    }

    fn send(conn: &Connection, conversation_id: &str, persona_id: &str, at: i64) -> Side {
        let side = SideResolver::new(conn)
            .resolve_side(conversation_id, persona_id)
            .unwrap();
        ConversationStore::new(conn)
            .insert_message(conversation_id, persona_id, "text", at)
            .unwrap();
        side
    }

    #[test]
    fn next_side_alternates() {
        assert_eq!(next_side(None), Side::Left);
        assert_eq!(next_side(Some(None)), Side::Left);
        assert_eq!(next_side(Some(Some(Side::Right))), Side::Left);
        assert_eq!(next_side(Some(Some(Side::Left))), Side::Right);
    }

    #[test]
    fn sides_alternate_after_the_user() {
        let conn = conn();
        let conversation = ConversationStore::new(&conn).create_conversation("sides").unwrap();
        link(&conn, &conversation.id, "p1");
        link(&conn, &conversation.id, "p2");

        let base = now_millis();
        assert_eq!(send(&conn, &conversation.id, USER_PERSONA_ID, base), Side::Right);
        assert_eq!(send(&conn, &conversation.id, "p1", base + 1), Side::Left);
        assert_eq!(send(&conn, &conversation.id, "p2", base + 2), Side::Right);
        // p2 just spoke on the right, but p1 keeps the side it was given.
        assert_eq!(send(&conn, &conversation.id, "p1", base + 3), Side::Left);
    }

    #[test]
    fn first_speaker_defaults_left() {
        let conn = conn();
        let conversation = ConversationStore::new(&conn).create_conversation("empty").unwrap();
        link(&conn, &conversation.id, "p1");

        assert_eq!(send(&conn, &conversation.id, "p1", now_millis()), Side::Left);
    }

    #[test]
    fn assigned_side_never_changes() {
        let conn = conn();
        let conversation = ConversationStore::new(&conn).create_conversation("fixed").unwrap();
        link(&conn, &conversation.id, "p1");
        link(&conn, &conversation.id, "p2");

        let base = now_millis();
        send(&conn, &conversation.id, "p1", base);
        for offset in 1..5 {
            send(&conn, &conversation.id, "p1", base + offset);
        }
        assert_eq!(send(&conn, &conversation.id, "p2", base + 10), Side::Right);
        assert_eq!(send(&conn, &conversation.id, "p1", base + 11), Side::Left);
    }

    #[test]
    fn unlinked_persona_is_not_found() {
        let conn = conn();
        let conversation = ConversationStore::new(&conn).create_conversation("x").unwrap();
        assert!(matches!(
            SideResolver::new(&conn).resolve_side(&conversation.id, "stranger"),
            Err(JournalError::NotFound { .. })
        ));
    }
}
