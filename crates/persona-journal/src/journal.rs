//! Command surface consumed by the presentation layer.
//!
//! Every command runs against the memoized store handle. Writes go through a
//! single IMMEDIATE transaction so a failed command leaves no partial rows.

use std::sync::Arc;

use dashmap::DashMap;
use rusqlite::{Connection, TransactionBehavior};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::catalog::PersonaCatalog;
use crate::config::Config;
use crate::error::{EntityKind, JournalError, Result};
use crate::journal_db::{
    now_millis, Conversation, ConversationStore, ConversationSummary, DatabaseStats, FlowMode,
    JournalDatabase, LinkedPersona, NewPersona, Persona, PersonaStore, Side, StoredMessage,
    USER_PERSONA_ID,
};
use crate::security::{FileSecretStore, KeyCustodian, SecretStore};
use crate::side_resolver::SideResolver;
use crate::turn_engine::{ActiveTurn, TurnEngine};
use crate::utils::TextUtils;

const DEFAULT_PAGE_SIZE: usize = 50;
const DEFAULT_PREVIEW_CHARS: usize = 80;

/// Proof that the user confirmed an irreversible operation.
#[derive(Debug)]
pub struct DestructiveConfirmation(());

impl DestructiveConfirmation {
    /// Call only after the user has explicitly agreed to lose data.
    pub fn acknowledge_data_loss() -> Self {
        Self(())
    }
}

/// Result of a successful send.
#[derive(Debug, Clone, Serialize)]
pub struct AppendOutcome {
    pub message: StoredMessage,
    pub side: Side,
    /// Under `random`, the persona whose turn it now is.
    pub next_turn: Option<ActiveTurn>,
}

pub struct Journal {
    db: JournalDatabase,
    custodian: Arc<KeyCustodian>,
    catalog: PersonaCatalog,
    page_size: usize,
    preview_chars: usize,
    // Reset and key deletion take this exclusively.
    op_lock: RwLock<()>,
    // full_control selections; presentation state, not persisted
    selections: DashMap<String, String>,
}

impl Journal {
    pub fn new(
        db: JournalDatabase,
        custodian: Arc<KeyCustodian>,
        catalog: PersonaCatalog,
    ) -> Self {
        Self {
            db,
            custodian,
            catalog,
            page_size: DEFAULT_PAGE_SIZE,
            preview_chars: DEFAULT_PREVIEW_CHARS,
            op_lock: RwLock::new(()),
            selections: DashMap::new(),
        }
    }

    pub fn with_limits(mut self, page_size: usize, preview_chars: usize) -> Self {
        self.page_size = page_size.max(1);
        self.preview_chars = preview_chars;
        self
    }

    /// File-backed journal wired from configuration. Does not open the store.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let catalog = match &config.catalog_path {
            Some(path) => PersonaCatalog::load(path)?,
            None => PersonaCatalog::embedded()?,
        };
        let store: Arc<dyn SecretStore> = Arc::new(FileSecretStore::new(config.secret_path()));
        let custodian = Arc::new(KeyCustodian::new(store));
        let db = JournalDatabase::file(config.db_path(), Arc::clone(&custodian))
            .require_cipher(config.require_cipher);

        Ok(Self::new(db, custodian, catalog)
            .with_limits(config.message_page_size, config.preview_chars))
    }

    /// In-memory journal with the embedded catalog.
    pub fn in_memory(store: Arc<dyn SecretStore>) -> Result<Self> {
        let custodian = Arc::new(KeyCustodian::new(store));
        let db = JournalDatabase::in_memory(Arc::clone(&custodian));
        Ok(Self::new(db, custodian, PersonaCatalog::embedded()?))
    }

    pub fn catalog(&self) -> &PersonaCatalog {
        &self.catalog
    }

    /// Ready/not-ready; never the key itself.
    pub fn is_key_ready(&self) -> bool {
        self.custodian.is_ready()
    }

    pub async fn open(&self) -> Result<()> {
        let _guard = self.op_lock.read().await;
        self.db.open()?;
        Ok(())
    }

    pub async fn close(&self) {
        let _guard = self.op_lock.write().await;
        self.db.close();
    }

    pub async fn create_conversation(&self, title: &str) -> Result<Conversation> {
        let _guard = self.op_lock.read().await;
        let conversation = self.write(|conn| ConversationStore::new(conn).create_conversation(title))?;
        info!("Conversation created: {}", conversation.id);
        Ok(conversation)
    }

    /// Links personas to a conversation, storing built-ins from the catalog
    /// on first use. Already-linked ids are left untouched.
    pub async fn link_personas<S: AsRef<str>>(
        &self,
        conversation_id: &str,
        persona_ids: &[S],
    ) -> Result<Vec<LinkedPersona>> {
        let _guard = self.op_lock.read().await;
        self.write(|conn| {
            let conversations = ConversationStore::new(conn);
            let personas = PersonaStore::new(conn);
            let conversation = conversations.require_conversation(conversation_id)?;
            let now = now_millis();

            conversations.link_persona(conversation_id, USER_PERSONA_ID, Some(Side::Right), now)?;

            let mut added = Vec::new();
            for persona_id in persona_ids.iter().map(AsRef::as_ref) {
                if persona_id == USER_PERSONA_ID {
                    continue;
                }
                if !personas.exists(persona_id)? {
                    let (pack, persona) = self
                        .catalog
                        .find(persona_id)
                        .ok_or_else(|| JournalError::not_found(EntityKind::Persona, persona_id))?;
                    personas.ensure_builtin(pack, persona)?;
                }
                if conversations.link_persona(conversation_id, persona_id, None, now)? {
                    added.push(persona_id.to_string());
                }
            }

            if !added.is_empty() && conversation.flow_mode == FlowMode::Random {
                TurnEngine::new(conn).extend(conversation_id, &added)?;
            }
            if !added.is_empty() {
                info!("Linked {:?} to {}", added, conversation_id);
            }
            conversations.linked_personas(conversation_id)
        })
    }

    pub async fn append_message(
        &self,
        conversation_id: &str,
        persona_id: &str,
        content: &str,
    ) -> Result<AppendOutcome> {
        if !TextUtils::has_content(content) {
            return Err(JournalError::validation("message content must not be empty"));
        }

        let _guard = self.op_lock.read().await;
        let outcome = self.write(|conn| {
            let conversations = ConversationStore::new(conn);
            let conversation = conversations.require_conversation(conversation_id)?;
            self.require_link(conn, conversation_id, persona_id)?;

            let engine = TurnEngine::new(conn);
            if conversation.flow_mode == FlowMode::Random {
                let turn = engine.current(conversation_id)?;
                if turn.persona.persona_id != persona_id {
                    return Err(JournalError::validation(format!(
                        "it is {}'s turn, not {}",
                        turn.persona.persona_id, persona_id
                    )));
                }
            }

            let side = SideResolver::new(conn).resolve_side(conversation_id, persona_id)?;

            let now = now_millis();
            let created_at = match conversations.last_message_millis(conversation_id)? {
                Some(last) if last >= now => last + 1,
                _ => now,
            };
            let message =
                conversations.insert_message(conversation_id, persona_id, content, created_at)?;
            conversations.touch_conversation(conversation_id, created_at)?;

            let next_turn = match conversation.flow_mode {
                FlowMode::Random => Some(engine.advance(conversation_id)?),
                FlowMode::FullControl => None,
            };

            Ok(AppendOutcome {
                message,
                side,
                next_turn,
            })
        })?;

        if outcome.next_turn.is_none() {
            self.selections
                .insert(conversation_id.to_string(), persona_id.to_string());
        }
        Ok(outcome)
    }

    /// Conversations by most recent activity, each with a latest-message preview.
    pub async fn list_conversations(&self) -> Result<Vec<ConversationSummary>> {
        let _guard = self.op_lock.read().await;
        let conn = self.db.connection()?;
        let mut summaries = ConversationStore::new(&conn).list_conversations()?;
        for summary in &mut summaries {
            if let Some(preview) = summary.latest_message.as_mut() {
                preview.content = TextUtils::preview(&preview.content, self.preview_chars);
            }
        }
        Ok(summaries)
    }

    /// The newest `limit` messages (default page size), oldest first.
    pub async fn list_messages(
        &self,
        conversation_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<StoredMessage>> {
        let _guard = self.op_lock.read().await;
        let conn = self.db.connection()?;
        let conversations = ConversationStore::new(&conn);
        conversations.require_conversation(conversation_id)?;
        conversations.list_messages(conversation_id, limit.unwrap_or(self.page_size))
    }

    pub async fn get_conversation(&self, conversation_id: &str) -> Result<Conversation> {
        let _guard = self.op_lock.read().await;
        let conn = self.db.connection()?;
        ConversationStore::new(&conn).require_conversation(conversation_id)
    }

    /// Linked personas with their sides, by display name.
    pub async fn conversation_personas(&self, conversation_id: &str) -> Result<Vec<LinkedPersona>> {
        let _guard = self.op_lock.read().await;
        let conn = self.db.connection()?;
        let conversations = ConversationStore::new(&conn);
        conversations.require_conversation(conversation_id)?;
        conversations.linked_personas(conversation_id)
    }

    /// Chooses the turn-taking mode. Only allowed before the first message.
    /// Returns the first active turn when switching to `random`.
    pub async fn set_flow_mode(
        &self,
        conversation_id: &str,
        mode: FlowMode,
    ) -> Result<Option<ActiveTurn>> {
        let _guard = self.op_lock.read().await;
        let turn = self.write(|conn| {
            let conversations = ConversationStore::new(conn);
            conversations.require_conversation(conversation_id)?;
            if conversations.message_count(conversation_id)? > 0 {
                return Err(JournalError::validation(
                    "flow mode can only be chosen before the first message",
                ));
            }

            match mode {
                FlowMode::Random => TurnEngine::new(conn).initialize(conversation_id).map(Some),
                FlowMode::FullControl => {
                    conversations.set_flow_mode(conversation_id, FlowMode::FullControl, None)?;
                    Ok(None)
                }
            }
        })?;

        self.selections.remove(conversation_id);
        info!("Flow mode for {} set to {}", conversation_id, mode.as_str());
        Ok(turn)
    }

    /// Moves a `random` conversation to its next persona.
    pub async fn advance_sequence(&self, conversation_id: &str) -> Result<ActiveTurn> {
        let _guard = self.op_lock.read().await;
        self.write(|conn| TurnEngine::new(conn).advance(conversation_id))
    }

    /// Makes a linked persona active under `full_control`.
    pub async fn select_persona(
        &self,
        conversation_id: &str,
        persona_id: &str,
    ) -> Result<LinkedPersona> {
        let _guard = self.op_lock.read().await;
        let conn = self.db.connection()?;
        let conversation = ConversationStore::new(&conn).require_conversation(conversation_id)?;
        if conversation.flow_mode != FlowMode::FullControl {
            return Err(JournalError::validation(
                "personas rotate automatically in random mode",
            ));
        }

        let persona = self.require_link(&conn, conversation_id, persona_id)?;
        self.selections
            .insert(conversation_id.to_string(), persona_id.to_string());
        Ok(persona)
    }

    /// The persona expected to speak next.
    pub async fn active_persona(&self, conversation_id: &str) -> Result<LinkedPersona> {
        let _guard = self.op_lock.read().await;
        let conn = self.db.connection()?;
        let conversation = ConversationStore::new(&conn).require_conversation(conversation_id)?;

        match conversation.flow_mode {
            FlowMode::Random => Ok(TurnEngine::new(&conn).current(conversation_id)?.persona),
            FlowMode::FullControl => {
                let selected = self
                    .selections
                    .get(conversation_id)
                    .map(|entry| entry.value().clone())
                    .unwrap_or_else(|| USER_PERSONA_ID.to_string());
                self.require_link(&conn, conversation_id, &selected)
            }
        }
    }

    pub async fn create_persona(
        &self,
        name: &str,
        perspective: &str,
        color: &str,
    ) -> Result<Persona> {
        let _guard = self.op_lock.read().await;
        self.write(|conn| {
            PersonaStore::new(conn).create_custom(NewPersona {
                name,
                perspective,
                color,
            })
        })
    }

    /// Custom personas, newest first.
    pub async fn list_custom_personas(&self) -> Result<Vec<Persona>> {
        let _guard = self.op_lock.read().await;
        let conn = self.db.connection()?;
        PersonaStore::new(&conn).list_custom()
    }

    pub async fn stats(&self) -> Result<DatabaseStats> {
        let _guard = self.op_lock.read().await;
        self.db.stats()
    }

    /// Drops and recreates every table.
    pub async fn reset_store(&self, _confirmed: DestructiveConfirmation) -> Result<()> {
        let _guard = self.op_lock.write().await;
        self.db.reset()?;
        self.selections.clear();
        warn!("Journal store reset");
        Ok(())
    }

    /// Closes the store and deletes the key. The existing database file can
    /// no longer be decrypted.
    pub async fn forget_key(&self, _confirmed: DestructiveConfirmation) -> Result<()> {
        let _guard = self.op_lock.write().await;
        self.db.close();
        self.selections.clear();
        self.custodian.forget_key()
    }

    fn write<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let mut conn = self.db.connection()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = f(&*tx)?;
        tx.commit()?;
        Ok(value)
    }

    fn require_link(
        &self,
        conn: &Connection,
        conversation_id: &str,
        persona_id: &str,
    ) -> Result<LinkedPersona> {
        if let Some(link) = ConversationStore::new(conn).linked_persona(conversation_id, persona_id)? {
            return Ok(link);
        }
        let kind = if PersonaStore::new(conn).exists(persona_id)? {
            EntityKind::ConversationPersona
        } else {
            EntityKind::Persona
        };
        Err(JournalError::not_found(kind, persona_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::MemorySecretStore;

    async fn journal() -> Journal {
        let journal = Journal::in_memory(Arc::new(MemorySecretStore::new())).unwrap();
        journal.open().await.unwrap();
        journal
    }

    #[tokio::test]
    async fn commands_before_open_are_rejected() {
        let journal = Journal::in_memory(Arc::new(MemorySecretStore::new())).unwrap();
        assert!(matches!(
            journal.create_conversation("early").await,
            Err(JournalError::NotInitialized)
        ));
    }

    #[tokio::test]
    async fn whitespace_message_is_rejected_without_writing() {
        let journal = journal().await;
        let conversation = journal.create_conversation("quiet").await.unwrap();

        let err = journal
            .append_message(&conversation.id, USER_PERSONA_ID, " \n\t")
            .await
            .unwrap_err();
        assert!(matches!(err, JournalError::Validation(_)));
        assert!(journal
            .list_messages(&conversation.id, None)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn unknown_ids_are_not_found() {
        let journal = journal().await;
        let conversation = journal.create_conversation("ids").await.unwrap();

        assert!(matches!(
            journal.append_message("conv_missing", USER_PERSONA_ID, "hi").await,
            Err(JournalError::NotFound {
                kind: EntityKind::Conversation,
                ..
            })
        ));
        assert!(matches!(
            journal.link_personas(&conversation.id, &["nobody"]).await,
            Err(JournalError::NotFound {
                kind: EntityKind::Persona,
                ..
            })
        ));
        assert!(matches!(
            journal.append_message(&conversation.id, "nobody", "hi").await,
            Err(JournalError::NotFound {
                kind: EntityKind::Persona,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn failed_link_leaves_no_partial_rows() {
        let journal = journal().await;
        let conversation = journal.create_conversation("atomic").await.unwrap();

        let result = journal
            .link_personas(&conversation.id, &["coach_1", "nobody"])
            .await;
        assert!(result.is_err());

        let linked = journal.conversation_personas(&conversation.id).await.unwrap();
        assert_eq!(linked.len(), 1);
        assert_eq!(linked[0].persona_id, USER_PERSONA_ID);
        assert_eq!(journal.stats().await.unwrap().total_personas, 1);
    }

    #[tokio::test]
    async fn linking_twice_is_idempotent() {
        let journal = journal().await;
        let conversation = journal.create_conversation("twice").await.unwrap();

        journal.link_personas(&conversation.id, &["coach_1"]).await.unwrap();
        let linked = journal
            .link_personas(&conversation.id, &["coach_1", "user"])
            .await
            .unwrap();
        assert_eq!(linked.len(), 2);
    }

    #[tokio::test]
    async fn unlinked_known_persona_cannot_send() {
        let journal = journal().await;
        let first = journal.create_conversation("first").await.unwrap();
        let second = journal.create_conversation("second").await.unwrap();
        journal.link_personas(&first.id, &["coach_1"]).await.unwrap();

        assert!(matches!(
            journal.append_message(&second.id, "coach_1", "hi").await,
            Err(JournalError::NotFound {
                kind: EntityKind::ConversationPersona,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn timestamps_strictly_increase() {
        let journal = journal().await;
        let conversation = journal.create_conversation("fast").await.unwrap();
        for i in 0..20 {
            journal
                .append_message(&conversation.id, USER_PERSONA_ID, &format!("note {}", i))
                .await
                .unwrap();
        }

        let messages = journal.list_messages(&conversation.id, Some(100)).await.unwrap();
        assert_eq!(messages.len(), 20);
        assert!(messages
            .windows(2)
            .all(|pair| pair[0].created_at < pair[1].created_at));
        assert_eq!(messages[0].content, "note 0");
    }

    #[tokio::test]
    async fn flow_mode_is_fixed_after_first_message() {
        let journal = journal().await;
        let conversation = journal.create_conversation("setup").await.unwrap();
        journal.link_personas(&conversation.id, &["coach_1"]).await.unwrap();

        let turn = journal
            .set_flow_mode(&conversation.id, FlowMode::Random)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(turn.sequence_len, 2);

        let speaker = turn.persona.persona_id.clone();
        journal
            .append_message(&conversation.id, &speaker, "first")
            .await
            .unwrap();

        assert!(matches!(
            journal
                .set_flow_mode(&conversation.id, FlowMode::FullControl)
                .await,
            Err(JournalError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn random_mode_enforces_turns() {
        let journal = journal().await;
        let conversation = journal.create_conversation("turns").await.unwrap();
        journal.link_personas(&conversation.id, &["coach_1"]).await.unwrap();
        journal
            .set_flow_mode(&conversation.id, FlowMode::Random)
            .await
            .unwrap();

        let active = journal.active_persona(&conversation.id).await.unwrap();
        let other = if active.persona_id == USER_PERSONA_ID {
            "coach_1"
        } else {
            USER_PERSONA_ID
        };
        assert!(matches!(
            journal.append_message(&conversation.id, other, "out of turn").await,
            Err(JournalError::Validation(_))
        ));

        let outcome = journal
            .append_message(&conversation.id, &active.persona_id, "in turn")
            .await
            .unwrap();
        let next = outcome.next_turn.unwrap();
        assert_eq!(next.persona.persona_id, other);

        assert!(matches!(
            journal.select_persona(&conversation.id, "coach_1").await,
            Err(JournalError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn full_control_selection_defaults_to_user() {
        let journal = journal().await;
        let conversation = journal.create_conversation("manual").await.unwrap();
        journal.link_personas(&conversation.id, &["coach_1"]).await.unwrap();

        let active = journal.active_persona(&conversation.id).await.unwrap();
        assert_eq!(active.persona_id, USER_PERSONA_ID);

        journal.select_persona(&conversation.id, "coach_1").await.unwrap();
        let active = journal.active_persona(&conversation.id).await.unwrap();
        assert_eq!(active.persona_id, "coach_1");

        assert!(matches!(
            journal.advance_sequence(&conversation.id).await,
            Err(JournalError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn personas_linked_mid_rotation_join_the_tail() {
        let journal = journal().await;
        let conversation = journal.create_conversation("late").await.unwrap();
        journal.link_personas(&conversation.id, &["coach_1"]).await.unwrap();
        journal
            .set_flow_mode(&conversation.id, FlowMode::Random)
            .await
            .unwrap();

        journal.link_personas(&conversation.id, &["critic_1"]).await.unwrap();
        let conversation = journal.get_conversation(&conversation.id).await.unwrap();
        let sequence = conversation.persona_sequence.unwrap();
        assert_eq!(sequence.len(), 3);
        assert_eq!(sequence.get(2), Some("critic_1"));
    }

    #[tokio::test]
    async fn stray_sequence_column_does_not_block_full_control() {
        let journal = journal().await;
        let manual = journal.create_conversation("manual").await.unwrap();
        let other = journal.create_conversation("other").await.unwrap();
        journal
            .db
            .connection()
            .unwrap()
            .execute(
                "UPDATE conversations SET persona_sequence = 'oops' WHERE id = ?1",
                [&manual.id],
            )
            .unwrap();

        assert_eq!(journal.list_conversations().await.unwrap().len(), 2);
        journal
            .append_message(&manual.id, USER_PERSONA_ID, "still writable")
            .await
            .unwrap();
        journal
            .append_message(&other.id, USER_PERSONA_ID, "unaffected")
            .await
            .unwrap();
        assert_eq!(journal.list_messages(&manual.id, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn list_previews_are_single_line_and_truncated() {
        let journal = Journal::in_memory(Arc::new(MemorySecretStore::new()))
            .unwrap()
            .with_limits(10, 12);
        journal.open().await.unwrap();
        let conversation = journal.create_conversation("preview").await.unwrap();
        journal
            .append_message(&conversation.id, USER_PERSONA_ID, "line one\nline two is longer")
            .await
            .unwrap();

        let summaries = journal.list_conversations().await.unwrap();
        let preview = summaries[0].latest_message.as_ref().unwrap();
        assert_eq!(preview.content, "line one li…");
    }

    #[tokio::test]
    async fn custom_personas_can_be_linked() {
        let journal = journal().await;
        let persona = journal
            .create_persona("Analyst", "I look for patterns", "#4CAF50")
            .await
            .unwrap();
        let conversation = journal.create_conversation("custom").await.unwrap();

        let linked = journal
            .link_personas(&conversation.id, &[persona.id.as_str()])
            .await
            .unwrap();
        assert!(linked.iter().any(|p| p.persona_id == persona.id));
        assert_eq!(journal.list_custom_personas().await.unwrap(), vec![persona]);
    }

    #[tokio::test]
    async fn reset_requires_confirmation_and_clears_data() {
        let journal = journal().await;
        journal.create_conversation("doomed").await.unwrap();

        journal
            .reset_store(DestructiveConfirmation::acknowledge_data_loss())
            .await
            .unwrap();
        assert!(journal.list_conversations().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn forget_key_closes_the_store() {
        let journal = journal().await;
        assert!(journal.is_key_ready());

        journal
            .forget_key(DestructiveConfirmation::acknowledge_data_loss())
            .await
            .unwrap();
        assert!(!journal.is_key_ready());
        assert!(matches!(
            journal.list_conversations().await,
            Err(JournalError::NotInitialized)
        ));
    }
}
