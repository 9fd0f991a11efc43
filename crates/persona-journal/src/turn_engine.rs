//! Turn-taking engine
//!
//! Under `full_control` the engine keeps no state: any linked persona may be
//! made active. Under `random` the conversation carries a persisted rotation
//! of persona ids and an index into it. Each advance moves to the next slot;
//! running off the end reshuffles the same ids and starts again at slot 0, so
//! every persona speaks exactly once per cycle.

use std::collections::HashSet;

use rand::seq::SliceRandom;
use rand::Rng;
use rusqlite::Connection;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{EntityKind, JournalError, Result};
use crate::journal_db::conversation_store::ConversationStore;
use crate::journal_db::schema::{FlowMode, LinkedPersona, PersonaSequence};

/// The persona whose turn it is under `random` mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveTurn {
    pub persona: LinkedPersona,
    pub index: usize,
    pub sequence_len: usize,
    /// True when this turn began a freshly shuffled cycle.
    pub reshuffled: bool,
}

/// Uniform random permutation of `ids` (Fisher-Yates).
pub fn shuffle_sequence<R: Rng + ?Sized>(ids: &[String], rng: &mut R) -> PersonaSequence {
    let mut shuffled = ids.to_vec();
    shuffled.shuffle(rng);
    PersonaSequence::new(shuffled)
}

pub struct TurnEngine<'c> {
    conversations: ConversationStore<'c>,
}

impl<'c> TurnEngine<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self {
            conversations: ConversationStore::new(conn),
        }
    }

    /// Switches the conversation to `random` with a fresh shuffle of its
    /// linked personas. Slot 0 becomes active.
    pub fn initialize(&self, conversation_id: &str) -> Result<ActiveTurn> {
        self.conversations.require_conversation(conversation_id)?;
        let ids = self.conversations.linked_persona_ids(conversation_id)?;
        if ids.is_empty() {
            return Err(JournalError::invalid_sequence(
                conversation_id,
                "no personas are linked",
            ));
        }

        let sequence = shuffle_sequence(&ids, &mut rand::thread_rng());
        self.conversations
            .set_flow_mode(conversation_id, FlowMode::Random, Some(&sequence))?;
        info!(
            "Generated random sequence for {}: {:?}",
            conversation_id,
            sequence.ids()
        );

        self.turn_at(conversation_id, &sequence, 0, true)
    }

    /// Persona at the current index, validated against the linked set.
    pub fn current(&self, conversation_id: &str) -> Result<ActiveTurn> {
        let (sequence, index) = self.load_random_state(conversation_id)?;
        self.turn_at(conversation_id, &sequence, index, false)
    }

    /// Moves to the next slot, reshuffling when the cycle is exhausted.
    pub fn advance(&self, conversation_id: &str) -> Result<ActiveTurn> {
        let (sequence, index) = self.load_random_state(conversation_id)?;
        let next = index + 1;

        if next < sequence.len() {
            self.conversations
                .save_sequence_index(conversation_id, next)?;
            debug!("Advanced {} to slot {}", conversation_id, next);
            return self.turn_at(conversation_id, &sequence, next, false);
        }

        let reshuffled = shuffle_sequence(sequence.ids(), &mut rand::thread_rng());
        self.conversations
            .save_sequence(conversation_id, &reshuffled, 0)?;
        info!(
            "Reshuffled sequence for {}: {:?}",
            conversation_id,
            reshuffled.ids()
        );
        self.turn_at(conversation_id, &reshuffled, 0, true)
    }

    /// Appends newly linked personas to the end of the current cycle.
    pub fn extend(&self, conversation_id: &str, persona_ids: &[String]) -> Result<()> {
        let (mut sequence, index) = self.load_random_state(conversation_id)?;
        let before = sequence.len();
        for id in persona_ids {
            if !sequence.contains(id) {
                sequence.push(id.clone());
            }
        }
        if sequence.len() != before {
            self.conversations
                .save_sequence(conversation_id, &sequence, index)?;
            debug!(
                "Extended sequence for {} to {} personas",
                conversation_id,
                sequence.len()
            );
        }
        Ok(())
    }

    /// Sequence and index of a `random` conversation, read strictly from the
    /// row so corrupt state fails here rather than in listings.
    fn load_random_state(&self, conversation_id: &str) -> Result<(PersonaSequence, usize)> {
        let conversation = self.conversations.require_conversation(conversation_id)?;
        if conversation.flow_mode != FlowMode::Random {
            return Err(JournalError::validation(format!(
                "conversation {} is not in random mode",
                conversation_id
            )));
        }

        let (sequence, index) = self.conversations.sequence_state(conversation_id)?;
        let sequence = sequence.ok_or_else(|| JournalError::invalid_sequence(conversation_id, "no sequence stored"))?;
        if sequence.is_empty() {
            return Err(JournalError::invalid_sequence(
                conversation_id,
                "stored sequence is empty",
            ));
        }
        if index >= sequence.len() {
            return Err(JournalError::invalid_sequence(
                conversation_id,
                format!(
                    "index {} is outside a sequence of {}",
                    index,
                    sequence.len()
                ),
            ));
        }

        let linked: HashSet<String> = self
            .conversations
            .linked_persona_ids(conversation_id)?
            .into_iter()
            .collect();
        if let Some(stray) = sequence.ids().iter().find(|id| !linked.contains(*id)) {
            return Err(JournalError::invalid_sequence(
                conversation_id,
                format!("persona {} is no longer linked", stray),
            ));
        }

        Ok((sequence, index))
    }

    fn turn_at(
        &self,
        conversation_id: &str,
        sequence: &PersonaSequence,
        index: usize,
        reshuffled: bool,
    ) -> Result<ActiveTurn> {
        let persona_id = sequence.get(index).ok_or_else(|| {
            JournalError::invalid_sequence(conversation_id, format!("no slot {}", index))
        })?;
        let persona = self
            .conversations
            .linked_persona(conversation_id, persona_id)?
            .ok_or_else(|| JournalError::not_found(EntityKind::ConversationPersona, persona_id))?;

        Ok(ActiveTurn {
            persona,
            index,
            sequence_len: sequence.len(),
            reshuffled,
        })
    }
}
