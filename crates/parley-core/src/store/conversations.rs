use std::collections::BTreeMap;

use rusqlite::{params, OptionalExtension, Row};

use crate::error::ChatError;
use crate::models::{Conversation, Message};
use crate::store::Database;

/// Typed CRUD over the local `conversations` table.
///
/// The derived unread count (messages newer than a participant's interaction
/// timestamp, not authored by them) is the source of truth; the stored
/// counter is a cache that `recompute_unread` re-derives whenever a writer
/// could have invalidated it.
#[derive(Clone)]
pub struct ConversationStore {
    db: Database,
}

fn json_column<T: serde::de::DeserializeOwned>(idx: usize, raw: String) -> rusqlite::Result<T> {
    serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn row_to_conversation(row: &Row<'_>) -> rusqlite::Result<Conversation> {
    let participants_raw: String = row.get(1)?;
    let unread_raw: String = row.get(7)?;
    let interaction_raw: String = row.get(8)?;
    Ok(Conversation {
        id: row.get(0)?,
        participant_ids: json_column(1, participants_raw)?,
        is_group: row.get(2)?,
        group_name: row.get(3)?,
        last_message: row.get(4)?,
        last_message_at: row.get(5)?,
        last_sender_id: row.get(6)?,
        unread_count: json_column(7, unread_raw)?,
        last_interaction_at: json_column(8, interaction_raw)?,
    })
}

const SELECT_COLUMNS: &str = "id, participant_ids, is_group, group_name, last_message, \
                              last_message_at, last_sender_id, unread_count, last_interaction_at";

impl ConversationStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn upsert(&self, conversation: &Conversation) -> Result<(), ChatError> {
        let participants = serde_json::to_string(&conversation.participant_ids)
            .map_err(|e| ChatError::store(e.to_string()))?;
        let unread = serde_json::to_string(&conversation.unread_count)
            .map_err(|e| ChatError::store(e.to_string()))?;
        let interaction = serde_json::to_string(&conversation.last_interaction_at)
            .map_err(|e| ChatError::store(e.to_string()))?;
        let conn = self.db.conn().lock();
        conn.execute(
            "INSERT OR REPLACE INTO conversations \
             (id, participant_ids, is_group, group_name, last_message, last_message_at, \
              last_sender_id, unread_count, last_interaction_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                conversation.id,
                participants,
                conversation.is_group,
                conversation.group_name,
                conversation.last_message,
                conversation.last_message_at,
                conversation.last_sender_id,
                unread,
                interaction,
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<Conversation>, ChatError> {
        let conn = self.db.conn().lock();
        let conversation = conn
            .query_row(
                &format!("SELECT {SELECT_COLUMNS} FROM conversations WHERE id = ?1"),
                params![id],
                row_to_conversation,
            )
            .optional()?;
        Ok(conversation)
    }

    pub fn delete(&self, id: &str) -> Result<bool, ChatError> {
        let conn = self.db.conn().lock();
        let changed = conn.execute("DELETE FROM conversations WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }

    /// Conversations `user` participates in, most recent activity first.
    pub fn list_for_user(&self, user: &str) -> Result<Vec<Conversation>, ChatError> {
        let conn = self.db.conn().lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SELECT_COLUMNS} FROM conversations \
             ORDER BY last_message_at DESC NULLS LAST, id ASC"
        ))?;
        let rows = stmt.query_map([], row_to_conversation)?;
        let mut conversations = Vec::new();
        for row in rows {
            let conversation = row?;
            if conversation.participant_ids.iter().any(|p| p == user) {
                conversations.push(conversation);
            }
        }
        Ok(conversations)
    }

    /// Re-derive every participant's unread counter from the message set and
    /// persist it. Returns the refreshed conversation, or `None` when the
    /// conversation is not known locally.
    pub fn recompute_unread(&self, conversation_id: &str) -> Result<Option<Conversation>, ChatError> {
        let Some(mut conversation) = self.get(conversation_id)? else {
            return Ok(None);
        };

        let mut unread: BTreeMap<String, u32> = BTreeMap::new();
        {
            let conn = self.db.conn().lock();
            let mut stmt = conn.prepare(
                "SELECT COUNT(*) FROM messages \
                 WHERE conversation_id = ?1 AND sender_id != ?2 AND created_at > ?3",
            )?;
            for participant in &conversation.participant_ids {
                let since = conversation
                    .last_interaction_at
                    .get(participant)
                    .copied()
                    .unwrap_or(0);
                let count: i64 =
                    stmt.query_row(params![conversation_id, participant, since], |row| {
                        row.get(0)
                    })?;
                unread.insert(participant.clone(), count.max(0) as u32);
            }
        }

        conversation.unread_count = unread;
        self.upsert(&conversation)?;
        Ok(Some(conversation))
    }

    /// Refresh the denormalized last-message fields and the unread cache
    /// after `message` landed locally. No-op when the conversation document
    /// has not arrived yet.
    pub fn refresh_after_message(&self, message: &Message) -> Result<Option<Conversation>, ChatError> {
        let Some(mut conversation) = self.get(&message.conversation_id)? else {
            tracing::debug!(
                conversation_id = %message.conversation_id,
                "message for conversation not yet known locally"
            );
            return Ok(None);
        };
        conversation.apply_last_message(message);
        self.upsert(&conversation)?;
        self.recompute_unread(&message.conversation_id)
    }

    /// Re-derive the denormalized last-message fields and the unread cache
    /// from the message set, e.g. after a remote removal deleted what used
    /// to be the newest message.
    pub fn rebuild_denormalized(
        &self,
        conversation_id: &str,
    ) -> Result<Option<Conversation>, ChatError> {
        let Some(mut conversation) = self.get(conversation_id)? else {
            return Ok(None);
        };
        let newest = {
            let conn = self.db.conn().lock();
            conn.query_row(
                "SELECT text, created_at, sender_id FROM messages \
                 WHERE conversation_id = ?1 ORDER BY created_at DESC, id DESC LIMIT 1",
                params![conversation_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?
        };
        match newest {
            Some((text, at, sender)) => {
                conversation.last_message = Some(text);
                conversation.last_message_at = Some(at);
                conversation.last_sender_id = Some(sender);
            }
            None => {
                conversation.last_message = None;
                conversation.last_message_at = None;
                conversation.last_sender_id = None;
            }
        }
        self.upsert(&conversation)?;
        self.recompute_unread(conversation_id)
    }

    /// Record that `user` has the conversation open right now: bump their
    /// interaction timestamp (never backward) and zero their unread counter.
    pub fn set_read_state(
        &self,
        conversation_id: &str,
        user: &str,
        timestamp: i64,
    ) -> Result<Option<Conversation>, ChatError> {
        let Some(mut conversation) = self.get(conversation_id)? else {
            tracing::warn!(conversation_id, "read-mark for unknown conversation");
            return Ok(None);
        };
        let entry = conversation
            .last_interaction_at
            .entry(user.to_string())
            .or_insert(timestamp);
        *entry = (*entry).max(timestamp);
        conversation.unread_count.insert(user.to_string(), 0);
        self.upsert(&conversation)?;
        Ok(Some(conversation))
    }

    /// Apply a server-authoritative conversation snapshot.
    ///
    /// Fields follow the snapshot (last-write-wins), except interaction
    /// timestamps, which take the per-user max so a locally-kept read-mark
    /// whose remote write is still pending is not rolled back. The unread
    /// cache is re-derived afterwards.
    pub fn apply_remote(&self, mut incoming: Conversation) -> Result<Conversation, ChatError> {
        if let Some(existing) = self.get(&incoming.id)? {
            for (user, &at) in &existing.last_interaction_at {
                let entry = incoming
                    .last_interaction_at
                    .entry(user.clone())
                    .or_insert(at);
                *entry = (*entry).max(at);
            }
        }
        self.upsert(&incoming)?;
        Ok(self
            .recompute_unread(&incoming.id)?
            .unwrap_or(incoming))
    }
}
