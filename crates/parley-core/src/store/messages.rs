use std::collections::BTreeMap;

use rusqlite::{params, OptionalExtension, Row};

use crate::error::ChatError;
use crate::models::{DeliveryState, Message};
use crate::store::Database;

/// Typed CRUD over the local `messages` table.
///
/// `upsert_merged` is the single entry point for remote-observed message
/// state: it applies the never-regress and union-don't-replace rules so that
/// the sync path and the send path cannot disagree about a row, whichever
/// one writes last.
#[derive(Clone)]
pub struct MessageStore {
    db: Database,
}

fn json_column<T: serde::de::DeserializeOwned>(
    idx: usize,
    raw: String,
) -> rusqlite::Result<T> {
    serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<Message> {
    let state_raw: String = row.get(5)?;
    let receipts_raw: String = row.get(6)?;
    Ok(Message {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        sender_id: row.get(2)?,
        text: row.get(3)?,
        created_at: row.get(4)?,
        delivery_state: DeliveryState::from_str_opt(&state_raw).unwrap_or(DeliveryState::Pending),
        read_receipts: json_column(6, receipts_raw)?,
        updated_at: row.get(7)?,
    })
}

const SELECT_COLUMNS: &str = "id, conversation_id, sender_id, text, created_at, \
                              delivery_state, read_receipts, updated_at";

impl MessageStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn insert(&self, message: &Message) -> Result<(), ChatError> {
        let receipts = serde_json::to_string(&message.read_receipts)
            .map_err(|e| ChatError::store(e.to_string()))?;
        let conn = self.db.conn().lock();
        conn.execute(
            "INSERT OR REPLACE INTO messages \
             (id, conversation_id, sender_id, text, created_at, delivery_state, read_receipts, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                message.id,
                message.conversation_id,
                message.sender_id,
                message.text,
                message.created_at,
                message.delivery_state.as_str(),
                receipts,
                message.updated_at,
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<Message>, ChatError> {
        let conn = self.db.conn().lock();
        let message = conn
            .query_row(
                &format!("SELECT {SELECT_COLUMNS} FROM messages WHERE id = ?1"),
                params![id],
                row_to_message,
            )
            .optional()?;
        Ok(message)
    }

    pub fn delete(&self, id: &str) -> Result<bool, ChatError> {
        let conn = self.db.conn().lock();
        let changed = conn.execute("DELETE FROM messages WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }

    /// Delete every message of `conversation_id`, returning how many rows
    /// went. Used when the conversation itself is removed remotely, so no
    /// orphan rows survive it.
    pub fn delete_for_conversation(&self, conversation_id: &str) -> Result<usize, ChatError> {
        let conn = self.db.conn().lock();
        let changed = conn.execute(
            "DELETE FROM messages WHERE conversation_id = ?1",
            params![conversation_id],
        )?;
        Ok(changed)
    }

    /// Messages of one conversation, oldest first.
    pub fn for_conversation(&self, conversation_id: &str) -> Result<Vec<Message>, ChatError> {
        let conn = self.db.conn().lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SELECT_COLUMNS} FROM messages \
             WHERE conversation_id = ?1 ORDER BY created_at ASC, id ASC"
        ))?;
        let rows = stmt.query_map(params![conversation_id], row_to_message)?;
        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    pub fn by_delivery_state(&self, state: DeliveryState) -> Result<Vec<Message>, ChatError> {
        let conn = self.db.conn().lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SELECT_COLUMNS} FROM messages \
             WHERE delivery_state = ?1 ORDER BY created_at ASC, id ASC"
        ))?;
        let rows = stmt.query_map(params![state.as_str()], row_to_message)?;
        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    /// Overwrite a message's delivery state and `updated_at`. Returns false
    /// when the row no longer exists.
    pub fn set_delivery_state(
        &self,
        id: &str,
        state: DeliveryState,
        updated_at: i64,
    ) -> Result<bool, ChatError> {
        let conn = self.db.conn().lock();
        let changed = conn.execute(
            "UPDATE messages SET delivery_state = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, state.as_str(), updated_at],
        )?;
        Ok(changed > 0)
    }

    /// Swap a temporary local id for the remote-assigned one and adopt the
    /// server timestamp. Returns false when no trace of the message is left.
    ///
    /// The sync pump can apply the `added` snapshot of the just-sent message
    /// before the send path resumes after the ack, so a row may already
    /// exist under `remote_id`. In that case the snapshot row is the
    /// authoritative one and the temp row is simply dropped; either
    /// interleave ends with exactly one row, and a repeated reconcile is a
    /// no-op.
    pub fn reconcile_remote_id(
        &self,
        local_id: &str,
        remote_id: &str,
        server_timestamp: i64,
        updated_at: i64,
    ) -> Result<bool, ChatError> {
        let mut conn = self.db.conn().lock();
        let tx = conn.transaction()?;
        let remote_rows: i64 = tx.query_row(
            "SELECT COUNT(*) FROM messages WHERE id = ?1",
            params![remote_id],
            |row| row.get(0),
        )?;
        let changed = if remote_rows > 0 {
            tx.execute("DELETE FROM messages WHERE id = ?1", params![local_id])?;
            1
        } else {
            tx.execute(
                "UPDATE messages SET id = ?2, created_at = ?3, updated_at = ?4 WHERE id = ?1",
                params![local_id, remote_id, server_timestamp, updated_at],
            )?
        };
        tx.commit()?;
        Ok(changed > 0)
    }

    /// Add `user`'s read receipt to each of `message_ids`, one transaction
    /// for the whole batch. Existing entries are never moved backward.
    pub fn add_receipts(
        &self,
        message_ids: &[String],
        user: &str,
        timestamp: i64,
    ) -> Result<(), ChatError> {
        let mut conn = self.db.conn().lock();
        let tx = conn.transaction()?;
        for id in message_ids {
            let existing: Option<String> = tx
                .query_row(
                    "SELECT read_receipts FROM messages WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(raw) = existing else {
                tracing::warn!(message_id = %id, "receipt target no longer exists locally");
                continue;
            };
            let mut receipts: BTreeMap<String, i64> =
                serde_json::from_str(&raw).map_err(|e| ChatError::store(e.to_string()))?;
            match receipts.get(user) {
                Some(&at) if at >= timestamp => continue,
                _ => {}
            }
            receipts.insert(user.to_string(), timestamp);
            let raw = serde_json::to_string(&receipts)
                .map_err(|e| ChatError::store(e.to_string()))?;
            tx.execute(
                "UPDATE messages SET read_receipts = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, raw, timestamp],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Upsert a remote-observed message.
    ///
    /// For an existing row, the delivery state is merged without regressing
    /// and the receipt map is union-merged; applying the same snapshot twice
    /// leaves the row unchanged the second time. Returns the stored result.
    pub fn upsert_merged(&self, incoming: Message) -> Result<Message, ChatError> {
        let existing = self.get(&incoming.id)?;
        let merged = match existing {
            None => {
                let mut msg = incoming;
                if msg.read_by_other() {
                    msg.delivery_state =
                        DeliveryState::merge_remote(msg.delivery_state, DeliveryState::Read);
                }
                msg
            }
            Some(mut current) => {
                current.delivery_state =
                    DeliveryState::merge_remote(current.delivery_state, incoming.delivery_state);
                current.merge_receipts(&incoming.read_receipts);
                if current.read_by_other() {
                    current.delivery_state =
                        DeliveryState::merge_remote(current.delivery_state, DeliveryState::Read);
                }
                // Body and sender are immutable after creation; timestamps
                // follow the remote document.
                current.created_at = incoming.created_at;
                current.updated_at = current.updated_at.max(incoming.updated_at);
                current
            }
        };
        self.insert(&merged)?;
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MessageStore {
        MessageStore::new(Database::open_in_memory().unwrap())
    }

    fn message(id: &str, conversation: &str, sender: &str, at: i64) -> Message {
        Message {
            id: id.to_string(),
            conversation_id: conversation.to_string(),
            sender_id: sender.to_string(),
            text: format!("text-{id}"),
            created_at: at,
            delivery_state: DeliveryState::Sent,
            read_receipts: BTreeMap::new(),
            updated_at: at,
        }
    }

    #[test]
    fn test_insert_get_delete() {
        let store = store();
        let msg = message("m1", "c1", "alice", 100);
        store.insert(&msg).unwrap();

        let loaded = store.get("m1").unwrap().unwrap();
        assert_eq!(loaded.text, "text-m1");
        assert_eq!(loaded.delivery_state, DeliveryState::Sent);

        assert!(store.delete("m1").unwrap());
        assert!(store.get("m1").unwrap().is_none());
        assert!(!store.delete("m1").unwrap());
    }

    #[test]
    fn test_for_conversation_is_ordered() {
        let store = store();
        store.insert(&message("m2", "c1", "alice", 200)).unwrap();
        store.insert(&message("m1", "c1", "bob", 100)).unwrap();
        store.insert(&message("m3", "c2", "bob", 50)).unwrap();

        let msgs = store.for_conversation("c1").unwrap();
        assert_eq!(
            msgs.iter().map(|m| m.id.as_str()).collect::<Vec<_>>(),
            vec!["m1", "m2"]
        );
    }

    #[test]
    fn test_by_delivery_state() {
        let store = store();
        let mut failed = message("m1", "c1", "alice", 100);
        failed.delivery_state = DeliveryState::Failed;
        store.insert(&failed).unwrap();
        store.insert(&message("m2", "c1", "alice", 200)).unwrap();

        let failed = store.by_delivery_state(DeliveryState::Failed).unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, "m1");
    }

    #[test]
    fn test_reconcile_remote_id() {
        let store = store();
        let local = Message::new_local("c1", "alice", "hi", 100);
        store.insert(&local).unwrap();

        assert!(store
            .reconcile_remote_id(&local.id, "msg-1", 150, 150)
            .unwrap());
        assert!(store.get(&local.id).unwrap().is_none());

        let remote = store.get("msg-1").unwrap().unwrap();
        assert_eq!(remote.created_at, 150);
        assert_eq!(remote.text, "hi");
    }

    #[test]
    fn test_reconcile_when_sync_applied_remote_row_first() {
        let store = store();
        let local = Message::new_local("c1", "alice", "hi", 100);
        store.insert(&local).unwrap();

        // The message subscription applied the ack'd document before the
        // send path got to reconcile.
        store.upsert_merged(message("msg-9", "c1", "alice", 150)).unwrap();

        assert!(store
            .reconcile_remote_id(&local.id, "msg-9", 150, 150)
            .unwrap());
        assert!(store.get(&local.id).unwrap().is_none());

        // Exactly one row remains, under the remote id, not regressed.
        let msgs = store.for_conversation("c1").unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].id, "msg-9");
        assert_eq!(msgs[0].delivery_state, DeliveryState::Sent);

        // A repeated reconcile is a no-op, not an error.
        assert!(store
            .reconcile_remote_id(&local.id, "msg-9", 150, 150)
            .unwrap());
        assert_eq!(store.for_conversation("c1").unwrap().len(), 1);
    }

    #[test]
    fn test_delete_for_conversation_leaves_others_alone() {
        let store = store();
        store.insert(&message("m1", "c1", "alice", 100)).unwrap();
        store.insert(&message("m2", "c1", "bob", 200)).unwrap();
        store.insert(&message("m3", "c2", "alice", 300)).unwrap();

        assert_eq!(store.delete_for_conversation("c1").unwrap(), 2);
        assert!(store.for_conversation("c1").unwrap().is_empty());
        assert_eq!(store.for_conversation("c2").unwrap().len(), 1);
        assert_eq!(store.delete_for_conversation("c1").unwrap(), 0);
    }

    #[test]
    fn test_add_receipts_batch_and_monotone() {
        let store = store();
        store.insert(&message("m1", "c1", "alice", 100)).unwrap();
        store.insert(&message("m2", "c1", "alice", 110)).unwrap();

        let ids = vec!["m1".to_string(), "m2".to_string(), "gone".to_string()];
        store.add_receipts(&ids, "bob", 200).unwrap();
        assert_eq!(store.get("m1").unwrap().unwrap().read_receipts["bob"], 200);
        assert_eq!(store.get("m2").unwrap().unwrap().read_receipts["bob"], 200);

        // An older batch cannot roll a receipt back.
        store.add_receipts(&ids, "bob", 150).unwrap();
        assert_eq!(store.get("m1").unwrap().unwrap().read_receipts["bob"], 200);
    }

    #[test]
    fn test_upsert_merged_never_regresses_state() {
        let store = store();
        let mut read = message("m1", "c1", "alice", 100);
        read.delivery_state = DeliveryState::Read;
        store.insert(&read).unwrap();

        // A delivered-state snapshot arriving after read must not regress.
        let mut stale = message("m1", "c1", "alice", 100);
        stale.delivery_state = DeliveryState::Delivered;
        let merged = store.upsert_merged(stale).unwrap();
        assert_eq!(merged.delivery_state, DeliveryState::Read);
    }

    #[test]
    fn test_upsert_merged_unions_receipts() {
        let store = store();
        let mut msg = message("m1", "c1", "alice", 100);
        msg.read_receipts.insert("bob".to_string(), 150);
        store.insert(&msg).unwrap();

        // Later snapshot missing bob's receipt but carrying carol's.
        let mut snapshot = message("m1", "c1", "alice", 100);
        snapshot.read_receipts.insert("carol".to_string(), 180);
        let merged = store.upsert_merged(snapshot).unwrap();
        assert_eq!(merged.read_receipts.get("bob"), Some(&150));
        assert_eq!(merged.read_receipts.get("carol"), Some(&180));
    }

    #[test]
    fn test_upsert_merged_is_idempotent() {
        let store = store();
        let mut snapshot = message("m1", "c1", "alice", 100);
        snapshot.read_receipts.insert("bob".to_string(), 150);
        snapshot.delivery_state = DeliveryState::Delivered;

        let once = store.upsert_merged(snapshot.clone()).unwrap();
        let twice = store.upsert_merged(snapshot).unwrap();
        assert_eq!(once.delivery_state, twice.delivery_state);
        assert_eq!(once.read_receipts, twice.read_receipts);
        assert_eq!(once.updated_at, twice.updated_at);
    }

    #[test]
    fn test_upsert_merged_derives_read_from_foreign_receipt() {
        let store = store();
        let mut snapshot = message("m1", "c1", "alice", 100);
        snapshot.delivery_state = DeliveryState::Delivered;
        snapshot.read_receipts.insert("bob".to_string(), 150);

        let merged = store.upsert_merged(snapshot).unwrap();
        assert_eq!(merged.delivery_state, DeliveryState::Read);
    }
}
