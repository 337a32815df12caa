use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::constants::{fields, LOCAL_ID_PREFIX};
use crate::error::ChatError;
use crate::models::DeliveryState;
use crate::remote::{DocumentSnapshot, Fields};

/// A single chat message.
///
/// Created locally first with a temporary id (optimistic insert), then
/// reconciled with the remote-assigned id and server timestamp. Body and
/// sender never change after creation; delivery state and the read-receipt
/// map do.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub text: String,
    /// Unix milliseconds. Server-assigned once the remote write acks.
    pub created_at: i64,
    pub delivery_state: DeliveryState,
    /// Recipient id → unix-millisecond timestamp of first read.
    /// Entries are only added, and a timestamp never moves backward.
    pub read_receipts: BTreeMap<String, i64>,
    pub updated_at: i64,
}

impl Message {
    /// Synthesize the optimistic local record for a send.
    pub fn new_local(
        conversation_id: impl Into<String>,
        sender_id: impl Into<String>,
        text: impl Into<String>,
        now: i64,
    ) -> Self {
        Self {
            id: format!("{}{}", LOCAL_ID_PREFIX, Uuid::new_v4()),
            conversation_id: conversation_id.into(),
            sender_id: sender_id.into(),
            text: text.into(),
            created_at: now,
            delivery_state: DeliveryState::Pending,
            read_receipts: BTreeMap::new(),
            updated_at: now,
        }
    }

    /// Whether this message still carries a temporary local id.
    pub fn is_local(&self) -> bool {
        self.id.starts_with(LOCAL_ID_PREFIX)
    }

    /// Parse a remote message document.
    ///
    /// Sender, text and timestamp are required; the delivery state falls back
    /// to `sent` (a document that exists remotely is at least sent), and the
    /// receipt map defaults to empty.
    pub fn from_snapshot(snapshot: &DocumentSnapshot) -> Result<Self, ChatError> {
        let conversation_id = snapshot
            .str_field(fields::CONVERSATION_ID)
            .ok_or_else(|| ChatError::invalid_remote("message missing conversationId"))?
            .to_string();
        let sender_id = snapshot
            .str_field(fields::SENDER_ID)
            .ok_or_else(|| ChatError::invalid_remote("message missing senderId"))?
            .to_string();
        let text = snapshot
            .str_field(fields::TEXT)
            .ok_or_else(|| ChatError::invalid_remote("message missing text"))?
            .to_string();
        let created_at = snapshot
            .i64_field(fields::TIMESTAMP)
            .ok_or_else(|| ChatError::invalid_remote("message missing timestamp"))?;

        let delivery_state = DeliveryState::parse(&snapshot.fields, DeliveryState::Sent);

        let mut read_receipts = BTreeMap::new();
        if let Some(map) = snapshot.map_field(fields::READ_RECEIPTS) {
            for (user, value) in map {
                if let Some(ts) = value.as_i64() {
                    read_receipts.insert(user.clone(), ts);
                }
            }
        }

        let updated_at = snapshot.i64_field(fields::UPDATED_AT).unwrap_or(created_at);

        Ok(Self {
            id: snapshot.id.clone(),
            conversation_id,
            sender_id,
            text,
            created_at,
            delivery_state,
            read_receipts,
            updated_at,
        })
    }

    /// The canonical remote representation written on send.
    pub fn to_remote_fields(&self) -> Fields {
        let mut doc = Fields::new();
        doc.insert(fields::CONVERSATION_ID.into(), json!(self.conversation_id));
        doc.insert(fields::SENDER_ID.into(), json!(self.sender_id));
        doc.insert(fields::TEXT.into(), json!(self.text));
        doc.insert(
            fields::DELIVERY_STATE.into(),
            json!(self.delivery_state.as_str()),
        );
        doc.insert(
            fields::READ_RECEIPTS.into(),
            json!(self
                .read_receipts
                .iter()
                .map(|(k, v)| (k.clone(), json!(v)))
                .collect::<serde_json::Map<_, _>>()),
        );
        doc
    }

    /// Union-merge an incoming receipt map into this one.
    ///
    /// Entries are only added, and an existing entry is only replaced by a
    /// newer timestamp, so a later-arriving snapshot that is missing a
    /// receipt recorded through another path never loses it. Returns whether
    /// anything changed.
    pub fn merge_receipts(&mut self, incoming: &BTreeMap<String, i64>) -> bool {
        let mut changed = false;
        for (user, &ts) in incoming {
            match self.read_receipts.get(user) {
                Some(&existing) if existing >= ts => {}
                _ => {
                    self.read_receipts.insert(user.clone(), ts);
                    changed = true;
                }
            }
        }
        changed
    }

    /// Whether any participant other than the sender has a read receipt.
    pub fn read_by_other(&self) -> bool {
        self.read_receipts.keys().any(|user| *user != self.sender_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(fields: Fields) -> DocumentSnapshot {
        DocumentSnapshot::new("msg-1", fields)
    }

    fn base_fields() -> Fields {
        let mut fields = Fields::new();
        fields.insert("conversationId".into(), json!("c1"));
        fields.insert("senderId".into(), json!("alice"));
        fields.insert("text".into(), json!("hi"));
        fields.insert("timestamp".into(), json!(1_000));
        fields
    }

    #[test]
    fn test_new_local_is_pending_with_temp_id() {
        let msg = Message::new_local("c1", "alice", "hi", 42);
        assert!(msg.is_local());
        assert_eq!(msg.delivery_state, DeliveryState::Pending);
        assert_eq!(msg.created_at, 42);
        assert!(msg.read_receipts.is_empty());
    }

    #[test]
    fn test_from_snapshot_complete() {
        let mut fields = base_fields();
        fields.insert("deliveryState".into(), json!("delivered"));
        fields.insert("readReceipts".into(), json!({ "bob": 2_000 }));
        fields.insert("updatedAt".into(), json!(2_000));

        let msg = Message::from_snapshot(&snapshot(fields)).unwrap();
        assert_eq!(msg.id, "msg-1");
        assert_eq!(msg.conversation_id, "c1");
        assert_eq!(msg.delivery_state, DeliveryState::Delivered);
        assert_eq!(msg.read_receipts.get("bob"), Some(&2_000));
        assert_eq!(msg.updated_at, 2_000);
    }

    #[test]
    fn test_from_snapshot_defaults() {
        let msg = Message::from_snapshot(&snapshot(base_fields())).unwrap();
        // A document that exists remotely is at least sent.
        assert_eq!(msg.delivery_state, DeliveryState::Sent);
        assert!(msg.read_receipts.is_empty());
        assert_eq!(msg.updated_at, msg.created_at);
    }

    #[test]
    fn test_from_snapshot_missing_required_field() {
        let mut fields = base_fields();
        fields.remove("senderId");
        let err = Message::from_snapshot(&snapshot(fields)).unwrap_err();
        assert!(matches!(err, ChatError::InvalidRemoteData { .. }));
    }

    #[test]
    fn test_merge_receipts_is_monotone() {
        let mut msg = Message::new_local("c1", "alice", "hi", 0);
        let mut incoming = BTreeMap::new();
        incoming.insert("bob".to_string(), 100);
        assert!(msg.merge_receipts(&incoming));

        // An older snapshot cannot move bob's timestamp backward.
        incoming.insert("bob".to_string(), 50);
        assert!(!msg.merge_receipts(&incoming));
        assert_eq!(msg.read_receipts.get("bob"), Some(&100));

        // A snapshot missing bob entirely cannot drop the entry.
        let empty = BTreeMap::new();
        assert!(!msg.merge_receipts(&empty));
        assert_eq!(msg.read_receipts.len(), 1);

        // New entries union in.
        incoming.insert("carol".to_string(), 200);
        assert!(msg.merge_receipts(&incoming));
        assert_eq!(msg.read_receipts.len(), 2);
    }

    #[test]
    fn test_read_by_other_ignores_sender() {
        let mut msg = Message::new_local("c1", "alice", "hi", 0);
        msg.read_receipts.insert("alice".to_string(), 10);
        assert!(!msg.read_by_other());
        msg.read_receipts.insert("bob".to_string(), 20);
        assert!(msg.read_by_other());
    }
}
