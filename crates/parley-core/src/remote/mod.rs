pub mod memory;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::ChatError;

pub use memory::MemoryRemoteStore;

/// Field map of a remote document.
pub type Fields = serde_json::Map<String, Value>;

/// How a document appears in an incremental change batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

/// A remote document as observed by a subscription.
#[derive(Debug, Clone)]
pub struct DocumentSnapshot {
    pub id: String,
    pub fields: Fields,
}

impl DocumentSnapshot {
    pub fn new(id: impl Into<String>, fields: Fields) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }

    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }

    pub fn i64_field(&self, name: &str) -> Option<i64> {
        self.fields.get(name).and_then(Value::as_i64)
    }

    pub fn bool_field(&self, name: &str) -> Option<bool> {
        self.fields.get(name).and_then(Value::as_bool)
    }

    pub fn map_field(&self, name: &str) -> Option<&Fields> {
        self.fields.get(name).and_then(Value::as_object)
    }

    pub fn str_array_field(&self, name: &str) -> Option<Vec<String>> {
        self.fields.get(name).and_then(Value::as_array).map(|arr| {
            arr.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
    }
}

#[derive(Debug, Clone)]
pub struct ChangeItem {
    pub kind: ChangeKind,
    pub doc: DocumentSnapshot,
}

/// One incremental set of document changes delivered by a subscription.
/// Within a single subscription, batches arrive in the remote store's own
/// change order.
#[derive(Debug, Clone, Default)]
pub struct ChangeBatch {
    pub items: Vec<ChangeItem>,
}

/// Acknowledgment of a remote message create: the durable id and the
/// server-assigned timestamp.
#[derive(Debug, Clone)]
pub struct RemoteAck {
    pub id: String,
    pub timestamp: i64,
}

/// The real-time remote document store. At-least-once delivery with
/// idempotent application on our side; no exactly-once guarantees.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Create a new message document. The store assigns the durable id and
    /// the server timestamp.
    async fn create_message(
        &self,
        conversation_id: &str,
        fields: Fields,
    ) -> Result<RemoteAck, ChatError>;

    /// Merge `fields` into an existing message document.
    async fn update_message(
        &self,
        conversation_id: &str,
        message_id: &str,
        fields: Fields,
    ) -> Result<(), ChatError>;

    /// Merge several message updates in one remote operation. Used by the
    /// read status engine so that marking a whole conversation read stays a
    /// bounded number of writes.
    async fn batch_update_messages(
        &self,
        conversation_id: &str,
        updates: Vec<(String, Fields)>,
    ) -> Result<(), ChatError>;

    /// Create or replace a conversation document.
    async fn upsert_conversation(&self, id: &str, fields: Fields) -> Result<(), ChatError>;

    /// Merge `fields` into an existing conversation document. Map-valued
    /// fields are merged one level deep (per-participant entries), matching
    /// the security rule that a participant only touches their own entries.
    async fn update_conversation(&self, id: &str, fields: Fields) -> Result<(), ChatError>;

    /// Open a change stream over the conversations `user_id` participates in.
    /// The first batch replays the current state as `Added` items.
    async fn subscribe_conversations(
        &self,
        user_id: &str,
    ) -> Result<mpsc::UnboundedReceiver<ChangeBatch>, ChatError>;

    /// Open a change stream over one conversation's messages. The first
    /// batch replays the current state as `Added` items.
    async fn subscribe_messages(
        &self,
        conversation_id: &str,
    ) -> Result<mpsc::UnboundedReceiver<ChangeBatch>, ChatError>;
}
