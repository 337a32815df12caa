use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::constants::fields;
use crate::error::ChatError;
use crate::models::now_ms;
use crate::remote::{
    ChangeBatch, ChangeItem, ChangeKind, DocumentSnapshot, Fields, RemoteAck, RemoteStore,
};

/// In-process implementation of [`RemoteStore`].
///
/// Backs tests and demos: assigns durable ids and server timestamps, fans
/// change batches out to subscribers in write order, and can simulate being
/// offline. Not a production backend.
pub struct MemoryRemoteStore {
    inner: Mutex<Inner>,
    next_id: AtomicU64,
    clock: AtomicI64,
    offline: AtomicBool,
    write_ops: AtomicUsize,
}

#[derive(Default)]
struct Inner {
    conversations: BTreeMap<String, Fields>,
    messages: HashMap<String, BTreeMap<String, Fields>>,
    conversation_subs: Vec<(String, mpsc::UnboundedSender<ChangeBatch>)>,
    message_subs: HashMap<String, Vec<mpsc::UnboundedSender<ChangeBatch>>>,
}

fn participant_ids(doc: &Fields) -> Vec<String> {
    doc.get(fields::PARTICIPANT_IDS)
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Merge `updates` into `target`, one level deep: map-valued fields merge
/// their entries (per-participant maps), everything else replaces.
fn merge_fields(target: &mut Fields, updates: Fields) {
    for (key, value) in updates {
        match (target.get_mut(&key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                for (k, v) in incoming {
                    existing.insert(k, v);
                }
            }
            (_, value) => {
                target.insert(key, value);
            }
        }
    }
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            next_id: AtomicU64::new(1),
            clock: AtomicI64::new(now_ms()),
            offline: AtomicBool::new(false),
            write_ops: AtomicUsize::new(0),
        }
    }

    /// While offline every write errors with `Timeout`, as an unreachable
    /// backend would after its ack budget expires.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of remote write operations performed (a batch counts as one).
    pub fn write_op_count(&self) -> usize {
        self.write_ops.load(Ordering::SeqCst)
    }

    /// Push an arbitrary message change to subscribers of `conversation_id`
    /// without touching stored documents. Lets tests replay duplicate or
    /// out-of-order snapshots.
    pub fn emit_message_change(&self, conversation_id: &str, item: ChangeItem) {
        let mut inner = self.inner.lock();
        Self::notify_message_subs(&mut inner, conversation_id, vec![item]);
    }

    /// Push an arbitrary conversation change to every conversation
    /// subscriber without touching stored documents. Lets tests replay
    /// removals and out-of-order snapshots.
    pub fn emit_conversation_change(&self, item: ChangeItem) {
        let batch = ChangeBatch { items: vec![item] };
        self.inner
            .lock()
            .conversation_subs
            .retain(|(_, tx)| tx.send(batch.clone()).is_ok());
    }

    /// Stored message document, for test assertions.
    pub fn message_doc(&self, conversation_id: &str, message_id: &str) -> Option<Fields> {
        self.inner
            .lock()
            .messages
            .get(conversation_id)
            .and_then(|m| m.get(message_id))
            .cloned()
    }

    /// Stored conversation document, for test assertions.
    pub fn conversation_doc(&self, conversation_id: &str) -> Option<Fields> {
        self.inner.lock().conversations.get(conversation_id).cloned()
    }

    fn check_online(&self) -> Result<(), ChatError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(ChatError::Timeout {
                seconds: crate::constants::SEND_TIMEOUT_SECS,
            });
        }
        Ok(())
    }

    fn server_timestamp(&self) -> i64 {
        // Strictly monotonic so two writes in the same millisecond still
        // order deterministically.
        self.clock.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn count_write(&self) {
        self.write_ops.fetch_add(1, Ordering::SeqCst);
    }

    fn notify_message_subs(inner: &mut Inner, conversation_id: &str, items: Vec<ChangeItem>) {
        if let Some(subs) = inner.message_subs.get_mut(conversation_id) {
            let batch = ChangeBatch { items };
            subs.retain(|tx| tx.send(batch.clone()).is_ok());
        }
    }

    fn notify_conversation_subs(inner: &mut Inner, id: &str, kind: ChangeKind) {
        let Some(doc) = inner.conversations.get(id).cloned() else {
            return;
        };
        let participants = participant_ids(&doc);
        let batch = ChangeBatch {
            items: vec![ChangeItem {
                kind,
                doc: DocumentSnapshot::new(id, doc),
            }],
        };
        inner.conversation_subs.retain(|(user, tx)| {
            if participants.iter().any(|p| p == user) {
                tx.send(batch.clone()).is_ok()
            } else {
                true
            }
        });
    }
}

impl Default for MemoryRemoteStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn create_message(
        &self,
        conversation_id: &str,
        mut doc: Fields,
    ) -> Result<RemoteAck, ChatError> {
        self.check_online()?;
        self.count_write();

        let id = format!("msg-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let timestamp = self.server_timestamp();
        doc.insert(fields::CONVERSATION_ID.into(), json!(conversation_id));
        doc.insert(fields::TIMESTAMP.into(), json!(timestamp));
        doc.insert(fields::UPDATED_AT.into(), json!(timestamp));

        let mut inner = self.inner.lock();
        inner
            .messages
            .entry(conversation_id.to_string())
            .or_default()
            .insert(id.clone(), doc.clone());
        Self::notify_message_subs(
            &mut inner,
            conversation_id,
            vec![ChangeItem {
                kind: ChangeKind::Added,
                doc: DocumentSnapshot::new(id.clone(), doc),
            }],
        );

        Ok(RemoteAck { id, timestamp })
    }

    async fn update_message(
        &self,
        conversation_id: &str,
        message_id: &str,
        updates: Fields,
    ) -> Result<(), ChatError> {
        self.check_online()?;
        self.count_write();

        let mut inner = self.inner.lock();
        let Some(doc) = inner
            .messages
            .get_mut(conversation_id)
            .and_then(|m| m.get_mut(message_id))
        else {
            return Err(ChatError::invalid_remote(format!(
                "no such message {conversation_id}/{message_id}"
            )));
        };
        merge_fields(doc, updates);
        doc.insert(fields::UPDATED_AT.into(), json!(self.server_timestamp()));
        let snapshot = DocumentSnapshot::new(message_id, doc.clone());
        Self::notify_message_subs(
            &mut inner,
            conversation_id,
            vec![ChangeItem {
                kind: ChangeKind::Modified,
                doc: snapshot,
            }],
        );
        Ok(())
    }

    async fn batch_update_messages(
        &self,
        conversation_id: &str,
        updates: Vec<(String, Fields)>,
    ) -> Result<(), ChatError> {
        self.check_online()?;
        // One remote operation regardless of how many documents it touches.
        self.count_write();

        let mut inner = self.inner.lock();
        let mut items = Vec::new();
        for (message_id, update) in updates {
            let Some(doc) = inner
                .messages
                .get_mut(conversation_id)
                .and_then(|m| m.get_mut(&message_id))
            else {
                tracing::warn!(conversation_id, message_id, "batch update target missing");
                continue;
            };
            merge_fields(doc, update);
            doc.insert(fields::UPDATED_AT.into(), json!(self.server_timestamp()));
            items.push(ChangeItem {
                kind: ChangeKind::Modified,
                doc: DocumentSnapshot::new(message_id, doc.clone()),
            });
        }
        if !items.is_empty() {
            Self::notify_message_subs(&mut inner, conversation_id, items);
        }
        Ok(())
    }

    async fn upsert_conversation(&self, id: &str, doc: Fields) -> Result<(), ChatError> {
        self.check_online()?;
        self.count_write();

        let mut inner = self.inner.lock();
        let kind = if inner.conversations.contains_key(id) {
            ChangeKind::Modified
        } else {
            ChangeKind::Added
        };
        inner.conversations.insert(id.to_string(), doc);
        Self::notify_conversation_subs(&mut inner, id, kind);
        Ok(())
    }

    async fn update_conversation(&self, id: &str, updates: Fields) -> Result<(), ChatError> {
        self.check_online()?;
        self.count_write();

        let mut inner = self.inner.lock();
        let Some(doc) = inner.conversations.get_mut(id) else {
            return Err(ChatError::invalid_remote(format!("no such conversation {id}")));
        };
        merge_fields(doc, updates);
        Self::notify_conversation_subs(&mut inner, id, ChangeKind::Modified);
        Ok(())
    }

    async fn subscribe_conversations(
        &self,
        user_id: &str,
    ) -> Result<mpsc::UnboundedReceiver<ChangeBatch>, ChatError> {
        self.check_online()?;
        let (tx, rx) = mpsc::unbounded_channel();

        let mut inner = self.inner.lock();
        let items: Vec<ChangeItem> = inner
            .conversations
            .iter()
            .filter(|(_, doc)| participant_ids(doc).iter().any(|p| p == user_id))
            .map(|(id, doc)| ChangeItem {
                kind: ChangeKind::Added,
                doc: DocumentSnapshot::new(id.clone(), doc.clone()),
            })
            .collect();
        if !items.is_empty() {
            let _ = tx.send(ChangeBatch { items });
        }
        inner.conversation_subs.push((user_id.to_string(), tx));
        Ok(rx)
    }

    async fn subscribe_messages(
        &self,
        conversation_id: &str,
    ) -> Result<mpsc::UnboundedReceiver<ChangeBatch>, ChatError> {
        self.check_online()?;
        let (tx, rx) = mpsc::unbounded_channel();

        let mut inner = self.inner.lock();
        let items: Vec<ChangeItem> = inner
            .messages
            .get(conversation_id)
            .map(|docs| {
                docs.iter()
                    .map(|(id, doc)| ChangeItem {
                        kind: ChangeKind::Added,
                        doc: DocumentSnapshot::new(id.clone(), doc.clone()),
                    })
                    .collect()
            })
            .unwrap_or_default();
        if !items.is_empty() {
            let _ = tx.send(ChangeBatch { items });
        }
        inner
            .message_subs
            .entry(conversation_id.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}
