use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;

use crate::constants::fields;
use crate::error::ChatError;
use crate::events::{ChatEvent, EventBus};
use crate::models::now_ms;
use crate::remote::{Fields, RemoteStore};
use crate::session::Session;
use crate::store::{ConversationStore, MessageStore};

/// A read-mark whose remote write has not landed yet. Kept so the local
/// mutation survives and the write can be retried on reconnection.
#[derive(Debug, Clone)]
struct PendingReadMark {
    conversation_id: String,
    user_id: String,
    timestamp: i64,
    receipt_message_ids: Vec<String>,
}

/// Computes and persists per-user read state.
///
/// The cheap path is one conversation-level interaction timestamp per user
/// (an O(1) write however many messages are unread); explicit per-message
/// receipts are the fine-grained complement for "who has read this message"
/// UI. Remote write failures here are non-fatal: read status stays locally
/// true and the write is flushed opportunistically later.
pub struct ReadStatusEngine {
    conversations: ConversationStore,
    messages: MessageStore,
    remote: Arc<dyn RemoteStore>,
    session: Arc<Session>,
    events: EventBus,
    pending: Mutex<Vec<PendingReadMark>>,
}

impl ReadStatusEngine {
    pub fn new(
        conversations: ConversationStore,
        messages: MessageStore,
        remote: Arc<dyn RemoteStore>,
        session: Arc<Session>,
        events: EventBus,
    ) -> Self {
        Self {
            conversations,
            messages,
            remote,
            session,
            events,
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Mark the whole conversation read for the current user: bump their
    /// interaction timestamp and zero their unread counter, locally then
    /// remotely. One write on each side regardless of message count.
    pub async fn mark_conversation_as_read(&self, conversation_id: &str) -> Result<(), ChatError> {
        let user = self.session.require_user()?;
        let now = now_ms();

        if self
            .conversations
            .set_read_state(conversation_id, &user, now)?
            .is_none()
        {
            return Ok(());
        }
        self.events.emit(ChatEvent::ConversationUpdated {
            conversation_id: conversation_id.to_string(),
        });

        self.push_or_queue(PendingReadMark {
            conversation_id: conversation_id.to_string(),
            user_id: user,
            timestamp: now,
            receipt_message_ids: Vec::new(),
        })
        .await;
        Ok(())
    }

    /// Like [`mark_conversation_as_read`], and additionally add an explicit
    /// receipt to every message authored by others that lacks one, batching
    /// the remote writes into a single operation.
    ///
    /// [`mark_conversation_as_read`]: Self::mark_conversation_as_read
    pub async fn mark_conversation_messages_as_read(
        &self,
        conversation_id: &str,
    ) -> Result<(), ChatError> {
        let user = self.session.require_user()?;
        let now = now_ms();

        if self
            .conversations
            .set_read_state(conversation_id, &user, now)?
            .is_none()
        {
            return Ok(());
        }

        let targets: Vec<String> = self
            .messages
            .for_conversation(conversation_id)?
            .into_iter()
            .filter(|m| m.sender_id != user && !m.read_receipts.contains_key(&user))
            .map(|m| m.id)
            .collect();

        self.messages.add_receipts(&targets, &user, now)?;
        self.events.emit(ChatEvent::ConversationUpdated {
            conversation_id: conversation_id.to_string(),
        });
        for message_id in &targets {
            self.events.emit(ChatEvent::MessageMutated {
                conversation_id: conversation_id.to_string(),
                message_id: message_id.clone(),
            });
        }

        self.push_or_queue(PendingReadMark {
            conversation_id: conversation_id.to_string(),
            user_id: user,
            timestamp: now,
            receipt_message_ids: targets,
        })
        .await;
        Ok(())
    }

    /// Retry queued read-marks. Invoked when connectivity is restored (the
    /// sync engine re-establishes a subscription). Failures re-queue.
    pub async fn flush_pending(&self) {
        let queued: Vec<PendingReadMark> = self.pending.lock().drain(..).collect();
        if queued.is_empty() {
            return;
        }
        tracing::info!(count = queued.len(), "flushing pending read-marks");
        for mark in queued {
            self.push_or_queue(mark).await;
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    async fn push_or_queue(&self, mark: PendingReadMark) {
        if let Err(err) = self.push_remote(&mark).await {
            tracing::warn!(
                conversation_id = %mark.conversation_id,
                error = %err,
                "read-mark remote write failed, keeping local state and queueing"
            );
            self.queue(mark);
        }
    }

    /// Queue a failed read-mark, coalescing with any queued mark for the
    /// same conversation and user: the newest timestamp wins and the receipt
    /// id sets union, so a flood of offline read-marks replays as one write
    /// pair on reconnect.
    fn queue(&self, mark: PendingReadMark) {
        let mut pending = self.pending.lock();
        let Some(existing) = pending
            .iter_mut()
            .find(|m| m.conversation_id == mark.conversation_id && m.user_id == mark.user_id)
        else {
            pending.push(mark);
            return;
        };
        existing.timestamp = existing.timestamp.max(mark.timestamp);
        for id in mark.receipt_message_ids {
            if !existing.receipt_message_ids.contains(&id) {
                existing.receipt_message_ids.push(id);
            }
        }
    }

    /// The remote shape of a read-mark. Per the security layer's access
    /// rule, only the current user's own entries are written: their
    /// interaction timestamp, their unread counter, their receipt entries.
    async fn push_remote(&self, mark: &PendingReadMark) -> Result<(), ChatError> {
        let mut update = Fields::new();
        update.insert(
            fields::LAST_INTERACTION.into(),
            json!({ mark.user_id.clone(): mark.timestamp }),
        );
        update.insert(fields::UNREAD_COUNT.into(), json!({ mark.user_id.clone(): 0 }));
        self.remote
            .update_conversation(&mark.conversation_id, update)
            .await?;

        if !mark.receipt_message_ids.is_empty() {
            let receipt = json!({ mark.user_id.clone(): mark.timestamp });
            let updates: Vec<(String, Fields)> = mark
                .receipt_message_ids
                .iter()
                .map(|id| {
                    let mut doc = Fields::new();
                    doc.insert(fields::READ_RECEIPTS.into(), receipt.clone());
                    (id.clone(), doc)
                })
                .collect();
            self.remote
                .batch_update_messages(&mark.conversation_id, updates)
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Conversation, DeliveryState, Message};
    use crate::remote::MemoryRemoteStore;
    use crate::store::Database;
    use std::collections::BTreeMap;

    struct Fixture {
        engine: ReadStatusEngine,
        conversations: ConversationStore,
        messages: MessageStore,
        remote: Arc<MemoryRemoteStore>,
    }

    fn fixture(user: &str) -> Fixture {
        let db = Database::open_in_memory().unwrap();
        let conversations = ConversationStore::new(db.clone());
        let messages = MessageStore::new(db);
        let remote = Arc::new(MemoryRemoteStore::new());
        let session = Arc::new(Session::new());
        session.sign_in(user);
        let engine = ReadStatusEngine::new(
            conversations.clone(),
            messages.clone(),
            remote.clone(),
            session,
            EventBus::new(),
        );
        Fixture {
            engine,
            conversations,
            messages,
            remote,
        }
    }

    fn local_message(id: &str, conversation: &str, sender: &str, at: i64) -> Message {
        Message {
            id: id.to_string(),
            conversation_id: conversation.to_string(),
            sender_id: sender.to_string(),
            text: "hi".to_string(),
            created_at: at,
            delivery_state: DeliveryState::Sent,
            read_receipts: BTreeMap::new(),
            updated_at: at,
        }
    }

    async fn seed_conversation(fx: &Fixture, message_count: usize) -> Conversation {
        let convo = Conversation::direct("alice", "bob");
        fx.conversations.upsert(&convo).unwrap();
        fx.remote
            .upsert_conversation(&convo.id, convo.to_remote_fields())
            .await
            .unwrap();

        for i in 0..message_count {
            let at = 100 + i as i64;
            let sent = Message::new_local(convo.id.clone(), "alice", "hi", at);
            let ack = fx
                .remote
                .create_message(&convo.id, sent.to_remote_fields())
                .await
                .unwrap();
            fx.messages
                .insert(&local_message(&ack.id, &convo.id, "alice", at))
                .unwrap();
        }
        fx.conversations.recompute_unread(&convo.id).unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_mark_conversation_as_read_is_o1() {
        let fx = fixture("bob");
        let convo = seed_conversation(&fx, 5).await;
        assert_eq!(convo.unread_count.get("bob"), Some(&5));

        let before = fx.remote.write_op_count();
        fx.engine.mark_conversation_as_read(&convo.id).await.unwrap();

        let updated = fx.conversations.get(&convo.id).unwrap().unwrap();
        assert_eq!(updated.unread_count.get("bob"), Some(&0));
        assert!(updated.last_interaction_at.contains_key("bob"));
        // One conversation update, no per-message writes.
        assert_eq!(fx.remote.write_op_count(), before + 1);
        assert_eq!(fx.engine.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_mark_all_messages_read_bounded_writes() {
        let fx = fixture("bob");
        let convo = seed_conversation(&fx, 50).await;
        assert_eq!(convo.unread_count.get("bob"), Some(&50));

        let before = fx.remote.write_op_count();
        fx.engine
            .mark_conversation_messages_as_read(&convo.id)
            .await
            .unwrap();

        // Conversation update + one batched receipt write, never 50.
        assert_eq!(fx.remote.write_op_count(), before + 2);

        let updated = fx.conversations.get(&convo.id).unwrap().unwrap();
        assert_eq!(updated.unread_count.get("bob"), Some(&0));
        for message in fx.messages.for_conversation(&convo.id).unwrap() {
            assert!(message.read_receipts.contains_key("bob"));
        }
    }

    #[tokio::test]
    async fn test_receipts_only_added_for_others_messages() {
        let fx = fixture("bob");
        let convo = seed_conversation(&fx, 2).await;
        fx.messages
            .insert(&local_message("own", &convo.id, "bob", 500))
            .unwrap();

        fx.engine
            .mark_conversation_messages_as_read(&convo.id)
            .await
            .unwrap();

        let own = fx.messages.get("own").unwrap().unwrap();
        assert!(own.read_receipts.is_empty());
    }

    #[tokio::test]
    async fn test_remote_failure_keeps_local_state_and_queues() {
        let fx = fixture("bob");
        let convo = seed_conversation(&fx, 3).await;

        fx.remote.set_offline(true);
        fx.engine.mark_conversation_as_read(&convo.id).await.unwrap();

        // Read status is locally true despite the failed remote write.
        let updated = fx.conversations.get(&convo.id).unwrap().unwrap();
        assert_eq!(updated.unread_count.get("bob"), Some(&0));
        assert_eq!(fx.engine.pending_count(), 1);

        // Reconnect: the queued mark flushes.
        fx.remote.set_offline(false);
        fx.engine.flush_pending().await;
        assert_eq!(fx.engine.pending_count(), 0);

        let doc = fx.remote.conversation_doc(&convo.id).unwrap();
        let interactions = doc
            .get(fields::LAST_INTERACTION)
            .and_then(|v| v.as_object())
            .unwrap();
        assert!(interactions.contains_key("bob"));
    }

    #[tokio::test]
    async fn test_offline_read_marks_coalesce_per_conversation() {
        let fx = fixture("bob");
        let convo = seed_conversation(&fx, 3).await;

        fx.remote.set_offline(true);
        fx.engine.mark_conversation_as_read(&convo.id).await.unwrap();
        fx.engine
            .mark_conversation_messages_as_read(&convo.id)
            .await
            .unwrap();
        fx.engine.mark_conversation_as_read(&convo.id).await.unwrap();

        // Three failed pushes collapse into one queued mark carrying the
        // union of receipt targets.
        assert_eq!(fx.engine.pending_count(), 1);

        fx.remote.set_offline(false);
        let before = fx.remote.write_op_count();
        fx.engine.flush_pending().await;
        assert_eq!(fx.engine.pending_count(), 0);
        // One conversation update plus one batched receipt write.
        assert_eq!(fx.remote.write_op_count(), before + 2);

        for message in fx.messages.for_conversation(&convo.id).unwrap() {
            let doc = fx.remote.message_doc(&convo.id, &message.id).unwrap();
            let receipts = doc
                .get(fields::READ_RECEIPTS)
                .and_then(|v| v.as_object())
                .unwrap();
            assert!(receipts.contains_key("bob"));
        }
    }

    #[tokio::test]
    async fn test_not_authenticated() {
        let fx = fixture("bob");
        let convo = seed_conversation(&fx, 1).await;
        let engine = ReadStatusEngine::new(
            fx.conversations.clone(),
            fx.messages.clone(),
            fx.remote.clone(),
            Arc::new(Session::new()),
            EventBus::new(),
        );
        assert!(matches!(
            engine.mark_conversation_as_read(&convo.id).await,
            Err(ChatError::NotAuthenticated)
        ));
    }
}
