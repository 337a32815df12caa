use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use uuid::Uuid;

use crate::constants::fields;
use crate::delivery::DeliveryTracker;
use crate::error::ChatError;
use crate::events::{ChatEvent, EventBus};
use crate::models::{now_ms, Conversation, DeliveryState, Message};
use crate::remote::RemoteStore;
use crate::session::Session;
use crate::store::{ConversationStore, MessageStore};

/// Optimistic message sending.
///
/// The local insert happens before the remote write so the UI shows the
/// message instantly; the remote acknowledgment reconciles the temporary id
/// and moves the message to `sent`. A failed or timed-out remote phase
/// leaves the message visible in `failed` with a retry affordance.
pub struct SendPipeline {
    conversations: ConversationStore,
    messages: MessageStore,
    tracker: DeliveryTracker,
    remote: Arc<dyn RemoteStore>,
    session: Arc<Session>,
    events: EventBus,
    send_timeout: Duration,
}

impl SendPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        conversations: ConversationStore,
        messages: MessageStore,
        tracker: DeliveryTracker,
        remote: Arc<dyn RemoteStore>,
        session: Arc<Session>,
        events: EventBus,
        send_timeout: Duration,
    ) -> Self {
        Self {
            conversations,
            messages,
            tracker,
            remote,
            session,
            events,
            send_timeout,
        }
    }

    /// Send `text` to `conversation_id`. Returns the message as stored after
    /// the remote phase; on a remote failure the error is returned and the
    /// optimistic local message stays behind in `failed`.
    pub async fn send_message(
        &self,
        conversation_id: &str,
        text: &str,
    ) -> Result<Message, ChatError> {
        let user = self.session.require_user()?;
        let text = text.trim();
        if text.is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        let conversation = self
            .conversations
            .get(conversation_id)?
            .ok_or(ChatError::InvalidParticipants)?;
        if conversation.others(&user).is_empty() {
            return Err(ChatError::InvalidParticipants);
        }

        // Optimistic insert: visible immediately as pending.
        let message = Message::new_local(conversation_id, user, text, now_ms());
        self.messages.insert(&message)?;
        self.conversations.refresh_after_message(&message)?;
        self.emit_mutation(&message);

        self.push_remote(message).await
    }

    /// Retry an existing failed message: `failed → pending`, then the remote
    /// phase again. Returns `None` when the message is gone or not failed.
    pub async fn retry_failed_message(
        &self,
        message_id: &str,
    ) -> Result<Option<Message>, ChatError> {
        let Some(message) = self.messages.get(message_id)? else {
            tracing::warn!(message_id, "retry for message no longer in local store");
            return Ok(None);
        };
        if message.delivery_state != DeliveryState::Failed {
            tracing::debug!(
                message_id,
                state = message.delivery_state.as_str(),
                "retry ignored, message is not failed"
            );
            return Ok(None);
        }

        self.tracker.mark_retrying(message_id)?;
        self.emit_mutation(&message);
        self.push_remote(message).await.map(Some)
    }

    /// Create (or return) the deterministic 1:1 conversation with `other`.
    pub async fn create_direct_conversation(
        &self,
        other: &str,
    ) -> Result<Conversation, ChatError> {
        let user = self.session.require_user()?;
        if other == user {
            return Err(ChatError::InvalidParticipants);
        }
        let id = Conversation::direct_id(&user, other);
        if let Some(existing) = self.conversations.get(&id)? {
            return Ok(existing);
        }

        let conversation = Conversation::direct(user, other);
        self.conversations.upsert(&conversation)?;
        self.events.emit(ChatEvent::ConversationUpdated {
            conversation_id: conversation.id.clone(),
        });
        self.remote
            .upsert_conversation(&conversation.id, conversation.to_remote_fields())
            .await?;
        Ok(conversation)
    }

    /// Create a group conversation with the current user and `participants`.
    pub async fn create_group_conversation(
        &self,
        name: &str,
        participants: Vec<String>,
    ) -> Result<Conversation, ChatError> {
        let user = self.session.require_user()?;
        let mut all = participants;
        all.push(user.clone());
        all.sort();
        all.dedup();
        if all.iter().all(|p| *p == user) {
            return Err(ChatError::InvalidParticipants);
        }

        let id = format!("group-{}", Uuid::new_v4());
        let conversation = Conversation::group(id, name, all);
        self.conversations.upsert(&conversation)?;
        self.events.emit(ChatEvent::ConversationUpdated {
            conversation_id: conversation.id.clone(),
        });
        self.remote
            .upsert_conversation(&conversation.id, conversation.to_remote_fields())
            .await?;
        Ok(conversation)
    }

    /// Remote phase of a send: write the canonical document, reconcile the
    /// local record with the remote id and server timestamp, mark sent.
    async fn push_remote(&self, message: Message) -> Result<Message, ChatError> {
        let mut outbound = message.clone();
        // The document only exists remotely once the write acks, so its
        // canonical state is sent, never pending.
        outbound.delivery_state = DeliveryState::Sent;

        let ack = match tokio::time::timeout(
            self.send_timeout,
            self.remote
                .create_message(&message.conversation_id, outbound.to_remote_fields()),
        )
        .await
        {
            Err(_) => {
                return self
                    .fail_send(
                        &message,
                        ChatError::Timeout {
                            seconds: self.send_timeout.as_secs(),
                        },
                    )
                    .await
            }
            Ok(Err(err)) => return self.fail_send(&message, err).await,
            Ok(Ok(ack)) => ack,
        };

        if !self
            .messages
            .reconcile_remote_id(&message.id, &ack.id, ack.timestamp, now_ms())?
        {
            tracing::warn!(
                local_id = %message.id,
                remote_id = %ack.id,
                "acknowledged message vanished locally before reconciliation"
            );
        }
        self.tracker.mark_sent(&ack.id)?;

        let Some(stored) = self.messages.get(&ack.id)? else {
            return Err(ChatError::store("reconciled message missing"));
        };
        self.conversations.refresh_after_message(&stored)?;
        self.emit_mutation(&stored);

        // Denormalize onto the remote conversation document. Best-effort:
        // the message itself is durable at this point.
        let mut update = crate::remote::Fields::new();
        update.insert(fields::LAST_MESSAGE.into(), json!(stored.text));
        update.insert(
            fields::LAST_MESSAGE_TIMESTAMP.into(),
            json!(stored.created_at),
        );
        update.insert(fields::LAST_SENDER_ID.into(), json!(stored.sender_id));
        if let Err(err) = self
            .remote
            .update_conversation(&stored.conversation_id, update)
            .await
        {
            tracing::warn!(
                conversation_id = %stored.conversation_id,
                error = %err,
                "failed to denormalize last message remotely"
            );
        }

        Ok(stored)
    }

    async fn fail_send(&self, message: &Message, err: ChatError) -> Result<Message, ChatError> {
        tracing::warn!(
            message_id = %message.id,
            error = %err,
            "remote write failed, marking message failed"
        );
        self.tracker.mark_failed(&message.id)?;
        self.emit_mutation(message);
        Err(err)
    }

    fn emit_mutation(&self, message: &Message) {
        self.events.emit(ChatEvent::MessageMutated {
            conversation_id: message.conversation_id.clone(),
            message_id: message.id.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryRemoteStore;
    use crate::store::Database;

    struct Fixture {
        pipeline: SendPipeline,
        conversations: ConversationStore,
        messages: MessageStore,
        remote: Arc<MemoryRemoteStore>,
        session: Arc<Session>,
    }

    fn fixture() -> Fixture {
        let db = Database::open_in_memory().unwrap();
        let conversations = ConversationStore::new(db.clone());
        let messages = MessageStore::new(db);
        let remote = Arc::new(MemoryRemoteStore::new());
        let session = Arc::new(Session::new());
        session.sign_in("alice");
        let pipeline = SendPipeline::new(
            conversations.clone(),
            messages.clone(),
            DeliveryTracker::new(messages.clone()),
            remote.clone(),
            session.clone(),
            EventBus::new(),
            Duration::from_secs(5),
        );
        Fixture {
            pipeline,
            conversations,
            messages,
            remote,
            session,
        }
    }

    async fn direct_conversation(fx: &Fixture) -> Conversation {
        fx.pipeline.create_direct_conversation("bob").await.unwrap()
    }

    #[tokio::test]
    async fn test_send_reaches_sent_with_remote_id() {
        let fx = fixture();
        let convo = direct_conversation(&fx).await;

        let message = fx.pipeline.send_message(&convo.id, "hi").await.unwrap();
        assert!(!message.is_local());
        assert_eq!(message.delivery_state, DeliveryState::Sent);
        assert!(fx.remote.message_doc(&convo.id, &message.id).is_some());

        // The temporary local record was reconciled away, not duplicated.
        assert_eq!(fx.messages.for_conversation(&convo.id).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_send_denormalizes_onto_conversation() {
        let fx = fixture();
        let convo = direct_conversation(&fx).await;

        let message = fx.pipeline.send_message(&convo.id, "latest").await.unwrap();
        let updated = fx.conversations.get(&convo.id).unwrap().unwrap();
        assert_eq!(updated.last_message.as_deref(), Some("latest"));
        assert_eq!(updated.last_message_at, Some(message.created_at));
        assert_eq!(updated.last_sender_id.as_deref(), Some("alice"));
        assert_eq!(updated.unread_count.get("bob"), Some(&1));
        assert_eq!(updated.unread_count.get("alice"), Some(&0));
    }

    #[tokio::test]
    async fn test_offline_send_fails_then_retry_succeeds() {
        let fx = fixture();
        let convo = direct_conversation(&fx).await;

        fx.remote.set_offline(true);
        let err = fx.pipeline.send_message(&convo.id, "hi").await.unwrap_err();
        assert!(matches!(err, ChatError::Timeout { .. }));

        // The optimistic message stays visible, in failed.
        let failed = fx.messages.by_delivery_state(DeliveryState::Failed).unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].text, "hi");

        // Reconnect and retry: the message reaches sent.
        fx.remote.set_offline(false);
        let retried = fx
            .pipeline
            .retry_failed_message(&failed[0].id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(retried.delivery_state, DeliveryState::Sent);
        assert!(fx
            .messages
            .by_delivery_state(DeliveryState::Failed)
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_retry_non_failed_message_is_noop() {
        let fx = fixture();
        let convo = direct_conversation(&fx).await;
        let message = fx.pipeline.send_message(&convo.id, "hi").await.unwrap();

        assert!(fx
            .pipeline
            .retry_failed_message(&message.id)
            .await
            .unwrap()
            .is_none());
        assert!(fx
            .pipeline
            .retry_failed_message("missing")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_validation_before_optimistic_write() {
        let fx = fixture();
        let convo = direct_conversation(&fx).await;

        assert!(matches!(
            fx.pipeline.send_message(&convo.id, "   ").await,
            Err(ChatError::EmptyMessage)
        ));
        assert!(matches!(
            fx.pipeline.send_message("nowhere", "hi").await,
            Err(ChatError::InvalidParticipants)
        ));

        fx.session.sign_out();
        assert!(matches!(
            fx.pipeline.send_message(&convo.id, "hi").await,
            Err(ChatError::NotAuthenticated)
        ));

        // No optimistic rows were written for any failed validation.
        assert!(fx.messages.for_conversation(&convo.id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_send_requires_other_participants() {
        let fx = fixture();
        let mut solo = Conversation::direct("alice", "alice");
        solo.participant_ids = vec!["alice".to_string()];
        fx.conversations.upsert(&solo).unwrap();

        assert!(matches!(
            fx.pipeline.send_message(&solo.id, "hi").await,
            Err(ChatError::InvalidParticipants)
        ));
    }

    #[tokio::test]
    async fn test_create_direct_conversation_is_deterministic() {
        let fx = fixture();
        let first = fx.pipeline.create_direct_conversation("bob").await.unwrap();
        let second = fx.pipeline.create_direct_conversation("bob").await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.id, Conversation::direct_id("alice", "bob"));
        assert!(fx.remote.conversation_doc(&first.id).is_some());
    }

    #[tokio::test]
    async fn test_create_group_requires_others() {
        let fx = fixture();
        assert!(matches!(
            fx.pipeline.create_group_conversation("empty", vec![]).await,
            Err(ChatError::InvalidParticipants)
        ));

        let group = fx
            .pipeline
            .create_group_conversation("team", vec!["bob".into(), "carol".into()])
            .await
            .unwrap();
        assert!(group.is_group);
        assert_eq!(group.participant_ids, vec!["alice", "bob", "carol"]);
    }
}
