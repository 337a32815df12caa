use std::sync::Arc;

use tokio::sync::broadcast;

use crate::config::CoreConfig;
use crate::delivery::DeliveryTracker;
use crate::error::ChatError;
use crate::events::{ChatEvent, EventBus};
use crate::models::{Conversation, Message};
use crate::read_status::ReadStatusEngine;
use crate::remote::RemoteStore;
use crate::send::SendPipeline;
use crate::session::Session;
use crate::store::{ConversationStore, Database, MessageStore};
use crate::sync::{ListenerRegistry, SyncEngine, SyncStatus};

/// The assembled messaging core: local store, send pipeline, sync engine and
/// read status, wired to one remote store and one event stream.
///
/// An embedding UI holds a single `ChatCore`, signs a user in, and then reads
/// from the local store while reacting to [`ChatEvent`]s. All methods take
/// `&self`; the core is shared behind an `Arc` when the UI needs it from
/// several tasks.
pub struct ChatCore {
    conversations: ConversationStore,
    messages: MessageStore,
    session: Arc<Session>,
    events: EventBus,
    send: SendPipeline,
    read_status: Arc<ReadStatusEngine>,
    sync: SyncEngine,
}

impl ChatCore {
    pub fn new(config: CoreConfig, remote: Arc<dyn RemoteStore>) -> Result<Self, ChatError> {
        let db = Database::open(&config.data_dir)?;
        Ok(Self::assemble(db, remote, config))
    }

    /// Core over an in-memory store. Tests and demos.
    pub fn in_memory(remote: Arc<dyn RemoteStore>) -> Result<Self, ChatError> {
        let db = Database::open_in_memory()?;
        Ok(Self::assemble(db, remote, CoreConfig::default()))
    }

    fn assemble(db: Database, remote: Arc<dyn RemoteStore>, config: CoreConfig) -> Self {
        let conversations = ConversationStore::new(db.clone());
        let messages = MessageStore::new(db);
        let tracker = DeliveryTracker::new(messages.clone());
        let session = Arc::new(Session::new());
        let events = EventBus::new();
        let listeners = Arc::new(ListenerRegistry::new());

        let send = SendPipeline::new(
            conversations.clone(),
            messages.clone(),
            tracker.clone(),
            remote.clone(),
            session.clone(),
            events.clone(),
            config.send_timeout,
        );
        let read_status = Arc::new(ReadStatusEngine::new(
            conversations.clone(),
            messages.clone(),
            remote.clone(),
            session.clone(),
            events.clone(),
        ));
        let sync = SyncEngine::new(
            conversations.clone(),
            messages.clone(),
            tracker,
            remote,
            listeners,
            events.clone(),
            session.clone(),
            read_status.clone(),
        );

        Self {
            conversations,
            messages,
            session,
            events,
            send,
            read_status,
            sync,
        }
    }

    /// Sign `user_id` in and bring the sync engine up for them.
    pub async fn sign_in(&self, user_id: &str) -> Result<(), ChatError> {
        self.session.sign_in(user_id);
        tracing::info!(user = user_id, "signed in");
        self.sync.start().await
    }

    /// Tear down every subscription and clear the session. The local store
    /// keeps its data for the next sign-in.
    pub fn sign_out(&self) {
        self.sync.stop();
        self.session.sign_out();
        tracing::info!("signed out");
    }

    pub fn current_user(&self) -> Option<String> {
        self.session.current_user()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ChatEvent> {
        self.events.subscribe()
    }

    /// Conversations for the signed-in user, newest activity first, straight
    /// from the local store.
    pub fn conversations(&self) -> Result<Vec<Conversation>, ChatError> {
        let user = self.session.require_user()?;
        self.conversations.list_for_user(&user)
    }

    /// Messages of one conversation in timeline order, from the local store.
    pub fn conversation_messages(&self, conversation_id: &str) -> Result<Vec<Message>, ChatError> {
        self.messages.for_conversation(conversation_id)
    }

    pub async fn send_message(
        &self,
        conversation_id: &str,
        text: &str,
    ) -> Result<Message, ChatError> {
        self.send.send_message(conversation_id, text).await
    }

    pub async fn retry_failed_message(
        &self,
        message_id: &str,
    ) -> Result<Option<Message>, ChatError> {
        self.send.retry_failed_message(message_id).await
    }

    pub async fn create_direct_conversation(
        &self,
        other: &str,
    ) -> Result<Conversation, ChatError> {
        self.send.create_direct_conversation(other).await
    }

    pub async fn create_group_conversation(
        &self,
        name: &str,
        participants: Vec<String>,
    ) -> Result<Conversation, ChatError> {
        self.send.create_group_conversation(name, participants).await
    }

    /// Open a conversation in the UI sense: make sure its message
    /// subscription is live.
    pub async fn open_conversation(&self, conversation_id: &str) -> Result<(), ChatError> {
        self.sync.open_conversation(conversation_id).await
    }

    pub async fn mark_conversation_as_read(&self, conversation_id: &str) -> Result<(), ChatError> {
        self.read_status.mark_conversation_as_read(conversation_id).await
    }

    pub async fn mark_conversation_messages_as_read(
        &self,
        conversation_id: &str,
    ) -> Result<(), ChatError> {
        self.read_status
            .mark_conversation_messages_as_read(conversation_id)
            .await
    }

    pub fn set_foreground(&self, foreground: bool) {
        self.sync.set_foreground(foreground);
    }

    /// Health of one conversation's live subscription, for UI indicators.
    pub fn conversation_sync_status(&self, conversation_id: &str) -> Option<SyncStatus> {
        self.sync.conversation_sync_status(conversation_id)
    }
}
