use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::{mpsc, watch};

use crate::constants::{fields, RECONNECT_BASE_DELAY_MS, RECONNECT_MAX_DELAY_MS};
use crate::delivery::DeliveryTracker;
use crate::error::ChatError;
use crate::events::{ChatEvent, EventBus};
use crate::models::{Conversation, DeliveryState, Message};
use crate::read_status::ReadStatusEngine;
use crate::remote::{ChangeBatch, ChangeKind, Fields, RemoteStore};
use crate::session::Session;
use crate::store::{ConversationStore, KeyedState, MessageStore};
use crate::sync::listeners::{ListenerRegistry, SubscriptionHandle};

/// Health of one subscription, keyed by the same key the registry uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// The change stream is open and batches are being applied.
    Live,
    /// The stream dropped; the engine is backing off and resubscribing.
    Reconnecting,
}

pub fn conversations_key(user: &str) -> String {
    format!("conversations:{user}")
}

pub fn messages_key(conversation_id: &str) -> String {
    format!("messages:{conversation_id}")
}

struct SyncShared {
    conversations: ConversationStore,
    messages: MessageStore,
    tracker: DeliveryTracker,
    remote: Arc<dyn RemoteStore>,
    listeners: Arc<ListenerRegistry>,
    events: EventBus,
    session: Arc<Session>,
    read_status: Arc<ReadStatusEngine>,
    foreground: AtomicBool,
    status: KeyedState<SyncStatus>,
}

/// Maintains the real-time subscriptions and folds their change batches
/// into the local store.
///
/// One conversation-list subscription per signed-in user; one message
/// subscription per conversation that list surfaces (or that was opened
/// explicitly). Within a subscription, batches apply in arrival order;
/// across subscriptions no ordering is needed since conversations are
/// independent. Subscription failures are recovered here (log, backoff,
/// resubscribe) and never surface to callers: until reconnection the local
/// store is stale, not wrong.
pub struct SyncEngine {
    shared: Arc<SyncShared>,
}

impl SyncEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        conversations: ConversationStore,
        messages: MessageStore,
        tracker: DeliveryTracker,
        remote: Arc<dyn RemoteStore>,
        listeners: Arc<ListenerRegistry>,
        events: EventBus,
        session: Arc<Session>,
        read_status: Arc<ReadStatusEngine>,
    ) -> Self {
        Self {
            shared: Arc::new(SyncShared {
                conversations,
                messages,
                tracker,
                remote,
                listeners,
                events,
                session,
                read_status,
                foreground: AtomicBool::new(true),
                status: KeyedState::new(),
            }),
        }
    }

    /// While backgrounded, changes still land in the local store but
    /// notification-worthy new-message events are suppressed.
    pub fn set_foreground(&self, foreground: bool) {
        self.shared.foreground.store(foreground, Ordering::SeqCst);
    }

    pub fn is_foreground(&self) -> bool {
        self.shared.foreground.load(Ordering::SeqCst)
    }

    /// Open the conversation-list subscription for the signed-in user and
    /// start applying changes. Also flushes any read-marks that queued while
    /// offline.
    pub async fn start(&self) -> Result<(), ChatError> {
        let user = self.shared.session.require_user()?;
        spawn_conversation_listener(&self.shared, &user).await
    }

    /// Ensure a message subscription for `conversation_id` exists, e.g. when
    /// the user opens a conversation that the list has not surfaced yet.
    pub async fn open_conversation(&self, conversation_id: &str) -> Result<(), ChatError> {
        if self.shared.listeners.is_active(&messages_key(conversation_id)) {
            return Ok(());
        }
        spawn_message_listener(&self.shared, conversation_id).await
    }

    /// Health of one conversation's message subscription, `None` when no
    /// subscription exists for it.
    pub fn conversation_sync_status(&self, conversation_id: &str) -> Option<SyncStatus> {
        self.shared.status.get(&messages_key(conversation_id))
    }

    /// Tear down every subscription. Sign-out path; safe to call redundantly.
    /// In-flight sends are independent operations and are not cancelled.
    pub fn stop(&self) {
        self.shared.listeners.remove_all();
        self.shared.status.clear_all();
    }
}

async fn spawn_conversation_listener(
    shared: &Arc<SyncShared>,
    user: &str,
) -> Result<(), ChatError> {
    let rx = shared.remote.subscribe_conversations(user).await?;
    // Connectivity is (re)established: opportunistically push read-marks
    // that failed while offline.
    shared.read_status.flush_pending().await;

    let (cancel_tx, cancel_rx) = watch::channel(false);
    let task = tokio::spawn(conversation_pump(
        shared.clone(),
        user.to_string(),
        rx,
        cancel_rx,
    ));
    let key = conversations_key(user);
    shared
        .listeners
        .register(key.clone(), SubscriptionHandle::new(cancel_tx, task));
    shared.status.set(key, SyncStatus::Live);
    Ok(())
}

async fn spawn_message_listener(
    shared: &Arc<SyncShared>,
    conversation_id: &str,
) -> Result<(), ChatError> {
    let rx = shared.remote.subscribe_messages(conversation_id).await?;
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let task = tokio::spawn(message_pump(
        shared.clone(),
        conversation_id.to_string(),
        rx,
        cancel_rx,
    ));
    let key = messages_key(conversation_id);
    shared
        .listeners
        .register(key.clone(), SubscriptionHandle::new(cancel_tx, task));
    shared.status.set(key, SyncStatus::Live);
    Ok(())
}

async fn conversation_pump(
    shared: Arc<SyncShared>,
    user: String,
    mut rx: mpsc::UnboundedReceiver<ChangeBatch>,
    mut cancel_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = cancel_rx.changed() => {
                if changed.is_err() || *cancel_rx.borrow() {
                    break;
                }
            }
            batch = rx.recv() => match batch {
                Some(batch) => apply_conversation_batch(&shared, batch).await,
                None => {
                    tracing::warn!(user = %user, "conversation subscription dropped");
                    shared
                        .status
                        .set(conversations_key(&user), SyncStatus::Reconnecting);
                    match resubscribe(&mut cancel_rx, || {
                        shared.remote.subscribe_conversations(&user)
                    })
                    .await
                    {
                        Some(new_rx) => {
                            shared.status.set(conversations_key(&user), SyncStatus::Live);
                            shared.read_status.flush_pending().await;
                            rx = new_rx;
                        }
                        None => break,
                    }
                }
            }
        }
    }
}

async fn message_pump(
    shared: Arc<SyncShared>,
    conversation_id: String,
    mut rx: mpsc::UnboundedReceiver<ChangeBatch>,
    mut cancel_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = cancel_rx.changed() => {
                if changed.is_err() || *cancel_rx.borrow() {
                    break;
                }
            }
            batch = rx.recv() => match batch {
                Some(batch) => apply_message_batch(&shared, &conversation_id, batch).await,
                None => {
                    tracing::warn!(conversation_id = %conversation_id, "message subscription dropped");
                    shared
                        .status
                        .set(messages_key(&conversation_id), SyncStatus::Reconnecting);
                    match resubscribe(&mut cancel_rx, || {
                        shared.remote.subscribe_messages(&conversation_id)
                    })
                    .await
                    {
                        Some(new_rx) => {
                            shared
                                .status
                                .set(messages_key(&conversation_id), SyncStatus::Live);
                            rx = new_rx;
                        }
                        None => break,
                    }
                }
            }
        }
    }
}

/// Reopen a dropped subscription with exponential backoff. Returns `None`
/// when cancelled while waiting.
async fn resubscribe<F, Fut>(
    cancel_rx: &mut watch::Receiver<bool>,
    mut subscribe: F,
) -> Option<mpsc::UnboundedReceiver<ChangeBatch>>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<mpsc::UnboundedReceiver<ChangeBatch>, ChatError>>,
{
    let mut delay = RECONNECT_BASE_DELAY_MS;
    loop {
        tokio::select! {
            changed = cancel_rx.changed() => {
                if changed.is_err() || *cancel_rx.borrow() {
                    return None;
                }
            }
            _ = tokio::time::sleep(Duration::from_millis(delay)) => {
                match subscribe().await {
                    Ok(rx) => {
                        tracing::info!("subscription reestablished");
                        return Some(rx);
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, delay_ms = delay, "resubscribe failed");
                        delay = (delay * 2).min(RECONNECT_MAX_DELAY_MS);
                    }
                }
            }
        }
    }
}

/// Conversation documents are server-authoritative; apply them last-write-
/// wins (modulo locally-kept read-marks) and make sure each conversation in
/// the list has a live message subscription.
async fn apply_conversation_batch(shared: &Arc<SyncShared>, batch: ChangeBatch) {
    for item in batch.items {
        match item.kind {
            ChangeKind::Added | ChangeKind::Modified => {
                let conversation = match Conversation::from_snapshot(&item.doc) {
                    Ok(conversation) => conversation,
                    Err(err) => {
                        tracing::warn!(doc_id = %item.doc.id, error = %err, "skipping malformed conversation snapshot");
                        continue;
                    }
                };
                let applied = match shared.conversations.apply_remote(conversation) {
                    Ok(applied) => applied,
                    Err(err) => {
                        tracing::warn!(doc_id = %item.doc.id, error = %err, "failed to apply conversation snapshot");
                        continue;
                    }
                };
                promote_read_states(shared, &applied);
                shared.events.emit(ChatEvent::ConversationUpdated {
                    conversation_id: applied.id.clone(),
                });

                if !shared.listeners.is_active(&messages_key(&applied.id)) {
                    if let Err(err) = spawn_message_listener(shared, &applied.id).await {
                        tracing::warn!(
                            conversation_id = %applied.id,
                            error = %err,
                            "could not open message subscription"
                        );
                    }
                }
            }
            ChangeKind::Removed => {
                // The conversation's messages go with it, otherwise orphan
                // rows keep surfacing through delivery-state queries.
                if let Err(err) = shared.messages.delete_for_conversation(&item.doc.id) {
                    tracing::warn!(doc_id = %item.doc.id, error = %err, "failed to delete conversation messages");
                }
                if let Err(err) = shared.conversations.delete(&item.doc.id) {
                    tracing::warn!(doc_id = %item.doc.id, error = %err, "failed to delete conversation");
                }
                shared.listeners.remove(&messages_key(&item.doc.id));
                shared.status.clear(&messages_key(&item.doc.id));
                shared.events.emit(ChatEvent::ConversationUpdated {
                    conversation_id: item.doc.id.clone(),
                });
            }
        }
    }
}

async fn apply_message_batch(shared: &Arc<SyncShared>, conversation_id: &str, batch: ChangeBatch) {
    for item in batch.items {
        match item.kind {
            ChangeKind::Added | ChangeKind::Modified => {
                let incoming = match Message::from_snapshot(&item.doc) {
                    Ok(incoming) => incoming,
                    Err(err) => {
                        tracing::warn!(doc_id = %item.doc.id, error = %err, "skipping malformed message snapshot");
                        continue;
                    }
                };
                let merged = match shared.messages.upsert_merged(incoming) {
                    Ok(merged) => merged,
                    Err(err) => {
                        tracing::warn!(doc_id = %item.doc.id, error = %err, "failed to apply message snapshot");
                        continue;
                    }
                };
                if let Err(err) = shared.conversations.refresh_after_message(&merged) {
                    tracing::warn!(conversation_id = %conversation_id, error = %err, "failed to refresh conversation");
                }
                shared.events.emit(ChatEvent::MessageMutated {
                    conversation_id: merged.conversation_id.clone(),
                    message_id: merged.id.clone(),
                });

                let me = shared.session.current_user();
                let from_other = me.as_deref() != Some(merged.sender_id.as_str());
                if from_other {
                    acknowledge_delivery(shared, &merged).await;
                    if item.kind == ChangeKind::Added
                        && shared.foreground.load(Ordering::SeqCst)
                    {
                        shared.events.emit(ChatEvent::NewIncomingMessage {
                            conversation_id: merged.conversation_id.clone(),
                            message_id: merged.id.clone(),
                            sender_id: merged.sender_id.clone(),
                        });
                    }
                }
            }
            ChangeKind::Removed => {
                match shared.messages.delete(&item.doc.id) {
                    Ok(true) => {
                        if let Err(err) = shared.conversations.rebuild_denormalized(conversation_id)
                        {
                            tracing::warn!(
                                conversation_id = %conversation_id,
                                error = %err,
                                "failed to rebuild conversation after removal"
                            );
                        }
                    }
                    Ok(false) => {}
                    Err(err) => {
                        tracing::warn!(doc_id = %item.doc.id, error = %err, "failed to delete message");
                    }
                }
            }
        }
    }
}

/// This client has the message now; let the sender's side observe
/// `delivered`. Best-effort on the remote side, the local row moves first.
async fn acknowledge_delivery(shared: &Arc<SyncShared>, message: &Message) {
    if !matches!(
        message.delivery_state,
        DeliveryState::Pending | DeliveryState::Sent
    ) {
        return;
    }
    if let Err(err) = shared.tracker.mark_delivered(&message.id) {
        tracing::warn!(message_id = %message.id, error = %err, "local delivered mark failed");
    }
    let mut update = Fields::new();
    update.insert(
        fields::DELIVERY_STATE.into(),
        json!(DeliveryState::Delivered.as_str()),
    );
    if let Err(err) = shared
        .remote
        .update_message(&message.conversation_id, &message.id, update)
        .await
    {
        tracing::debug!(message_id = %message.id, error = %err, "remote delivered mark failed");
    }
}

/// Derive `read` from conversation-level interaction timestamps: a message
/// is read once any participant other than its sender has interacted with
/// the conversation at or after the message's timestamp, no per-message
/// receipt required.
fn promote_read_states(shared: &Arc<SyncShared>, conversation: &Conversation) {
    let messages = match shared.messages.for_conversation(&conversation.id) {
        Ok(messages) => messages,
        Err(err) => {
            tracing::warn!(conversation_id = %conversation.id, error = %err, "failed to load messages for read promotion");
            return;
        }
    };
    for message in messages {
        if message.delivery_state == DeliveryState::Read {
            continue;
        }
        let seen = conversation
            .others(&message.sender_id)
            .iter()
            .any(|p| conversation.has_seen(p, message.created_at));
        if !seen {
            continue;
        }
        match shared.tracker.mark_read(&message.id) {
            Ok(true) => shared.events.emit(ChatEvent::MessageMutated {
                conversation_id: conversation.id.clone(),
                message_id: message.id.clone(),
            }),
            Ok(false) => {}
            Err(err) => {
                tracing::warn!(message_id = %message.id, error = %err, "read promotion failed");
            }
        }
    }
}
