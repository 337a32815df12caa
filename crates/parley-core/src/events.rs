use tokio::sync::broadcast;

use crate::constants::EVENT_CHANNEL_CAPACITY;

/// Discrete notifications emitted by the send and sync paths.
///
/// Consumers (UI refresh, AI feature triggers, the notification subsystem,
/// test harnesses) subscribe through [`EventBus::subscribe`]; emission is
/// fire-and-forget and never blocks the emitting path.
#[derive(Debug, Clone)]
pub enum ChatEvent {
    /// A message row was inserted or updated locally.
    MessageMutated {
        conversation_id: String,
        message_id: String,
    },
    /// A message from another participant arrived while the app is
    /// foregrounded. Surfaced for push/local notification dispatch.
    NewIncomingMessage {
        conversation_id: String,
        message_id: String,
        sender_id: String,
    },
    /// A conversation document changed (denormalized fields, read state).
    ConversationUpdated { conversation_id: String },
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ChatEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.tx.subscribe()
    }

    /// Send an event to all current subscribers. A send with no subscribers
    /// is not an error.
    pub fn emit(&self, event: ChatEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
