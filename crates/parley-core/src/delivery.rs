use crate::error::ChatError;
use crate::models::{now_ms, DeliveryState, Message};
use crate::store::MessageStore;

/// Owner of the message delivery state machine.
///
/// Every local transition goes through here so the send path and the sync
/// path cannot diverge on what a state means or when it may change. A
/// transition against a message that no longer exists locally (deleted
/// concurrently) is a logged no-op, not an error.
#[derive(Clone)]
pub struct DeliveryTracker {
    messages: MessageStore,
}

impl DeliveryTracker {
    pub fn new(messages: MessageStore) -> Self {
        Self { messages }
    }

    pub fn mark_sent(&self, id: &str) -> Result<bool, ChatError> {
        self.transition(id, DeliveryState::Sent)
    }

    pub fn mark_delivered(&self, id: &str) -> Result<bool, ChatError> {
        self.transition(id, DeliveryState::Delivered)
    }

    pub fn mark_read(&self, id: &str) -> Result<bool, ChatError> {
        self.transition(id, DeliveryState::Read)
    }

    pub fn mark_failed(&self, id: &str) -> Result<bool, ChatError> {
        self.transition(id, DeliveryState::Failed)
    }

    /// The explicit `failed → pending` edge taken when a send is retried.
    pub fn mark_retrying(&self, id: &str) -> Result<bool, ChatError> {
        self.transition(id, DeliveryState::Pending)
    }

    /// Apply a remote-observed state to a local message, regressing nothing.
    /// Returns the message as stored afterwards, or `None` when it is gone.
    pub fn merge_remote_state(
        &self,
        id: &str,
        remote: DeliveryState,
    ) -> Result<Option<Message>, ChatError> {
        let Some(mut message) = self.messages.get(id)? else {
            tracing::warn!(message_id = %id, "remote state for unknown local message");
            return Ok(None);
        };
        let merged = DeliveryState::merge_remote(message.delivery_state, remote);
        if merged != message.delivery_state {
            message.delivery_state = merged;
            message.updated_at = now_ms();
            self.messages.insert(&message)?;
        }
        Ok(Some(message))
    }

    fn transition(&self, id: &str, target: DeliveryState) -> Result<bool, ChatError> {
        let Some(message) = self.messages.get(id)? else {
            tracing::warn!(
                message_id = %id,
                target = target.as_str(),
                "delivery transition for message no longer in local store"
            );
            return Ok(false);
        };
        if message.delivery_state == target {
            // Duplicate acknowledgment; applying it twice is a no-op.
            return Ok(false);
        }
        if !message.delivery_state.can_transition_to(target) {
            tracing::debug!(
                message_id = %id,
                from = message.delivery_state.as_str(),
                to = target.as_str(),
                "ignoring illegal delivery transition"
            );
            return Ok(false);
        }
        self.messages.set_delivery_state(id, target, now_ms())
    }
}
