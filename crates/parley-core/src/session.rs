use parking_lot::RwLock;

use crate::error::ChatError;

/// Signed-in identity, shared between the send pipeline, the read status
/// engine and the sync engine. Authentication itself is an external
/// collaborator; this only holds the result.
#[derive(Default)]
pub struct Session {
    user_id: RwLock<Option<String>>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sign_in(&self, user_id: impl Into<String>) {
        *self.user_id.write() = Some(user_id.into());
    }

    pub fn sign_out(&self) {
        *self.user_id.write() = None;
    }

    pub fn current_user(&self) -> Option<String> {
        self.user_id.read().clone()
    }

    /// The signed-in user, or `NotAuthenticated`.
    pub fn require_user(&self) -> Result<String, ChatError> {
        self.current_user().ok_or(ChatError::NotAuthenticated)
    }
}
