use thiserror::Error;

/// Error taxonomy for the messaging core.
///
/// Validation errors (`NotAuthenticated`, `InvalidParticipants`, `EmptyMessage`)
/// are raised before any optimistic write happens. Transient remote errors
/// (`Timeout`) leave the optimistic local message visible in the `failed`
/// state. Sync-side problems never surface through this type; they are logged
/// and recovered internally.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("not authenticated")]
    NotAuthenticated,

    #[error("conversation has no other participants")]
    InvalidParticipants,

    #[error("message text is empty")]
    EmptyMessage,

    #[error("local store unavailable: {message}")]
    StoreUnavailable { message: String },

    #[error("invalid remote data: {message}")]
    InvalidRemoteData { message: String },

    #[error("remote write timed out after {seconds}s")]
    Timeout { seconds: u64 },
}

impl ChatError {
    pub fn invalid_remote(message: impl Into<String>) -> Self {
        ChatError::InvalidRemoteData {
            message: message.into(),
        }
    }

    pub fn store(message: impl Into<String>) -> Self {
        ChatError::StoreUnavailable {
            message: message.into(),
        }
    }
}

impl From<rusqlite::Error> for ChatError {
    fn from(err: rusqlite::Error) -> Self {
        ChatError::StoreUnavailable {
            message: err.to_string(),
        }
    }
}
