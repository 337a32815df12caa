//! Application-wide constants
//!
//! Centralized location for magic strings and configuration values
//! that are used across multiple modules.

/// Default data directory when none is configured
pub const DEFAULT_DATA_DIR: &str = "parley_data";

/// Remote write acknowledgment budget for a send, in seconds
pub const SEND_TIMEOUT_SECS: u64 = 10;

/// Capacity of the core event broadcast channel.
/// Slow subscribers that lag past this many events miss the oldest ones.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Initial delay before a dropped subscription is reopened, in milliseconds
pub const RECONNECT_BASE_DELAY_MS: u64 = 1_000;

/// Ceiling for the reconnect backoff, in milliseconds
pub const RECONNECT_MAX_DELAY_MS: u64 = 30_000;

/// Prefix of temporary message ids assigned before the remote store issues one
pub const LOCAL_ID_PREFIX: &str = "local-";

/// Prefix of deterministically derived direct (1:1) conversation ids
pub const DIRECT_ID_PREFIX: &str = "direct:";

// Remote document field names (see the remote interface contract)
pub mod fields {
    pub const CONVERSATION_ID: &str = "conversationId";
    pub const SENDER_ID: &str = "senderId";
    pub const TEXT: &str = "text";
    pub const TIMESTAMP: &str = "timestamp";
    pub const DELIVERY_STATE: &str = "deliveryState";
    /// Field name used by older clients for the delivery state
    pub const LEGACY_DELIVERY_STATE: &str = "status";
    pub const READ_RECEIPTS: &str = "readReceipts";
    pub const UPDATED_AT: &str = "updatedAt";

    pub const PARTICIPANT_IDS: &str = "participantIds";
    pub const IS_GROUP: &str = "isGroup";
    pub const GROUP_NAME: &str = "groupName";
    pub const LAST_MESSAGE: &str = "lastMessage";
    pub const LAST_MESSAGE_TIMESTAMP: &str = "lastMessageTimestamp";
    pub const LAST_SENDER_ID: &str = "lastSenderId";
    pub const UNREAD_COUNT: &str = "unreadCount";
    pub const LAST_INTERACTION: &str = "lastInteractionByUser";
}
