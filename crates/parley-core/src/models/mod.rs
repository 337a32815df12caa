pub mod conversation;
pub mod delivery;
pub mod message;

pub use conversation::Conversation;
pub use delivery::DeliveryState;
pub use message::Message;

/// Current wall-clock time in unix milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
