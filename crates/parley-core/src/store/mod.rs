pub mod conversations;
pub mod db;
pub mod keyed_state;
pub mod messages;

pub use conversations::ConversationStore;
pub use db::Database;
pub use keyed_state::KeyedState;
pub use messages::MessageStore;
