pub mod config;
pub mod constants;
pub mod delivery;
pub mod error;
pub mod events;
pub mod models;
pub mod read_status;
pub mod remote;
pub mod runtime;
pub mod send;
pub mod session;
pub mod store;
pub mod sync;
pub mod tracing_setup;

// Re-export the embedding surface at the crate root for convenience
pub use config::CoreConfig;
pub use error::ChatError;
pub use events::{ChatEvent, EventBus};
pub use models::{Conversation, DeliveryState, Message};
pub use remote::{MemoryRemoteStore, RemoteStore};
pub use runtime::ChatCore;
pub use tracing_setup::init_tracing;
