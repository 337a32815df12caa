pub mod engine;
pub mod listeners;

pub use engine::{SyncEngine, SyncStatus};
pub use listeners::{ListenerRegistry, SubscriptionHandle};
