use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Handle to one running subscription pump.
///
/// Owns the cooperative cancel flag and the task itself. Cancelling is
/// idempotent; a redundant cancel is harmless and any error on the
/// underlying channel is swallowed.
pub struct SubscriptionHandle {
    cancel_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SubscriptionHandle {
    pub fn new(cancel_tx: watch::Sender<bool>, task: JoinHandle<()>) -> Self {
        Self { cancel_tx, task }
    }

    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
        self.task.abort();
    }
}

/// Tracks active remote subscriptions by key.
///
/// Guarantees at most one subscription per key: registering under an
/// occupied key cancels and replaces the previous one. `remove_all` is the
/// sign-out teardown and leaves nothing running.
#[derive(Default)]
pub struct ListenerRegistry {
    active: Mutex<HashMap<String, SubscriptionHandle>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, key: impl Into<String>, handle: SubscriptionHandle) {
        let key = key.into();
        if let Some(previous) = self.active.lock().insert(key.clone(), handle) {
            tracing::debug!(key, "replacing existing subscription");
            previous.cancel();
        }
    }

    /// Cancel and forget the subscription under `key`. Returns whether one
    /// was registered.
    pub fn remove(&self, key: &str) -> bool {
        match self.active.lock().remove(key) {
            Some(handle) => {
                handle.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self, key: &str) -> bool {
        self.active.lock().contains_key(key)
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    /// Cancel everything. Safe to call redundantly.
    pub fn remove_all(&self) {
        let drained: Vec<(String, SubscriptionHandle)> =
            self.active.lock().drain().collect();
        for (key, handle) in drained {
            tracing::debug!(key, "cancelling subscription on teardown");
            handle.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn spawn_pump(stopped: Arc<AtomicBool>) -> SubscriptionHandle {
        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            loop {
                if cancel_rx.changed().await.is_err() || *cancel_rx.borrow() {
                    break;
                }
            }
            stopped.store(true, Ordering::SeqCst);
        });
        SubscriptionHandle::new(cancel_tx, task)
    }

    #[tokio::test]
    async fn test_register_replaces_same_key() {
        let registry = ListenerRegistry::new();
        let first_stopped = Arc::new(AtomicBool::new(false));

        registry.register("messages:c1", spawn_pump(first_stopped.clone()));
        assert!(registry.is_active("messages:c1"));

        registry.register("messages:c1", spawn_pump(Arc::new(AtomicBool::new(false))));
        assert_eq!(registry.active_count(), 1);

        // The replaced pump was cancelled.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(registry.is_active("messages:c1"));
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let registry = ListenerRegistry::new();
        registry.register("conversations:alice", spawn_pump(Arc::new(AtomicBool::new(false))));

        assert!(registry.remove("conversations:alice"));
        assert!(!registry.is_active("conversations:alice"));
        // Redundant cancel is harmless.
        assert!(!registry.remove("conversations:alice"));
    }

    #[tokio::test]
    async fn test_remove_all_leaves_nothing() {
        let registry = ListenerRegistry::new();
        registry.register("a", spawn_pump(Arc::new(AtomicBool::new(false))));
        registry.register("b", spawn_pump(Arc::new(AtomicBool::new(false))));
        assert_eq!(registry.active_count(), 2);

        registry.remove_all();
        assert_eq!(registry.active_count(), 0);
        registry.remove_all();
    }
}
