use std::collections::HashMap;

use parking_lot::Mutex;

/// Typed per-key state container.
///
/// Replaces ad-hoc string-keyed dictionaries of loading/error flags: callers
/// get a typed value or an honest `None`, never a silently stale or
/// mistyped entry.
pub struct KeyedState<T> {
    entries: Mutex<HashMap<String, T>>,
}

impl<T: Clone> KeyedState<T> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn set(&self, key: impl Into<String>, value: T) {
        self.entries.lock().insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<T> {
        self.entries.lock().get(key).cloned()
    }

    /// Remove and return the entry for `key`.
    pub fn take(&self, key: &str) -> Option<T> {
        self.entries.lock().remove(key)
    }

    pub fn clear(&self, key: &str) {
        self.entries.lock().remove(key);
    }

    pub fn clear_all(&self) {
        self.entries.lock().clear();
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.lock().contains_key(key)
    }
}

impl<T: Clone> Default for KeyedState<T> {
    fn default() -> Self {
        Self::new()
    }
}
