//! Concurrent string-keyed registry.
//!
//! Used twice on the server: target id -> tunnel connection, and
//! request id -> pending response slot. Each use gets its own typed
//! instance so no runtime type checks are needed.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

/// Cheaply cloneable handle to a shared map
pub struct Registry<V> {
    entries: Arc<DashMap<String, V>>,
}

impl<V> Registry<V> {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
        }
    }

    /// Insert or overwrite.
    pub fn set(&self, key: impl Into<String>, value: V) {
        self.entries.insert(key.into(), value);
    }

    /// Insert only if no entry exists for `key`. Hands the value back otherwise.
    pub fn insert_if_absent(&self, key: impl Into<String>, value: V) -> Result<(), V> {
        match self.entries.entry(key.into()) {
            Entry::Occupied(_) => Err(value),
            Entry::Vacant(slot) => {
                slot.insert(value);
                Ok(())
            }
        }
    }

    pub fn delete(&self, key: &str) {
        self.entries.remove(key);
    }

    /// Remove and return the entry. At most one caller observes `Some`.
    pub fn take(&self, key: &str) -> Option<V> {
        self.entries.remove(key).map(|(_, value)| value)
    }

    /// Remove the entry only while `pred` holds for its current value.
    pub fn delete_if(&self, key: &str, pred: impl FnOnce(&V) -> bool) -> bool {
        self.entries.remove_if(key, |_, value| pred(value)).is_some()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<V: Clone> Registry<V> {
    pub fn get(&self, key: &str) -> Option<V> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }
}

impl<V> Clone for Registry<V> {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
        }
    }
}

impl<V> Default for Registry<V> {
    fn default() -> Self {
        Self::new()
    }
}
