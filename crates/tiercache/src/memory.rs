//! In-memory tier: process-lifetime key -> entry map

use std::collections::HashMap;

use ahash::RandomState;
use parking_lot::RwLock;

use crate::entry::{CacheEntry, EntryMeta};

/// Unbounded map of live entries, guarded by one lock
///
/// Invalid entries are evicted lazily by [`MemoryTier::get`] or in bulk by
/// [`MemoryTier::cleanup_expired`], which holds the write lock for the
/// whole sweep.
pub struct MemoryTier<T> {
    entries: RwLock<HashMap<String, CacheEntry<T>, RandomState>>,
}

impl<T: Clone> MemoryTier<T> {
    /// Create an empty tier
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::with_hasher(RandomState::new())),
        }
    }

    /// Value under `key` if present and valid; an invalid entry is evicted
    pub fn get(&self, key: &str, now: i64, version: &str) -> Option<T> {
        {
            let entries = self.entries.read();
            match entries.get(key) {
                None => return None,
                Some(entry) if entry.is_valid(now, version) => return Some(entry.data.clone()),
                Some(_) => {}
            }
        }

        let mut entries = self.entries.write();
        // Re-check: a writer may have replaced the entry since the read lock dropped
        if entries
            .get(key)
            .is_some_and(|entry| !entry.is_valid(now, version))
        {
            entries.remove(key);
        }
        entries.get(key).map(|entry| entry.data.clone())
    }

    /// Store `entry` under `key`, replacing any previous entry
    pub fn set(&self, key: impl Into<String>, entry: CacheEntry<T>) {
        self.entries.write().insert(key.into(), entry);
    }

    /// Remove `key`, returning whether it was present
    pub fn remove(&self, key: &str) -> bool {
        self.entries.write().remove(key).is_some()
    }

    /// Whether `key` is physically present, valid or not
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.read().contains_key(key)
    }

    /// Drop every entry
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Keys physically present
    pub fn keys(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    /// Number of entries physically present
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Check if the tier holds no entries
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Remove every invalid entry, returning how many were removed
    pub fn cleanup_expired(&self, now: i64, version: &str) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| entry.is_valid(now, version));
        before - entries.len()
    }

    /// Metadata of every entry present, for diagnostics
    pub fn metas(&self) -> Vec<EntryMeta> {
        self.entries.read().values().map(CacheEntry::meta).collect()
    }
}

impl<T: Clone> Default for MemoryTier<T> {
    fn default() -> Self {
        Self::new()
    }
}
