//! Storage medium abstraction and the in-memory medium
//!
//! A medium is a flat, quota-limited byte key/value store, the moral
//! equivalent of a browser's local storage. Keys from several cache
//! namespaces may share one medium; namespacing is the caller's job.

use std::collections::HashMap;
use std::sync::Arc;

use ahash::RandomState;
use parking_lot::RwLock;

use crate::error::{Error, Result};

/// Default aggregate quota (5 MiB)
pub const DEFAULT_QUOTA: u64 = 5 * 1024 * 1024;

/// Byte-oriented persistent key/value store with an aggregate quota
pub trait StorageMedium: Send + Sync {
    /// Read the raw bytes stored under `key`
    fn get_item(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store `value` under `key`, replacing any previous value
    ///
    /// Fails with [`Error::QuotaExceeded`] when the write would push the
    /// medium past its quota. A failed write leaves the previous value intact.
    fn set_item(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Remove `key`; removing an absent key is not an error
    fn remove_item(&self, key: &str) -> Result<()>;

    /// All keys currently stored, in a stable order
    fn keys(&self) -> Result<Vec<String>>;

    /// Bytes currently accounted against the quota
    fn used_bytes(&self) -> u64;
}

/// Bytes one item costs against the quota
pub(crate) fn item_size(key: &str, value_len: usize) -> u64 {
    (key.len() + value_len) as u64
}

struct MemoryInner {
    items: HashMap<String, Vec<u8>, RandomState>,
    used: u64,
    quota: u64,
}

/// Quota-limited medium held in process memory
///
/// Clones share the same storage, so a cache "restart" can be simulated by
/// building a fresh cache over a clone of the medium.
#[derive(Clone)]
pub struct MemoryMedium {
    inner: Arc<RwLock<MemoryInner>>,
}

impl MemoryMedium {
    /// Create an empty medium with the given quota in bytes
    pub fn new(quota: u64) -> Self {
        Self {
            inner: Arc::new(RwLock::new(MemoryInner {
                items: HashMap::with_hasher(RandomState::new()),
                used: 0,
                quota,
            })),
        }
    }

    /// Quota in bytes
    pub fn quota(&self) -> u64 {
        self.inner.read().quota
    }

    /// Number of stored items
    pub fn len(&self) -> usize {
        self.inner.read().items.len()
    }

    /// Check if the medium holds no items
    pub fn is_empty(&self) -> bool {
        self.inner.read().items.is_empty()
    }
}

impl Default for MemoryMedium {
    fn default() -> Self {
        Self::new(DEFAULT_QUOTA)
    }
}

impl StorageMedium for MemoryMedium {
    fn get_item(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.inner.read().items.get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &[u8]) -> Result<()> {
        let mut inner = self.inner.write();

        let previous = inner
            .items
            .get(key)
            .map(|old| item_size(key, old.len()))
            .unwrap_or(0);
        let needed = inner.used - previous + item_size(key, value.len());
        if needed > inner.quota {
            return Err(Error::QuotaExceeded {
                needed,
                quota: inner.quota,
            });
        }

        inner.items.insert(key.to_string(), value.to_vec());
        inner.used = needed;
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<()> {
        let mut inner = self.inner.write();
        if let Some(old) = inner.items.remove(key) {
            inner.used -= item_size(key, old.len());
        }
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self.inner.read().items.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }

    fn used_bytes(&self) -> u64 {
        self.inner.read().used
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_get() {
        let medium = MemoryMedium::default();
        medium.set_item("a", b"hello").unwrap();

        assert_eq!(medium.get_item("a").unwrap(), Some(b"hello".to_vec()));
        assert_eq!(medium.get_item("b").unwrap(), None);
        assert_eq!(medium.used_bytes(), 6);
    }

    #[test]
    fn test_replace_accounts_only_new_size() {
        let medium = MemoryMedium::new(20);
        medium.set_item("k", &[0u8; 15]).unwrap();
        medium.set_item("k", &[0u8; 18]).unwrap();

        assert_eq!(medium.used_bytes(), 19);
        assert_eq!(medium.len(), 1);
    }

    #[test]
    fn test_quota_exceeded_keeps_previous_value() {
        let medium = MemoryMedium::new(10);
        medium.set_item("k", b"abc").unwrap();

        let result = medium.set_item("k", &[0u8; 20]);
        assert!(matches!(result, Err(Error::QuotaExceeded { needed: 21, quota: 10 })));
        assert_eq!(medium.get_item("k").unwrap(), Some(b"abc".to_vec()));
        assert_eq!(medium.used_bytes(), 4);
    }

    #[test]
    fn test_remove_frees_quota() {
        let medium = MemoryMedium::new(10);
        medium.set_item("a", &[0u8; 8]).unwrap();
        assert!(medium.set_item("b", &[0u8; 8]).is_err());

        medium.remove_item("a").unwrap();
        medium.remove_item("missing").unwrap();
        medium.set_item("b", &[0u8; 8]).unwrap();

        assert_eq!(medium.keys().unwrap(), vec!["b".to_string()]);
    }

    #[test]
    fn test_clones_share_storage() {
        let medium = MemoryMedium::default();
        let other = medium.clone();
        medium.set_item("shared", b"1").unwrap();

        assert_eq!(other.get_item("shared").unwrap(), Some(b"1".to_vec()));
    }
}
