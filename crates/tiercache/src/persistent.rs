//! Persistent tier: entries stored on a quota-limited medium
//!
//! Every failure in here is absorbed. Reads that hit unparsable, expired or
//! foreign-version records delete the record and report a miss; writes
//! report a [`WriteOutcome`] instead of an error.

use std::marker::PhantomData;
use std::sync::{Arc, OnceLock};

use cachestore::{frame, Result, StorageMedium};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::codec::Codec;
use crate::config::CacheConfig;
use crate::entry::{CacheEntry, EntryMeta};
use crate::stats::CacheMetrics;

/// Key used by the availability probe (outside any namespace)
const PROBE_KEY: &str = "__storage_test__";

/// Result of a persistent write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Record stored
    Persisted,
    /// Medium failed its probe; nothing attempted
    Unavailable,
    /// Encoded record exceeds the per-entry cap (size in bytes)
    TooLarge(usize),
    /// Medium stayed full after one cleanup-and-retry
    Degraded,
    /// Encoding or I/O failure
    Failed,
}

impl WriteOutcome {
    /// Whether the record reached the medium
    pub fn is_persisted(&self) -> bool {
        matches!(self, WriteOutcome::Persisted)
    }
}

/// Namespaced view of a [`StorageMedium`] holding encoded entries
pub struct PersistentTier<T, C> {
    medium: Arc<dyn StorageMedium>,
    codec: C,
    config: CacheConfig,
    metrics: Arc<CacheMetrics>,

    /// Probe result, computed on first use
    available: OnceLock<bool>,

    /// Serializes medium access so a sweep is never observed half-done
    io: Mutex<()>,

    _marker: PhantomData<fn() -> T>,
}

impl<T, C> PersistentTier<T, C>
where
    C: Codec<T>,
{
    /// Wrap `medium` for the namespace in `config`
    pub fn new(
        medium: Arc<dyn StorageMedium>,
        codec: C,
        config: CacheConfig,
        metrics: Arc<CacheMetrics>,
    ) -> Self {
        Self {
            medium,
            codec,
            config,
            metrics,
            available: OnceLock::new(),
            io: Mutex::new(()),
            _marker: PhantomData,
        }
    }

    /// Whether the medium passed its write-then-delete probe
    ///
    /// A medium that is merely full still counts as available.
    pub fn is_available(&self) -> bool {
        *self.available.get_or_init(|| {
            let probe = self
                .medium
                .set_item(PROBE_KEY, b"test")
                .and_then(|()| self.medium.remove_item(PROBE_KEY));

            match probe {
                Ok(()) => true,
                Err(e) if e.is_quota_exceeded() => {
                    debug!("Storage probe hit the quota; medium is usable but full");
                    true
                }
                Err(e) => {
                    warn!("Persistent storage unavailable, caching in memory only: {}", e);
                    false
                }
            }
        })
    }

    /// Store `entry` under `key`
    ///
    /// On a full medium, sweeps the namespace and retries exactly once. When
    /// the write does not go through, any older record under `key` is
    /// removed so a restart cannot resurrect a replaced value.
    pub fn write(&self, key: &str, entry: &CacheEntry<T>, compress: bool, now: i64) -> WriteOutcome {
        if !self.is_available() {
            return WriteOutcome::Unavailable;
        }

        let storage_key = self.config.storage_key(key);
        let record = match self.encode(entry, compress) {
            Ok(record) => record,
            Err(e) => {
                warn!("Failed to encode cache entry {}: {}", key, e);
                self.discard_quietly(&storage_key);
                return WriteOutcome::Failed;
            }
        };

        if record.len() > self.config.max_entry_bytes {
            warn!(
                "Cache entry {} too large to persist: {} bytes (max {})",
                key,
                record.len(),
                self.config.max_entry_bytes
            );
            self.metrics.record_rejected_write();
            self.discard_quietly(&storage_key);
            return WriteOutcome::TooLarge(record.len());
        }

        let _io = self.io.lock();
        match self.medium.set_item(&storage_key, &record) {
            Ok(()) => WriteOutcome::Persisted,
            Err(e) if e.is_quota_exceeded() => {
                self.metrics.record_quota_retry();
                let swept = self.sweep_locked(now);
                info!("Storage quota exceeded; swept {} expired entries before retrying", swept);

                match self.medium.set_item(&storage_key, &record) {
                    Ok(()) => WriteOutcome::Persisted,
                    Err(e) => {
                        warn!("Storage still full, keeping {} in memory only: {}", key, e);
                        self.metrics.record_degraded_write();
                        self.discard(&storage_key);
                        WriteOutcome::Degraded
                    }
                }
            }
            Err(e) => {
                warn!("Failed to persist cache entry {}: {}", key, e);
                self.discard(&storage_key);
                WriteOutcome::Failed
            }
        }
    }

    /// Valid entry under `key`; anything unreadable or stale is deleted
    pub fn read(&self, key: &str, now: i64) -> Option<CacheEntry<T>> {
        if !self.is_available() {
            return None;
        }

        let storage_key = self.config.storage_key(key);
        let _io = self.io.lock();

        let raw = match self.medium.get_item(&storage_key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!("Failed to read cache entry {}: {}", key, e);
                return None;
            }
        };

        let entry = match self.decode(&raw) {
            Ok(entry) => entry,
            Err(e) => {
                debug!("Dropping unreadable cache entry {}: {}", key, e);
                self.discard(&storage_key);
                return None;
            }
        };

        if !entry.is_valid(now, &self.config.schema_version) {
            debug!("Dropping expired cache entry {}", key);
            self.discard(&storage_key);
            return None;
        }

        Some(entry)
    }

    /// Delete `key`
    pub fn remove(&self, key: &str) {
        if !self.is_available() {
            return;
        }
        let _io = self.io.lock();
        self.discard(&self.config.storage_key(key));
    }

    /// Delete every key in this namespace, returning how many were removed
    pub fn clear(&self) -> usize {
        if !self.is_available() {
            return 0;
        }
        let _io = self.io.lock();

        let keys = self.namespaced_keys();
        for storage_key in &keys {
            self.discard(storage_key);
        }
        keys.len()
    }

    /// Cache keys stored in this namespace
    pub fn keys(&self) -> Vec<String> {
        if !self.is_available() {
            return Vec::new();
        }
        let _io = self.io.lock();

        self.namespaced_keys()
            .iter()
            .filter_map(|storage_key| self.config.cache_key(storage_key))
            .map(str::to_string)
            .collect()
    }

    /// Delete every expired, foreign-version or unparsable record
    pub fn cleanup_expired(&self, now: i64) -> usize {
        if !self.is_available() {
            return 0;
        }
        let _io = self.io.lock();
        self.sweep_locked(now)
    }

    /// Bytes the medium reports in use (all namespaces)
    pub fn used_bytes(&self) -> u64 {
        self.medium.used_bytes()
    }

    fn sweep_locked(&self, now: i64) -> usize {
        let mut removed = 0;
        for storage_key in self.namespaced_keys() {
            let keep = match self.medium.get_item(&storage_key) {
                Ok(Some(raw)) => self
                    .decode_meta(&raw)
                    .map(|meta| meta.is_valid(now, &self.config.schema_version))
                    .unwrap_or(false),
                Ok(None) => continue,
                Err(e) => {
                    warn!("Failed to read {} during cleanup: {}", storage_key, e);
                    continue;
                }
            };

            if !keep {
                self.discard(&storage_key);
                removed += 1;
            }
        }

        self.metrics.record_swept(removed);
        removed
    }

    fn namespaced_keys(&self) -> Vec<String> {
        match self.medium.keys() {
            Ok(keys) => keys
                .into_iter()
                .filter(|key| self.config.cache_key(key).is_some())
                .collect(),
            Err(e) => {
                warn!("Failed to list storage keys: {}", e);
                Vec::new()
            }
        }
    }

    fn discard(&self, storage_key: &str) {
        if let Err(e) = self.medium.remove_item(storage_key) {
            warn!("Failed to remove {}: {}", storage_key, e);
        }
    }

    fn discard_quietly(&self, storage_key: &str) {
        let _io = self.io.lock();
        self.discard(storage_key);
    }

    fn encode(&self, entry: &CacheEntry<T>, compress: bool) -> Result<Vec<u8>> {
        let payload = self.codec.encode(entry)?;
        let plain = frame::wrap_plain(&payload);
        if !compress {
            return Ok(plain);
        }

        match frame::compress(&payload) {
            Ok(framed) if framed.len() > frame::FRAME_HEADER_LEN && framed.len() < plain.len() => {
                Ok(framed)
            }
            Ok(framed) if framed.len() <= frame::FRAME_HEADER_LEN => {
                warn!("Compression produced no output; storing uncompressed record");
                Ok(plain)
            }
            // No gain; the plain record is smaller
            Ok(_) => Ok(plain),
            Err(e) => {
                warn!("Compression failed, storing uncompressed record: {}", e);
                Ok(plain)
            }
        }
    }

    fn decode(&self, raw: &[u8]) -> Result<CacheEntry<T>> {
        let plain = frame::unframe(raw)?;
        self.codec.decode(&plain)
    }

    fn decode_meta(&self, raw: &[u8]) -> Result<EntryMeta> {
        let plain = frame::unframe(raw)?;
        self.codec.decode_meta(&plain)
    }
}
