//! CacheManager: memory tier in front of a persistent tier
//!
//! Reads check memory first, fall through to the medium, and promote
//! persistent hits back into memory. Writes always land in memory and are
//! persisted best-effort. Nothing here returns an error: an unusable or full
//! medium degrades the cache to memory-only.

use std::collections::HashSet;
use std::sync::Arc;

use ahash::RandomState;
use cachestore::StorageMedium;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::cleanup::{CleanupReport, Sweep};
use crate::codec::{Codec, JsonCodec};
use crate::config::{CacheConfig, SetOptions};
use crate::entry::{CacheEntry, Clock, SystemClock};
use crate::memory::MemoryTier;
use crate::persistent::{PersistentTier, WriteOutcome};
use crate::stats::{CacheMetrics, CacheStats, StatsCollector};

/// Two-tier cache for values of type `T` in one namespace
pub struct CacheManager<T, C = JsonCodec> {
    memory: MemoryTier<T>,
    persistent: PersistentTier<T, C>,
    clock: Arc<dyn Clock>,
    config: CacheConfig,
    metrics: Arc<CacheMetrics>,
}

impl<T> CacheManager<T, JsonCodec>
where
    T: Clone + Serialize + DeserializeOwned,
{
    /// Create a JSON-backed cache over `medium`
    pub fn new(medium: Arc<dyn StorageMedium>, config: CacheConfig) -> Self {
        Self::builder(medium).config(config).build()
    }

    /// Start configuring a cache over `medium`
    pub fn builder(medium: Arc<dyn StorageMedium>) -> CacheManagerBuilder<T, JsonCodec> {
        CacheManagerBuilder {
            medium,
            codec: JsonCodec,
            config: CacheConfig::default(),
            clock: Arc::new(SystemClock),
            _marker: std::marker::PhantomData,
        }
    }
}

impl<T, C> CacheManager<T, C>
where
    T: Clone,
    C: Codec<T>,
{
    /// Get a valid value, from memory or (promoting) from the medium
    pub fn get(&self, key: &str) -> Option<T> {
        let now = self.clock.now_ms();

        if let Some(value) = self.memory.get(key, now, &self.config.schema_version) {
            self.metrics.record_memory_hit();
            return Some(value);
        }

        match self.persistent.read(key, now) {
            Some(entry) => {
                self.metrics.record_persistent_hit();
                let value = entry.data.clone();
                self.memory.set(key, entry);
                Some(value)
            }
            None => {
                self.metrics.record_miss();
                None
            }
        }
    }

    /// Store a value
    ///
    /// Returns `true` once the memory tier holds the value. That means
    /// "accepted", not "durable": the persistent write may have been skipped,
    /// rejected as oversized, or degraded by a full medium.
    pub fn set(&self, key: &str, data: T, options: SetOptions) -> bool {
        let now = self.clock.now_ms();
        let entry = CacheEntry::new(
            data,
            now,
            options.ttl.unwrap_or_else(|| self.config.default_ttl()),
            options
                .version
                .unwrap_or_else(|| self.config.schema_version.clone()),
        );

        self.memory.set(key, entry.clone());
        self.metrics.record_set();

        match self.persistent.write(key, &entry, options.compress, now) {
            WriteOutcome::Persisted => {}
            outcome => debug!("Cache entry {} kept in memory only ({:?})", key, outcome),
        }
        true
    }

    /// Remove `key` from both tiers
    pub fn delete(&self, key: &str) {
        self.memory.remove(key);
        self.persistent.remove(key);
    }

    /// Remove every entry of this namespace from both tiers
    pub fn clear(&self) {
        self.memory.clear();
        let removed = self.persistent.clear();
        debug!("Cleared cache namespace {} ({} persisted entries)", self.config.namespace, removed);
    }

    /// Drop the memory tier only; the medium is left as is
    pub fn clear_memory(&self) {
        self.memory.clear();
    }

    /// Whether `key` currently resolves to a valid value
    pub fn has(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Keys present in either tier, memory keys first, without duplicates
    ///
    /// Keys are listed as stored; an entry may still turn out to be expired
    /// on the next `get`.
    pub fn keys(&self) -> Vec<String> {
        let mut seen: HashSet<String, RandomState> = HashSet::with_hasher(RandomState::new());
        let mut keys = Vec::new();

        for key in self.memory.keys().into_iter().chain(self.persistent.keys()) {
            if seen.insert(key.clone()) {
                keys.push(key);
            }
        }
        keys
    }

    /// Sweep expired and corrupt entries out of both tiers
    pub fn cleanup(&self) -> CleanupReport {
        let now = self.clock.now_ms();
        let memory = self.memory.cleanup_expired(now, &self.config.schema_version);
        self.metrics.record_swept(memory);
        let persistent = self.persistent.cleanup_expired(now);

        CleanupReport { memory, persistent }
    }

    /// Diagnostic snapshot of the memory tier
    pub fn stats(&self) -> CacheStats {
        StatsCollector::collect(&self.memory, self.clock.now_ms(), &self.config.schema_version)
    }

    /// Traffic counters
    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    /// Whether the persistent medium is in use
    pub fn is_persistent(&self) -> bool {
        self.persistent.is_available()
    }

    /// Configuration of this cache
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Number of entries physically in the memory tier
    pub fn memory_len(&self) -> usize {
        self.memory.len()
    }
}

impl<T, C> Sweep for CacheManager<T, C>
where
    T: Clone + Send + Sync,
    C: Codec<T>,
{
    fn sweep(&self) -> CleanupReport {
        self.cleanup()
    }

    fn label(&self) -> &str {
        &self.config.namespace
    }
}

/// Builder for [`CacheManager`]
pub struct CacheManagerBuilder<T, C> {
    medium: Arc<dyn StorageMedium>,
    codec: C,
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T, C> CacheManagerBuilder<T, C>
where
    T: Clone,
    C: Codec<T>,
{
    /// Replace the whole configuration
    pub fn config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the key namespace prefix
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.config.namespace = namespace.into();
        self
    }

    /// Set the schema version
    pub fn schema_version(mut self, version: impl Into<String>) -> Self {
        self.config.schema_version = version.into();
        self
    }

    /// Use a different time source
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Use a different record codec
    pub fn codec<C2: Codec<T>>(self, codec: C2) -> CacheManagerBuilder<T, C2> {
        CacheManagerBuilder {
            medium: self.medium,
            codec,
            config: self.config,
            clock: self.clock,
            _marker: std::marker::PhantomData,
        }
    }

    /// Build the cache
    pub fn build(self) -> CacheManager<T, C> {
        let metrics = Arc::new(CacheMetrics::new());
        CacheManager {
            memory: MemoryTier::new(),
            persistent: PersistentTier::new(self.medium, self.codec, self.config.clone(), metrics.clone()),
            clock: self.clock,
            config: self.config,
            metrics,
        }
    }
}
