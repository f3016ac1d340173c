//! Cache diagnostics: memory-tier snapshots and operational counters
//!
//! Nothing in here feeds back into get/set/eviction decisions.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::memory::MemoryTier;

/// Snapshot of the memory tier
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CacheStats {
    /// Entries physically present
    pub total_entries: usize,
    /// Entries that would be served
    pub valid_entries: usize,
    /// Entries present but logically expired
    pub expired_entries: usize,
    /// `valid_entries / max(1, total_entries)`
    pub hit_rate: f64,
}

/// Builds [`CacheStats`] by scanning a memory tier
#[derive(Debug, Default, Clone, Copy)]
pub struct StatsCollector;

impl StatsCollector {
    /// Scan `tier` without evicting anything
    pub fn collect<T: Clone>(tier: &MemoryTier<T>, now: i64, version: &str) -> CacheStats {
        let metas = tier.metas();
        let total_entries = metas.len();
        let valid_entries = metas
            .iter()
            .filter(|meta| meta.is_valid(now, version))
            .count();

        CacheStats {
            total_entries,
            valid_entries,
            expired_entries: total_entries - valid_entries,
            hit_rate: valid_entries as f64 / total_entries.max(1) as f64,
        }
    }
}

/// Counters for cache traffic
#[derive(Debug, Default)]
pub struct CacheMetrics {
    memory_hits: AtomicU64,
    persistent_hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    quota_retries: AtomicU64,
    degraded_writes: AtomicU64,
    rejected_writes: AtomicU64,
    swept: AtomicU64,
}

impl CacheMetrics {
    /// Create new counters
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_memory_hit(&self) {
        self.memory_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_persistent_hit(&self) {
        self.persistent_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_set(&self) {
        self.sets.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_quota_retry(&self) {
        self.quota_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_degraded_write(&self) {
        self.degraded_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rejected_write(&self) {
        self.rejected_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_swept(&self, count: usize) {
        self.swept.fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Reads served by the memory tier
    pub fn memory_hits(&self) -> u64 {
        self.memory_hits.load(Ordering::Relaxed)
    }

    /// Reads served by the persistent tier (each one promoted)
    pub fn persistent_hits(&self) -> u64 {
        self.persistent_hits.load(Ordering::Relaxed)
    }

    /// Reads that found nothing valid
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Accepted `set` calls
    pub fn sets(&self) -> u64 {
        self.sets.load(Ordering::Relaxed)
    }

    /// Cleanup-and-retry cycles triggered by a full medium
    pub fn quota_retries(&self) -> u64 {
        self.quota_retries.load(Ordering::Relaxed)
    }

    /// Writes that ended up memory-only after a failed retry
    pub fn degraded_writes(&self) -> u64 {
        self.degraded_writes.load(Ordering::Relaxed)
    }

    /// Writes refused for exceeding the per-entry cap
    pub fn rejected_writes(&self) -> u64 {
        self.rejected_writes.load(Ordering::Relaxed)
    }

    /// Entries removed by cleanup sweeps
    pub fn swept(&self) -> u64 {
        self.swept.load(Ordering::Relaxed)
    }

    /// Fraction of reads that were hits (0.0 to 1.0)
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.memory_hits() + self.persistent_hits();
        let total = hits + self.misses();
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    /// Reset all counters
    pub fn reset(&self) {
        for counter in [
            &self.memory_hits,
            &self.persistent_hits,
            &self.misses,
            &self.sets,
            &self.quota_retries,
            &self.degraded_writes,
            &self.rejected_writes,
            &self.swept,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
